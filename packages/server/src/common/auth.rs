//! Resolved caller identity.
//!
//! Session, bearer, and API-key strategies all live at the HTTP boundary;
//! by the time a request reaches a manager it has been reduced to an
//! [`Actor`]. Managers scope every query by the actor's user id and report
//! cross-user access as not-found so resource existence never leaks.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Subscription tier, used to bound how many live endpoints a user may own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    #[default]
    Free,
    Pro,
}

/// The authenticated caller on whose behalf a manager operation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Uuid,
    pub tier: Tier,
}

impl Actor {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            tier: Tier::default(),
        }
    }

    pub fn with_tier(user_id: Uuid, tier: Tier) -> Self {
        Self { user_id, tier }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("not authenticated")]
    Unauthenticated,
}
