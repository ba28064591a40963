//! Job container model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Active,
    Paused,
    Archived,
}

/// Groups one or more endpoints under a single user.
///
/// Archiving is soft-delete: endpoints under an archived job stop being
/// claimed but their run history stays queryable.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = Uuid::now_v7())]
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    #[builder(default, setter(strip_option))]
    pub description: Option<String>,
    #[builder(default)]
    pub status: JobStatus,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub archived_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Whether endpoints under this job may be claimed.
    pub fn is_schedulable(&self) -> bool {
        self.status == JobStatus::Active && self.archived_at.is_none()
    }
}

/// Partial update for a job; `None` fields are left untouched.
#[derive(Debug, Clone, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
pub struct JobPatch {
    pub name: Option<String>,
    pub description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job::builder()
            .user_id(Uuid::new_v4())
            .name("checks")
            .build()
    }

    #[test]
    fn new_job_is_active() {
        let job = sample_job();
        assert_eq!(job.status, JobStatus::Active);
        assert!(job.is_schedulable());
    }

    #[test]
    fn paused_job_is_not_schedulable() {
        let mut job = sample_job();
        job.status = JobStatus::Paused;
        assert!(!job.is_schedulable());
    }

    #[test]
    fn archived_job_is_not_schedulable() {
        let mut job = sample_job();
        job.status = JobStatus::Archived;
        job.archived_at = Some(Utc::now());
        assert!(!job.is_schedulable());
    }
}
