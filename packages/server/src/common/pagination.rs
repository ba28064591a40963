//! Offset pagination for history reads.

use serde::{Deserialize, Serialize};

/// Hard ceiling on page sizes regardless of what the caller asks for.
pub const MAX_PAGE_LIMIT: i64 = 200;

/// Default page size when the caller does not specify one.
pub const DEFAULT_PAGE_LIMIT: i64 = 50;

/// Limit/offset pair, clamped to sane bounds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PageArgs {
    pub limit: i64,
    pub offset: i64,
}

impl Default for PageArgs {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

impl PageArgs {
    pub fn new(limit: i64, offset: i64) -> Self {
        Self {
            limit: limit.clamp(1, MAX_PAGE_LIMIT),
            offset: offset.max(0),
        }
    }
}

/// One page of results together with the unpaged total.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            total: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_args_clamp_limit() {
        let args = PageArgs::new(10_000, -5);
        assert_eq!(args.limit, MAX_PAGE_LIMIT);
        assert_eq!(args.offset, 0);
    }

    #[test]
    fn page_args_keep_reasonable_values() {
        let args = PageArgs::new(25, 100);
        assert_eq!(args.limit, 25);
        assert_eq!(args.offset, 100);
    }
}
