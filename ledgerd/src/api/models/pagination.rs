//! Offset pagination shared by every list endpoint.
//!
//! Query strings carry `skip` and `limit`; responses wrap the page in
//! [`PaginatedResponse`] together with the pre-pagination total, so clients
//! can render page controls without a second count request.

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use utoipa::{IntoParams, ToSchema};

/// Page size used when the query string does not name one.
pub const DEFAULT_LIMIT: i64 = 10;

/// Largest page size a client can request.
pub const MAX_LIMIT: i64 = 100;

/// `skip`/`limit` query parameters.
///
/// Values arrive as strings in the query string; [`Pagination::params`]
/// turns them into bounds that are safe to feed straight into SQL.
#[serde_as]
#[derive(Debug, Default, Deserialize, IntoParams, ToSchema)]
pub struct Pagination {
    /// Number of items to skip (default: 0)
    #[param(default = 0, minimum = 0)]
    #[serde_as(as = "Option<DisplayFromStr>")]
    pub skip: Option<i64>,

    /// Maximum number of items to return (default: 10, max: 100)
    #[param(default = 10, minimum = 1, maximum = 100)]
    #[serde_as(as = "Option<DisplayFromStr>")]
    pub limit: Option<i64>,
}

impl Pagination {
    /// The effective `(skip, limit)` pair.
    ///
    /// `skip` is floored at 0 and `limit` is clamped to `1..=`[`MAX_LIMIT`],
    /// so a hostile query string can neither ask for everything nor for a
    /// zero-row page.
    pub fn params(&self) -> (i64, i64) {
        let skip = self.skip.unwrap_or(0).max(0);
        let limit = self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
        (skip, limit)
    }
}

/// One page of results plus the metadata to ask for the next one.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaginatedResponse<T: ToSchema> {
    /// The items for the current page
    pub data: Vec<T>,
    /// Total number of items matching the query (before pagination)
    pub total_count: i64,
    /// Number of items skipped
    pub skip: i64,
    /// Maximum items returned per page
    pub limit: i64,
}

impl<T: ToSchema> PaginatedResponse<T> {
    pub fn new(data: Vec<T>, total_count: i64, skip: i64, limit: i64) -> Self {
        Self {
            data,
            total_count,
            skip,
            limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert_eq!(Pagination::default().params(), (0, DEFAULT_LIMIT));
    }

    #[test]
    fn test_bounds() {
        let cases = [
            // (skip, limit) -> effective (skip, limit)
            (Some(-10), Some(0), (0, 1)),
            (None, Some(-5), (0, 1)),
            (Some(20), Some(50), (20, 50)),
            (Some(100), None, (100, DEFAULT_LIMIT)),
            (None, Some(1000), (0, MAX_LIMIT)),
        ];
        for (skip, limit, expected) in cases {
            let p = Pagination { skip, limit };
            assert_eq!(p.params(), expected, "skip={skip:?} limit={limit:?}");
        }
    }
}
