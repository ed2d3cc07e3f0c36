//! API request/response models for staging jobs.

use crate::db::models::jobs::{JobDBResponse, JobStatus};
use crate::types::{JobId, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use super::pagination::Pagination;

// Request models
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct JobCreateRequest {
    /// Job kind; priced via the job catalog
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct JobTransitionRequest {
    /// Target status (queued jobs may start or fail; running jobs may
    /// succeed or fail)
    pub status: JobStatus,
    /// Failure detail, required when transitioning to failed
    pub error: Option<String>,
}

/// Query parameters for listing jobs
#[derive(Debug, Default, Deserialize, IntoParams, ToSchema)]
pub struct ListJobsQuery {
    /// Pagination parameters
    #[serde(flatten)]
    #[param(inline)]
    pub pagination: Pagination,
}

// Response models
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct JobResponse {
    /// Job ID
    #[schema(value_type = String, format = "uuid")]
    pub id: JobId,
    /// Owning user
    #[schema(value_type = String, format = "uuid")]
    pub user_id: UserId,
    /// Job kind
    pub kind: String,
    /// Current status
    pub status: JobStatus,
    /// Credits debited when the job was created
    #[schema(value_type = String)]
    pub credit_cost: Decimal,
    /// Failure detail, when failed
    pub error: Option<String>,
    /// When the job was created
    pub created_at: DateTime<Utc>,
    /// When the job last changed
    pub updated_at: DateTime<Utc>,
}

// Conversions
impl From<JobDBResponse> for JobResponse {
    fn from(db: JobDBResponse) -> Self {
        Self {
            id: db.id,
            user_id: db.user_id,
            kind: db.kind,
            status: db.status,
            credit_cost: db.credit_cost,
            error: db.error,
            created_at: db.created_at,
            updated_at: db.updated_at,
        }
    }
}
