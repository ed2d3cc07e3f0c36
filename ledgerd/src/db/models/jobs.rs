//! Database models for staging jobs.

use crate::types::{JobId, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Staging job lifecycle state. Stored as TEXT.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    /// Legal lifecycle transitions. Terminal states have no successors.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Queued, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// Database request for creating a staging job
#[derive(Debug, Clone)]
pub struct JobCreateDBRequest {
    pub user_id: UserId,
    pub kind: String,
    pub credit_cost: Decimal,
}

/// Database response for a staging job
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobDBResponse {
    pub id: JobId,
    pub user_id: UserId,
    pub kind: String,
    pub status: JobStatus,
    pub credit_cost: Decimal,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
