//! Database repository for staging jobs.
//!
//! Status moves through guarded updates (`WHERE status = expected`), so a
//! worker and an admin racing on the same job cannot both apply a
//! transition. Policy about which transitions are legal lives in
//! [`JobStatus::can_transition_to`]; this layer only enforces the guard.

use crate::db::{
    errors::Result,
    models::jobs::{JobCreateDBRequest, JobDBResponse, JobStatus},
};
use crate::types::{JobId, UserId, abbrev_uuid};
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::instrument;
use uuid::Uuid;

/// Filter for listing jobs
#[derive(Debug, Clone)]
pub struct JobFilter {
    pub skip: i64,
    pub limit: i64,
}

impl JobFilter {
    pub fn new(skip: i64, limit: i64) -> Self {
        Self { skip, limit }
    }
}

pub struct Jobs<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Jobs<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(user_id = %abbrev_uuid(&request.user_id), kind = %request.kind), err)]
    pub async fn create(&mut self, request: &JobCreateDBRequest) -> Result<JobDBResponse> {
        let job = sqlx::query_as::<_, JobDBResponse>(
            r#"
            INSERT INTO staging_jobs (id, user_id, kind, credit_cost)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(request.user_id)
        .bind(&request.kind)
        .bind(request.credit_cost)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(job)
    }

    #[instrument(skip(self), err)]
    pub async fn get_by_id(&mut self, id: JobId) -> Result<Option<JobDBResponse>> {
        let job = sqlx::query_as::<_, JobDBResponse>("SELECT * FROM staging_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(job)
    }

    #[instrument(skip(self, filter), fields(user_id = %abbrev_uuid(&user_id), limit = filter.limit, skip = filter.skip), err)]
    pub async fn list_for_user(&mut self, user_id: UserId, filter: &JobFilter) -> Result<Vec<JobDBResponse>> {
        let jobs = sqlx::query_as::<_, JobDBResponse>(
            "SELECT * FROM staging_jobs WHERE user_id = $1 ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3",
        )
        .bind(user_id)
        .bind(filter.limit)
        .bind(filter.skip)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(jobs)
    }

    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&user_id)), err)]
    pub async fn count_for_user(&mut self, user_id: UserId) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM staging_jobs WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&mut *self.db)
            .await?;
        Ok(count)
    }

    #[instrument(skip(self, filter), fields(limit = filter.limit, skip = filter.skip), err)]
    pub async fn list_all(&mut self, filter: &JobFilter) -> Result<Vec<JobDBResponse>> {
        let jobs = sqlx::query_as::<_, JobDBResponse>(
            "SELECT * FROM staging_jobs ORDER BY created_at DESC, id DESC LIMIT $1 OFFSET $2",
        )
        .bind(filter.limit)
        .bind(filter.skip)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(jobs)
    }

    #[instrument(skip(self), err)]
    pub async fn count_all(&mut self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM staging_jobs")
            .fetch_one(&mut *self.db)
            .await?;
        Ok(count)
    }

    /// Move a job from `expected` to `to`. Returns `None` when the job is
    /// missing or no longer in `expected` (someone else transitioned first).
    #[instrument(skip(self), fields(from = ?expected, to = ?to), err)]
    pub async fn transition(
        &mut self,
        id: JobId,
        expected: JobStatus,
        to: JobStatus,
        error: Option<&str>,
    ) -> Result<Option<JobDBResponse>> {
        let job = sqlx::query_as::<_, JobDBResponse>(
            r#"
            UPDATE staging_jobs
            SET status = $3, error = $4, updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(expected)
        .bind(to)
        .bind(error)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(job)
    }

    /// Jobs sitting in a non-terminal state since before the cutoff
    #[instrument(skip(self), err)]
    pub async fn stale_non_terminal(&mut self, cutoff: DateTime<Utc>) -> Result<Vec<JobDBResponse>> {
        let jobs = sqlx::query_as::<_, JobDBResponse>(
            "SELECT * FROM staging_jobs WHERE status IN ($1, $2) AND updated_at < $3 ORDER BY updated_at",
        )
        .bind(JobStatus::Queued)
        .bind(JobStatus::Running)
        .bind(cutoff)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(jobs)
    }

    /// Failed jobs that were debited but never refunded.
    ///
    /// The failure transition writes the refund in the same transaction, so
    /// anything here indicates a write path that bypassed it.
    #[instrument(skip(self), err)]
    pub async fn failed_without_refund(&mut self) -> Result<Vec<JobDBResponse>> {
        let jobs = sqlx::query_as::<_, JobDBResponse>(
            r#"
            SELECT j.* FROM staging_jobs j
            WHERE j.status = $1
              AND j.credit_cost > 0
              AND EXISTS (
                  SELECT 1 FROM credit_entries ce
                  WHERE ce.source_id = 'job_' || j.id::text
              )
              AND NOT EXISTS (
                  SELECT 1 FROM credit_entries ce
                  WHERE ce.source_id = 'job_refund_' || j.id::text
              )
            ORDER BY j.updated_at
            "#,
        )
        .bind(JobStatus::Failed)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(jobs)
    }
}
