//! HTTP handlers for staging job endpoints.
//!
//! Jobs are the ledger's one debit path: creating a job writes the job row
//! and its `job_usage` debit in a single transaction, so a job either exists
//! fully paid for or not at all. The failure transition refunds the debit the
//! same way. Workers drive status through the transition endpoint; the
//! guarded update in the repository keeps racing writers honest.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use rust_decimal::Decimal;

use crate::{
    AppState,
    api::models::{
        jobs::{JobCreateRequest, JobResponse, JobTransitionRequest, ListJobsQuery},
        pagination::PaginatedResponse,
        users::CurrentUser,
    },
    auth::permissions::{self, RequiresPermission, operation, resource},
    db::{
        handlers::{Jobs, JobFilter, Ledger, LedgerError},
        models::{jobs::JobStatus, ledger::EntryCreateDBRequest},
    },
    errors::{Error, Result},
    types::{JobId, Resource},
};

/// Create a staging job
#[utoipa::path(
    post,
    path = "/jobs",
    tag = "jobs",
    summary = "Create a job",
    description = "Creates a staging job and debits its credit cost in the same transaction. \
                   402 when the caller's balance cannot cover the cost; the job is not created.",
    request_body = JobCreateRequest,
    responses(
        (status = 201, description = "Job created and debited", body = JobResponse),
        (status = 400, description = "Bad request - empty kind"),
        (status = 401, description = "Unauthorized"),
        (status = 402, description = "Insufficient credits"),
        (status = 500, description = "Internal server error"),
    ),
    security(
        ("CookieAuth" = []),
        ("ProxyHeader" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn create_job(
    State(state): State<AppState>,
    _perm: RequiresPermission<resource::Jobs, operation::CreateOwn>,
    current_user: CurrentUser,
    Json(data): Json<JobCreateRequest>,
) -> Result<(StatusCode, Json<JobResponse>)> {
    let kind = data.kind.trim();
    if kind.is_empty() {
        return Err(Error::BadRequest {
            message: "Job kind must not be empty".to_string(),
        });
    }

    let credit_cost = state.config.credits.jobs.cost_for(kind);

    let mut tx = state.db.begin().await.map_err(|e| Error::Database(e.into()))?;

    let job = Jobs::new(&mut tx)
        .create(&crate::db::models::jobs::JobCreateDBRequest {
            user_id: current_user.id,
            kind: kind.to_string(),
            credit_cost,
        })
        .await?;

    // The debit rides in the same transaction: a 402 rolls the job back
    if credit_cost > Decimal::ZERO {
        let mut ledger = Ledger::new(&mut tx);
        ledger
            .append(&EntryCreateDBRequest::job_usage(current_user.id, job.id, credit_cost))
            .await?;
    }

    tx.commit().await.map_err(|e| Error::Database(e.into()))?;

    tracing::info!(job_id = %job.id, kind = %job.kind, "Created job for {credit_cost} credits");

    Ok((StatusCode::CREATED, Json(JobResponse::from(job))))
}

/// List jobs
#[utoipa::path(
    get,
    path = "/jobs",
    tag = "jobs",
    summary = "List jobs",
    description = "The caller's jobs, newest first. Callers with Jobs ReadAll see every user's jobs.",
    params(ListJobsQuery),
    responses(
        (status = 200, description = "Paginated jobs", body = PaginatedResponse<JobResponse>),
        (status = 401, description = "Unauthorized"),
        (status = 500, description = "Internal server error"),
    ),
    security(
        ("CookieAuth" = []),
        ("ProxyHeader" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
    _perm: RequiresPermission<resource::Jobs, operation::ReadOwn>,
    current_user: CurrentUser,
) -> Result<Json<PaginatedResponse<JobResponse>>> {
    let (skip, limit) = query.pagination.params();
    let filter = JobFilter::new(skip, limit);

    let mut pool_conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut jobs = Jobs::new(&mut pool_conn);

    let (rows, total_count) = if permissions::can_read_all_resources(&current_user, Resource::Jobs) {
        (jobs.list_all(&filter).await?, jobs.count_all().await?)
    } else {
        (
            jobs.list_for_user(current_user.id, &filter).await?,
            jobs.count_for_user(current_user.id).await?,
        )
    };

    let data = rows.into_iter().map(JobResponse::from).collect();
    Ok(Json(PaginatedResponse::new(data, total_count, skip, limit)))
}

/// Get a job
#[utoipa::path(
    get,
    path = "/jobs/{job_id}",
    tag = "jobs",
    summary = "Get a job",
    description = "A single job by id. Callers without Jobs ReadAll can only access their own.",
    params(
        ("job_id" = Uuid, Path, description = "Job ID"),
    ),
    responses(
        (status = 200, description = "Job details", body = JobResponse),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Job not found"),
        (status = 500, description = "Internal server error"),
    ),
    security(
        ("CookieAuth" = []),
        ("ProxyHeader" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
    current_user: CurrentUser,
) -> Result<Json<JobResponse>> {
    let mut pool_conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut jobs = Jobs::new(&mut pool_conn);

    let job = jobs.get_by_id(job_id).await?.ok_or_else(|| Error::NotFound {
        resource: "Job".to_string(),
        id: job_id.to_string(),
    })?;

    if job.user_id != current_user.id && !permissions::can_read_all_resources(&current_user, Resource::Jobs) {
        // Return 404 to avoid leaking existence
        return Err(Error::NotFound {
            resource: "Job".to_string(),
            id: job_id.to_string(),
        });
    }

    Ok(Json(JobResponse::from(job)))
}

/// Transition a job's status
#[utoipa::path(
    post,
    path = "/jobs/{job_id}/transition",
    tag = "jobs",
    summary = "Transition a job",
    description = "Moves a job through its lifecycle (queued → running → succeeded | failed). \
                   Failing a job refunds its debit in the same transaction; a failure detail is required.",
    params(
        ("job_id" = Uuid, Path, description = "Job ID"),
    ),
    request_body = JobTransitionRequest,
    responses(
        (status = 200, description = "Job transitioned", body = JobResponse),
        (status = 400, description = "Bad request - missing failure detail"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden - requires Jobs UpdateAll"),
        (status = 404, description = "Job not found"),
        (status = 409, description = "Transition not allowed from the job's current status"),
        (status = 500, description = "Internal server error"),
    ),
    security(
        ("CookieAuth" = []),
        ("ProxyHeader" = [])
    )
)]
#[tracing::instrument(skip_all, fields(job_id = %job_id))]
pub async fn transition_job(
    State(state): State<AppState>,
    _perm: RequiresPermission<resource::Jobs, operation::UpdateAll>,
    Path(job_id): Path<JobId>,
    Json(data): Json<JobTransitionRequest>,
) -> Result<Json<JobResponse>> {
    let error = match (data.status, data.error.as_deref().map(str::trim)) {
        (JobStatus::Failed, Some(detail)) if !detail.is_empty() => Some(detail.to_string()),
        (JobStatus::Failed, _) => {
            return Err(Error::BadRequest {
                message: "A failure detail is required when failing a job".to_string(),
            });
        }
        _ => None,
    };

    let mut tx = state.db.begin().await.map_err(|e| Error::Database(e.into()))?;

    let mut jobs = Jobs::new(&mut tx);
    let job = jobs.get_by_id(job_id).await?.ok_or_else(|| Error::NotFound {
        resource: "Job".to_string(),
        id: job_id.to_string(),
    })?;

    if !job.status.can_transition_to(data.status) {
        return Err(Error::Conflict {
            message: format!("Job cannot move from {:?} to {:?}", job.status, data.status),
        });
    }

    let updated = jobs
        .transition(job.id, job.status, data.status, error.as_deref())
        .await?
        .ok_or_else(|| Error::Conflict {
            // Guarded update lost: something else moved the job first
            message: "Job changed status concurrently".to_string(),
        })?;

    // A failed job gets its debit back; the deterministic source_id keeps
    // replays from refunding twice
    if updated.status == JobStatus::Failed && updated.credit_cost > Decimal::ZERO {
        let refund = EntryCreateDBRequest::job_refund(updated.user_id, updated.id, updated.credit_cost);
        let mut ledger = Ledger::new(&mut tx);
        match ledger.append(&refund).await {
            Ok(_) => {
                tracing::info!(job_id = %updated.id, "Refunded {} credits for failed job", updated.credit_cost);
            }
            Err(LedgerError::AlreadyApplied { .. }) => {
                tracing::trace!(job_id = %updated.id, "Refund already applied, skipping");
            }
            Err(e) => return Err(e.into()),
        }
    }

    tx.commit().await.map_err(|e| Error::Database(e.into()))?;

    Ok(Json(JobResponse::from(updated)))
}
