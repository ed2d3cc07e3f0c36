use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use rust_decimal::Decimal;

use crate::{
    AppState,
    api::models::{
        credits::{AdminCreditRequest, BalanceResponse, EntryResponse, ListEntriesQuery},
        pagination::PaginatedResponse,
        users::CurrentUser,
    },
    auth::permissions::{self, RequiresPermission, operation, resource},
    db::{
        handlers::{EntryFilter, Ledger, LedgerError, Repository, Users},
        models::ledger::{EntryCreateDBRequest, EntryReason},
    },
    errors::{Error, Result},
    types::{Resource, UserId},
};

/// Get the current user's credit balance
#[utoipa::path(
    get,
    path = "/users/current/credits/balance",
    tag = "credits",
    summary = "Get own credit balance",
    description = "Current balance: the sum of the caller's non-expired ledger entries",
    responses(
        (status = 200, description = "Current balance", body = BalanceResponse),
        (status = 401, description = "Unauthorized"),
        (status = 500, description = "Internal server error"),
    ),
    security(
        ("CookieAuth" = []),
        ("ProxyHeader" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn get_own_balance(
    State(state): State<AppState>,
    _perm: RequiresPermission<resource::Credits, operation::ReadOwn>,
    current_user: CurrentUser,
) -> Result<Json<BalanceResponse>> {
    let mut pool_conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut ledger = Ledger::new(&mut pool_conn);

    let balance = ledger.balance(current_user.id).await?;

    Ok(Json(BalanceResponse {
        user_id: current_user.id,
        balance,
    }))
}

/// List the current user's ledger entries
#[utoipa::path(
    get,
    path = "/users/current/credits/entries",
    tag = "credits",
    summary = "List own ledger entries",
    description = "Paginated history of the caller's credit entries, newest first",
    params(ListEntriesQuery),
    responses(
        (status = 200, description = "Paginated ledger entries", body = PaginatedResponse<EntryResponse>),
        (status = 401, description = "Unauthorized"),
        (status = 500, description = "Internal server error"),
    ),
    security(
        ("CookieAuth" = []),
        ("ProxyHeader" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn list_own_entries(
    State(state): State<AppState>,
    Query(query): Query<ListEntriesQuery>,
    _perm: RequiresPermission<resource::Credits, operation::ReadOwn>,
    current_user: CurrentUser,
) -> Result<Json<PaginatedResponse<EntryResponse>>> {
    let (skip, limit) = query.pagination.params();

    let mut pool_conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut ledger = Ledger::new(&mut pool_conn);

    let entries = ledger.list_for_user(current_user.id, &EntryFilter::new(skip, limit)).await?;
    let total_count = ledger.count_for_user(current_user.id).await?;

    let data = entries.into_iter().map(EntryResponse::from).collect();
    Ok(Json(PaginatedResponse::new(data, total_count, skip, limit)))
}

/// Create an admin credit adjustment
#[utoipa::path(
    post,
    path = "/users/{user_id}/credits",
    tag = "credits",
    summary = "Adjust a user's credits",
    description = "Append an admin_grant or admin_removal entry to a user's ledger (BillingManager role required). \
                   Amounts are positive magnitudes; removals are stored negated and cannot take the balance below zero.",
    params(
        ("user_id" = Uuid, Path, description = "User to adjust"),
    ),
    request_body = AdminCreditRequest,
    responses(
        (status = 201, description = "Adjustment applied", body = EntryResponse),
        (status = 400, description = "Bad request - invalid reason, amount, or removal beyond balance"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden - requires BillingManager role"),
        (status = 404, description = "User not found"),
        (status = 500, description = "Internal server error"),
    ),
    security(
        ("CookieAuth" = []),
        ("ProxyHeader" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn create_adjustment(
    State(state): State<AppState>,
    granter: RequiresPermission<resource::Credits, operation::CreateAll>,
    Path(user_id): Path<UserId>,
    Json(data): Json<AdminCreditRequest>,
) -> Result<(StatusCode, Json<EntryResponse>)> {
    // Only the two audited correction reasons are accepted here; every other
    // reason is written by a system path with its own source_id scheme.
    if !matches!(data.reason, EntryReason::AdminGrant | EntryReason::AdminRemoval) {
        return Err(Error::BadRequest {
            message: "Reason must be admin_grant or admin_removal".to_string(),
        });
    }

    if data.amount <= Decimal::ZERO {
        return Err(Error::BadRequest {
            message: "Amount must be greater than zero".to_string(),
        });
    }

    let description = match data.description.as_deref().map(str::trim) {
        Some(d) if !d.is_empty() => d.to_string(),
        _ => {
            return Err(Error::BadRequest {
                message: "A description is required for admin adjustments".to_string(),
            });
        }
    };

    let mut pool_conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;

    let mut users = Users::new(&mut pool_conn);
    if users.get_by_id(user_id).await?.is_none() {
        return Err(Error::NotFound {
            resource: "User".to_string(),
            id: user_id.to_string(),
        });
    }

    let request = match data.reason {
        EntryReason::AdminGrant => EntryCreateDBRequest::admin_grant(user_id, granter.id, data.amount, Some(description)),
        _ => EntryCreateDBRequest::admin_removal(user_id, granter.id, data.amount, Some(description)),
    };

    let mut ledger = Ledger::new(&mut pool_conn);
    let entry = match ledger.append(&request).await {
        Ok(entry) => entry,
        // An admin overdrawing a user is a request mistake, not a payment
        // problem, so it maps to 400 rather than 402.
        Err(LedgerError::InsufficientBalance { balance, requested }) => {
            return Err(Error::BadRequest {
                message: format!("Cannot remove {requested} credits: balance is only {balance}"),
            });
        }
        Err(other) => return Err(other.into()),
    };

    Ok((StatusCode::CREATED, Json(EntryResponse::from(entry))))
}

/// Get a specific user's credit balance
#[utoipa::path(
    get,
    path = "/users/{user_id}/credits/balance",
    tag = "credits",
    summary = "Get a user's credit balance",
    description = "Balance for any user. Callers without Credits ReadAll can only access their own.",
    params(
        ("user_id" = Uuid, Path, description = "User ID"),
    ),
    responses(
        (status = 200, description = "Current balance", body = BalanceResponse),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "User not found"),
        (status = 500, description = "Internal server error"),
    ),
    security(
        ("CookieAuth" = []),
        ("ProxyHeader" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn get_user_balance(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
    current_user: CurrentUser,
) -> Result<Json<BalanceResponse>> {
    let has_read_all = permissions::can_read_all_resources(&current_user, Resource::Credits);
    if !has_read_all && user_id != current_user.id {
        // Return 404 to avoid leaking existence
        return Err(Error::NotFound {
            resource: "User".to_string(),
            id: user_id.to_string(),
        });
    }

    let mut pool_conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;

    let mut users = Users::new(&mut pool_conn);
    if users.get_by_id(user_id).await?.is_none() {
        return Err(Error::NotFound {
            resource: "User".to_string(),
            id: user_id.to_string(),
        });
    }

    let mut ledger = Ledger::new(&mut pool_conn);
    let balance = ledger.balance(user_id).await?;

    Ok(Json(BalanceResponse { user_id, balance }))
}

/// List a specific user's ledger entries
#[utoipa::path(
    get,
    path = "/users/{user_id}/credits/entries",
    tag = "credits",
    summary = "List a user's ledger entries",
    description = "Paginated ledger history for any user. Callers without Credits ReadAll can only access their own.",
    params(
        ("user_id" = Uuid, Path, description = "User ID"),
        ListEntriesQuery
    ),
    responses(
        (status = 200, description = "Paginated ledger entries", body = PaginatedResponse<EntryResponse>),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "User not found"),
        (status = 500, description = "Internal server error"),
    ),
    security(
        ("CookieAuth" = []),
        ("ProxyHeader" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn list_user_entries(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
    Query(query): Query<ListEntriesQuery>,
    current_user: CurrentUser,
) -> Result<Json<PaginatedResponse<EntryResponse>>> {
    let has_read_all = permissions::can_read_all_resources(&current_user, Resource::Credits);
    if !has_read_all && user_id != current_user.id {
        // Return 404 to avoid leaking existence
        return Err(Error::NotFound {
            resource: "User".to_string(),
            id: user_id.to_string(),
        });
    }

    let (skip, limit) = query.pagination.params();

    let mut pool_conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;

    let mut users = Users::new(&mut pool_conn);
    if users.get_by_id(user_id).await?.is_none() {
        return Err(Error::NotFound {
            resource: "User".to_string(),
            id: user_id.to_string(),
        });
    }

    let mut ledger = Ledger::new(&mut pool_conn);
    let entries = ledger.list_for_user(user_id, &EntryFilter::new(skip, limit)).await?;
    let total_count = ledger.count_for_user(user_id).await?;

    let data = entries.into_iter().map(EntryResponse::from).collect();
    Ok(Json(PaginatedResponse::new(data, total_count, skip, limit)))
}

/// List all ledger entries across users
#[utoipa::path(
    get,
    path = "/credits/entries",
    tag = "credits",
    summary = "List all ledger entries",
    description = "Global paginated feed of credit entries, newest first (requires Credits ReadAll)",
    params(ListEntriesQuery),
    responses(
        (status = 200, description = "Paginated ledger entries", body = PaginatedResponse<EntryResponse>),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden - requires Credits ReadAll"),
        (status = 500, description = "Internal server error"),
    ),
    security(
        ("CookieAuth" = []),
        ("ProxyHeader" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn list_all_entries(
    State(state): State<AppState>,
    _perm: RequiresPermission<resource::Credits, operation::ReadAll>,
    Query(query): Query<ListEntriesQuery>,
) -> Result<Json<PaginatedResponse<EntryResponse>>> {
    let (skip, limit) = query.pagination.params();

    let mut pool_conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut ledger = Ledger::new(&mut pool_conn);

    let entries = ledger.list_all(&EntryFilter::new(skip, limit)).await?;
    let total_count = ledger.count_all().await?;

    let data = entries.into_iter().map(EntryResponse::from).collect();
    Ok(Json(PaginatedResponse::new(data, total_count, skip, limit)))
}
