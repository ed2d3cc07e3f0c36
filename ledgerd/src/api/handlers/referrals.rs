//! HTTP handlers for referral code endpoints.
//!
//! Personal referral codes are redeemed implicitly at registration; the
//! endpoints here cover the single-use marketing codes: admins mint and list
//! them, users redeem them. A redemption claims the code row and appends the
//! grant in one transaction, so a code can never pay out twice.

use axum::{
    Json,
    extract::State,
    http::StatusCode,
};
use chrono::Utc;
use rust_decimal::Decimal;

use crate::{
    AppState,
    api::models::{
        referrals::{RedeemRequest, RedeemResponse, ReferralCodeCreateRequest, ReferralCodeResponse},
        users::CurrentUser,
    },
    auth::permissions::{RequiresPermission, operation, resource},
    db::{
        handlers::{Ledger, Referrals, Repository, Users},
        models::{ledger::EntryCreateDBRequest, referrals::ReferralCodeCreateDBRequest},
    },
    errors::{Error, Result},
};

/// Redeem a single-use referral code
#[utoipa::path(
    post,
    path = "/referrals/redeem",
    tag = "referrals",
    summary = "Redeem a referral code",
    description = "Claims a single-use marketing code and credits the caller. Each code pays out once, \
                   to whichever user claims it first.",
    request_body = RedeemRequest,
    responses(
        (status = 200, description = "Code redeemed", body = RedeemResponse),
        (status = 400, description = "Bad request - empty code or own personal code"),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Unknown code"),
        (status = 409, description = "Code already redeemed or expired"),
        (status = 500, description = "Internal server error"),
    ),
    security(
        ("CookieAuth" = []),
        ("ProxyHeader" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn redeem_code(
    State(state): State<AppState>,
    _perm: RequiresPermission<resource::ReferralCodes, operation::UpdateOwn>,
    current_user: CurrentUser,
    Json(data): Json<RedeemRequest>,
) -> Result<Json<RedeemResponse>> {
    let code = data.code.trim();
    if code.is_empty() {
        return Err(Error::BadRequest {
            message: "A referral code is required".to_string(),
        });
    }

    let mut tx = state.db.begin().await.map_err(|e| Error::Database(e.into()))?;

    // Personal codes only work at registration, and never on yourself
    let me = Users::new(&mut tx).get_by_id(current_user.id).await?.ok_or(Error::NotFound {
        resource: "User".to_string(),
        id: current_user.id.to_string(),
    })?;
    if me.referral_code == code {
        return Err(Error::BadRequest {
            message: "You cannot redeem your own referral code".to_string(),
        });
    }

    let mut referrals = Referrals::new(&mut tx);
    let Some(claimed) = referrals.claim(code, current_user.id).await? else {
        // Zero rows: figure out whether the code is unknown, spent, or expired
        let existing = referrals.get_by_code(code).await?;
        return Err(match existing {
            None => Error::NotFound {
                resource: "Referral code".to_string(),
                id: code.to_string(),
            },
            Some(row) if row.is_redeemed() => Error::Conflict {
                message: "This code has already been redeemed".to_string(),
            },
            Some(_) => Error::Conflict {
                message: "This code has expired".to_string(),
            },
        });
    };

    let expires_at = state
        .config
        .credits
        .referral
        .expires_after
        .and_then(|d| chrono::Duration::from_std(d).ok())
        .map(|d| Utc::now() + d);

    let grant = EntryCreateDBRequest::special_code_grant(current_user.id, code, claimed.credit_amount, expires_at);

    let mut ledger = Ledger::new(&mut tx);
    let entry = ledger.append(&grant).await?;
    let balance = ledger.balance(current_user.id).await?;

    tx.commit().await.map_err(|e| Error::Database(e.into()))?;

    tracing::info!(code = %claimed.code, user = %current_user.id, "Referral code redeemed for {} credits", claimed.credit_amount);

    Ok(Json(RedeemResponse {
        granted: claimed.credit_amount,
        expires_at: entry.expires_at,
        balance,
    }))
}

/// Create a single-use referral code
#[utoipa::path(
    post,
    path = "/referrals",
    tag = "referrals",
    summary = "Create a referral code",
    description = "Mint a single-use marketing code worth a fixed credit amount (BillingManager role required)",
    request_body = ReferralCodeCreateRequest,
    responses(
        (status = 201, description = "Code created", body = ReferralCodeResponse),
        (status = 400, description = "Bad request - empty code, non-positive amount, or past expiry"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden - requires BillingManager role"),
        (status = 409, description = "Code already exists"),
        (status = 500, description = "Internal server error"),
    ),
    security(
        ("CookieAuth" = []),
        ("ProxyHeader" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn create_code(
    State(state): State<AppState>,
    creator: RequiresPermission<resource::ReferralCodes, operation::CreateAll>,
    Json(data): Json<ReferralCodeCreateRequest>,
) -> Result<(StatusCode, Json<ReferralCodeResponse>)> {
    let code = data.code.trim();
    if code.is_empty() {
        return Err(Error::BadRequest {
            message: "Code must not be empty".to_string(),
        });
    }
    if data.credit_amount <= Decimal::ZERO {
        return Err(Error::BadRequest {
            message: "Credit amount must be greater than zero".to_string(),
        });
    }
    if let Some(expires_at) = data.expires_at
        && expires_at <= Utc::now()
    {
        return Err(Error::BadRequest {
            message: "Expiry must be in the future".to_string(),
        });
    }

    let mut pool_conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut referrals = Referrals::new(&mut pool_conn);

    // A duplicate code surfaces as a unique violation, which maps to 409
    let created = referrals
        .create(&ReferralCodeCreateDBRequest {
            code: code.to_string(),
            credit_amount: data.credit_amount,
            expires_at: data.expires_at,
            created_by: creator.id,
        })
        .await?;

    tracing::info!(code = %created.code, "Created referral code worth {} credits", created.credit_amount);

    Ok((StatusCode::CREATED, Json(ReferralCodeResponse::from(created))))
}

/// List referral codes
#[utoipa::path(
    get,
    path = "/referrals",
    tag = "referrals",
    summary = "List referral codes",
    description = "All minted codes with their redemption state (requires ReferralCodes ReadAll)",
    responses(
        (status = 200, description = "List of codes", body = [ReferralCodeResponse]),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden"),
        (status = 500, description = "Internal server error"),
    ),
    security(
        ("CookieAuth" = []),
        ("ProxyHeader" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn list_codes(
    State(state): State<AppState>,
    _perm: RequiresPermission<resource::ReferralCodes, operation::ReadAll>,
) -> Result<Json<Vec<ReferralCodeResponse>>> {
    let mut pool_conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut referrals = Referrals::new(&mut pool_conn);

    let codes = referrals.list().await?;
    Ok(Json(codes.into_iter().map(ReferralCodeResponse::from).collect()))
}
