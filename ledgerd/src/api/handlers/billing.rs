//! HTTP handlers for checkout, customer portal, and plan endpoints.
//!
//! All of these delegate to the configured [`BillingProvider`]; when no
//! provider is configured the write endpoints answer 501 so the dashboard can
//! hide its purchase UI. Reading the active plan works regardless, since plan
//! rows live in our database.

use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, header},
};

use crate::{
    AppState,
    api::models::{
        billing::{CheckoutResponse, PlanResponse, PortalResponse, ProcessCheckoutResponse},
        users::CurrentUser,
    },
    auth::permissions::{RequiresPermission, operation, resource},
    billing::{BillingError, BillingProvider},
    config::Config,
    db::handlers::Plans,
    errors::{Error, Result},
};

/// Resolve the frontend origin to redirect back to after checkout.
///
/// Prefers the browser-supplied `Origin`, then the `Referer` reduced to its
/// origin, then the proxy-forwarded protocol plus `Host`, and finally the
/// configured dashboard URL.
fn request_origin(headers: &HeaderMap, config: &Config) -> String {
    headers
        .get(header::ORIGIN)
        .or_else(|| headers.get(header::REFERER))
        .and_then(|h| h.to_str().ok())
        .and_then(|s| {
            // A referer carries a path; reduce it to just the origin
            if let Ok(url) = url::Url::parse(s) {
                url.origin().ascii_serialization().into()
            } else {
                Some(s.to_string())
            }
        })
        .or_else(|| {
            let host = headers.get(header::HOST).and_then(|h| h.to_str().ok())?;
            let proto = headers
                .get("x-forwarded-proto")
                .and_then(|h| h.to_str().ok())
                .unwrap_or("http");
            Some(format!("{proto}://{host}"))
        })
        .unwrap_or_else(|| config.dashboard_url.clone())
}

fn provider(state: &AppState) -> Result<&dyn BillingProvider> {
    state.billing.as_deref().ok_or(Error::NotConfigured {
        feature: "Billing".to_string(),
    })
}

/// Create a checkout session for a one-off credit purchase
#[utoipa::path(
    post,
    path = "/billing/checkout",
    tag = "billing",
    summary = "Create checkout session",
    description = "Creates a provider checkout session and returns the URL to send the user to. \
                   The success redirect carries the session id so the frontend can trigger processing.",
    responses(
        (status = 200, description = "Checkout session created", body = CheckoutResponse),
        (status = 401, description = "Unauthorized"),
        (status = 501, description = "No billing provider configured"),
        (status = 500, description = "Internal server error"),
    ),
    security(
        ("CookieAuth" = []),
        ("ProxyHeader" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn create_checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    current_user: CurrentUser,
) -> Result<Json<CheckoutResponse>> {
    let provider = provider(&state)?;

    let origin = request_origin(&headers, &state.config);
    let success_url = format!("{origin}/billing?payment=success&session_id={{CHECKOUT_SESSION_ID}}");
    let cancel_url = format!("{origin}/billing?payment=cancelled");

    tracing::info!("Building checkout URLs with origin: {origin}");

    let session = provider
        .create_checkout_session(&state.db, &current_user, &cancel_url, &success_url)
        .await?;

    Ok(Json(CheckoutResponse {
        session_id: session.session_id,
        checkout_url: session.checkout_url,
    }))
}

/// Manually fulfill a checkout session
#[utoipa::path(
    post,
    path = "/billing/checkout/{session_id}/process",
    tag = "billing",
    summary = "Process a checkout session",
    description = "Credits the purchase for a paid checkout session. Fallback for missed \
                   completion webhooks; safe to call any number of times.",
    params(
        ("session_id" = String, Path, description = "Provider checkout session id"),
    ),
    responses(
        (status = 200, description = "Session fulfilled (or already was)", body = ProcessCheckoutResponse),
        (status = 400, description = "Invalid session id"),
        (status = 401, description = "Unauthorized"),
        (status = 402, description = "Payment not completed yet"),
        (status = 501, description = "No billing provider configured"),
        (status = 500, description = "Internal server error"),
    ),
    security(
        ("CookieAuth" = []),
        ("ProxyHeader" = [])
    )
)]
#[tracing::instrument(skip_all, fields(session_id = %session_id))]
pub async fn process_checkout(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    _current_user: CurrentUser,
) -> Result<Json<ProcessCheckoutResponse>> {
    let provider = provider(&state)?;

    let status = match provider.process_checkout_session(&state.db, &session_id).await {
        Ok(()) => "applied",
        // The webhook (or an earlier retry) got there first; for the caller
        // that is success
        Err(BillingError::AlreadyProcessed) => "already_applied",
        Err(other) => return Err(other.into()),
    };

    Ok(Json(ProcessCheckoutResponse {
        status: status.to_string(),
    }))
}

/// Create a customer portal session
#[utoipa::path(
    post,
    path = "/billing/portal",
    tag = "billing",
    summary = "Open the customer portal",
    description = "Returns the provider's customer portal URL, where the user manages their subscription",
    responses(
        (status = 200, description = "Portal session created", body = PortalResponse),
        (status = 401, description = "Unauthorized"),
        (status = 501, description = "No billing provider configured"),
        (status = 500, description = "Internal server error"),
    ),
    security(
        ("CookieAuth" = []),
        ("ProxyHeader" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn create_portal(
    State(state): State<AppState>,
    headers: HeaderMap,
    current_user: CurrentUser,
) -> Result<Json<PortalResponse>> {
    let provider = provider(&state)?;

    let return_url = format!("{}/billing", request_origin(&headers, &state.config));
    let portal_url = provider.create_portal_session(&state.db, &current_user, &return_url).await?;

    Ok(Json(PortalResponse { portal_url }))
}

/// Get the current user's active plan
#[utoipa::path(
    get,
    path = "/users/current/plan",
    tag = "billing",
    summary = "Get own subscription plan",
    description = "The caller's active plan, if any. 404 when the user has never subscribed or the plan was canceled.",
    responses(
        (status = 200, description = "Active plan", body = PlanResponse),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "No active plan"),
        (status = 500, description = "Internal server error"),
    ),
    security(
        ("CookieAuth" = []),
        ("ProxyHeader" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn get_own_plan(
    State(state): State<AppState>,
    _perm: RequiresPermission<resource::Plans, operation::ReadOwn>,
    current_user: CurrentUser,
) -> Result<Json<PlanResponse>> {
    let mut pool_conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut plans = Plans::new(&mut pool_conn);

    let plan = plans.get_active_for_user(current_user.id).await?.ok_or(Error::NotFound {
        resource: "Plan".to_string(),
        id: current_user.id.to_string(),
    })?;

    Ok(Json(PlanResponse::from(plan)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::users::Role;
    use crate::db::models::plans::{PlanCreateDBRequest, PlanStatus};
    use crate::test_utils::{
        add_auth_headers, create_test_app, create_test_app_with_config, create_test_config, create_test_user,
    };
    use axum::http::StatusCode;
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;
    use sqlx::PgPool;

    #[sqlx::test]
    #[test_log::test]
    async fn test_checkout_returns_session_without_writing(pool: PgPool) {
        let (app, _bg_services) = create_test_app(pool.clone()).await;
        let user = create_test_user(&pool, Role::StandardUser).await;
        let headers = add_auth_headers(&user);

        let response = app
            .post("/api/v1/billing/checkout")
            .add_header(&headers[0].0, &headers[0].1)
            .await;
        response.assert_status_ok();

        let checkout: CheckoutResponse = response.json();
        assert!(checkout.session_id.starts_with(&format!("dummy_session_{}", user.id)));
        assert!(checkout.checkout_url.contains("payment=success"));
        assert!(checkout.checkout_url.contains(&checkout.session_id));

        // Creating the session credits nothing
        let balance = app
            .get("/api/v1/users/current/credits/balance")
            .add_header(&headers[0].0, &headers[0].1)
            .await
            .json::<crate::api::models::credits::BalanceResponse>()
            .balance;
        assert_eq!(balance, Decimal::ZERO);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_process_checkout_is_idempotent(pool: PgPool) {
        let (app, _bg_services) = create_test_app(pool.clone()).await;
        let user = create_test_user(&pool, Role::StandardUser).await;
        let headers = add_auth_headers(&user);

        let checkout: CheckoutResponse = app
            .post("/api/v1/billing/checkout")
            .add_header(&headers[0].0, &headers[0].1)
            .await
            .json();

        let path = format!("/api/v1/billing/checkout/{}/process", checkout.session_id);

        let response = app.post(&path).add_header(&headers[0].0, &headers[0].1).await;
        response.assert_status_ok();
        assert_eq!(response.json::<ProcessCheckoutResponse>().status, "applied");

        // Refreshing the success page retries processing; no second entry
        let response = app.post(&path).add_header(&headers[0].0, &headers[0].1).await;
        response.assert_status_ok();
        assert_eq!(response.json::<ProcessCheckoutResponse>().status, "already_applied");

        let balance = app
            .get("/api/v1/users/current/credits/balance")
            .add_header(&headers[0].0, &headers[0].1)
            .await
            .json::<crate::api::models::credits::BalanceResponse>()
            .balance;
        assert_eq!(balance, Decimal::new(50, 0));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_process_rejects_malformed_session_id(pool: PgPool) {
        let (app, _bg_services) = create_test_app(pool.clone()).await;
        let user = create_test_user(&pool, Role::StandardUser).await;
        let headers = add_auth_headers(&user);

        let response = app
            .post("/api/v1/billing/checkout/not_a_dummy_session/process")
            .add_header(&headers[0].0, &headers[0].1)
            .await;
        response.assert_status_bad_request();
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_billing_endpoints_501_without_provider(pool: PgPool) {
        let mut config = create_test_config();
        config.billing = None;
        let (app, _bg_services) = create_test_app_with_config(pool.clone(), config).await;
        let user = create_test_user(&pool, Role::StandardUser).await;
        let headers = add_auth_headers(&user);

        for path in ["/api/v1/billing/checkout", "/api/v1/billing/portal", "/api/v1/billing/checkout/x/process"] {
            let response = app.post(path).add_header(&headers[0].0, &headers[0].1).await;
            response.assert_status(StatusCode::NOT_IMPLEMENTED);
        }
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_portal_returns_url(pool: PgPool) {
        let (app, _bg_services) = create_test_app(pool.clone()).await;
        let user = create_test_user(&pool, Role::StandardUser).await;
        let headers = add_auth_headers(&user);

        let response = app
            .post("/api/v1/billing/portal")
            .add_header(&headers[0].0, &headers[0].1)
            .await;
        response.assert_status_ok();
        // The dummy provider bounces back to the return URL
        assert!(response.json::<PortalResponse>().portal_url.contains("/billing"));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_own_plan_shown_or_404(pool: PgPool) {
        let (app, _bg_services) = create_test_app(pool.clone()).await;
        let subscriber = create_test_user(&pool, Role::StandardUser).await;
        let free_user = create_test_user(&pool, Role::StandardUser).await;

        let now = Utc::now();
        let mut conn = pool.acquire().await.unwrap();
        Plans::new(&mut conn)
            .create(&PlanCreateDBRequest {
                user_id: subscriber.id,
                name: "starter".to_string(),
                status: PlanStatus::Active,
                provider_subscription_id: "sub_plan_test".to_string(),
                credits_per_period: Decimal::new(100, 0),
                current_period_start: now,
                current_period_end: now + Duration::days(30),
            })
            .await
            .unwrap();
        drop(conn);

        let headers = add_auth_headers(&subscriber);
        let response = app
            .get("/api/v1/users/current/plan")
            .add_header(&headers[0].0, &headers[0].1)
            .await;
        response.assert_status_ok();
        let plan: PlanResponse = response.json();
        assert_eq!(plan.name, "starter");
        assert_eq!(plan.status, PlanStatus::Active);
        assert_eq!(plan.user_id, subscriber.id);

        let headers = add_auth_headers(&free_user);
        let response = app
            .get("/api/v1/users/current/plan")
            .add_header(&headers[0].0, &headers[0].1)
            .await;
        response.assert_status_not_found();
    }

    #[test]
    fn test_request_origin_resolution() {
        let config = create_test_config();

        // Origin header wins
        let mut headers = HeaderMap::new();
        headers.insert(header::ORIGIN, "https://app.example.com".parse().unwrap());
        headers.insert(header::HOST, "ignored:9".parse().unwrap());
        assert_eq!(request_origin(&headers, &config), "https://app.example.com");

        // Referer is reduced to its origin
        let mut headers = HeaderMap::new();
        headers.insert(header::REFERER, "https://app.example.com/billing?tab=1".parse().unwrap());
        assert_eq!(request_origin(&headers, &config), "https://app.example.com");

        // Host + forwarded proto
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "ledger.internal:8080".parse().unwrap());
        headers.insert("x-forwarded-proto", "https".parse().unwrap());
        assert_eq!(request_origin(&headers, &config), "https://ledger.internal:8080");

        // Nothing usable falls back to the configured dashboard
        let headers = HeaderMap::new();
        assert_eq!(request_origin(&headers, &config), config.dashboard_url);
    }
}
