//! Admin surface for the reconciliation sweep.

use axum::{Json, extract::State};

use crate::{
    AppState,
    auth::permissions::{RequiresPermission, operation, resource},
    errors::{Error, Result},
    reconciliation::{self, ReconciliationReport},
};

/// Last reconciliation report
#[utoipa::path(
    get,
    path = "/admin/reconciliation/last",
    tag = "admin",
    summary = "Last reconciliation report",
    description = "The report persisted by the most recent sweep, background or manual.",
    responses(
        (status = 200, description = "Most recent report", body = ReconciliationReport),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden - requires system access"),
        (status = 404, description = "No sweep has completed yet"),
        (status = 500, description = "Internal server error"),
    ),
    security(
        ("CookieAuth" = []),
        ("ProxyHeader" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn get_last_report(
    State(state): State<AppState>,
    _perm: RequiresPermission<resource::System, operation::SystemAccess>,
) -> Result<Json<ReconciliationReport>> {
    let mut pool_conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;

    let report = reconciliation::last_report(&mut pool_conn).await?.ok_or_else(|| Error::NotFound {
        resource: "Reconciliation report".to_string(),
        id: "last".to_string(),
    })?;

    Ok(Json(report))
}

/// Run reconciliation now
#[utoipa::path(
    post,
    path = "/admin/reconciliation/run",
    tag = "admin",
    summary = "Run reconciliation now",
    description = "Runs a full sweep immediately and returns its report. Safe to call at any time; \
                   repairs are idempotent.",
    responses(
        (status = 200, description = "Report from the pass that just ran", body = ReconciliationReport),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden - requires system access"),
        (status = 500, description = "Internal server error"),
    ),
    security(
        ("CookieAuth" = []),
        ("ProxyHeader" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn run_reconciliation(
    State(state): State<AppState>,
    _perm: RequiresPermission<resource::System, operation::SystemAccess>,
) -> Result<Json<ReconciliationReport>> {
    let report = reconciliation::run_once(&state.db, &state.config).await?;

    tracing::info!(findings = report.finding_count(), "Manual reconciliation pass finished");

    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::users::Role;
    use crate::test_utils::{add_auth_headers, create_test_admin_user, create_test_app, create_test_user};
    use sqlx::PgPool;

    #[sqlx::test]
    #[test_log::test]
    async fn test_reconciliation_requires_system_access(pool: PgPool) {
        let (app, _bg_services) = create_test_app(pool.clone()).await;
        let user = create_test_user(&pool, Role::StandardUser).await;
        let manager = create_test_user(&pool, Role::BillingManager).await;

        for account in [&user, &manager] {
            let headers = add_auth_headers(account);
            let response = app
                .get("/api/v1/admin/reconciliation/last")
                .add_header(&headers[0].0, &headers[0].1)
                .await;
            response.assert_status_forbidden();

            let response = app
                .post("/api/v1/admin/reconciliation/run")
                .add_header(&headers[0].0, &headers[0].1)
                .await;
            response.assert_status_forbidden();
        }
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_run_then_fetch_report(pool: PgPool) {
        let (app, _bg_services) = create_test_app(pool.clone()).await;
        let admin = create_test_admin_user(&pool).await;
        let headers = add_auth_headers(&admin);

        // Nothing persisted before the first pass
        let response = app
            .get("/api/v1/admin/reconciliation/last")
            .add_header(&headers[0].0, &headers[0].1)
            .await;
        response.assert_status_not_found();

        let response = app
            .post("/api/v1/admin/reconciliation/run")
            .add_header(&headers[0].0, &headers[0].1)
            .await;
        response.assert_status_ok();
        let ran: ReconciliationReport = response.json();
        assert!(ran.is_clean());

        let response = app
            .get("/api/v1/admin/reconciliation/last")
            .add_header(&headers[0].0, &headers[0].1)
            .await;
        response.assert_status_ok();
        let stored: ReconciliationReport = response.json();
        assert_eq!(stored.started_at, ran.started_at);
    }
}
