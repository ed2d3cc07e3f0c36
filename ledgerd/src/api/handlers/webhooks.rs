//! Ingestion endpoint for billing provider webhook deliveries.
//!
//! The route sits outside the authenticated API: the Standard Webhooks
//! signature is the authentication. Deliveries are recorded before they are
//! processed, keyed on the provider's event id, so redeliveries answer 200
//! without touching the ledger again. Processing itself is idempotent on top
//! of that (deterministic source_ids), which covers the provider re-sending
//! the same lifecycle change under a fresh event id.

use axum::{Json, extract::State, http::HeaderMap};
use serde_json::json;

use crate::{
    AppState,
    billing::BillingError,
    db::{handlers::BillingEvents, models::billing_events::BillingEventCreateDBRequest},
    errors::{Error, Result},
};

/// Receive a signed billing event
#[tracing::instrument(skip_all)]
pub async fn ingest_billing_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<serde_json::Value>> {
    let Some(provider) = state.billing.as_deref() else {
        tracing::warn!("Billing webhook received but no provider is configured");
        return Err(Error::NotConfigured {
            feature: "Billing".to_string(),
        });
    };

    // Signature, timestamp, and body shape are all checked before anything
    // touches the database
    let Some(event) = provider.validate_webhook(&headers, &body) else {
        return Err(Error::BadRequest {
            message: "Invalid webhook delivery".to_string(),
        });
    };

    tracing::info!(event_id = %event.event_id, event_type = %event.event_type, "Received billing event");

    let mut pool_conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut events = BillingEvents::new(&mut pool_conn);

    let recorded = events
        .record(&BillingEventCreateDBRequest {
            event_id: event.event_id.clone(),
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
        })
        .await?;
    drop(pool_conn);

    if recorded.is_none() {
        tracing::debug!(event_id = %event.event_id, "Event already recorded, skipping");
        return Ok(Json(json!({ "status": "already_processed" })));
    }

    match provider.process_event(&state.db, &event).await {
        Ok(()) => Ok(Json(json!({ "status": "processed" }))),
        // A replay under a fresh event id; the original writes stand, and a
        // 200 stops the provider from retrying
        Err(BillingError::AlreadyProcessed) => Ok(Json(json!({ "status": "already_applied" }))),
        Err(other) => Err(other.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::credits::BalanceResponse;
    use crate::api::models::users::Role;
    use crate::billing::{
        SubscriptionEventData, TEST_WEBHOOK_SECRET,
        dummy::{DummyProvider, event_body},
        event_types, test_plan_catalog,
    };
    use crate::config::DummyBillingConfig;
    use crate::test_utils::{
        add_auth_headers, create_test_app, create_test_app_with_config, create_test_config, create_test_user,
    };
    use axum::http::StatusCode;
    use axum_test::TestServer;
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;
    use sqlx::PgPool;

    /// A provider holding the shared test secret, used only to sign deliveries
    fn signer() -> DummyProvider {
        let config = DummyBillingConfig {
            webhook_secret: TEST_WEBHOOK_SECRET.to_string(),
            checkout_amount: Decimal::new(50, 0),
            timestamp_tolerance: std::time::Duration::from_secs(300),
            portal_url: None,
        };
        DummyProvider::new(config, test_plan_catalog())
    }

    async fn deliver(app: &TestServer, event_id: &str, body: &str) -> axum_test::TestResponse {
        let headers = signer().sign_delivery(event_id, Utc::now(), body).unwrap();
        app.post("/webhooks/billing")
            .add_header(headers[0].0, &headers[0].1)
            .add_header(headers[1].0, &headers[1].1)
            .add_header(headers[2].0, &headers[2].1)
            .text(body.to_string())
            .await
    }

    async fn balance_of(app: &TestServer, user: &crate::api::models::users::UserResponse) -> Decimal {
        let headers = add_auth_headers(user);
        app.get("/api/v1/users/current/credits/balance")
            .add_header(&headers[0].0, &headers[0].1)
            .await
            .json::<BalanceResponse>()
            .balance
    }

    fn subscription_body(user_id: crate::types::UserId, subscription: &str, plan: &str) -> String {
        event_body(
            event_types::SUBSCRIPTION_CREATED,
            SubscriptionEventData {
                subscription_id: subscription.to_string(),
                user_id,
                plan: plan.to_string(),
                period_start: Utc::now(),
                period_end: Utc::now() + Duration::days(30),
                cancel_at_period_end: false,
            },
        )
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_unsigned_delivery_rejected(pool: PgPool) {
        let (app, _bg_services) = create_test_app(pool.clone()).await;
        let user = create_test_user(&pool, Role::StandardUser).await;
        let body = subscription_body(user.id, "sub_reject", "starter");

        // No signature headers at all
        let response = app.post("/webhooks/billing").text(body.clone()).await;
        response.assert_status_bad_request();

        // Signed, but the body was tampered with afterwards
        let headers = signer().sign_delivery("evt_tamper", Utc::now(), &body).unwrap();
        let response = app
            .post("/webhooks/billing")
            .add_header(headers[0].0, &headers[0].1)
            .add_header(headers[1].0, &headers[1].1)
            .add_header(headers[2].0, &headers[2].1)
            .text(subscription_body(user.id, "sub_reject", "pro"))
            .await;
        response.assert_status_bad_request();

        // Nothing was recorded or granted
        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(BillingEvents::new(&mut conn).count().await.unwrap(), 0);
        drop(conn);
        assert_eq!(balance_of(&app, &user).await, Decimal::ZERO);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_subscription_event_grants_credits(pool: PgPool) {
        let (app, _bg_services) = create_test_app(pool.clone()).await;
        let user = create_test_user(&pool, Role::StandardUser).await;

        let body = subscription_body(user.id, "sub_http", "starter");
        let response = deliver(&app, "evt_http_1", &body).await;
        response.assert_status_ok();
        assert_eq!(response.json::<serde_json::Value>()["status"], "processed");

        assert_eq!(balance_of(&app, &user).await, Decimal::new(100, 0));

        // The delivery is on record under the provider's event id
        let mut conn = pool.acquire().await.unwrap();
        let recorded = BillingEvents::new(&mut conn).get_by_event_id("evt_http_1").await.unwrap();
        assert!(recorded.is_some());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_redelivered_event_id_is_skipped(pool: PgPool) {
        let (app, _bg_services) = create_test_app(pool.clone()).await;
        let user = create_test_user(&pool, Role::StandardUser).await;
        let body = subscription_body(user.id, "sub_redeliver", "starter");

        deliver(&app, "evt_dup", &body).await.assert_status_ok();

        let response = deliver(&app, "evt_dup", &body).await;
        response.assert_status_ok();
        assert_eq!(response.json::<serde_json::Value>()["status"], "already_processed");

        assert_eq!(balance_of(&app, &user).await, Decimal::new(100, 0));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_replay_under_fresh_event_id_grants_nothing(pool: PgPool) {
        let (app, _bg_services) = create_test_app(pool.clone()).await;
        let user = create_test_user(&pool, Role::StandardUser).await;
        let body = subscription_body(user.id, "sub_replay", "starter");

        deliver(&app, "evt_replay_1", &body).await.assert_status_ok();

        // Same period, new event id: the dedup table lets it through but the
        // period's source_id does not
        let response = deliver(&app, "evt_replay_2", &body).await;
        response.assert_status_ok();
        assert_eq!(response.json::<serde_json::Value>()["status"], "already_applied");

        assert_eq!(balance_of(&app, &user).await, Decimal::new(100, 0));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_webhook_501_without_provider(pool: PgPool) {
        let mut config = create_test_config();
        config.billing = None;
        let (app, _bg_services) = create_test_app_with_config(pool.clone(), config).await;
        let user = create_test_user(&pool, Role::StandardUser).await;

        let body = subscription_body(user.id, "sub_none", "starter");
        let response = deliver(&app, "evt_none", &body).await;
        response.assert_status(StatusCode::NOT_IMPLEMENTED);
    }
}
