//! Dummy billing provider.
//!
//! Stands in for a real payment provider in development and tests: checkout
//! "payments" complete instantly, the customer portal is a redirect, and
//! webhook deliveries are Standard-Webhooks-signed bodies anyone holding the
//! shared secret can produce. The subscription lifecycle handling is real:
//! plans and grants are written exactly as they would be for a live
//! provider, which is what makes this provider useful for exercising the
//! ledger's idempotency guarantees end to end.

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashMap;
use std::time::Duration;

use crate::{
    api::models::users::CurrentUser,
    billing::{
        BillingError, BillingEvent, BillingProvider, CheckoutEventData, CheckoutSession, Result,
        SubscriptionEventData, event_types, signing,
    },
    config::DummyBillingConfig,
    db::{
        handlers::{Ledger, LedgerError, Plans},
        models::{
            ledger::EntryCreateDBRequest,
            plans::{PlanCreateDBRequest, PlanStatus, PlanUpdateDBRequest},
        },
    },
    types::UserId,
};

/// Session id prefix; the user id is embedded so processing can recover it
const SESSION_PREFIX: &str = "dummy_session_";

/// Dummy billing provider
pub struct DummyProvider {
    checkout_amount: Decimal,
    webhook_secret: String,
    timestamp_tolerance: Duration,
    portal_url: Option<String>,
    plan_catalog: HashMap<String, Decimal>,
}

impl DummyProvider {
    pub fn new(config: DummyBillingConfig, plan_catalog: HashMap<String, Decimal>) -> Self {
        Self {
            checkout_amount: config.checkout_amount,
            webhook_secret: config.webhook_secret,
            timestamp_tolerance: config.timestamp_tolerance,
            portal_url: config.portal_url,
            plan_catalog,
        }
    }

    /// Produce the three signed delivery headers for `body`, as the provider
    /// side would. Used by tests and local development to fabricate webhooks
    /// the service will accept.
    pub fn sign_delivery(&self, event_id: &str, timestamp: DateTime<Utc>, body: &str) -> Option<[(&'static str, String); 3]> {
        let signature = signing::sign_payload(event_id, timestamp.timestamp(), body, &self.webhook_secret)?;
        Some([
            (signing::HEADER_ID, event_id.to_string()),
            (signing::HEADER_TIMESTAMP, timestamp.timestamp().to_string()),
            (signing::HEADER_SIGNATURE, signature),
        ])
    }

    fn plan_credits(&self, plan: &str) -> Result<Decimal> {
        self.plan_catalog
            .get(plan)
            .copied()
            .ok_or_else(|| BillingError::InvalidData(format!("Plan '{plan}' is not in the catalog")))
    }

    /// Upsert the plan row for the event's period and append that period's
    /// renewal grant. Both writes are idempotent, so `created`, `renewed`,
    /// and any replay of either all converge on "this period is true"; a
    /// replay still refreshes the plan row but reports
    /// [`BillingError::AlreadyProcessed`] instead of granting again.
    async fn apply_subscription_period(&self, db_pool: &PgPool, data: &SubscriptionEventData) -> Result<()> {
        let credits = self.plan_credits(&data.plan)?;

        let mut tx = db_pool.begin().await?;

        let mut plans = Plans::new(&mut tx);
        plans
            .upsert_by_subscription(&PlanCreateDBRequest {
                user_id: data.user_id,
                name: data.plan.clone(),
                status: PlanStatus::Active,
                provider_subscription_id: data.subscription_id.clone(),
                credits_per_period: credits,
                current_period_start: data.period_start,
                current_period_end: data.period_end,
            })
            .await?;

        let grant = EntryCreateDBRequest::renewal(data.user_id, &data.subscription_id, data.period_start, credits, &data.plan);
        let mut ledger = Ledger::new(&mut tx);
        let already_granted = match ledger.append(&grant).await {
            Ok(_) => {
                tracing::info!(
                    subscription = %data.subscription_id,
                    plan = %data.plan,
                    "Granted {credits} credits for period starting {}",
                    data.period_start
                );
                false
            }
            // Replayed delivery for a period that was already granted
            Err(LedgerError::AlreadyApplied { .. }) => {
                tracing::trace!(subscription = %data.subscription_id, "Renewal grant already applied, skipping");
                true
            }
            Err(e) => return Err(e.into()),
        };

        tx.commit().await?;

        if already_granted {
            return Err(BillingError::AlreadyProcessed);
        }
        Ok(())
    }

    /// Plan change. Refreshes the row and, when the new tier carries more
    /// credits mid-period, grants the difference exactly once per period.
    async fn apply_subscription_update(&self, db_pool: &PgPool, data: &SubscriptionEventData) -> Result<()> {
        let credits = self.plan_credits(&data.plan)?;

        let existing = {
            let mut conn = db_pool.acquire().await?;
            Plans::new(&mut conn).get_by_subscription_id(&data.subscription_id).await?
        };
        let Some(existing) = existing else {
            // Events can arrive out of order; an update for a subscription
            // we never saw is just its creation
            tracing::debug!(subscription = %data.subscription_id, "Update for unknown subscription, treating as created");
            return self.apply_subscription_period(db_pool, data).await;
        };

        let difference = credits - existing.credits_per_period;

        let mut tx = db_pool.begin().await?;

        let mut plans = Plans::new(&mut tx);
        plans
            .update(
                existing.id,
                &PlanUpdateDBRequest {
                    name: Some(data.plan.clone()),
                    credits_per_period: Some(credits),
                    current_period_start: Some(data.period_start),
                    current_period_end: Some(data.period_end),
                    cancel_at_period_end: Some(data.cancel_at_period_end),
                    status: None,
                },
            )
            .await?;

        if difference > Decimal::ZERO {
            let grant = EntryCreateDBRequest::upgrade_difference(
                data.user_id,
                &data.subscription_id,
                data.period_start,
                difference,
                &data.plan,
            );
            let mut ledger = Ledger::new(&mut tx);
            match ledger.append(&grant).await {
                Ok(_) => {
                    tracing::info!(
                        subscription = %data.subscription_id,
                        plan = %data.plan,
                        "Granted upgrade difference of {difference} credits"
                    );
                }
                Err(LedgerError::AlreadyApplied { .. }) => {
                    tracing::trace!(subscription = %data.subscription_id, "Upgrade difference already granted this period");
                }
                Err(e) => return Err(e.into()),
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Cancellation: either flag the period boundary or cancel immediately.
    /// Credits already granted are never clawed back.
    async fn apply_subscription_cancel(&self, db_pool: &PgPool, data: &SubscriptionEventData) -> Result<()> {
        let mut conn = db_pool.acquire().await?;
        let mut plans = Plans::new(&mut conn);

        let Some(existing) = plans.get_by_subscription_id(&data.subscription_id).await? else {
            tracing::debug!(subscription = %data.subscription_id, "Cancel for unknown subscription, ignoring");
            return Ok(());
        };

        let update = if data.cancel_at_period_end {
            PlanUpdateDBRequest {
                cancel_at_period_end: Some(true),
                ..Default::default()
            }
        } else {
            PlanUpdateDBRequest {
                status: Some(PlanStatus::Canceled),
                ..Default::default()
            }
        };
        plans.update(existing.id, &update).await?;

        tracing::info!(
            subscription = %data.subscription_id,
            immediate = !data.cancel_at_period_end,
            "Subscription canceled"
        );
        Ok(())
    }
}

/// Recover the user id embedded in a dummy session id.
/// Format: `dummy_session_{user_id}_{uuid}`
fn parse_session_user(session_id: &str) -> Result<UserId> {
    if !session_id.starts_with(SESSION_PREFIX) {
        return Err(BillingError::InvalidData("Invalid dummy session id format".to_string()));
    }

    // UUIDs contain no underscores, so splitting is unambiguous
    let parts: Vec<&str> = session_id.split('_').collect();
    if parts.len() < 4 {
        return Err(BillingError::InvalidData("Invalid dummy session id format".to_string()));
    }

    parts[2]
        .parse()
        .map_err(|e| BillingError::InvalidData(format!("Invalid user id in session id: {e}")))
}

/// Wire body for a dummy webhook delivery
pub fn event_body(event_type: &str, data: impl Serialize) -> String {
    serde_json::json!({ "type": event_type, "data": data }).to_string()
}

/// Wire format of a dummy webhook body
#[derive(Debug, Serialize, Deserialize)]
struct EventEnvelope {
    #[serde(rename = "type")]
    event_type: String,
    data: serde_json::Value,
}

fn parse_payload<T: serde::de::DeserializeOwned>(event: &BillingEvent) -> Result<T> {
    serde_json::from_value(event.payload.clone())
        .map_err(|e| BillingError::InvalidData(format!("Malformed {} payload: {e}", event.event_type)))
}

#[async_trait]
impl BillingProvider for DummyProvider {
    async fn create_checkout_session(
        &self,
        _db_pool: &PgPool,
        user: &CurrentUser,
        _cancel_url: &str,
        success_url: &str,
    ) -> Result<CheckoutSession> {
        // The user id rides inside the session id so processing can recover
        // it without provider-side state
        let session_id = format!("{}{}_{}", SESSION_PREFIX, user.id, uuid::Uuid::new_v4());

        // Payment is instantly "complete": checkout goes straight to the
        // success redirect
        let checkout_url = success_url.replace("{CHECKOUT_SESSION_ID}", &session_id);

        tracing::info!("Dummy provider created checkout session {session_id} for user {}", user.id);

        Ok(CheckoutSession { session_id, checkout_url })
    }

    async fn process_checkout_session(&self, db_pool: &PgPool, session_id: &str) -> Result<()> {
        let user_id = parse_session_user(session_id)?;
        let request = EntryCreateDBRequest::purchase(user_id, session_id, self.checkout_amount);

        let mut conn = db_pool.acquire().await?;
        let mut ledger = Ledger::new(&mut conn);

        // Fast path for retries; the append still catches the race
        if ledger.find_by_source_id(&request.source_id).await?.is_some() {
            tracing::trace!("Checkout session {session_id} already fulfilled, skipping");
            return Err(BillingError::AlreadyProcessed);
        }

        // Dummy sessions are always paid, so no PaymentNotCompleted path here
        ledger.append(&request).await?;

        tracing::info!("Fulfilled checkout session {session_id} for user {user_id}");
        Ok(())
    }

    async fn create_portal_session(&self, _db_pool: &PgPool, user: &CurrentUser, return_url: &str) -> Result<String> {
        // The "portal" is wherever config points, or straight back
        let url = self.portal_url.clone().unwrap_or_else(|| return_url.to_string());
        tracing::debug!("Dummy provider created portal session for user {}", user.id);
        Ok(url)
    }

    fn validate_webhook(&self, headers: &HeaderMap, body: &str) -> Option<BillingEvent> {
        let Some(delivery) = signing::DeliveryHeaders::from_headers(headers) else {
            tracing::debug!("Webhook rejected: missing or malformed signature headers");
            return None;
        };

        if !delivery.is_fresh(Utc::now(), self.timestamp_tolerance) {
            tracing::debug!(event_id = %delivery.id, "Webhook rejected: timestamp outside tolerance");
            return None;
        }

        if !signing::verify_signature(&delivery.id, delivery.timestamp, body, &delivery.signature, &self.webhook_secret) {
            tracing::debug!(event_id = %delivery.id, "Webhook rejected: signature mismatch");
            return None;
        }

        let envelope: EventEnvelope = match serde_json::from_str(body) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(event_id = %delivery.id, "Webhook rejected: malformed body: {e}");
                return None;
            }
        };

        Some(BillingEvent {
            event_id: delivery.id,
            event_type: envelope.event_type,
            payload: envelope.data,
        })
    }

    async fn process_event(&self, db_pool: &PgPool, event: &BillingEvent) -> Result<()> {
        match event.event_type.as_str() {
            event_types::CHECKOUT_COMPLETED => {
                let data: CheckoutEventData = parse_payload(event)?;
                self.process_checkout_session(db_pool, &data.session_id).await
            }
            event_types::SUBSCRIPTION_CREATED | event_types::SUBSCRIPTION_RENEWED => {
                let data: SubscriptionEventData = parse_payload(event)?;
                self.apply_subscription_period(db_pool, &data).await
            }
            event_types::SUBSCRIPTION_UPDATED => {
                let data: SubscriptionEventData = parse_payload(event)?;
                self.apply_subscription_update(db_pool, &data).await
            }
            event_types::SUBSCRIPTION_CANCELED => {
                let data: SubscriptionEventData = parse_payload(event)?;
                self.apply_subscription_cancel(db_pool, &data).await
            }
            other => {
                tracing::debug!(event_type = %other, "Ignoring unhandled billing event type");
                Ok(())
            }
        }
    }
}
