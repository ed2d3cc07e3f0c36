//! Billing provider abstraction layer.
//!
//! Checkout, customer portal, and subscription lifecycle handling go through
//! the [`BillingProvider`] trait, so the rest of the service never talks to a
//! provider SDK directly. [`create_provider`] is the single point where
//! configuration turns into a provider instance; adding a provider means
//! adding a match arm there.
//!
//! Providers normalize their webhook deliveries into [`BillingEvent`]s. The
//! ingestion handler records each event (deduplicating on the provider's
//! event id) before handing it to [`BillingProvider::process_event`], and
//! every ledger write a provider makes carries a deterministic source_id, so
//! provider retries, replays, and races with the manual fallback endpoint
//! all converge on the rows written the first time.

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::{
    api::models::users::CurrentUser,
    config::{BillingConfig, CreditsConfig},
    db::errors::DbError,
    db::handlers::ledger::{LedgerError, SOURCE_ID_CONSTRAINT},
    types::UserId,
};

pub mod dummy;
pub mod signing;

/// Create a billing provider from configuration
///
/// This is the single point where we convert config into provider instances.
/// The plan catalog rides along because subscription events are priced by
/// plan name.
pub fn create_provider(config: BillingConfig, credits: &CreditsConfig) -> std::sync::Arc<dyn BillingProvider> {
    match config {
        BillingConfig::Dummy(dummy_config) => {
            std::sync::Arc::new(dummy::DummyProvider::new(dummy_config, credits.plan_catalog.clone()))
        }
    }
}

/// Result type for billing provider operations
pub type Result<T> = std::result::Result<T, BillingError>;

/// Errors that can occur during billing operations
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Billing provider API error: {0}")]
    ProviderApi(String),

    #[error("Database error: {0}")]
    Database(DbError),

    #[error("Payment not completed yet")]
    PaymentNotCompleted,

    #[error("Invalid billing data: {0}")]
    InvalidData(String),

    #[error("Event already processed")]
    AlreadyProcessed,
}

impl From<DbError> for BillingError {
    fn from(err: DbError) -> Self {
        match err {
            // A duplicate source_id is the idempotency signal, not a failure
            DbError::UniqueViolation { ref constraint, .. } if constraint.as_deref() == Some(SOURCE_ID_CONSTRAINT) => {
                BillingError::AlreadyProcessed
            }
            other => BillingError::Database(other),
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::from(DbError::from(err))
    }
}

impl From<LedgerError> for BillingError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::AlreadyApplied { .. } => BillingError::AlreadyProcessed,
            LedgerError::InsufficientBalance { balance, requested } => {
                BillingError::InvalidData(format!("Debit of {requested} exceeds balance {balance}"))
            }
            LedgerError::Db(db) => BillingError::from(db),
        }
    }
}

impl From<BillingError> for crate::errors::Error {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::ProviderApi(message) => crate::errors::Error::Internal {
                operation: format!("call billing provider: {message}"),
            },
            BillingError::Database(db) => crate::errors::Error::Database(db),
            BillingError::PaymentNotCompleted => crate::errors::Error::PaymentRequired {
                message: "Payment has not completed for this checkout session".to_string(),
            },
            BillingError::InvalidData(message) => crate::errors::Error::BadRequest { message },
            BillingError::AlreadyProcessed => crate::errors::Error::Conflict {
                message: "This billing operation was already applied".to_string(),
            },
        }
    }
}

/// A checkout session handed back by the provider
#[derive(Debug, Clone)]
pub struct CheckoutSession {
    /// Provider's session id; embedded in the success redirect and usable
    /// with the manual processing endpoint
    pub session_id: String,
    /// Where to send the user to pay
    pub checkout_url: String,
}

/// A validated webhook delivery, normalized across providers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingEvent {
    /// Provider's event id; ingestion dedups on it
    pub event_id: String,
    /// Lifecycle event name, e.g. "subscription.renewed"
    pub event_type: String,
    /// Event data as delivered
    pub payload: serde_json::Value,
}

/// Event types the service understands. Anything else is logged and ignored.
pub mod event_types {
    pub const CHECKOUT_COMPLETED: &str = "checkout.completed";
    pub const SUBSCRIPTION_CREATED: &str = "subscription.created";
    pub const SUBSCRIPTION_RENEWED: &str = "subscription.renewed";
    pub const SUBSCRIPTION_UPDATED: &str = "subscription.updated";
    pub const SUBSCRIPTION_CANCELED: &str = "subscription.canceled";
}

/// Payload carried by `subscription.*` events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionEventData {
    /// Provider's subscription id
    pub subscription_id: String,
    /// The subscribing user
    pub user_id: UserId,
    /// Plan tier name (catalog key)
    pub plan: String,
    /// Start of the billing period the event describes
    pub period_start: DateTime<Utc>,
    /// End of that billing period
    pub period_end: DateTime<Utc>,
    /// Set on cancellations that take effect at the period boundary
    #[serde(default)]
    pub cancel_at_period_end: bool,
}

/// Payload carried by `checkout.completed` events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutEventData {
    /// The completed checkout session
    pub session_id: String,
}

/// Abstract billing provider interface
///
/// Implementors translate provider-specific sessions and webhook deliveries
/// into ledger and plan writes. All write paths must be idempotent: the
/// provider may deliver any event more than once, and users may retry any
/// endpoint.
#[async_trait]
pub trait BillingProvider: Send + Sync {
    /// Create a checkout session for a one-off credit purchase.
    ///
    /// `success_url` and `cancel_url` may contain a `{CHECKOUT_SESSION_ID}`
    /// placeholder, which is replaced with the real session id.
    async fn create_checkout_session(
        &self,
        db_pool: &PgPool,
        user: &CurrentUser,
        cancel_url: &str,
        success_url: &str,
    ) -> Result<CheckoutSession>;

    /// Fulfill a paid checkout session by appending its purchase entry.
    ///
    /// Fallback for missed `checkout.completed` webhooks; the frontend calls
    /// it after the success redirect. Fulfilling a session twice yields
    /// [`BillingError::AlreadyProcessed`] and no second entry; an unpaid
    /// session yields [`BillingError::PaymentNotCompleted`].
    async fn process_checkout_session(&self, db_pool: &PgPool, session_id: &str) -> Result<()>;

    /// URL of the provider's customer portal for this user
    async fn create_portal_session(&self, db_pool: &PgPool, user: &CurrentUser, return_url: &str) -> Result<String>;

    /// Validate a webhook delivery and normalize it into a [`BillingEvent`].
    ///
    /// `None` means the delivery must be rejected (bad signature, stale
    /// timestamp, malformed body); the specific reason is logged here rather
    /// than surfaced to the sender.
    fn validate_webhook(&self, headers: &HeaderMap, body: &str) -> Option<BillingEvent>;

    /// Apply a validated event to plans and the ledger.
    ///
    /// Replayed events converge on the rows written the first time and
    /// report [`BillingError::AlreadyProcessed`]; callers decide whether
    /// that is an error or a benign retry.
    async fn process_event(&self, db_pool: &PgPool, event: &BillingEvent) -> Result<()>;
}

/// Shared secret used by provider tests and `create_test_app`, so tests can
/// sign deliveries the app will accept.
#[cfg(any(test, feature = "test-utils"))]
pub(crate) const TEST_WEBHOOK_SECRET: &str = "whsec_bGVkZ2VyZC10ZXN0LXdlYmhvb2stc2VjcmV0LTAwMDE=";

#[cfg(test)]
pub(crate) fn test_plan_catalog() -> std::collections::HashMap<String, Decimal> {
    std::collections::HashMap::from([
        ("starter".to_string(), Decimal::new(100, 0)),
        ("pro".to_string(), Decimal::new(300, 0)),
    ])
}

/// A dummy provider wired with the shared test secret and plan catalog.
#[cfg(test)]
pub fn test_provider() -> std::sync::Arc<dyn BillingProvider> {
    let config = crate::config::DummyBillingConfig {
        webhook_secret: TEST_WEBHOOK_SECRET.to_string(),
        checkout_amount: Decimal::new(50, 0),
        timestamp_tolerance: std::time::Duration::from_secs(300),
        portal_url: None,
    };
    std::sync::Arc::new(dummy::DummyProvider::new(config, test_plan_catalog()))
}
