//! API request/response models for checkout, portal, and plans.

use crate::db::models::plans::{PlanDBResponse, PlanStatus};
use crate::types::{PlanId, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

// Response models
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CheckoutResponse {
    /// Provider checkout session id; used to process the session if the
    /// completion webhook is missed
    pub session_id: String,
    /// URL to send the user to for payment
    pub checkout_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProcessCheckoutResponse {
    /// "applied" on first processing, "already_applied" on any retry
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PortalResponse {
    /// URL of the provider's customer portal for this user
    pub portal_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PlanResponse {
    /// Plan ID
    #[schema(value_type = String, format = "uuid")]
    pub id: PlanId,
    /// Owning user
    #[schema(value_type = String, format = "uuid")]
    pub user_id: UserId,
    /// Plan tier name (catalog key)
    pub name: String,
    /// Subscription status
    pub status: PlanStatus,
    /// Provider's subscription id
    pub provider_subscription_id: String,
    /// Credits granted each billing period
    #[schema(value_type = String)]
    pub credits_per_period: Decimal,
    /// Start of the current billing period
    pub current_period_start: DateTime<Utc>,
    /// End of the current billing period
    pub current_period_end: DateTime<Utc>,
    /// Whether the subscription ends at the period boundary
    pub cancel_at_period_end: bool,
    /// When the plan row was created
    pub created_at: DateTime<Utc>,
}

// Conversions
impl From<PlanDBResponse> for PlanResponse {
    fn from(db: PlanDBResponse) -> Self {
        Self {
            id: db.id,
            user_id: db.user_id,
            name: db.name,
            status: db.status,
            provider_subscription_id: db.provider_subscription_id,
            credits_per_period: db.credits_per_period,
            current_period_start: db.current_period_start,
            current_period_end: db.current_period_end,
            cancel_at_period_end: db.cancel_at_period_end,
            created_at: db.created_at,
        }
    }
}
