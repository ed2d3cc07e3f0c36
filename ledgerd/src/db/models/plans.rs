//! Database models for subscription plans.

use crate::types::{PlanId, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Subscription status as reported by the billing provider. Stored as TEXT.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Active,
    PastDue,
    Canceled,
}

/// Database request for creating a plan row
#[derive(Debug, Clone)]
pub struct PlanCreateDBRequest {
    pub user_id: UserId,
    pub name: String,
    pub status: PlanStatus,
    pub provider_subscription_id: String,
    pub credits_per_period: Decimal,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
}

/// Database request for updating a plan row
#[derive(Debug, Clone, Default)]
pub struct PlanUpdateDBRequest {
    pub name: Option<String>,
    pub status: Option<PlanStatus>,
    pub credits_per_period: Option<Decimal>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: Option<bool>,
}

/// Database response for a plan
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PlanDBResponse {
    pub id: PlanId,
    pub user_id: UserId,
    pub name: String,
    pub status: PlanStatus,
    pub provider_subscription_id: String,
    pub credits_per_period: Decimal,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub cancel_at_period_end: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
