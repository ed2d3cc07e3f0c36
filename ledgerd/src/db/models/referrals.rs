//! Database models for promotional referral codes.

use crate::types::{ReferralCodeId, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Database request for creating a promotional code
#[derive(Debug, Clone)]
pub struct ReferralCodeCreateDBRequest {
    pub code: String,
    pub credit_amount: Decimal,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_by: UserId,
}

/// Database response for a promotional code
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ReferralCodeDBResponse {
    pub id: ReferralCodeId,
    pub code: String,
    pub credit_amount: Decimal,
    pub expires_at: Option<DateTime<Utc>>,
    pub redeemed_by: Option<UserId>,
    pub redeemed_at: Option<DateTime<Utc>>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

impl ReferralCodeDBResponse {
    pub fn is_redeemed(&self) -> bool {
        self.redeemed_by.is_some()
    }
}
