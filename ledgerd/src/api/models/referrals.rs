//! API request/response models for referral codes.

use crate::db::models::referrals::ReferralCodeDBResponse;
use crate::types::{ReferralCodeId, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

// Request models
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReferralCodeCreateRequest {
    /// The code users will type in (unique, case-sensitive)
    pub code: String,
    /// Credits granted to the redeemer
    #[schema(value_type = String)]
    pub credit_amount: Decimal,
    /// Last moment the code can be redeemed (None = no deadline)
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RedeemRequest {
    /// A single-use marketing code
    pub code: String,
}

// Response models
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReferralCodeResponse {
    /// Code ID
    #[schema(value_type = String, format = "uuid")]
    pub id: ReferralCodeId,
    /// The redeemable code
    pub code: String,
    /// Credits granted on redemption
    #[schema(value_type = String)]
    pub credit_amount: Decimal,
    /// Redemption deadline
    pub expires_at: Option<DateTime<Utc>>,
    /// Who redeemed the code, once redeemed
    #[schema(value_type = Option<String>, format = "uuid")]
    pub redeemed_by: Option<UserId>,
    /// When the code was redeemed
    pub redeemed_at: Option<DateTime<Utc>>,
    /// Admin who created the code
    #[schema(value_type = String, format = "uuid")]
    pub created_by: UserId,
    /// When the code was created
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RedeemResponse {
    /// Credits granted by the code
    #[schema(value_type = String)]
    pub granted: Decimal,
    /// When the granted credits stop counting, if they expire
    pub expires_at: Option<DateTime<Utc>>,
    /// Balance after the grant
    #[schema(value_type = String)]
    pub balance: Decimal,
}

// Conversions
impl From<ReferralCodeDBResponse> for ReferralCodeResponse {
    fn from(db: ReferralCodeDBResponse) -> Self {
        Self {
            id: db.id,
            code: db.code,
            credit_amount: db.credit_amount,
            expires_at: db.expires_at,
            redeemed_by: db.redeemed_by,
            redeemed_at: db.redeemed_at,
            created_by: db.created_by,
            created_at: db.created_at,
        }
    }
}
