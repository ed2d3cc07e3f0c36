//! API request/response models for credit balances and ledger entries.

use crate::db::models::ledger::{EntryDBResponse, EntryReason};
use crate::types::UserId;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use super::pagination::Pagination;

// Request models
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AdminCreditRequest {
    /// Reason for the adjustment (only admin_grant and admin_removal are accepted)
    pub reason: EntryReason,
    /// Amount of credits (absolute value)
    #[schema(value_type = String)]
    pub amount: Decimal,
    /// Optional description of the adjustment
    pub description: Option<String>,
}

// Response models
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EntryResponse {
    /// Entry ID
    #[schema(value_type = String, format = "uuid")]
    pub id: uuid::Uuid,
    /// User ID
    #[schema(value_type = String, format = "uuid")]
    pub user_id: UserId,
    /// Why the entry exists
    pub reason: EntryReason,
    /// Signed credit delta
    #[schema(value_type = String)]
    pub amount: Decimal,
    /// Idempotency key of the operation that produced this entry
    pub source_id: String,
    /// Description
    pub description: Option<String>,
    /// When these credits stop counting toward the balance
    pub expires_at: Option<DateTime<Utc>>,
    /// When the entry was created
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BalanceResponse {
    /// User ID
    #[schema(value_type = String, format = "uuid")]
    pub user_id: UserId,
    /// Current credit balance (sum of non-expired entries)
    #[schema(value_type = String)]
    pub balance: Decimal,
}

/// Query parameters for listing ledger entries
#[derive(Debug, Default, Deserialize, IntoParams, ToSchema)]
pub struct ListEntriesQuery {
    /// Pagination parameters
    #[serde(flatten)]
    #[param(inline)]
    pub pagination: Pagination,
}

// Conversions
impl From<EntryDBResponse> for EntryResponse {
    fn from(db: EntryDBResponse) -> Self {
        Self {
            id: db.id,
            user_id: db.user_id,
            reason: db.reason,
            amount: db.amount,
            source_id: db.source_id,
            description: db.description,
            expires_at: db.expires_at,
            created_at: db.created_at,
        }
    }
}
