//! Database models for inbound billing webhook events.

use crate::types::BillingEventId;
use chrono::{DateTime, Utc};

/// Database request for recording a received webhook event
#[derive(Debug, Clone)]
pub struct BillingEventCreateDBRequest {
    /// The provider's event id (dedup key)
    pub event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

/// Database response for a recorded webhook event
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BillingEventDBResponse {
    pub id: BillingEventId,
    pub event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}
