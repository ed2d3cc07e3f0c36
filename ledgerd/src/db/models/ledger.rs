//! Database models for the credit ledger.
//!
//! Every balance-affecting event in the system is one row here. Rows are
//! never updated or deleted; corrections are new entries with their own
//! reason. The `source_id` carried by each request is the idempotency key
//! that makes retried writes safe.

use crate::types::{JobId, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Why a ledger entry exists. Stored as TEXT in the database.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EntryReason {
    Purchase,
    TrialGrant,
    ReferralReward,
    AdminGrant,
    AdminRemoval,
    Renewal,
    JobUsage,
    JobRefund,
}

/// Database request for appending a ledger entry
#[derive(Debug, Clone)]
pub struct EntryCreateDBRequest {
    pub user_id: UserId,
    pub reason: EntryReason,
    /// Signed delta. Positive for grants, negative for debits.
    pub amount: Decimal,
    pub source_id: String,
    pub description: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl EntryCreateDBRequest {
    /// Admin grant with a server-generated source_id (one correction, one entry)
    pub fn admin_grant(user_id: UserId, granter_id: UserId, amount: Decimal, description: Option<String>) -> Self {
        Self {
            user_id,
            reason: EntryReason::AdminGrant,
            amount,
            source_id: format!("admin_{}_{}", granter_id, Uuid::new_v4()),
            description,
            metadata: None,
            expires_at: None,
        }
    }

    /// Admin removal; `amount` is a positive magnitude, stored negated
    pub fn admin_removal(user_id: UserId, granter_id: UserId, amount: Decimal, description: Option<String>) -> Self {
        Self {
            user_id,
            reason: EntryReason::AdminRemoval,
            amount: -amount,
            source_id: format!("admin_{}_{}", granter_id, Uuid::new_v4()),
            description,
            metadata: None,
            expires_at: None,
        }
    }

    /// Signup trial grant, keyed by the user so it can only ever apply once
    pub fn trial_grant(user_id: UserId, amount: Decimal, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            user_id,
            reason: EntryReason::TrialGrant,
            amount,
            source_id: format!("trial_{user_id}"),
            description: Some("Trial credits".to_string()),
            metadata: None,
            expires_at,
        }
    }

    /// Debit for a staging job, keyed by the job id
    pub fn job_usage(user_id: UserId, job_id: JobId, cost: Decimal) -> Self {
        Self {
            user_id,
            reason: EntryReason::JobUsage,
            amount: -cost,
            source_id: format!("job_{job_id}"),
            description: None,
            metadata: None,
            expires_at: None,
        }
    }

    /// Refund for a failed staging job, keyed by the job id
    pub fn job_refund(user_id: UserId, job_id: JobId, cost: Decimal) -> Self {
        Self {
            user_id,
            reason: EntryReason::JobRefund,
            amount: cost,
            source_id: format!("job_refund_{job_id}"),
            description: Some("Refund for failed job".to_string()),
            metadata: None,
            expires_at: None,
        }
    }

    /// Reward to the referrer when a referred user signs up
    pub fn referral_signup_reward(
        referrer_id: UserId,
        new_user_id: UserId,
        amount: Decimal,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            user_id: referrer_id,
            reason: EntryReason::ReferralReward,
            amount,
            source_id: format!("referral_signup_{new_user_id}"),
            description: Some("Referral signup reward".to_string()),
            metadata: Some(serde_json::json!({ "referred_user_id": new_user_id })),
            expires_at,
        }
    }

    /// Grant for redeeming a single-use marketing code
    pub fn special_code_grant(
        user_id: UserId,
        code: &str,
        amount: Decimal,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            user_id,
            reason: EntryReason::ReferralReward,
            amount,
            source_id: format!("special_{code}_{user_id}"),
            description: Some(format!("Referral code {code}")),
            metadata: None,
            expires_at,
        }
    }

    /// One-time credit purchase, keyed by the provider's checkout session
    pub fn purchase(user_id: UserId, session_id: &str, amount: Decimal) -> Self {
        Self {
            user_id,
            reason: EntryReason::Purchase,
            amount,
            source_id: format!("purchase_{session_id}"),
            description: Some("Credit purchase".to_string()),
            metadata: None,
            expires_at: None,
        }
    }

    /// Monthly subscription grant, keyed by subscription and period start
    pub fn renewal(
        user_id: UserId,
        provider_subscription_id: &str,
        period_start: DateTime<Utc>,
        amount: Decimal,
        plan_name: &str,
    ) -> Self {
        Self {
            user_id,
            reason: EntryReason::Renewal,
            amount,
            source_id: renewal_source_id(provider_subscription_id, period_start),
            description: Some(format!("Monthly credits for {plan_name}")),
            metadata: None,
            expires_at: None,
        }
    }

    /// Difference granted once when a plan is upgraded mid-period.
    ///
    /// Keyed separately from the period's renewal so the upgrade webhook
    /// cannot re-apply the full monthly amount.
    pub fn upgrade_difference(
        user_id: UserId,
        provider_subscription_id: &str,
        period_start: DateTime<Utc>,
        difference: Decimal,
        plan_name: &str,
    ) -> Self {
        Self {
            user_id,
            reason: EntryReason::Renewal,
            amount: difference,
            source_id: upgrade_source_id(provider_subscription_id, period_start),
            description: Some(format!("Upgrade to {plan_name}")),
            metadata: None,
            expires_at: None,
        }
    }
}

/// Database response for a ledger entry
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EntryDBResponse {
    pub id: Uuid,
    pub user_id: UserId,
    pub reason: EntryReason,
    pub amount: Decimal,
    pub source_id: String,
    pub description: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Idempotency keys for subscription-driven grants.
///
/// Renewal grants are keyed by subscription and period start, so a replayed
/// webhook (or a second webhook fired by a mid-period plan change) collapses
/// onto the row the first delivery created instead of double-crediting.
pub fn renewal_source_id(provider_subscription_id: &str, period_start: DateTime<Utc>) -> String {
    format!("renewal_{}_{}", provider_subscription_id, period_start.timestamp())
}

/// Idempotency key for the one-time credit difference granted by a mid-period upgrade.
pub fn upgrade_source_id(provider_subscription_id: &str, period_start: DateTime<Utc>) -> String {
    format!("upgrade_{}_{}", provider_subscription_id, period_start.timestamp())
}
