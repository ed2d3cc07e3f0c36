//! Periodic consistency sweep over plans, the ledger, jobs, and referral
//! codes.
//!
//! Webhook delivery is at-least-once but not guaranteed: a provider outage
//! can swallow a cancellation, a renewal event can be lost, a crash can
//! strand state mid-flow. The sweep re-derives what should be true from
//! the rows themselves, applies the repairs that are idempotent (plan
//! status, missing grants) and reports everything else. The last report is
//! persisted to `system_config` so the admin API can serve it without
//! re-running the checks.

use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

use crate::config::Config;
use crate::db::handlers::{Jobs, Ledger, LedgerError, Plans, Referrals};
use crate::db::models::ledger::{EntryCreateDBRequest, renewal_source_id};
use crate::db::models::plans::{PlanStatus, PlanUpdateDBRequest};
use crate::errors::{Error, Result};
use crate::types::{JobId, PlanId, UserId};

/// system_config key the last report is stored under
pub const LAST_REPORT_KEY: &str = "last_reconciliation";

/// A user whose non-expired deltas sum below zero
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NegativeBalanceFinding {
    #[schema(value_type = String, format = "uuid")]
    pub user_id: UserId,
    #[schema(value_type = String)]
    pub balance: Decimal,
}

/// Outcome of one sweep. Repair fields list what was fixed; the rest are
/// report-only findings an operator should look at.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReconciliationReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Active plans whose period lapsed past the grace window, flipped to past_due
    #[schema(value_type = Vec<String>)]
    pub plans_marked_past_due: Vec<PlanId>,
    /// Started periods that were missing their renewal grant, appended
    #[schema(value_type = Vec<String>)]
    pub renewals_granted: Vec<PlanId>,
    /// Redeemed codes whose grant entry was missing, appended
    pub redemption_grants_applied: Vec<String>,
    /// Users currently below zero (a spent grant expired)
    pub negative_balances: Vec<NegativeBalanceFinding>,
    /// Users whose recomputed balance disagrees with the aggregate
    #[schema(value_type = Vec<String>)]
    pub drifted_balances: Vec<UserId>,
    /// Non-terminal jobs idle past the configured age
    #[schema(value_type = Vec<String>)]
    pub stale_jobs: Vec<JobId>,
    /// Failed, debited jobs with no refund entry
    #[schema(value_type = Vec<String>)]
    pub unrefunded_failed_jobs: Vec<JobId>,
}

impl ReconciliationReport {
    pub fn finding_count(&self) -> usize {
        self.plans_marked_past_due.len()
            + self.renewals_granted.len()
            + self.redemption_grants_applied.len()
            + self.negative_balances.len()
            + self.drifted_balances.len()
            + self.stale_jobs.len()
            + self.unrefunded_failed_jobs.len()
    }

    pub fn is_clean(&self) -> bool {
        self.finding_count() == 0
    }
}

/// Run one full sweep and persist the report.
#[tracing::instrument(skip_all)]
pub async fn run_once(pool: &PgPool, config: &Config) -> Result<ReconciliationReport> {
    let started_at = Utc::now();
    let mut conn = pool.acquire().await.map_err(|e| Error::Database(e.into()))?;

    // Lapsed plans flip first so the renewal check below only feeds live
    // subscriptions.
    let plan_cutoff = started_at - config.reconciliation.plan_grace;
    let lapsed = Plans::new(&mut conn).lapsed_active(plan_cutoff).await?;
    let mut plans_marked_past_due = Vec::new();
    for plan in lapsed {
        Plans::new(&mut conn)
            .update(
                plan.id,
                &PlanUpdateDBRequest {
                    status: Some(PlanStatus::PastDue),
                    ..Default::default()
                },
            )
            .await?;
        tracing::warn!(
            plan_id = %plan.id,
            subscription = %plan.provider_subscription_id,
            period_end = %plan.current_period_end,
            "Marked lapsed plan past_due"
        );
        plans_marked_past_due.push(plan.id);
    }

    // Every active plan with a started period owes that period's renewal
    // grant. The source_id makes the append idempotent, so racing a late
    // webhook is harmless.
    let active = Plans::new(&mut conn).active_in_period(started_at).await?;
    let mut renewals_granted = Vec::new();
    for plan in active {
        let source_id = renewal_source_id(&plan.provider_subscription_id, plan.current_period_start);
        let mut ledger = Ledger::new(&mut conn);
        if ledger.find_by_source_id(&source_id).await?.is_some() {
            continue;
        }

        let request = EntryCreateDBRequest::renewal(
            plan.user_id,
            &plan.provider_subscription_id,
            plan.current_period_start,
            plan.credits_per_period,
            &plan.name,
        );
        match ledger.append(&request).await {
            Ok(_) => {
                tracing::warn!(plan_id = %plan.id, %source_id, "Granted missing renewal credits");
                renewals_granted.push(plan.id);
            }
            Err(LedgerError::AlreadyApplied { .. }) => {}
            Err(e) => return Err(e.into()),
        }
    }

    // A redeemed code owes its holder the grant. Same idempotent append.
    let orphaned = Referrals::new(&mut conn).redeemed_without_grant().await?;
    let mut redemption_grants_applied = Vec::new();
    for code in orphaned {
        let Some(redeemer) = code.redeemed_by else {
            continue;
        };
        let request = EntryCreateDBRequest::special_code_grant(redeemer, &code.code, code.credit_amount, None);
        match Ledger::new(&mut conn).append(&request).await {
            Ok(_) => {
                tracing::warn!(code = %code.code, user_id = %redeemer, "Granted missing redemption credits");
                redemption_grants_applied.push(code.code);
            }
            Err(LedgerError::AlreadyApplied { .. }) => {}
            Err(e) => return Err(e.into()),
        }
    }

    // Report-only findings from here down.
    let negative_balances: Vec<NegativeBalanceFinding> = Ledger::new(&mut conn)
        .negative_balances()
        .await?
        .into_iter()
        .map(|(user_id, balance)| NegativeBalanceFinding { user_id, balance })
        .collect();
    for finding in &negative_balances {
        tracing::warn!(user_id = %finding.user_id, balance = %finding.balance, "User balance is negative");
    }

    let drifted_balances = Ledger::new(&mut conn).drifted_balances(started_at).await?;
    for user_id in &drifted_balances {
        tracing::warn!(user_id = %user_id, "Balance recomputation disagrees with the aggregate");
    }

    let stale_cutoff = started_at - config.reconciliation.stale_job_age;
    let stale = Jobs::new(&mut conn).stale_non_terminal(stale_cutoff).await?;
    let stale_jobs: Vec<JobId> = stale.iter().map(|job| job.id).collect();
    for job in &stale {
        tracing::warn!(job_id = %job.id, status = ?job.status, idle_since = %job.updated_at, "Job is stale");
    }

    let unrefunded = Jobs::new(&mut conn).failed_without_refund().await?;
    let unrefunded_failed_jobs: Vec<JobId> = unrefunded.iter().map(|job| job.id).collect();
    for job in &unrefunded {
        tracing::warn!(job_id = %job.id, cost = %job.credit_cost, "Failed job was never refunded");
    }

    let report = ReconciliationReport {
        started_at,
        finished_at: Utc::now(),
        plans_marked_past_due,
        renewals_granted,
        redemption_grants_applied,
        negative_balances,
        drifted_balances,
        stale_jobs,
        unrefunded_failed_jobs,
    };

    if report.is_clean() {
        tracing::info!("Reconciliation pass clean");
    } else {
        tracing::warn!(findings = report.finding_count(), "Reconciliation pass applied repairs or found problems");
    }

    persist_report(&mut conn, &report).await?;

    Ok(report)
}

/// The most recent persisted report, if a pass has ever completed.
pub async fn last_report(conn: &mut PgConnection) -> Result<Option<ReconciliationReport>> {
    let value: Option<serde_json::Value> = sqlx::query_scalar("SELECT value FROM system_config WHERE key = $1")
        .bind(LAST_REPORT_KEY)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| Error::Database(e.into()))?;

    match value {
        Some(value) => {
            let report = serde_json::from_value(value).map_err(|e| Error::Internal {
                operation: format!("deserialize reconciliation report: {e}"),
            })?;
            Ok(Some(report))
        }
        None => Ok(None),
    }
}

async fn persist_report(conn: &mut PgConnection, report: &ReconciliationReport) -> Result<()> {
    let value = serde_json::to_value(report).map_err(|e| Error::Internal {
        operation: format!("serialize reconciliation report: {e}"),
    })?;

    sqlx::query(
        r#"
        INSERT INTO system_config (key, value) VALUES ($1, $2)
        ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
        "#,
    )
    .bind(LAST_REPORT_KEY)
    .bind(value)
    .execute(&mut *conn)
    .await
    .map_err(|e| Error::Database(e.into()))?;

    Ok(())
}

/// Run the sweep on the configured interval until shutdown.
///
/// The first pass is delayed by a random fraction of the interval so that
/// replicas started together do not sweep in lockstep.
pub async fn run_reconciliation_loop(pool: PgPool, config: Config, shutdown: CancellationToken) {
    let interval = config.reconciliation.interval;
    let first_pass_in = interval.mul_f64(rand::thread_rng().gen_range(0.0..1.0));

    tracing::info!(?interval, ?first_pass_in, "Starting reconciliation sweep");

    tokio::select! {
        _ = tokio::time::sleep(first_pass_in) => {}
        _ = shutdown.cancelled() => {
            tracing::info!("Reconciliation sweep shutting down");
            return;
        }
    }

    loop {
        if let Err(e) = run_once(&pool, &config).await {
            tracing::warn!(error = %e, "Reconciliation pass failed");
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.cancelled() => {
                tracing::info!("Reconciliation sweep shutting down");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::users::Role;
    use crate::db::handlers::{Repository, Users};
    use crate::db::models::jobs::JobCreateDBRequest;
    use crate::db::models::plans::PlanCreateDBRequest;
    use crate::db::models::referrals::ReferralCodeCreateDBRequest;
    use crate::db::models::users::UserCreateDBRequest;
    use crate::test_utils::create_test_config;
    use chrono::Duration;
    use sqlx::PgPool;

    async fn make_user(pool: &PgPool, name: &str) -> UserId {
        let mut conn = pool.acquire().await.unwrap();
        let mut users = Users::new(&mut conn);
        users
            .create(&UserCreateDBRequest {
                username: name.to_string(),
                email: format!("{name}@example.com"),
                display_name: None,
                avatar_url: None,
                is_admin: false,
                roles: vec![Role::StandardUser],
                auth_source: "test".to_string(),
                password_hash: None,
            })
            .await
            .unwrap()
            .id
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_lapsed_plan_marked_past_due(pool: PgPool) {
        let config = create_test_config();
        let user_id = make_user(&pool, "recon1").await;

        let mut conn = pool.acquire().await.unwrap();
        let plan = Plans::new(&mut conn)
            .create(&PlanCreateDBRequest {
                user_id,
                name: "starter".to_string(),
                status: PlanStatus::Active,
                provider_subscription_id: "sub_lapsed".to_string(),
                credits_per_period: Decimal::new(100, 0),
                current_period_start: Utc::now() - Duration::days(33),
                current_period_end: Utc::now() - Duration::days(3),
            })
            .await
            .unwrap();
        drop(conn);

        let report = run_once(&pool, &config).await.unwrap();
        assert_eq!(report.plans_marked_past_due, vec![plan.id]);

        let mut conn = pool.acquire().await.unwrap();
        let row = Plans::new(&mut conn).get_by_id(plan.id).await.unwrap().unwrap();
        assert_eq!(row.status, PlanStatus::PastDue);

        // A past_due plan earns nothing
        assert_eq!(Ledger::new(&mut conn).balance(user_id).await.unwrap(), Decimal::ZERO);
        drop(conn);

        // Second pass has nothing left to fix
        let report = run_once(&pool, &config).await.unwrap();
        assert!(report.is_clean());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_missing_renewal_granted_once(pool: PgPool) {
        let config = create_test_config();
        let user_id = make_user(&pool, "recon2").await;

        let period_start = Utc::now() - Duration::hours(1);
        let mut conn = pool.acquire().await.unwrap();
        let plan = Plans::new(&mut conn)
            .create(&PlanCreateDBRequest {
                user_id,
                name: "pro".to_string(),
                status: PlanStatus::Active,
                provider_subscription_id: "sub_norenew".to_string(),
                credits_per_period: Decimal::new(300, 0),
                current_period_start: period_start,
                current_period_end: period_start + Duration::days(30),
            })
            .await
            .unwrap();
        drop(conn);

        let report = run_once(&pool, &config).await.unwrap();
        assert_eq!(report.renewals_granted, vec![plan.id]);

        let mut conn = pool.acquire().await.unwrap();
        let mut ledger = Ledger::new(&mut conn);
        assert_eq!(ledger.balance(user_id).await.unwrap(), Decimal::new(300, 0));

        let source_id = renewal_source_id("sub_norenew", period_start);
        let entry = ledger.find_by_source_id(&source_id).await.unwrap().unwrap();
        assert_eq!(entry.amount, Decimal::new(300, 0));
        drop(conn);

        // Replaying the sweep does not double-grant
        let report = run_once(&pool, &config).await.unwrap();
        assert!(report.renewals_granted.is_empty());

        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(Ledger::new(&mut conn).balance(user_id).await.unwrap(), Decimal::new(300, 0));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_negative_balance_reported_not_repaired(pool: PgPool) {
        let config = create_test_config();
        let user_id = make_user(&pool, "recon3").await;

        let mut conn = pool.acquire().await.unwrap();
        let mut ledger = Ledger::new(&mut conn);
        let mut expiring = EntryCreateDBRequest::trial_grant(user_id, Decimal::new(40, 0), Some(Utc::now() + Duration::hours(1)));
        expiring.source_id = "recon_spent_grant".to_string();
        ledger.append(&expiring).await.unwrap();
        ledger
            .append(&EntryCreateDBRequest::job_usage(user_id, uuid::Uuid::new_v4(), Decimal::new(35, 0)))
            .await
            .unwrap();

        sqlx::query("UPDATE credit_entries SET expires_at = NOW() - INTERVAL '1 minute' WHERE source_id = $1")
            .bind("recon_spent_grant")
            .execute(&pool)
            .await
            .unwrap();
        drop(conn);

        let report = run_once(&pool, &config).await.unwrap();
        assert_eq!(report.negative_balances.len(), 1);
        assert_eq!(report.negative_balances[0].user_id, user_id);
        assert_eq!(report.negative_balances[0].balance, Decimal::new(-35, 0));

        // Report only: the ledger is left alone
        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(Ledger::new(&mut conn).balance(user_id).await.unwrap(), Decimal::new(-35, 0));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_redeemed_code_grant_repaired(pool: PgPool) {
        let config = create_test_config();
        let admin = make_user(&pool, "recon4a").await;
        let redeemer = make_user(&pool, "recon4b").await;

        let mut conn = pool.acquire().await.unwrap();
        let mut referrals = Referrals::new(&mut conn);
        referrals
            .create(&ReferralCodeCreateDBRequest {
                code: "STRANDED".to_string(),
                credit_amount: Decimal::new(25, 0),
                expires_at: None,
                created_by: admin,
            })
            .await
            .unwrap();
        // Claim without the grant, as if the process died mid-redemption
        referrals.claim("STRANDED", redeemer).await.unwrap();
        drop(conn);

        let report = run_once(&pool, &config).await.unwrap();
        assert_eq!(report.redemption_grants_applied, vec!["STRANDED".to_string()]);

        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(Ledger::new(&mut conn).balance(redeemer).await.unwrap(), Decimal::new(25, 0));
        drop(conn);

        let report = run_once(&pool, &config).await.unwrap();
        assert!(report.is_clean());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_stale_job_reported(pool: PgPool) {
        let config = create_test_config();
        let user_id = make_user(&pool, "recon5").await;

        let mut conn = pool.acquire().await.unwrap();
        let job = Jobs::new(&mut conn)
            .create(&JobCreateDBRequest {
                user_id,
                kind: "noop".to_string(),
                credit_cost: Decimal::ZERO,
            })
            .await
            .unwrap();

        sqlx::query("UPDATE staging_jobs SET updated_at = NOW() - INTERVAL '3 days' WHERE id = $1")
            .bind(job.id)
            .execute(&pool)
            .await
            .unwrap();
        drop(conn);

        let report = run_once(&pool, &config).await.unwrap();
        assert_eq!(report.stale_jobs, vec![job.id]);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_report_persisted_and_served(pool: PgPool) {
        let config = create_test_config();
        make_user(&pool, "recon6").await;

        let mut conn = pool.acquire().await.unwrap();
        assert!(last_report(&mut conn).await.unwrap().is_none());
        drop(conn);

        let report = run_once(&pool, &config).await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        let stored = last_report(&mut conn).await.unwrap().unwrap();
        assert_eq!(stored.started_at, report.started_at);
        assert_eq!(stored.finding_count(), report.finding_count());
    }
}
