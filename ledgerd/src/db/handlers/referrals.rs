//! Database repository for single-use referral codes.
//!
//! The claim is one guarded UPDATE: it only matches an unredeemed,
//! unexpired row, so two concurrent redeemers cannot both win. Callers run
//! [`Referrals::claim`] and the credit grant inside the same transaction.

use crate::db::{
    errors::Result,
    models::referrals::{ReferralCodeCreateDBRequest, ReferralCodeDBResponse},
};
use crate::types::{UserId, abbrev_uuid};
use sqlx::PgConnection;
use tracing::instrument;
use uuid::Uuid;

pub struct Referrals<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Referrals<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(code = %request.code), err)]
    pub async fn create(&mut self, request: &ReferralCodeCreateDBRequest) -> Result<ReferralCodeDBResponse> {
        let code = sqlx::query_as::<_, ReferralCodeDBResponse>(
            r#"
            INSERT INTO referral_codes (id, code, credit_amount, expires_at, created_by)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&request.code)
        .bind(request.credit_amount)
        .bind(request.expires_at)
        .bind(request.created_by)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(code)
    }

    #[instrument(skip(self, code), err)]
    pub async fn get_by_code(&mut self, code: &str) -> Result<Option<ReferralCodeDBResponse>> {
        let row = sqlx::query_as::<_, ReferralCodeDBResponse>("SELECT * FROM referral_codes WHERE code = $1")
            .bind(code)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(row)
    }

    #[instrument(skip(self), err)]
    pub async fn list(&mut self) -> Result<Vec<ReferralCodeDBResponse>> {
        let codes = sqlx::query_as::<_, ReferralCodeDBResponse>(
            "SELECT * FROM referral_codes ORDER BY created_at DESC",
        )
        .fetch_all(&mut *self.db)
        .await?;
        Ok(codes)
    }

    /// Atomically mark a code redeemed by `redeemer`.
    ///
    /// Returns `None` when the code does not exist, was already redeemed,
    /// or has expired; the caller distinguishes those with a follow-up
    /// [`Referrals::get_by_code`].
    #[instrument(skip(self, code), fields(redeemer = %abbrev_uuid(&redeemer)), err)]
    pub async fn claim(&mut self, code: &str, redeemer: UserId) -> Result<Option<ReferralCodeDBResponse>> {
        let claimed = sqlx::query_as::<_, ReferralCodeDBResponse>(
            r#"
            UPDATE referral_codes
            SET redeemed_by = $2, redeemed_at = NOW()
            WHERE code = $1
              AND redeemed_by IS NULL
              AND (expires_at IS NULL OR expires_at > NOW())
            RETURNING *
            "#,
        )
        .bind(code)
        .bind(redeemer)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(claimed)
    }

    /// Codes marked redeemed whose grant entry never landed.
    ///
    /// The claim and the grant commit together, so this should stay empty;
    /// reconciliation reports any row that shows up here.
    #[instrument(skip(self), err)]
    pub async fn redeemed_without_grant(&mut self) -> Result<Vec<ReferralCodeDBResponse>> {
        let codes = sqlx::query_as::<_, ReferralCodeDBResponse>(
            r#"
            SELECT rc.* FROM referral_codes rc
            WHERE rc.redeemed_by IS NOT NULL
              AND NOT EXISTS (
                  SELECT 1 FROM credit_entries ce
                  WHERE ce.source_id = 'special_' || rc.code || '_' || rc.redeemed_by::text
              )
            ORDER BY rc.redeemed_at
            "#,
        )
        .fetch_all(&mut *self.db)
        .await?;
        Ok(codes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::users::Role;
    use crate::db::handlers::{Repository, Users};
    use crate::db::models::users::UserCreateDBRequest;
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;
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

    fn code_request(code: &str, created_by: UserId) -> ReferralCodeCreateDBRequest {
        ReferralCodeCreateDBRequest {
            code: code.to_string(),
            credit_amount: Decimal::new(25, 0),
            expires_at: None,
            created_by,
        }
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_claim_is_single_use(pool: PgPool) {
        let admin = make_user(&pool, "refadmin").await;
        let alice = make_user(&pool, "alice").await;
        let bob = make_user(&pool, "bob").await;

        let mut conn = pool.acquire().await.unwrap();
        let mut referrals = Referrals::new(&mut conn);
        referrals.create(&code_request("LAUNCH25", admin)).await.unwrap();

        let first = referrals.claim("LAUNCH25", alice).await.unwrap();
        assert_eq!(first.unwrap().redeemed_by, Some(alice));

        // Second redeemer gets nothing
        assert!(referrals.claim("LAUNCH25", bob).await.unwrap().is_none());

        let row = referrals.get_by_code("LAUNCH25").await.unwrap().unwrap();
        assert_eq!(row.redeemed_by, Some(alice));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_claim_expired_code(pool: PgPool) {
        let admin = make_user(&pool, "refadmin2").await;
        let alice = make_user(&pool, "alice2").await;

        let mut conn = pool.acquire().await.unwrap();
        let mut referrals = Referrals::new(&mut conn);

        let mut request = code_request("BYGONE", admin);
        request.expires_at = Some(Utc::now() - Duration::hours(1));
        referrals.create(&request).await.unwrap();

        assert!(referrals.claim("BYGONE", alice).await.unwrap().is_none());
        // Row still exists, just expired
        assert!(referrals.get_by_code("BYGONE").await.unwrap().is_some());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_duplicate_code_rejected(pool: PgPool) {
        let admin = make_user(&pool, "refadmin3").await;
        let mut conn = pool.acquire().await.unwrap();
        let mut referrals = Referrals::new(&mut conn);

        referrals.create(&code_request("ONCE", admin)).await.unwrap();
        let err = referrals.create(&code_request("ONCE", admin)).await.unwrap_err();
        assert!(err.is_unique_violation_on("referral_codes_code_key"));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_redeemed_without_grant_flags_missing_entries(pool: PgPool) {
        let admin = make_user(&pool, "refadmin4").await;
        let alice = make_user(&pool, "alice4").await;

        let mut conn = pool.acquire().await.unwrap();
        let mut referrals = Referrals::new(&mut conn);
        referrals.create(&code_request("ORPHAN", admin)).await.unwrap();
        referrals.claim("ORPHAN", alice).await.unwrap();

        // Claimed but never granted
        let missing = referrals.redeemed_without_grant().await.unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].code, "ORPHAN");

        // Granting clears the report
        let mut ledger = crate::db::handlers::Ledger::new(&mut conn);
        let request = crate::db::models::ledger::EntryCreateDBRequest::special_code_grant(
            alice,
            "ORPHAN",
            Decimal::new(25, 0),
            None,
        );
        ledger.append(&request).await.unwrap();

        let mut referrals = Referrals::new(&mut conn);
        assert!(referrals.redeemed_without_grant().await.unwrap().is_empty());
    }
}
