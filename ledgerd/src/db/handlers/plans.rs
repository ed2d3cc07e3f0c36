//! Database repository for billing plans.
//!
//! One row per provider subscription. Webhook processing goes through
//! [`Plans::upsert_by_subscription`] so that replayed lifecycle events
//! converge on the same row instead of erroring or duplicating.

use crate::db::{
    errors::Result,
    models::plans::{PlanCreateDBRequest, PlanDBResponse, PlanStatus, PlanUpdateDBRequest},
};
use crate::types::{PlanId, UserId, abbrev_uuid};
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::instrument;
use uuid::Uuid;

pub struct Plans<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Plans<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(user_id = %abbrev_uuid(&request.user_id), subscription = %request.provider_subscription_id), err)]
    pub async fn create(&mut self, request: &PlanCreateDBRequest) -> Result<PlanDBResponse> {
        let plan = sqlx::query_as::<_, PlanDBResponse>(
            r#"
            INSERT INTO plans (id, user_id, name, status, provider_subscription_id, credits_per_period, current_period_start, current_period_end)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(request.user_id)
        .bind(&request.name)
        .bind(request.status)
        .bind(&request.provider_subscription_id)
        .bind(request.credits_per_period)
        .bind(request.current_period_start)
        .bind(request.current_period_end)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(plan)
    }

    /// Insert a plan, or refresh the existing row for the same subscription.
    ///
    /// Lifecycle events are delivered at-least-once and can arrive out of
    /// order; converging on the subscription id keeps one row per
    /// subscription regardless.
    #[instrument(skip(self, request), fields(user_id = %abbrev_uuid(&request.user_id), subscription = %request.provider_subscription_id), err)]
    pub async fn upsert_by_subscription(&mut self, request: &PlanCreateDBRequest) -> Result<PlanDBResponse> {
        let plan = sqlx::query_as::<_, PlanDBResponse>(
            r#"
            INSERT INTO plans (id, user_id, name, status, provider_subscription_id, credits_per_period, current_period_start, current_period_end)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (provider_subscription_id) DO UPDATE SET
                name = EXCLUDED.name,
                status = EXCLUDED.status,
                credits_per_period = EXCLUDED.credits_per_period,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(request.user_id)
        .bind(&request.name)
        .bind(request.status)
        .bind(&request.provider_subscription_id)
        .bind(request.credits_per_period)
        .bind(request.current_period_start)
        .bind(request.current_period_end)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(plan)
    }

    #[instrument(skip(self), err)]
    pub async fn get_by_id(&mut self, id: PlanId) -> Result<Option<PlanDBResponse>> {
        let plan = sqlx::query_as::<_, PlanDBResponse>("SELECT * FROM plans WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(plan)
    }

    #[instrument(skip(self, subscription_id), err)]
    pub async fn get_by_subscription_id(&mut self, subscription_id: &str) -> Result<Option<PlanDBResponse>> {
        let plan = sqlx::query_as::<_, PlanDBResponse>("SELECT * FROM plans WHERE provider_subscription_id = $1")
            .bind(subscription_id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(plan)
    }

    /// The user's current active plan, if any. Newest first breaks ties when
    /// a canceled subscription was replaced within the same period.
    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&user_id)), err)]
    pub async fn get_active_for_user(&mut self, user_id: UserId) -> Result<Option<PlanDBResponse>> {
        let plan = sqlx::query_as::<_, PlanDBResponse>(
            "SELECT * FROM plans WHERE user_id = $1 AND status = $2 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(user_id)
        .bind(PlanStatus::Active)
        .fetch_optional(&mut *self.db)
        .await?;
        Ok(plan)
    }

    #[instrument(skip(self, request), err)]
    pub async fn update(&mut self, id: PlanId, request: &PlanUpdateDBRequest) -> Result<Option<PlanDBResponse>> {
        let plan = sqlx::query_as::<_, PlanDBResponse>(
            r#"
            UPDATE plans SET
                name = COALESCE($2, name),
                status = COALESCE($3, status),
                credits_per_period = COALESCE($4, credits_per_period),
                current_period_start = COALESCE($5, current_period_start),
                current_period_end = COALESCE($6, current_period_end),
                cancel_at_period_end = COALESCE($7, cancel_at_period_end),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&request.name)
        .bind(request.status)
        .bind(request.credits_per_period)
        .bind(request.current_period_start)
        .bind(request.current_period_end)
        .bind(request.cancel_at_period_end)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(plan)
    }

    /// Plans still marked active whose period ended before the cutoff.
    ///
    /// These are subscriptions the provider stopped renewing without a
    /// cancellation event reaching us; reconciliation flags them.
    #[instrument(skip(self), err)]
    pub async fn lapsed_active(&mut self, cutoff: DateTime<Utc>) -> Result<Vec<PlanDBResponse>> {
        let plans = sqlx::query_as::<_, PlanDBResponse>(
            "SELECT * FROM plans WHERE status = $1 AND current_period_end < $2 ORDER BY current_period_end",
        )
        .bind(PlanStatus::Active)
        .bind(cutoff)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(plans)
    }

    /// All active plans whose current period has started (reconciliation
    /// checks each one for its renewal grant)
    #[instrument(skip(self), err)]
    pub async fn active_in_period(&mut self, now: DateTime<Utc>) -> Result<Vec<PlanDBResponse>> {
        let plans = sqlx::query_as::<_, PlanDBResponse>(
            "SELECT * FROM plans WHERE status = $1 AND current_period_start <= $2 ORDER BY current_period_start",
        )
        .bind(PlanStatus::Active)
        .bind(now)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(plans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::users::Role;
    use crate::db::handlers::{Repository, Users};
    use crate::db::models::users::UserCreateDBRequest;
    use chrono::Duration;
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

    fn plan_request(user_id: UserId, subscription: &str) -> PlanCreateDBRequest {
        let now = Utc::now();
        PlanCreateDBRequest {
            user_id,
            name: "starter".to_string(),
            status: PlanStatus::Active,
            provider_subscription_id: subscription.to_string(),
            credits_per_period: Decimal::new(100, 0),
            current_period_start: now,
            current_period_end: now + Duration::days(30),
        }
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_upsert_converges_on_subscription(pool: PgPool) {
        let user_id = make_user(&pool, "plans1").await;
        let mut conn = pool.acquire().await.unwrap();
        let mut plans = Plans::new(&mut conn);

        let first = plans.upsert_by_subscription(&plan_request(user_id, "sub_abc")).await.unwrap();

        let mut renewed = plan_request(user_id, "sub_abc");
        renewed.current_period_start = first.current_period_end;
        renewed.current_period_end = first.current_period_end + Duration::days(30);
        let second = plans.upsert_by_subscription(&renewed).await.unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.current_period_start, first.current_period_end);
        drop(plans);

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM plans WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_active_plan_lookup(pool: PgPool) {
        let user_id = make_user(&pool, "plans2").await;
        let mut conn = pool.acquire().await.unwrap();
        let mut plans = Plans::new(&mut conn);

        let created = plans.create(&plan_request(user_id, "sub_active")).await.unwrap();
        assert_eq!(
            plans.get_active_for_user(user_id).await.unwrap().map(|p| p.id),
            Some(created.id)
        );

        plans
            .update(
                created.id,
                &PlanUpdateDBRequest {
                    status: Some(PlanStatus::Canceled),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(plans.get_active_for_user(user_id).await.unwrap().is_none());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_lapsed_active_detection(pool: PgPool) {
        let user_id = make_user(&pool, "plans3").await;
        let mut conn = pool.acquire().await.unwrap();
        let mut plans = Plans::new(&mut conn);

        let mut stale = plan_request(user_id, "sub_stale");
        stale.current_period_start = Utc::now() - Duration::days(60);
        stale.current_period_end = Utc::now() - Duration::days(30);
        plans.create(&stale).await.unwrap();
        plans.create(&plan_request(user_id, "sub_fresh")).await.unwrap();

        let lapsed = plans.lapsed_active(Utc::now() - Duration::days(1)).await.unwrap();
        assert_eq!(lapsed.len(), 1);
        assert_eq!(lapsed[0].provider_subscription_id, "sub_stale");
    }
}
