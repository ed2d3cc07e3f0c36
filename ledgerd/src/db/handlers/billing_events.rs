//! Database repository for received billing provider events.
//!
//! Every webhook delivery is recorded here before processing; the unique
//! event_id makes [`BillingEvents::record`] the dedup gate for replays.

use crate::db::{
    errors::Result,
    models::billing_events::{BillingEventCreateDBRequest, BillingEventDBResponse},
};
use sqlx::PgConnection;
use tracing::instrument;
use uuid::Uuid;

pub struct BillingEvents<'c> {
    db: &'c mut PgConnection,
}

impl<'c> BillingEvents<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Record an incoming event. Returns `None` when the event_id was
    /// already recorded, in which case the caller skips processing.
    #[instrument(skip(self, request), fields(event_id = %request.event_id, event_type = %request.event_type), err)]
    pub async fn record(&mut self, request: &BillingEventCreateDBRequest) -> Result<Option<BillingEventDBResponse>> {
        let event = sqlx::query_as::<_, BillingEventDBResponse>(
            r#"
            INSERT INTO billing_events (id, event_id, event_type, payload)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (event_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&request.event_id)
        .bind(&request.event_type)
        .bind(&request.payload)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(event)
    }

    #[instrument(skip(self, event_id), err)]
    pub async fn get_by_event_id(&mut self, event_id: &str) -> Result<Option<BillingEventDBResponse>> {
        let event = sqlx::query_as::<_, BillingEventDBResponse>("SELECT * FROM billing_events WHERE event_id = $1")
            .bind(event_id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(event)
    }

    #[instrument(skip(self), err)]
    pub async fn count(&mut self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM billing_events")
            .fetch_one(&mut *self.db)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::PgPool;

    fn event(event_id: &str) -> BillingEventCreateDBRequest {
        BillingEventCreateDBRequest {
            event_id: event_id.to_string(),
            event_type: "subscription.renewed".to_string(),
            payload: serde_json::json!({"subscription_id": "sub_1"}),
        }
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_record_dedupes_by_event_id(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let mut events = BillingEvents::new(&mut conn);

        let first = events.record(&event("evt_1")).await.unwrap();
        assert!(first.is_some());

        let replay = events.record(&event("evt_1")).await.unwrap();
        assert!(replay.is_none());

        assert_eq!(events.count().await.unwrap(), 1);
        assert!(events.get_by_event_id("evt_1").await.unwrap().is_some());
    }
}
