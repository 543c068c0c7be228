use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;

use crate::{is_unique_violation, to_rfc3339};

/// Ledger of received Stripe events, keyed by Stripe's event id.
#[derive(Clone)]
pub struct WebhookEventRepository {
    pool: SqlitePool,
}

#[derive(Clone)]
pub struct NewWebhookEvent<'a> {
    pub event_id: &'a str,
    pub event_type: &'a str,
    pub payload_json: &'a str,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookInsertOutcome {
    Inserted,
    Duplicate,
}

impl WebhookInsertOutcome {
    pub fn is_duplicate(self) -> bool {
        matches!(self, Self::Duplicate)
    }
}

impl WebhookEventRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(
        &self,
        record: &NewWebhookEvent<'_>,
    ) -> Result<WebhookInsertOutcome, WebhookEventError> {
        let result = sqlx::query(
            "INSERT INTO stripe_webhook_events (event_id, event_type, payload_json, received_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(record.event_id)
        .bind(record.event_type)
        .bind(record.payload_json)
        .bind(to_rfc3339(record.received_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(WebhookInsertOutcome::Inserted),
            Err(err) if is_unique_violation(&err) => Ok(WebhookInsertOutcome::Duplicate),
            Err(err) => Err(WebhookEventError::Database(err)),
        }
    }

    pub async fn mark_processed(
        &self,
        event_id: &str,
        outcome: &str,
        now: DateTime<Utc>,
    ) -> Result<(), WebhookEventError> {
        sqlx::query(
            "UPDATE stripe_webhook_events SET processed_at = ?, outcome = ? WHERE event_id = ?",
        )
        .bind(to_rfc3339(now))
        .bind(outcome)
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn outcome(&self, event_id: &str) -> Result<Option<String>, WebhookEventError> {
        let outcome: Option<Option<String>> =
            sqlx::query_scalar("SELECT outcome FROM stripe_webhook_events WHERE event_id = ?")
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(outcome.flatten())
    }

    /// Deletes up to `limit` events received before `threshold`.
    pub async fn delete_older_than_batch(
        &self,
        threshold: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, sqlx::Error> {
        let done = sqlx::query(
            "DELETE FROM stripe_webhook_events WHERE event_id IN ( \
                SELECT event_id FROM stripe_webhook_events WHERE received_at < ? LIMIT ?)",
        )
        .bind(to_rfc3339(threshold))
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }
}

#[derive(Debug, Error)]
pub enum WebhookEventError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use chrono::Duration;

    fn event(id: &str, received_at: DateTime<Utc>) -> NewWebhookEvent<'_> {
        NewWebhookEvent {
            event_id: id,
            event_type: "invoice.payment_succeeded",
            payload_json: "{}",
            received_at,
        }
    }

    #[tokio::test]
    async fn duplicates_are_detected() {
        let (db, _dir) = test_support::database().await;
        let repo = db.webhook_events();
        let now = Utc::now();

        assert_eq!(
            repo.insert(&event("evt_1", now)).await.expect("insert"),
            WebhookInsertOutcome::Inserted
        );
        assert!(repo
            .insert(&event("evt_1", now))
            .await
            .expect("insert")
            .is_duplicate());

        repo.mark_processed("evt_1", "processed", now)
            .await
            .expect("mark");
        assert_eq!(
            repo.outcome("evt_1").await.expect("outcome").as_deref(),
            Some("processed")
        );
    }

    #[tokio::test]
    async fn ttl_deletes_only_old_rows() {
        let (db, _dir) = test_support::database().await;
        let repo = db.webhook_events();
        let now = Utc::now();
        repo.insert(&event("old", now - Duration::days(31)))
            .await
            .expect("insert");
        repo.insert(&event("new", now)).await.expect("insert");

        let deleted = repo
            .delete_older_than_batch(now - Duration::days(30), 1000)
            .await
            .expect("delete");
        assert_eq!(deleted, 1);
        assert!(repo.insert(&event("new", now)).await.expect("insert").is_duplicate());
    }
}
