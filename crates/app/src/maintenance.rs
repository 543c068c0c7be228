use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::{counter, histogram};
use serde_json::json;
use sqlx::Error as SqlxError;
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use stockflow_core::{billing::SubscriptionStatus, notification::SubscriptionEvent};
use stockflow_storage::{Database, SubscriptionError};

use crate::audit::{AuditEvent, AuditHub, AuditKind};
use crate::billing::notify_subscription;
use crate::notifier::Notifier;
use crate::verification::VerificationService;

const WEBHOOK_RETENTION_DAYS: i64 = 30;
const BATCH_LIMIT: i64 = 1000;
const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Background worker for retention sweeps, subscription deadlines and WAL checkpoints.
#[derive(Clone)]
pub struct MaintenanceWorker {
    database: Database,
    verification: VerificationService,
    audit: AuditHub,
    notifier: Notifier,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    interval: Duration,
}

impl MaintenanceWorker {
    pub fn new(
        database: Database,
        verification: VerificationService,
        audit: AuditHub,
        notifier: Notifier,
    ) -> Self {
        Self {
            database,
            verification,
            audit,
            notifier,
            clock: Arc::new(Utc::now),
            interval: DEFAULT_INTERVAL,
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_once().await {
                error!(stage = "storage", error = %err, "maintenance run failed");
            }
        }
    }

    /// One full cycle: token and webhook retention, notification expiry,
    /// subscription deadlines, then a WAL checkpoint.
    pub async fn run_once(&self) -> Result<(), MaintenanceError> {
        let now = (self.clock)();

        let (tokens_deleted, tokens_busy) = self
            .sweep("verification_tokens", || async move {
                self.verification
                    .cleanup_expired_batch(now, BATCH_LIMIT)
                    .await
            })
            .await?;
        info!(
            stage = "storage",
            table = "verification_tokens",
            deleted = tokens_deleted,
            busy = tokens_busy,
            "verification token sweep completed"
        );
        self.publish_storage_event(
            "ttl.verification_tokens",
            json!({
                "table": "verification_tokens",
                "deleted": tokens_deleted,
                "busy": tokens_busy,
            }),
        );

        let threshold = now - ChronoDuration::days(WEBHOOK_RETENTION_DAYS);
        let (events_deleted, events_busy) = self
            .sweep("stripe_webhook_events", || async move {
                self.database
                    .webhook_events()
                    .delete_older_than_batch(threshold, BATCH_LIMIT)
                    .await
            })
            .await?;
        info!(
            stage = "storage",
            table = "stripe_webhook_events",
            deleted = events_deleted,
            busy = events_busy,
            threshold = %threshold.to_rfc3339(),
            "webhook event sweep completed"
        );
        self.publish_storage_event(
            "ttl.stripe_webhook_events",
            json!({
                "table": "stripe_webhook_events",
                "deleted": events_deleted,
                "threshold": threshold.to_rfc3339(),
                "busy": events_busy,
            }),
        );

        let (expired, expire_busy) = self
            .sweep("notifications", || async move {
                self.database
                    .notifications()
                    .expire_batch(now, BATCH_LIMIT)
                    .await
            })
            .await?;
        if expired > 0 {
            info!(stage = "storage", expired, "notifications expired");
        }
        self.publish_storage_event(
            "expire.notifications",
            json!({ "table": "notifications", "expired": expired, "busy": expire_busy }),
        );

        self.settle_subscriptions(now).await?;
        self.run_checkpoint().await?;

        Ok(())
    }

    /// Repeats `batch` until it deletes nothing. A busy database ends the sweep early.
    async fn sweep<F, Fut>(
        &self,
        table: &'static str,
        mut batch: F,
    ) -> Result<(u64, bool), MaintenanceError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<u64, SqlxError>>,
    {
        let mut total = 0u64;
        loop {
            match batch().await {
                Ok(0) => return Ok((total, false)),
                Ok(affected) => {
                    total += affected;
                    counter!("db_ttl_deleted_total", "table" => table).increment(affected);
                }
                Err(err) if is_sqlite_busy(&err) => {
                    counter!("db_busy_total", "op" => "ttl").increment(1);
                    warn!(stage = "storage", %table, error = %err, "sweep hit busy timeout");
                    return Ok((total, true));
                }
                Err(err) => return Err(MaintenanceError::Sweep { table, source: err }),
            }
        }
    }

    async fn settle_subscriptions(&self, now: DateTime<Utc>) -> Result<(), MaintenanceError> {
        let repo = self.database.subscriptions();
        let due = match repo.list_unsettled(now, BATCH_LIMIT).await {
            Ok(due) => due,
            Err(SubscriptionError::Database(err)) if is_sqlite_busy(&err) => {
                counter!("db_busy_total", "op" => "settle").increment(1);
                warn!(stage = "storage", error = %err, "subscription settlement hit busy timeout");
                return Ok(());
            }
            Err(err) => return Err(MaintenanceError::Settle(err)),
        };

        let mut settled = 0u64;
        for mut subscription in due {
            if !subscription.settle(now) {
                continue;
            }
            repo.update(&subscription)
                .await
                .map_err(MaintenanceError::Settle)?;
            settled += 1;
            counter!("subscription_transitions_total", "status" => subscription.status.as_str())
                .increment(1);
            info!(
                stage = "billing",
                subscription_id = %subscription.id,
                status = subscription.status.as_str(),
                "subscription settled"
            );

            let event = match subscription.status {
                SubscriptionStatus::Expired => Some(SubscriptionEvent::Expired),
                SubscriptionStatus::Cancelled => Some(SubscriptionEvent::Cancelled),
                _ => None,
            };
            if let Some(event) = event {
                notify_subscription(&self.database, &self.notifier, &subscription, event, now).await;
            }
        }

        self.publish_storage_event("settle.subscriptions", json!({ "settled": settled }));
        Ok(())
    }

    async fn run_checkpoint(&self) -> Result<(), MaintenanceError> {
        let start = std::time::Instant::now();
        match self.database.wal_checkpoint_truncate().await {
            Ok(stats) => {
                let duration = start.elapsed().as_secs_f64();
                histogram!("db_checkpoint_seconds").record(duration);
                let busy = stats.busy_frames > 0;
                if busy {
                    counter!("db_busy_total", "op" => "checkpoint").increment(1);
                    warn!(
                        stage = "storage",
                        busy_frames = stats.busy_frames,
                        log_frames = stats.log_frames,
                        duration_secs = duration,
                        "WAL checkpoint completed with busy frames"
                    );
                } else {
                    info!(
                        stage = "storage",
                        log_frames = stats.log_frames,
                        checkpointed_frames = stats.checkpointed_frames,
                        duration_secs = duration,
                        "WAL checkpoint completed"
                    );
                }
                self.publish_storage_event(
                    "wal.checkpoint",
                    json!({
                        "busy_frames": stats.busy_frames,
                        "log_frames": stats.log_frames,
                        "checkpointed_frames": stats.checkpointed_frames,
                        "busy": busy,
                        "duration_secs": duration,
                    }),
                );
                Ok(())
            }
            Err(err) if is_sqlite_busy(&err) => {
                counter!("db_busy_total", "op" => "checkpoint").increment(1);
                warn!(stage = "storage", error = %err, "WAL checkpoint hit busy timeout");
                self.publish_storage_event(
                    "wal.checkpoint",
                    json!({ "busy": true, "error": "database busy" }),
                );
                Ok(())
            }
            Err(err) => Err(MaintenanceError::Checkpoint { source: err }),
        }
    }

    fn publish_storage_event(&self, action: &str, payload: serde_json::Value) {
        self.audit
            .publish(AuditEvent::new(AuditKind::Storage, action, (self.clock)()).output(payload));
    }
}

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("failed to sweep {table}")]
    Sweep {
        table: &'static str,
        #[source]
        source: SqlxError,
    },
    #[error("failed to settle subscriptions: {0}")]
    Settle(#[source] SubscriptionError),
    #[error("failed to run WAL checkpoint")]
    Checkpoint {
        #[source]
        source: SqlxError,
    },
}

fn is_sqlite_busy(err: &SqlxError) -> bool {
    match err {
        SqlxError::Database(db_err) => matches!(db_err.code().as_deref(), Some("5") | Some("6")),
        _ => false,
    }
}
