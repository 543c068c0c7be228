use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use stockflow_core::{
    identity::User,
    notification::{resolve_preference, Channel, NotificationDraft},
};
use stockflow_storage::{Database, UserError};

use crate::audit::{AuditEvent, AuditHub, AuditKind};
use crate::mailer::{notification_email, send_logged, Mailer};
use crate::sse::NotificationHub;

/// Fans a notification out to recipients over the channels their
/// preferences allow.
#[derive(Clone)]
pub struct Notifier {
    database: Database,
    hub: NotificationHub,
    mailer: Arc<dyn Mailer>,
    audit: AuditHub,
    public_base_url: Arc<str>,
    // Held from insert to publish so the hub sees seqs in ascending order.
    publish_order: Arc<Mutex<()>>,
}

impl Notifier {
    pub fn new(
        database: Database,
        hub: NotificationHub,
        mailer: Arc<dyn Mailer>,
        audit: AuditHub,
        public_base_url: &str,
    ) -> Self {
        Self {
            database,
            hub,
            mailer,
            audit,
            public_base_url: Arc::from(public_base_url),
            publish_order: Arc::new(Mutex::new(())),
        }
    }

    /// Delivers `draft` to each recipient and returns how many received it on
    /// at least one channel. Per-recipient failures are logged and skipped.
    pub async fn dispatch(
        &self,
        recipients: &[User],
        draft: &NotificationDraft,
        now: DateTime<Utc>,
    ) -> usize {
        let mut delivered = 0;
        for recipient in recipients {
            if self.deliver(recipient, draft, now).await {
                delivered += 1;
            }
        }

        info!(
            stage = "notification",
            kind = draft.kind.as_str(),
            priority = draft.priority.as_str(),
            recipients = recipients.len(),
            delivered,
            "notification dispatched"
        );
        let mut event = AuditEvent::new(AuditKind::Notification, "dispatch", now).output(json!({
            "kind": draft.kind.as_str(),
            "priority": draft.priority.as_str(),
            "recipients": recipients.len(),
            "delivered": delivered,
        }));
        if let Some(sender) = &draft.sender_id {
            event = event.actor(sender.clone());
        }
        self.audit.publish(event);
        delivered
    }

    pub async fn dispatch_to_user(
        &self,
        user_id: &str,
        draft: &NotificationDraft,
        now: DateTime<Utc>,
    ) -> Result<usize, NotifyError> {
        let Some(record) = self.database.users().find_by_id(user_id).await? else {
            return Err(NotifyError::UnknownRecipient);
        };
        if !record.user.is_active {
            return Ok(0);
        }
        Ok(self.dispatch(&[record.user], draft, now).await)
    }

    /// Every active user whose role grants `permission`.
    pub async fn dispatch_to_permission(
        &self,
        permission: &str,
        draft: &NotificationDraft,
        now: DateTime<Utc>,
    ) -> Result<usize, NotifyError> {
        let recipients = self.database.users().list_with_permission(permission).await?;
        Ok(self.dispatch(&recipients, draft, now).await)
    }

    pub async fn dispatch_to_role(
        &self,
        role: &str,
        draft: &NotificationDraft,
        now: DateTime<Utc>,
    ) -> Result<usize, NotifyError> {
        let recipients = self.database.users().list_active_by_role(role).await?;
        Ok(self.dispatch(&recipients, draft, now).await)
    }

    async fn deliver(&self, recipient: &User, draft: &NotificationDraft, now: DateTime<Utc>) -> bool {
        let stored = match self.database.notifications().preferences_for(&recipient.id).await {
            Ok(stored) => stored,
            Err(err) => {
                error!(stage = "notification", user_id = %recipient.id, error = %err, "failed to load preferences");
                return false;
            }
        };
        let preference = resolve_preference(&stored, draft.kind);
        let timezone = recipient.timezone();
        let in_app = preference.should_receive(draft.priority, Channel::InApp, now, timezone);
        let email = preference.should_receive(draft.priority, Channel::Email, now, timezone);

        let mut delivered = false;
        if in_app {
            let id = Uuid::new_v4().to_string();
            let _order = self.publish_order.lock().await;
            match self
                .database
                .notifications()
                .insert(&id, &recipient.id, draft, now)
                .await
            {
                Ok(notification) => {
                    counter!("notifications_dispatched_total", "channel" => Channel::InApp.as_str())
                        .increment(1);
                    delivered = true;
                    if let Err(err) = self.hub.publish(&notification).await {
                        warn!(stage = "notification", user_id = %recipient.id, error = %err, "failed to push notification");
                    }
                }
                Err(err) => {
                    error!(stage = "notification", user_id = %recipient.id, error = %err, "failed to store notification");
                }
            }
        }

        if email {
            match notification_email(
                &self.public_base_url,
                &recipient.email,
                &recipient.full_name(),
                draft,
            ) {
                Ok(message) => {
                    if send_logged(self.mailer.as_ref(), message, "notification").await {
                        counter!("notifications_dispatched_total", "channel" => Channel::Email.as_str())
                            .increment(1);
                        delivered = true;
                    }
                }
                Err(err) => {
                    warn!(stage = "notification", user_id = %recipient.id, error = %err, "failed to render notification email");
                }
            }
        }

        delivered
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("recipient does not exist")]
    UnknownRecipient,
    #[error("failed to resolve recipients: {0}")]
    Users(#[from] UserError),
}
