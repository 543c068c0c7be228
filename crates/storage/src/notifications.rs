use chrono::{DateTime, NaiveTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;

use stockflow_core::notification::{
    ChannelSet, Notification, NotificationDraft, NotificationError, NotificationPreference,
    NotificationStatus, QuietHours,
};
use stockflow_core::paging::{Page, PageRequest};

use crate::{is_foreign_key_violation, opt_rfc3339, to_rfc3339};

const NOTIFICATION_COLUMNS: &str = "seq, id, recipient_id, sender_id, title, message, kind, \
     priority, status, related_entity_type, related_entity_id, action_url, metadata_json, \
     created_at, read_at, expires_at, is_dismissible";

/// Rows that are still visible to their recipient.
const VISIBLE: &str = "dismissed_at IS NULL AND status != 'expired'";

const QUIET_TIME_FORMAT: &str = "%H:%M";

/// Repository for in-app notifications and per-user delivery preferences.
#[derive(Clone)]
pub struct NotificationRepository {
    pool: SqlitePool,
}

#[derive(Debug, sqlx::FromRow)]
struct NotificationRow {
    seq: i64,
    id: String,
    recipient_id: String,
    sender_id: Option<String>,
    title: String,
    message: String,
    kind: String,
    priority: String,
    status: String,
    related_entity_type: Option<String>,
    related_entity_id: Option<String>,
    action_url: Option<String>,
    metadata_json: Option<String>,
    created_at: DateTime<Utc>,
    read_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    is_dismissible: bool,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = NotificationRepoError;

    fn try_from(row: NotificationRow) -> Result<Self, Self::Error> {
        let metadata = match row.metadata_json.as_deref() {
            Some(raw) => serde_json::from_str(raw)?,
            None => serde_json::Value::Null,
        };
        Ok(Notification {
            id: row.id,
            seq: row.seq,
            recipient_id: row.recipient_id,
            sender_id: row.sender_id,
            title: row.title,
            message: row.message,
            kind: row.kind.parse()?,
            priority: row.priority.parse()?,
            status: row.status.parse()?,
            related_entity_type: row.related_entity_type,
            related_entity_id: row.related_entity_id,
            action_url: row.action_url,
            metadata,
            created_at: row.created_at,
            read_at: row.read_at,
            expires_at: row.expires_at,
            is_dismissible: row.is_dismissible,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PreferenceRow {
    kind: String,
    enabled: bool,
    channels: i64,
    minimum_priority: String,
    quiet_start: Option<String>,
    quiet_end: Option<String>,
}

impl TryFrom<PreferenceRow> for NotificationPreference {
    type Error = NotificationRepoError;

    fn try_from(row: PreferenceRow) -> Result<Self, Self::Error> {
        let quiet_hours = match (row.quiet_start.as_deref(), row.quiet_end.as_deref()) {
            (Some(start), Some(end)) => Some(QuietHours {
                start: parse_quiet_time(start)?,
                end: parse_quiet_time(end)?,
            }),
            _ => None,
        };
        Ok(NotificationPreference {
            kind: row.kind.parse()?,
            enabled: row.enabled,
            channels: ChannelSet::from_bits(row.channels),
            minimum_priority: row.minimum_priority.parse()?,
            quiet_hours,
        })
    }
}

fn parse_quiet_time(raw: &str) -> Result<NaiveTime, NotificationRepoError> {
    NaiveTime::parse_from_str(raw, QUIET_TIME_FORMAT)
        .map_err(|_| NotificationRepoError::InvalidQuietHours(raw.to_string()))
}

/// Result of dismissing a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DismissOutcome {
    Dismissed,
    NotFound,
    NotDismissible,
}

impl NotificationRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Stores a delivered notification and returns it with its assigned `seq`.
    pub async fn insert(
        &self,
        id: &str,
        recipient_id: &str,
        draft: &NotificationDraft,
        now: DateTime<Utc>,
    ) -> Result<Notification, NotificationRepoError> {
        let metadata_json = if draft.metadata.is_null() {
            None
        } else {
            Some(serde_json::to_string(&draft.metadata)?)
        };

        let result = sqlx::query(
            "INSERT INTO notifications \
             (id, recipient_id, sender_id, title, message, kind, priority, status, \
              related_entity_type, related_entity_id, action_url, metadata_json, created_at, \
              expires_at, is_dismissible) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(recipient_id)
        .bind(&draft.sender_id)
        .bind(&draft.title)
        .bind(&draft.message)
        .bind(draft.kind.as_str())
        .bind(draft.priority.as_str())
        .bind(NotificationStatus::Delivered.as_str())
        .bind(&draft.related_entity_type)
        .bind(&draft.related_entity_id)
        .bind(&draft.action_url)
        .bind(metadata_json)
        .bind(to_rfc3339(now))
        .bind(opt_rfc3339(draft.expires_at))
        .bind(draft.is_dismissible)
        .execute(&self.pool)
        .await;

        let seq = match result {
            Ok(done) => done.last_insert_rowid(),
            Err(err) if is_foreign_key_violation(&err) => {
                return Err(NotificationRepoError::UnknownRecipient)
            }
            Err(err) => return Err(NotificationRepoError::Database(err)),
        };

        let row = sqlx::query_as::<_, NotificationRow>(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE seq = ?"
        ))
        .bind(seq)
        .fetch_one(&self.pool)
        .await?;
        Notification::try_from(row)
    }

    /// Newest first.
    pub async fn page_for_user(
        &self,
        user_id: &str,
        unread_only: bool,
        request: PageRequest,
    ) -> Result<Page<Notification>, NotificationRepoError> {
        let unread = if unread_only { " AND read_at IS NULL" } else { "" };

        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM notifications WHERE recipient_id = ? AND {VISIBLE}{unread}"
        ))
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query_as::<_, NotificationRow>(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications \
             WHERE recipient_id = ? AND {VISIBLE}{unread} \
             ORDER BY seq DESC LIMIT ? OFFSET ?"
        ))
        .bind(user_id)
        .bind(request.limit())
        .bind(request.offset())
        .fetch_all(&self.pool)
        .await?;

        let items = rows
            .into_iter()
            .map(Notification::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page::new(items, total, request))
    }

    pub async fn unread_count(&self, user_id: &str) -> Result<i64, NotificationRepoError> {
        let count = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM notifications \
             WHERE recipient_id = ? AND read_at IS NULL AND {VISIBLE}"
        ))
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Returns `false` when the notification does not belong to `user_id`.
    pub async fn mark_read(
        &self,
        user_id: &str,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, NotificationRepoError> {
        let done = sqlx::query(
            "UPDATE notifications SET read_at = COALESCE(read_at, ?), \
             status = CASE WHEN status = 'expired' THEN status ELSE 'read' END \
             WHERE id = ? AND recipient_id = ? AND dismissed_at IS NULL",
        )
        .bind(to_rfc3339(now))
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    pub async fn mark_all_read(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, NotificationRepoError> {
        let done = sqlx::query(&format!(
            "UPDATE notifications SET read_at = ?, status = 'read' \
             WHERE recipient_id = ? AND read_at IS NULL AND {VISIBLE}"
        ))
        .bind(to_rfc3339(now))
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }

    pub async fn dismiss(
        &self,
        user_id: &str,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<DismissOutcome, NotificationRepoError> {
        let dismissible: Option<bool> = sqlx::query_scalar(
            "SELECT is_dismissible FROM notifications \
             WHERE id = ? AND recipient_id = ? AND dismissed_at IS NULL",
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match dismissible {
            None => Ok(DismissOutcome::NotFound),
            Some(false) => Ok(DismissOutcome::NotDismissible),
            Some(true) => {
                sqlx::query("UPDATE notifications SET dismissed_at = ? WHERE id = ?")
                    .bind(to_rfc3339(now))
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
                Ok(DismissOutcome::Dismissed)
            }
        }
    }

    /// Visible notifications with `seq` greater than `after_seq`, oldest first.
    pub async fn list_since(
        &self,
        user_id: &str,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<Notification>, NotificationRepoError> {
        let rows = sqlx::query_as::<_, NotificationRow>(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications \
             WHERE recipient_id = ? AND seq > ? AND {VISIBLE} \
             ORDER BY seq ASC LIMIT ?"
        ))
        .bind(user_id)
        .bind(after_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Notification::try_from).collect()
    }

    /// Marks up to `limit` notifications past their expiry as expired.
    pub async fn expire_batch(&self, now: DateTime<Utc>, limit: i64) -> Result<u64, sqlx::Error> {
        let done = sqlx::query(
            "UPDATE notifications SET status = 'expired' WHERE seq IN ( \
                SELECT seq FROM notifications \
                 WHERE expires_at IS NOT NULL AND expires_at <= ? AND status != 'expired' \
                 LIMIT ?)",
        )
        .bind(to_rfc3339(now))
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }

    /// Stored preferences only; callers merge in defaults.
    pub async fn preferences_for(
        &self,
        user_id: &str,
    ) -> Result<Vec<NotificationPreference>, NotificationRepoError> {
        let rows = sqlx::query_as::<_, PreferenceRow>(
            "SELECT kind, enabled, channels, minimum_priority, quiet_start, quiet_end \
             FROM notification_preferences WHERE user_id = ? ORDER BY kind",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(NotificationPreference::try_from)
            .collect()
    }

    pub async fn upsert_preference(
        &self,
        user_id: &str,
        preference: &NotificationPreference,
        now: DateTime<Utc>,
    ) -> Result<(), NotificationRepoError> {
        let (quiet_start, quiet_end) = match preference.quiet_hours {
            Some(window) => (
                Some(window.start.format(QUIET_TIME_FORMAT).to_string()),
                Some(window.end.format(QUIET_TIME_FORMAT).to_string()),
            ),
            None => (None, None),
        };
        sqlx::query(
            "INSERT INTO notification_preferences \
             (user_id, kind, enabled, channels, minimum_priority, quiet_start, quiet_end, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(user_id, kind) DO UPDATE SET \
               enabled = excluded.enabled, channels = excluded.channels, \
               minimum_priority = excluded.minimum_priority, quiet_start = excluded.quiet_start, \
               quiet_end = excluded.quiet_end, updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(preference.kind.as_str())
        .bind(preference.enabled)
        .bind(preference.channels.bits())
        .bind(preference.minimum_priority.as_str())
        .bind(quiet_start)
        .bind(quiet_end)
        .bind(to_rfc3339(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum NotificationRepoError {
    #[error("recipient does not exist")]
    UnknownRecipient,
    #[error("invalid quiet hours value {0}")]
    InvalidQuietHours(String),
    #[error(transparent)]
    Corrupt(#[from] NotificationError),
    #[error("metadata is not valid json: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
