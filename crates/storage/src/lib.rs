mod billing;
mod invoices;
mod notifications;
mod products;
mod role_requests;
mod roles;
mod tokens;
mod users;
mod webhook_events;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{migrate::MigrateError, sqlite::SqlitePoolOptions, Row, SqlitePool};
use thiserror::Error;

pub use billing::{PlanError, PlanRepository, SubscriptionError, SubscriptionRepository};
pub use invoices::{InvoiceRepoError, InvoiceRepository};
pub use notifications::{DismissOutcome, NotificationRepoError, NotificationRepository};
pub use products::{ProductRepoError, ProductRepository};
pub use role_requests::{RoleRequestError, RoleRequestRepository};
pub use roles::{RoleRepoError, RoleRepository};
pub use tokens::{
    ConsumeOutcome, NewVerificationToken, TokenRepoError, VerificationTokenRecord,
    VerificationTokenRepository,
};
pub use users::{NewUser, ProfileUpdate, UserError, UserRecord, UserRepository};
pub use webhook_events::{
    NewWebhookEvent, WebhookEventError, WebhookEventRepository, WebhookInsertOutcome,
};

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Runs `PRAGMA wal_checkpoint(TRUNCATE)` and reports the frame counters.
    pub async fn wal_checkpoint_truncate(&self) -> Result<CheckpointStats, sqlx::Error> {
        let row = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE);")
            .fetch_one(&self.pool)
            .await?;
        Ok(CheckpointStats {
            busy_frames: row.try_get::<i64, _>(0)?,
            log_frames: row.try_get::<i64, _>(1)?,
            checkpointed_frames: row.try_get::<i64, _>(2)?,
        })
    }

    pub fn users(&self) -> UserRepository {
        UserRepository::new(self.pool.clone())
    }

    pub fn roles(&self) -> RoleRepository {
        RoleRepository::new(self.pool.clone())
    }

    pub fn role_requests(&self) -> RoleRequestRepository {
        RoleRequestRepository::new(self.pool.clone())
    }

    pub fn products(&self) -> ProductRepository {
        ProductRepository::new(self.pool.clone())
    }

    /// Invoices with their line items.
    pub fn invoices(&self) -> InvoiceRepository {
        InvoiceRepository::new(self.pool.clone())
    }

    pub fn plans(&self) -> PlanRepository {
        PlanRepository::new(self.pool.clone())
    }

    pub fn subscriptions(&self) -> SubscriptionRepository {
        SubscriptionRepository::new(self.pool.clone())
    }

    pub fn notifications(&self) -> NotificationRepository {
        NotificationRepository::new(self.pool.clone())
    }

    /// Single-use tokens for email verification and password resets.
    pub fn verification_tokens(&self) -> VerificationTokenRepository {
        VerificationTokenRepository::new(self.pool.clone())
    }

    /// Stripe event ledger used for webhook idempotency.
    pub fn webhook_events(&self) -> WebhookEventRepository {
        WebhookEventRepository::new(self.pool.clone())
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

const PRAGMAS: &[&str] = &[
    "PRAGMA foreign_keys = ON;",
    "PRAGMA journal_mode = WAL;",
    "PRAGMA synchronous = NORMAL;",
    "PRAGMA busy_timeout = 5000;",
];

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    for pragma in PRAGMAS {
        // journal_mode returns a row; fetch_all accepts both shapes.
        sqlx::query(pragma)
            .fetch_all(pool)
            .await
            .map_err(StorageError::Pragma)?;
    }
    Ok(())
}

/// Result of a WAL checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointStats {
    pub busy_frames: i64,
    pub log_frames: i64,
    pub checkpointed_frames: i64,
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub(crate) fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn opt_rfc3339(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(to_rfc3339)
}

/// SQLite extended codes 2067 (UNIQUE) and 1555 (PRIMARY KEY).
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            matches!(db_err.code().as_deref(), Some("2067") | Some("1555"))
        }
        _ => false,
    }
}

/// SQLite extended code 787 (FOREIGN KEY).
pub(crate) fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("787"),
        _ => false,
    }
}

/// Escapes `%` and `_` so user input is matched literally by `LIKE ... ESCAPE '\'`.
pub(crate) fn like_pattern(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len() + 2);
    escaped.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Database;
    use stockflow_core::roles::RoleDefinition;

    /// File-backed database in a temporary directory, migrated and seeded with system roles.
    pub async fn database() -> (Database, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
        let db = Database::connect(&url).await.expect("connect");
        db.run_migrations().await.expect("migrations");
        db.roles()
            .ensure_system_roles(&RoleDefinition::system_defaults(), chrono::Utc::now())
            .await
            .expect("seed roles");
        (db, dir)
    }
}
