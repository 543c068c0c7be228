use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;

use crate::{is_unique_violation, to_rfc3339};

/// Repository for single-use verification tokens. Only SHA-256 hashes are stored.
#[derive(Clone)]
pub struct VerificationTokenRepository {
    pool: SqlitePool,
}

#[derive(Clone)]
pub struct NewVerificationToken<'a> {
    pub token_hash: &'a str,
    pub email: &'a str,
    pub purpose: &'a str,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct VerificationTokenRecord {
    pub token_hash: String,
    pub email: String,
    pub purpose: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

/// Result of redeeming a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Consumed,
    Missing,
    /// The token had expired; it has been deleted.
    Expired,
    AlreadyUsed,
    /// Email or purpose did not match the stored token.
    Mismatch,
}

impl ConsumeOutcome {
    pub fn is_consumed(self) -> bool {
        matches!(self, Self::Consumed)
    }
}

impl VerificationTokenRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, token: &NewVerificationToken<'_>) -> Result<(), TokenRepoError> {
        let result = sqlx::query(
            "INSERT INTO verification_tokens (token_hash, email, purpose, created_at, expires_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(token.token_hash)
        .bind(token.email)
        .bind(token.purpose)
        .bind(to_rfc3339(token.created_at))
        .bind(to_rfc3339(token.expires_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(TokenRepoError::Collision),
            Err(err) => Err(TokenRepoError::Database(err)),
        }
    }

    pub async fn find(
        &self,
        token_hash: &str,
    ) -> Result<Option<VerificationTokenRecord>, TokenRepoError> {
        let record = sqlx::query_as::<_, VerificationTokenRecord>(
            "SELECT token_hash, email, purpose, created_at, expires_at, used_at \
             FROM verification_tokens WHERE token_hash = ?",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Removes a token. Returns `true` when a row was deleted.
    pub async fn delete(&self, token_hash: &str) -> Result<bool, TokenRepoError> {
        let done = sqlx::query("DELETE FROM verification_tokens WHERE token_hash = ?")
            .bind(token_hash)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Drops outstanding tokens so only the newest one issued for an address is valid.
    pub async fn delete_for_email(&self, email: &str, purpose: &str) -> Result<u64, TokenRepoError> {
        let done = sqlx::query(
            "DELETE FROM verification_tokens WHERE email = ? COLLATE NOCASE AND purpose = ? AND used_at IS NULL",
        )
        .bind(email)
        .bind(purpose)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }

    /// Marks the token used if it is live and matches. The conditional update makes
    /// concurrent redemptions of the same token succeed at most once.
    pub async fn consume(
        &self,
        token_hash: &str,
        email: &str,
        purpose: &str,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, TokenRepoError> {
        let stamp = to_rfc3339(now);
        let updated = sqlx::query(
            "UPDATE verification_tokens SET used_at = ? \
             WHERE token_hash = ? AND used_at IS NULL AND expires_at > ? \
               AND email = ? COLLATE NOCASE AND purpose = ?",
        )
        .bind(&stamp)
        .bind(token_hash)
        .bind(&stamp)
        .bind(email)
        .bind(purpose)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 1 {
            return Ok(ConsumeOutcome::Consumed);
        }

        let Some(record) = self.find(token_hash).await? else {
            return Ok(ConsumeOutcome::Missing);
        };
        if record.used_at.is_some() {
            return Ok(ConsumeOutcome::AlreadyUsed);
        }
        if record.expires_at <= now {
            self.delete(token_hash).await?;
            return Ok(ConsumeOutcome::Expired);
        }
        Ok(ConsumeOutcome::Mismatch)
    }

    /// Deletes up to `limit` expired or used tokens.
    pub async fn delete_expired_batch(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, sqlx::Error> {
        let done = sqlx::query(
            "DELETE FROM verification_tokens WHERE token_hash IN ( \
                SELECT token_hash FROM verification_tokens \
                 WHERE expires_at <= ? OR used_at IS NOT NULL \
                 LIMIT ?)",
        )
        .bind(to_rfc3339(now))
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }
}

#[derive(Debug, Error)]
pub enum TokenRepoError {
    #[error("token hash already exists")]
    Collision,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
