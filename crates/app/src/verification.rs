use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use stockflow_core::identity::normalize_email;
use stockflow_storage::{ConsumeOutcome, Database, NewVerificationToken, TokenRepoError};

const TOKEN_BYTES: usize = 32;
const MAX_GENERATE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPurpose {
    EmailVerification,
    PasswordReset,
}

impl TokenPurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EmailVerification => "email_verification",
            Self::PasswordReset => "password_reset",
        }
    }
}

/// Issues and redeems single-use email tokens. Only SHA-256 digests are stored.
#[derive(Clone)]
pub struct VerificationService {
    database: Database,
    ttl: Duration,
}

impl VerificationService {
    pub fn new(database: Database, ttl: Duration) -> Self {
        Self { database, ttl }
    }

    /// Creates a token for `email` and returns the raw value to embed in a link.
    /// Earlier unused tokens for the same email and purpose are discarded.
    pub async fn generate(
        &self,
        email: &str,
        purpose: TokenPurpose,
        now: DateTime<Utc>,
    ) -> Result<String, VerificationError> {
        let email = normalize_email(email);
        let repo = self.database.verification_tokens();
        repo.delete_for_email(&email, purpose.as_str()).await?;

        for _ in 0..MAX_GENERATE_ATTEMPTS {
            let token = random_token();
            let token_hash = hash_token(&token);
            let record = NewVerificationToken {
                token_hash: &token_hash,
                email: &email,
                purpose: purpose.as_str(),
                created_at: now,
                expires_at: now + self.ttl,
            };
            match repo.insert(&record).await {
                Ok(()) => {
                    info!(stage = "auth", purpose = purpose.as_str(), "verification token issued");
                    return Ok(token);
                }
                Err(TokenRepoError::Collision) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(VerificationError::Exhausted)
    }

    /// Redeems `token`. Succeeds once, and only for the matching email and purpose.
    pub async fn validate(
        &self,
        token: &str,
        email: &str,
        purpose: TokenPurpose,
        now: DateTime<Utc>,
    ) -> Result<bool, VerificationError> {
        if token.trim().is_empty() {
            return Ok(false);
        }
        let outcome = self
            .database
            .verification_tokens()
            .consume(
                &hash_token(token.trim()),
                &normalize_email(email),
                purpose.as_str(),
                now,
            )
            .await?;
        if !outcome.is_consumed() {
            debug!(stage = "auth", purpose = purpose.as_str(), outcome = ?outcome, "token rejected");
        }
        Ok(outcome == ConsumeOutcome::Consumed)
    }

    /// Email a live token was issued for. Expired tokens resolve to `None`.
    pub async fn email_for_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, VerificationError> {
        let record = self
            .database
            .verification_tokens()
            .find(&hash_token(token.trim()))
            .await?;
        Ok(record
            .filter(|record| record.expires_at > now)
            .map(|record| record.email))
    }

    pub async fn invalidate(&self, token: &str) -> Result<bool, VerificationError> {
        Ok(self
            .database
            .verification_tokens()
            .delete(&hash_token(token.trim()))
            .await?)
    }

    /// One cleanup batch of expired or used tokens.
    pub async fn cleanup_expired_batch(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, sqlx::Error> {
        self.database
            .verification_tokens()
            .delete_expired_batch(now, limit)
            .await
    }
}

fn random_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub(crate) fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("token storage failed: {0}")]
    Storage(#[from] TokenRepoError),
    #[error("could not allocate a unique token")]
    Exhausted,
}
