use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, StatusCode},
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use metrics::counter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

use stockflow_core::{identity::User, permissions::PermissionSet};

use crate::audit::{AuditEvent, AuditKind};
use crate::problem::ProblemResponse;
use crate::router::AppState;

pub const TOKEN_AUDIENCE: &str = "stockflow-api";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    pub role: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Issues and checks HS256 access tokens. Expiry is evaluated against the
/// caller-supplied clock rather than the system time.
#[derive(Clone)]
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl TokenService {
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        validation.validate_exp = false;
        validation.validate_nbf = false;
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            ttl,
        }
    }

    pub fn issue(&self, user: &User, now: DateTime<Utc>) -> Result<IssuedToken, TokenError> {
        let expires_at = now + self.ttl;
        let claims = Claims {
            sub: user.id.clone(),
            email: user.email.clone(),
            role: user.role.clone(),
            aud: TOKEN_AUDIENCE.to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|err| TokenError::Encode(err.to_string()))?;
        Ok(IssuedToken { token, expires_at })
    }

    pub fn validate(&self, token: &str, now: DateTime<Utc>) -> Result<Claims, TokenError> {
        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|err| TokenError::Invalid(err.to_string()))?
            .claims;
        if claims.aud != TOKEN_AUDIENCE {
            return Err(TokenError::Invalid("audience_mismatch".to_string()));
        }
        if now.timestamp() >= claims.exp {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }
}

impl Claims {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.exp, 0).single()
    }
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token: {0}")]
    Invalid(String),
    #[error("token expired")]
    Expired,
    #[error("failed to encode token: {0}")]
    Encode(String),
}

/// The caller behind a valid bearer token, with the permissions of its role.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user: User,
    pub permissions: PermissionSet,
}

impl AuthenticatedUser {
    pub fn id(&self) -> &str {
        &self.user.id
    }

    /// 403 problem unless the role grants `permission`.
    pub fn require(&self, permission: &'static str) -> Result<(), ProblemResponse> {
        self.permissions.require(permission).map_err(|denied| {
            warn!(stage = "auth", user_id = %self.user.id, permission = denied.0, "permission denied");
            ProblemResponse::forbidden(format!("missing permission {}", denied.0))
        })
    }
}

fn unauthorized(detail: &str) -> ProblemResponse {
    counter!("http_auth_failures_total").increment(1);
    ProblemResponse::new(StatusCode::UNAUTHORIZED, "unauthorized", detail.to_string())
}

/// Resolves a raw access token to an active user and its permissions.
pub async fn authenticate(state: &AppState, token: &str) -> Result<AuthenticatedUser, ProblemResponse> {
    let claims = state
        .tokens()
        .validate(token, state.now())
        .map_err(|_| unauthorized("invalid or expired token"))?;

    let record = state
        .storage()
        .users()
        .find_by_id(&claims.sub)
        .await
        .map_err(|err| {
            error!(stage = "auth", error = %err, "failed to load user for token");
            ProblemResponse::internal()
        })?
        .ok_or_else(|| unauthorized("invalid or expired token"))?;

    if !record.user.is_active {
        state.audit().publish(
            AuditEvent::new(AuditKind::Access, "inactive_user_rejected", state.now())
                .user(record.user.id.clone()),
        );
        return Err(unauthorized("account is disabled"));
    }

    let permissions = state
        .storage()
        .roles()
        .permissions_for(&record.user.role)
        .await
        .map_err(|err| {
            error!(stage = "auth", error = %err, "failed to load role permissions");
            ProblemResponse::internal()
        })?;

    Ok(AuthenticatedUser {
        user: record.user,
        permissions: PermissionSet::new(permissions),
    })
}

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = ProblemResponse;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| {
                value
                    .strip_prefix("Bearer ")
                    .or_else(|| value.strip_prefix("bearer "))
            })
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| unauthorized("missing bearer token"))?;

        authenticate(state, token).await
    }
}
