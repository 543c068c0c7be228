use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use thiserror::Error;

use stockflow_core::role_upgrade::{RequestStatus, RoleUpgradeRequest};

use crate::{is_unique_violation, opt_rfc3339, to_rfc3339};

const REQUEST_COLUMNS: &str = "id, user_id, current_role, requested_role, justification, status, \
     priority, requested_at, reviewed_by, reviewed_at, review_comments";

/// Repository for role upgrade requests.
#[derive(Clone)]
pub struct RoleRequestRepository {
    pool: SqlitePool,
}

#[derive(Debug, sqlx::FromRow)]
struct RequestRow {
    id: String,
    user_id: String,
    current_role: String,
    requested_role: String,
    justification: String,
    status: String,
    priority: i64,
    requested_at: DateTime<Utc>,
    reviewed_by: Option<String>,
    reviewed_at: Option<DateTime<Utc>>,
    review_comments: Option<String>,
}

impl TryFrom<RequestRow> for RoleUpgradeRequest {
    type Error = RoleRequestError;

    fn try_from(row: RequestRow) -> Result<Self, Self::Error> {
        let corrupt = |field: &str, value: &str| RoleRequestError::Corrupt(format!("{field}={value}"));
        Ok(RoleUpgradeRequest {
            current_role: row
                .current_role
                .parse()
                .map_err(|_| corrupt("current_role", &row.current_role))?,
            requested_role: row
                .requested_role
                .parse()
                .map_err(|_| corrupt("requested_role", &row.requested_role))?,
            status: row
                .status
                .parse()
                .map_err(|_| corrupt("status", &row.status))?,
            priority: u8::try_from(row.priority)
                .map_err(|_| corrupt("priority", &row.priority.to_string()))?,
            id: row.id,
            user_id: row.user_id,
            justification: row.justification,
            requested_at: row.requested_at,
            reviewed_by: row.reviewed_by,
            reviewed_at: row.reviewed_at,
            review_comments: row.review_comments,
        })
    }
}

impl RoleRequestRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, request: &RoleUpgradeRequest) -> Result<(), RoleRequestError> {
        let result = sqlx::query(&format!(
            "INSERT INTO role_upgrade_requests ({REQUEST_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&request.id)
        .bind(&request.user_id)
        .bind(request.current_role.as_str())
        .bind(request.requested_role.as_str())
        .bind(&request.justification)
        .bind(request.status.as_str())
        .bind(i64::from(request.priority))
        .bind(to_rfc3339(request.requested_at))
        .bind(&request.reviewed_by)
        .bind(opt_rfc3339(request.reviewed_at))
        .bind(&request.review_comments)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(RoleRequestError::PendingExists),
            Err(err) => Err(RoleRequestError::Database(err)),
        }
    }

    pub async fn find(&self, id: &str) -> Result<Option<RoleUpgradeRequest>, RoleRequestError> {
        let row = sqlx::query_as::<_, RequestRow>(&format!(
            "SELECT {REQUEST_COLUMNS} FROM role_upgrade_requests WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(RoleUpgradeRequest::try_from).transpose()
    }

    /// Review queue: highest priority first, then oldest.
    pub async fn list_by_status(
        &self,
        status: RequestStatus,
    ) -> Result<Vec<RoleUpgradeRequest>, RoleRequestError> {
        let rows = sqlx::query_as::<_, RequestRow>(&format!(
            "SELECT {REQUEST_COLUMNS} FROM role_upgrade_requests \
             WHERE status = ? ORDER BY priority DESC, requested_at ASC"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RoleUpgradeRequest::try_from).collect()
    }

    pub async fn list_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<RoleUpgradeRequest>, RoleRequestError> {
        let rows = sqlx::query_as::<_, RequestRow>(&format!(
            "SELECT {REQUEST_COLUMNS} FROM role_upgrade_requests \
             WHERE user_id = ? ORDER BY requested_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RoleUpgradeRequest::try_from).collect()
    }

    /// Persists status, review fields and priority.
    pub async fn update(&self, request: &RoleUpgradeRequest) -> Result<(), RoleRequestError> {
        let mut tx = self.pool.begin().await?;
        write_request(&mut tx, request).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Saves a reviewed request. An approval also moves the requester to the
    /// requested role in the same transaction.
    pub async fn save_review(
        &self,
        request: &RoleUpgradeRequest,
        now: DateTime<Utc>,
    ) -> Result<(), RoleRequestError> {
        let mut tx = self.pool.begin().await?;
        write_request(&mut tx, request).await?;
        if request.status == RequestStatus::Approved {
            let updated = sqlx::query("UPDATE users SET role = ?, updated_at = ? WHERE id = ?")
                .bind(request.requested_role.as_str())
                .bind(to_rfc3339(now))
                .bind(&request.user_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            if updated == 0 {
                return Err(RoleRequestError::NotFound);
            }
        }
        tx.commit().await?;
        Ok(())
    }
}

async fn write_request(
    tx: &mut Transaction<'_, Sqlite>,
    request: &RoleUpgradeRequest,
) -> Result<(), RoleRequestError> {
    let updated = sqlx::query(
        "UPDATE role_upgrade_requests SET status = ?, priority = ?, reviewed_by = ?, \
         reviewed_at = ?, review_comments = ? WHERE id = ?",
    )
    .bind(request.status.as_str())
    .bind(i64::from(request.priority))
    .bind(&request.reviewed_by)
    .bind(opt_rfc3339(request.reviewed_at))
    .bind(&request.review_comments)
    .bind(&request.id)
    .execute(&mut **tx)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(RoleRequestError::NotFound);
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum RoleRequestError {
    #[error("a pending request already exists for this user")]
    PendingExists,
    #[error("request not found")]
    NotFound,
    #[error("stored request is invalid: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
