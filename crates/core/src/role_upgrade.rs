use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::SystemRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }
}

impl FromStr for RequestStatus {
    type Err = UpgradeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(UpgradeError::UnknownStatus(other.to_string())),
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user's request to move to a more privileged built-in role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleUpgradeRequest {
    pub id: String,
    pub user_id: String,
    pub current_role: SystemRole,
    pub requested_role: SystemRole,
    pub justification: String,
    pub status: RequestStatus,
    pub priority: u8,
    pub requested_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewed_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_comments: Option<String>,
}

impl RoleUpgradeRequest {
    pub fn new(
        id: String,
        user_id: String,
        current_role: SystemRole,
        requested_role: SystemRole,
        justification: &str,
        priority: Option<u8>,
        now: DateTime<Utc>,
    ) -> Result<Self, UpgradeError> {
        let justification = justification.trim();
        if justification.is_empty() {
            return Err(UpgradeError::MissingJustification);
        }
        if requested_role <= current_role {
            return Err(UpgradeError::NotAnUpgrade {
                current: current_role,
                requested: requested_role,
            });
        }
        Ok(Self {
            id,
            user_id,
            current_role,
            requested_role,
            justification: justification.to_string(),
            status: RequestStatus::Pending,
            priority: clamp_priority(priority.unwrap_or(1)),
            requested_at: now,
            reviewed_by: None,
            reviewed_at: None,
            review_comments: None,
        })
    }

    pub fn is_pending(&self) -> bool {
        self.status == RequestStatus::Pending
    }

    /// Manager and admin elevations may only be granted by an admin.
    pub fn can_be_reviewed_by(&self, reviewer: SystemRole) -> bool {
        match self.requested_role {
            SystemRole::Manager | SystemRole::Admin => reviewer == SystemRole::Admin,
            SystemRole::User => reviewer >= SystemRole::Manager,
        }
    }

    pub fn approve(
        &mut self,
        reviewer_id: &str,
        comments: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), UpgradeError> {
        self.ensure_pending()?;
        self.close(RequestStatus::Approved, reviewer_id, comments, now);
        Ok(())
    }

    pub fn reject(
        &mut self,
        reviewer_id: &str,
        comments: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), UpgradeError> {
        self.ensure_pending()?;
        let comments = comments
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or(UpgradeError::MissingComments)?;
        self.close(RequestStatus::Rejected, reviewer_id, Some(comments), now);
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), UpgradeError> {
        self.ensure_pending()?;
        self.status = RequestStatus::Cancelled;
        Ok(())
    }

    pub fn update_priority(&mut self, priority: u8) -> Result<(), UpgradeError> {
        self.ensure_pending()?;
        self.priority = clamp_priority(priority);
        Ok(())
    }

    fn ensure_pending(&self) -> Result<(), UpgradeError> {
        if self.is_pending() {
            Ok(())
        } else {
            Err(UpgradeError::NotPending(self.status))
        }
    }

    fn close(
        &mut self,
        status: RequestStatus,
        reviewer_id: &str,
        comments: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.status = status;
        self.reviewed_by = Some(reviewer_id.to_string());
        self.reviewed_at = Some(now);
        self.review_comments = comments
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
    }
}

fn clamp_priority(value: u8) -> u8 {
    value.clamp(1, 5)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpgradeError {
    #[error("justification is required")]
    MissingJustification,
    #[error("requested role {requested} is not above current role {current}")]
    NotAnUpgrade {
        current: SystemRole,
        requested: SystemRole,
    },
    #[error("request is {0}, only pending requests can change")]
    NotPending(RequestStatus),
    #[error("comments are required when rejecting a request")]
    MissingComments,
    #[error("unknown request status {0}")]
    UnknownStatus(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(requested: SystemRole) -> RoleUpgradeRequest {
        RoleUpgradeRequest::new(
            "req-1".into(),
            "user-1".into(),
            SystemRole::User,
            requested,
            "  I run the warehouse now ",
            Some(9),
            Utc::now(),
        )
        .expect("valid request")
    }

    #[test]
    fn creation_rules() {
        let req = request(SystemRole::Manager);
        assert_eq!(req.justification, "I run the warehouse now");
        assert_eq!(req.priority, 5);
        assert!(req.is_pending());

        let err = RoleUpgradeRequest::new(
            "r".into(),
            "u".into(),
            SystemRole::Manager,
            SystemRole::User,
            "please",
            None,
            Utc::now(),
        )
        .expect_err("downgrade");
        assert!(matches!(err, UpgradeError::NotAnUpgrade { .. }));

        let err = RoleUpgradeRequest::new(
            "r".into(),
            "u".into(),
            SystemRole::User,
            SystemRole::Admin,
            "   ",
            None,
            Utc::now(),
        )
        .expect_err("blank");
        assert_eq!(err, UpgradeError::MissingJustification);
    }

    #[test]
    fn only_admins_review_privileged_requests() {
        let req = request(SystemRole::Manager);
        assert!(req.can_be_reviewed_by(SystemRole::Admin));
        assert!(!req.can_be_reviewed_by(SystemRole::Manager));
    }

    #[test]
    fn reject_requires_comments() {
        let mut req = request(SystemRole::Admin);
        assert_eq!(
            req.reject("admin-1", Some("  ".into()), Utc::now()),
            Err(UpgradeError::MissingComments)
        );
        req.reject("admin-1", Some("not yet".into()), Utc::now())
            .expect("reject");
        assert_eq!(req.status, RequestStatus::Rejected);
        assert_eq!(req.review_comments.as_deref(), Some("not yet"));
    }

    #[test]
    fn closed_requests_are_frozen() {
        let mut req = request(SystemRole::Manager);
        req.approve("admin-1", None, Utc::now()).expect("approve");
        assert_eq!(req.reviewed_by.as_deref(), Some("admin-1"));
        assert_eq!(
            req.cancel(),
            Err(UpgradeError::NotPending(RequestStatus::Approved))
        );
        assert!(req.update_priority(2).is_err());
        assert!(req.approve("admin-2", None, Utc::now()).is_err());
    }
}
