use std::{fmt, str::FromStr};

use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::product::{Product, StockLevel};
use crate::role_upgrade::{RequestStatus, RoleUpgradeRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    System,
    StockAlert,
    Invoice,
    Payment,
    Account,
    Security,
    Subscription,
    Warning,
    Error,
}

impl NotificationKind {
    pub const ALL: [NotificationKind; 9] = [
        Self::System,
        Self::StockAlert,
        Self::Invoice,
        Self::Payment,
        Self::Account,
        Self::Security,
        Self::Subscription,
        Self::Warning,
        Self::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::StockAlert => "stock_alert",
            Self::Invoice => "invoice",
            Self::Payment => "payment",
            Self::Account => "account",
            Self::Security => "security",
            Self::Subscription => "subscription",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl FromStr for NotificationKind {
    type Err = NotificationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| NotificationError::UnknownKind(value.to_string()))
    }
}

/// Delivery urgency, ordered from `Low` to `Emergency`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
    Emergency,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
            Self::Emergency => "emergency",
        }
    }
}

impl FromStr for Priority {
    type Err = NotificationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            "emergency" => Ok(Self::Emergency),
            other => Err(NotificationError::UnknownPriority(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    InApp,
    Email,
}

impl Channel {
    fn bit(self) -> u8 {
        match self {
            Self::InApp => 0b01,
            Self::Email => 0b10,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InApp => "in_app",
            Self::Email => "email",
        }
    }
}

/// Small bit set of delivery channels. Serialises as a list of channel names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<Channel>", into = "Vec<Channel>")]
pub struct ChannelSet(u8);

impl ChannelSet {
    pub const NONE: ChannelSet = ChannelSet(0);

    pub fn of(channels: &[Channel]) -> Self {
        Self(channels.iter().fold(0, |bits, c| bits | c.bit()))
    }

    pub fn from_bits(bits: i64) -> Self {
        Self((bits & 0b11) as u8)
    }

    pub fn bits(self) -> i64 {
        self.0 as i64
    }

    pub fn contains(self, channel: Channel) -> bool {
        self.0 & channel.bit() != 0
    }
}

impl From<Vec<Channel>> for ChannelSet {
    fn from(value: Vec<Channel>) -> Self {
        Self::of(&value)
    }
}

impl From<ChannelSet> for Vec<Channel> {
    fn from(value: ChannelSet) -> Self {
        [Channel::InApp, Channel::Email]
            .into_iter()
            .filter(|c| value.contains(*c))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Delivered,
    Read,
    Expired,
}

impl NotificationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Expired => "expired",
        }
    }
}

impl FromStr for NotificationStatus {
    type Err = NotificationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "delivered" => Ok(Self::Delivered),
            "read" => Ok(Self::Read),
            "expired" => Ok(Self::Expired),
            other => Err(NotificationError::UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub seq: i64,
    pub recipient_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
    pub priority: Priority,
    pub status: NotificationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_entity_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_entity_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_url: Option<String>,
    #[serde(skip_serializing_if = "Value::is_null", default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub is_dismissible: bool,
}

impl Notification {
    pub fn is_read(&self) -> bool {
        self.read_at.is_some()
    }
}

/// Content of a notification before recipients are resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationDraft {
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
    pub priority: Priority,
    pub sender_id: Option<String>,
    pub related_entity_type: Option<String>,
    pub related_entity_id: Option<String>,
    pub action_url: Option<String>,
    pub metadata: Value,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_dismissible: bool,
}

impl NotificationDraft {
    pub fn new(
        kind: NotificationKind,
        priority: Priority,
        title: &str,
        message: &str,
    ) -> Result<Self, NotificationError> {
        let title = title.trim();
        let message = message.trim();
        if title.is_empty() || title.chars().count() > 200 {
            return Err(NotificationError::InvalidTitle);
        }
        if message.is_empty() || message.chars().count() > 2000 {
            return Err(NotificationError::InvalidMessage);
        }
        Ok(Self {
            title: title.to_string(),
            message: message.to_string(),
            kind,
            priority,
            sender_id: None,
            related_entity_type: None,
            related_entity_id: None,
            action_url: None,
            metadata: Value::Null,
            expires_at: None,
            is_dismissible: true,
        })
    }

    pub fn related(mut self, entity_type: &str, entity_id: &str) -> Self {
        self.related_entity_type = Some(entity_type.to_string());
        self.related_entity_id = Some(entity_id.to_string());
        self
    }

    pub fn with_action_url(mut self, url: impl Into<String>) -> Self {
        self.action_url = Some(url.into());
        self
    }

    pub fn with_sender(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = Some(sender_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Builds the alert sent when a product drops to a worse stock level.
pub fn stock_alert(product: &Product, level: StockLevel) -> Option<NotificationDraft> {
    let (priority, title, message) = match level {
        StockLevel::OutOfStock => (
            Priority::Critical,
            format!("Out of stock: {}", product.name),
            format!("{} is out of stock.", product.name),
        ),
        StockLevel::Low => (
            Priority::High,
            format!("Low stock: {}", product.name),
            format!(
                "{} is running low ({} left).",
                product.name, product.number_in_stock
            ),
        ),
        StockLevel::Healthy => return None,
    };
    NotificationDraft::new(NotificationKind::StockAlert, priority, &title, &message)
        .ok()
        .map(|draft| {
            draft
                .related("product", &product.id)
                .with_action_url(format!("/products/{}", product.id))
                .with_metadata(serde_json::json!({
                    "product_id": product.id,
                    "stock": product.number_in_stock,
                    "level": level.as_str(),
                }))
        })
}

/// Subscription lifecycle changes the account owner is told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEvent {
    Started { trial: bool },
    Renewed,
    PaymentFailed { attempts: i64 },
    Cancelled,
    Expired,
}

pub fn subscription_event(
    event: SubscriptionEvent,
    plan_name: &str,
    subscription_id: &str,
) -> NotificationDraft {
    let (kind, priority, title, message) = match event {
        SubscriptionEvent::Started { trial: true } => (
            NotificationKind::Subscription,
            Priority::Normal,
            format!("Your {plan_name} trial has started"),
            format!("Your {plan_name} trial is active. Billing starts when the trial ends."),
        ),
        SubscriptionEvent::Started { trial: false } => (
            NotificationKind::Subscription,
            Priority::Normal,
            format!("Welcome to {plan_name}"),
            format!("Your {plan_name} subscription is now active."),
        ),
        SubscriptionEvent::Renewed => (
            NotificationKind::Payment,
            Priority::Low,
            "Payment received".to_string(),
            format!("Your {plan_name} subscription has been renewed."),
        ),
        SubscriptionEvent::PaymentFailed { attempts } => (
            NotificationKind::Payment,
            Priority::High,
            "Payment failed".to_string(),
            format!(
                "We could not collect the payment for your {plan_name} subscription \
                 (attempt {attempts}). Please update your payment method."
            ),
        ),
        SubscriptionEvent::Cancelled => (
            NotificationKind::Subscription,
            Priority::Normal,
            "Subscription cancelled".to_string(),
            format!("Your {plan_name} subscription has been cancelled."),
        ),
        SubscriptionEvent::Expired => (
            NotificationKind::Subscription,
            Priority::High,
            "Subscription expired".to_string(),
            format!("Your {plan_name} subscription expired after the grace period."),
        ),
    };
    NotificationDraft {
        title,
        message,
        kind,
        priority,
        sender_id: None,
        related_entity_type: Some("subscription".to_string()),
        related_entity_id: Some(subscription_id.to_string()),
        action_url: Some("/billing".to_string()),
        metadata: serde_json::json!({ "subscription_id": subscription_id }),
        expires_at: None,
        is_dismissible: true,
    }
}

/// Tells the requester how a role upgrade review ended. `None` while pending.
pub fn role_request_reviewed(request: &RoleUpgradeRequest) -> Option<NotificationDraft> {
    let role = request.requested_role.display_name();
    let (title, mut message) = match request.status {
        RequestStatus::Approved => (
            "Role upgrade approved".to_string(),
            format!("Your request to become {role} was approved."),
        ),
        RequestStatus::Rejected => (
            "Role upgrade rejected".to_string(),
            format!("Your request to become {role} was rejected."),
        ),
        RequestStatus::Pending | RequestStatus::Cancelled => return None,
    };
    if let Some(comments) = request.review_comments.as_deref() {
        message.push_str(&format!(" Reviewer comments: {comments}"));
    }
    let mut draft = NotificationDraft::new(NotificationKind::Account, Priority::Normal, &title, &message)
        .ok()?
        .related("role_upgrade_request", &request.id)
        .with_action_url("/profile");
    if let Some(reviewer) = request.reviewed_by.as_deref() {
        draft = draft.with_sender(reviewer);
    }
    Some(draft)
}

/// Daily window during which non-urgent notifications are held back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietHours {
    /// `true` when `time` falls inside the window. Windows may wrap past midnight.
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPreference {
    pub kind: NotificationKind,
    pub enabled: bool,
    pub channels: ChannelSet,
    pub minimum_priority: Priority,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub quiet_hours: Option<QuietHours>,
}

impl NotificationPreference {
    pub fn default_for(kind: NotificationKind) -> Self {
        let channels = match kind {
            NotificationKind::Security | NotificationKind::Payment => {
                ChannelSet::of(&[Channel::InApp, Channel::Email])
            }
            _ => ChannelSet::of(&[Channel::InApp]),
        };
        Self {
            kind,
            enabled: true,
            channels,
            minimum_priority: Priority::Low,
            quiet_hours: None,
        }
    }

    /// Decides delivery for one channel. Quiet hours are evaluated in `timezone`.
    pub fn should_receive(
        &self,
        priority: Priority,
        channel: Channel,
        now: DateTime<Utc>,
        timezone: Tz,
    ) -> bool {
        if !self.enabled || !self.channels.contains(channel) {
            return false;
        }
        if priority == Priority::Emergency {
            return true;
        }
        if priority < self.minimum_priority {
            return false;
        }
        match self.quiet_hours {
            Some(window) if priority < Priority::Critical => {
                let local = now.with_timezone(&timezone).time();
                !window.contains(local)
            }
            _ => true,
        }
    }
}

/// Picks the stored preference for `kind`, falling back to the default.
pub fn resolve_preference(
    stored: &[NotificationPreference],
    kind: NotificationKind,
) -> NotificationPreference {
    stored
        .iter()
        .find(|pref| pref.kind == kind)
        .cloned()
        .unwrap_or_else(|| NotificationPreference::default_for(kind))
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotificationError {
    #[error("unknown notification kind {0}")]
    UnknownKind(String),
    #[error("unknown priority {0}")]
    UnknownPriority(String),
    #[error("unknown notification status {0}")]
    UnknownStatus(String),
    #[error("title must be 1-200 characters")]
    InvalidTitle,
    #[error("message must be 1-2000 characters")]
    InvalidMessage,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn quiet(start: (u32, u32), end: (u32, u32)) -> Option<QuietHours> {
        Some(QuietHours {
            start: NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap(),
            end: NaiveTime::from_hms_opt(end.0, end.1, 0).unwrap(),
        })
    }

    #[test]
    fn failed_payment_notice_is_high_priority_payment() {
        let draft = subscription_event(
            SubscriptionEvent::PaymentFailed { attempts: 2 },
            "Pro",
            "sub-1",
        );
        assert_eq!(draft.kind, NotificationKind::Payment);
        assert_eq!(draft.priority, Priority::High);
        assert!(draft.message.contains("attempt 2"));
        assert_eq!(draft.related_entity_id.as_deref(), Some("sub-1"));

        let started = subscription_event(SubscriptionEvent::Started { trial: true }, "Pro", "sub-1");
        assert_eq!(started.kind, NotificationKind::Subscription);
        assert!(started.title.contains("trial"));
    }

    #[test]
    fn review_outcome_reaches_requester() {
        let now = Utc::now();
        let mut request = RoleUpgradeRequest::new(
            "r-1".into(),
            "u-1".into(),
            crate::identity::SystemRole::User,
            crate::identity::SystemRole::Manager,
            "I run the warehouse",
            None,
            now,
        )
        .expect("request");
        assert!(role_request_reviewed(&request).is_none());

        request
            .reject("a-1", Some("Not yet".into()), now)
            .expect("reject");
        let draft = role_request_reviewed(&request).expect("draft");
        assert_eq!(draft.kind, NotificationKind::Account);
        assert_eq!(draft.sender_id.as_deref(), Some("a-1"));
        assert!(draft.message.contains("Not yet"));
    }

    #[test]
    fn priorities_are_ordered() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Critical < Priority::Emergency);
        assert_eq!("high".parse::<Priority>(), Ok(Priority::High));
    }

    #[test]
    fn channel_set_roundtrips_through_bits() {
        let set = ChannelSet::of(&[Channel::Email]);
        assert!(set.contains(Channel::Email));
        assert!(!set.contains(Channel::InApp));
        assert_eq!(ChannelSet::from_bits(set.bits()), set);
        let json = serde_json::to_string(&ChannelSet::of(&[Channel::InApp, Channel::Email]))
            .expect("serialize");
        assert_eq!(json, r#"["in_app","email"]"#);
    }

    #[test]
    fn quiet_hours_span_midnight() {
        let window = quiet((22, 0), (7, 0)).unwrap();
        assert!(window.contains(NaiveTime::from_hms_opt(23, 30, 0).unwrap()));
        assert!(window.contains(NaiveTime::from_hms_opt(6, 59, 0).unwrap()));
        assert!(!window.contains(NaiveTime::from_hms_opt(7, 0, 0).unwrap()));
        assert!(!window.contains(NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
    }

    #[test]
    fn preference_rules() {
        let pref = NotificationPreference {
            kind: NotificationKind::StockAlert,
            enabled: true,
            channels: ChannelSet::of(&[Channel::InApp]),
            minimum_priority: Priority::Normal,
            quiet_hours: quiet((22, 0), (7, 0)),
        };
        let noon = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let night = Utc.with_ymd_and_hms(2024, 3, 1, 23, 0, 0).unwrap();

        assert!(pref.should_receive(Priority::Normal, Channel::InApp, noon, chrono_tz::UTC));
        assert!(!pref.should_receive(Priority::Low, Channel::InApp, noon, chrono_tz::UTC));
        assert!(!pref.should_receive(Priority::High, Channel::Email, noon, chrono_tz::UTC));
        assert!(!pref.should_receive(Priority::High, Channel::InApp, night, chrono_tz::UTC));
        assert!(pref.should_receive(Priority::Critical, Channel::InApp, night, chrono_tz::UTC));
        assert!(pref.should_receive(Priority::Emergency, Channel::InApp, night, chrono_tz::UTC));

        let disabled = NotificationPreference {
            enabled: false,
            ..pref
        };
        assert!(!disabled.should_receive(
            Priority::Emergency,
            Channel::InApp,
            noon,
            chrono_tz::UTC
        ));
    }

    #[test]
    fn quiet_hours_use_recipient_timezone() {
        let pref = NotificationPreference {
            quiet_hours: quiet((22, 0), (7, 0)),
            ..NotificationPreference::default_for(NotificationKind::System)
        };
        // Tokyo is UTC+9: 12:00 UTC is 21:00 local, 14:00 UTC is 23:00 local.
        let at_noon = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 3, 1, 14, 0, 0).unwrap();
        let tokyo: Tz = "Asia/Tokyo".parse().unwrap();
        assert!(pref.should_receive(Priority::Normal, Channel::InApp, at_noon, tokyo));
        assert!(!pref.should_receive(Priority::Normal, Channel::InApp, later, tokyo));
    }

    #[test]
    fn defaults_send_security_mail() {
        let security = NotificationPreference::default_for(NotificationKind::Security);
        assert!(security.channels.contains(Channel::Email));
        let stock = resolve_preference(&[], NotificationKind::StockAlert);
        assert!(!stock.channels.contains(Channel::Email));
    }

    #[test]
    fn stock_alert_priorities() {
        let now = Utc::now();
        let product = Product {
            id: "p-1".into(),
            name: "Bolt".into(),
            cost_per_item_cents: 10,
            number_in_stock: 0,
            is_active: true,
            image_url: None,
            created_at: now,
            updated_at: now,
        };
        let alert = stock_alert(&product, StockLevel::OutOfStock).expect("alert");
        assert_eq!(alert.priority, Priority::Critical);
        assert_eq!(alert.related_entity_id.as_deref(), Some("p-1"));
        assert!(stock_alert(&product, StockLevel::Healthy).is_none());
    }
}
