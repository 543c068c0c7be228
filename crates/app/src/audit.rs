use std::{collections::HashSet, time::Duration};

use axum::response::sse::{Event, KeepAlive};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditKind {
    Auth,
    Access,
    Inventory,
    Invoice,
    Billing,
    Notification,
    Storage,
}

impl AuditKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditKind::Auth => "auth",
            AuditKind::Access => "access",
            AuditKind::Inventory => "inventory",
            AuditKind::Invoice => "invoice",
            AuditKind::Billing => "billing",
            AuditKind::Notification => "notification",
            AuditKind::Storage => "storage",
        }
    }
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct AuditMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AuditMetadata {
    fn is_empty(&self) -> bool {
        self.action.is_none()
            && self.entity_type.is_none()
            && self.entity_id.is_none()
            && self.size_bytes.is_none()
            && self.latency_ms.is_none()
            && self.message.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditPayload {
    pub redacted: bool,
    pub payload: Value,
}

impl Default for AuditPayload {
    fn default() -> Self {
        Self {
            redacted: false,
            payload: Value::Null,
        }
    }
}

impl AuditPayload {
    pub fn redacted() -> Self {
        Self {
            redacted: true,
            payload: Value::Null,
        }
    }

    pub fn of(payload: Value) -> Self {
        Self {
            redacted: false,
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub ts: DateTime<Utc>,
    pub kind: AuditKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "AuditMetadata::is_empty")]
    pub meta: AuditMetadata,
    pub r#in: AuditPayload,
    pub out: AuditPayload,
}

impl AuditEvent {
    /// Event with the given action and empty payloads.
    pub fn new(kind: AuditKind, action: &str, ts: DateTime<Utc>) -> Self {
        Self {
            ts,
            kind,
            actor_id: None,
            user_id: None,
            meta: AuditMetadata {
                action: Some(action.to_string()),
                ..AuditMetadata::default()
            },
            r#in: AuditPayload::default(),
            out: AuditPayload::default(),
        }
    }

    pub fn actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn entity(mut self, entity_type: &str, entity_id: impl Into<String>) -> Self {
        self.meta.entity_type = Some(entity_type.to_string());
        self.meta.entity_id = Some(entity_id.into());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.meta.message = Some(message.into());
        self
    }

    pub fn input(mut self, payload: AuditPayload) -> Self {
        self.r#in = payload;
        self
    }

    pub fn output(mut self, payload: Value) -> Self {
        self.out = AuditPayload::of(payload);
        self
    }

    pub fn into_sse_event(self) -> Result<Event, serde_json::Error> {
        let data = serde_json::to_string(&self)?;
        Ok(Event::default().event(self.kind.as_str()).data(data))
    }
}

/// In-process broadcast of audit events for the admin debug stream.
#[derive(Clone)]
pub struct AuditHub {
    sender: broadcast::Sender<AuditEvent>,
}

impl AuditHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(128);
        Self { sender }
    }

    pub fn publish(&self, event: AuditEvent) {
        // No receivers is the normal case when nobody is tailing the stream.
        if self.sender.send(event).is_err() {
            debug!(stage = "app", "audit event dropped without subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuditEvent> {
        self.sender.subscribe()
    }
}

impl Default for AuditHub {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    kinds: Option<HashSet<AuditKind>>,
}

impl AuditFilter {
    pub fn from_kinds(kinds: Option<HashSet<AuditKind>>) -> Self {
        Self { kinds }
    }

    pub fn matches(&self, event: &AuditEvent) -> bool {
        match &self.kinds {
            Some(kinds) => kinds.contains(&event.kind),
            None => true,
        }
    }
}

pub fn audit_stream(
    hub: AuditHub,
    filter: AuditFilter,
) -> impl Stream<Item = Result<Event, serde_json::Error>> + Send + 'static {
    BroadcastStream::new(hub.subscribe()).filter_map(move |result| match result {
        Ok(event) if filter.matches(&event) => Some(event.into_sse_event()),
        Ok(_) => None,
        Err(_) => None,
    })
}

pub fn audit_keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(20))
        .text("heartbeat")
}

pub fn parse_kind_list(value: Option<&str>) -> Result<Option<HashSet<AuditKind>>, String> {
    let Some(raw) = value else {
        return Ok(None);
    };
    let mut set = HashSet::new();
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let kind = match item.to_lowercase().as_str() {
            "auth" => AuditKind::Auth,
            "access" => AuditKind::Access,
            "inventory" => AuditKind::Inventory,
            "invoice" => AuditKind::Invoice,
            "billing" => AuditKind::Billing,
            "notification" => AuditKind::Notification,
            "storage" => AuditKind::Storage,
            other => return Err(format!("unknown audit kind '{other}'")),
        };
        set.insert(kind);
    }

    if set.is_empty() {
        Ok(None)
    } else {
        Ok(Some(set))
    }
}
