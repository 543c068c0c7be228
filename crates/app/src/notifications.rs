use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{KeepAlive, Sse},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use stockflow_core::{
    notification::{
        resolve_preference, Notification, NotificationDraft, NotificationKind,
        NotificationPreference, Priority,
    },
    paging::{Page, PageRequest},
    permissions,
};
use stockflow_storage::{DismissOutcome, NotificationRepoError};

use crate::auth::{authenticate, AuthenticatedUser};
use crate::notifier::NotifyError;
use crate::problem::ProblemResponse;
use crate::router::AppState;
use crate::sse::SseStream;

const LAST_EVENT_ID: &str = "last-event-id";

fn repo_problem(err: NotificationRepoError) -> ProblemResponse {
    match err {
        NotificationRepoError::InvalidQuietHours(detail) => {
            ProblemResponse::bad_request("invalid_preference", detail)
        }
        other => ProblemResponse::internal_error("notification", other),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub page_size: Option<u32>,
    #[serde(default)]
    pub unread_only: bool,
}

pub async fn list(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<Page<Notification>>, ProblemResponse> {
    let page = state
        .storage()
        .notifications()
        .page_for_user(
            caller.id(),
            query.unread_only,
            PageRequest::new(query.page, query.page_size),
        )
        .await
        .map_err(repo_problem)?;
    Ok(Json(page))
}

#[derive(Debug, Serialize)]
pub struct UnreadCount {
    pub count: i64,
}

pub async fn unread_count(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
) -> Result<Json<UnreadCount>, ProblemResponse> {
    let count = state
        .storage()
        .notifications()
        .unread_count(caller.id())
        .await
        .map_err(repo_problem)?;
    Ok(Json(UnreadCount { count }))
}

pub async fn mark_read(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path(id): Path<String>,
) -> Result<StatusCode, ProblemResponse> {
    let updated = state
        .storage()
        .notifications()
        .mark_read(caller.id(), &id, state.now())
        .await
        .map_err(repo_problem)?;
    if updated {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ProblemResponse::not_found("notification not found"))
    }
}

#[derive(Debug, Serialize)]
pub struct MarkedCount {
    pub updated: u64,
}

pub async fn mark_all_read(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
) -> Result<Json<MarkedCount>, ProblemResponse> {
    let updated = state
        .storage()
        .notifications()
        .mark_all_read(caller.id(), state.now())
        .await
        .map_err(repo_problem)?;
    Ok(Json(MarkedCount { updated }))
}

pub async fn dismiss(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path(id): Path<String>,
) -> Result<StatusCode, ProblemResponse> {
    let outcome = state
        .storage()
        .notifications()
        .dismiss(caller.id(), &id, state.now())
        .await
        .map_err(repo_problem)?;
    match outcome {
        DismissOutcome::Dismissed => Ok(StatusCode::NO_CONTENT),
        DismissOutcome::NotFound => Err(ProblemResponse::not_found("notification not found")),
        DismissOutcome::NotDismissible => Err(ProblemResponse::conflict(
            "not_dismissible",
            "this notification cannot be dismissed",
        )),
    }
}

/// Stored preferences merged with the defaults, one entry per kind.
pub async fn preferences(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
) -> Result<Json<Vec<NotificationPreference>>, ProblemResponse> {
    let stored = state
        .storage()
        .notifications()
        .preferences_for(caller.id())
        .await
        .map_err(repo_problem)?;
    Ok(Json(
        NotificationKind::ALL
            .into_iter()
            .map(|kind| resolve_preference(&stored, kind))
            .collect(),
    ))
}

pub async fn update_preference(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Json(preference): Json<NotificationPreference>,
) -> Result<Json<NotificationPreference>, ProblemResponse> {
    state
        .storage()
        .notifications()
        .upsert_preference(caller.id(), &preference, state.now())
        .await
        .map_err(repo_problem)?;
    Ok(Json(preference))
}

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    #[serde(default)]
    pub recipient_id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    pub title: String,
    pub message: String,
    #[serde(default = "default_kind")]
    pub kind: NotificationKind,
    #[serde(default = "default_priority")]
    pub priority: Priority,
    #[serde(default)]
    pub action_url: Option<String>,
}

fn default_kind() -> NotificationKind {
    NotificationKind::System
}

fn default_priority() -> Priority {
    Priority::Normal
}

#[derive(Debug, Serialize)]
pub struct SendResponse {
    pub delivered: usize,
}

pub async fn send(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Json(body): Json<SendRequest>,
) -> Result<Json<SendResponse>, ProblemResponse> {
    caller.require(permissions::SYSTEM_MANAGE_SETTINGS)?;
    let mut draft = NotificationDraft::new(body.kind, body.priority, &body.title, &body.message)
        .map_err(|err| ProblemResponse::bad_request("invalid_notification", err.to_string()))?
        .with_sender(caller.id());
    if let Some(url) = body.action_url.filter(|url| !url.trim().is_empty()) {
        draft = draft.with_action_url(url);
    }

    let now = state.now();
    let notifier = state.notifier();
    let result = match (body.recipient_id.as_deref(), body.role.as_deref()) {
        (Some(user_id), None) => notifier.dispatch_to_user(user_id, &draft, now).await,
        (None, Some(role)) => notifier.dispatch_to_role(role, &draft, now).await,
        _ => {
            return Err(ProblemResponse::bad_request(
                "invalid_recipient",
                "exactly one of recipient_id or role is required",
            ))
        }
    };
    let delivered = result.map_err(|err| match err {
        NotifyError::UnknownRecipient => ProblemResponse::not_found("recipient not found"),
        other => ProblemResponse::internal_error("notification", other),
    })?;

    info!(stage = "notification", sender = %caller.id(), delivered, "manual notification sent");
    Ok(Json(SendResponse { delivered }))
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub since: Option<i64>,
}

/// Live notification feed. EventSource cannot send headers, so the access
/// token travels in the query string.
pub async fn stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<SseStream>, ProblemResponse> {
    let token = query.token.as_deref().ok_or_else(|| {
        ProblemResponse::new(StatusCode::UNAUTHORIZED, "unauthorized", "missing token")
    })?;
    let caller = authenticate(&state, token).await?;

    let since = headers
        .get(LAST_EVENT_ID)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<i64>().ok())
        .or(query.since);

    let hub = state.hub();
    let subscription = hub.subscribe(caller.id(), since).await;
    let stream = match (subscription.ring_miss(), subscription.since()) {
        (true, Some(since)) => {
            let backlog = hub.load_backlog(caller.id(), since).await.map_err(|err| {
                warn!(stage = "notification", user_id = %caller.id(), error = %err, "failed to reload backlog");
                ProblemResponse::internal()
            })?;
            subscription.into_stream_with_initial(backlog)
        }
        _ => subscription.into_stream(),
    };

    let keep_alive = KeepAlive::new()
        .interval(state.settings().sse_heartbeat)
        .text("heartbeat");
    Ok(Sse::new(stream).keep_alive(keep_alive))
}
