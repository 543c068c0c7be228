use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use stockflow_core::{
    identity::{SystemRole, ValidationError},
    notification::role_request_reviewed,
    permissions::{self, PermissionInfo, CATALOG},
    role_upgrade::{RequestStatus, RoleUpgradeRequest, UpgradeError},
    roles::{normalize_permissions, RoleDefinition, RoleError},
};
use stockflow_storage::{RoleRepoError, RoleRequestError};

use crate::audit::{AuditEvent, AuditKind, AuditPayload};
use crate::auth::AuthenticatedUser;
use crate::problem::ProblemResponse;
use crate::router::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateRoleRequest {
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub priority: i64,
}

#[derive(Debug, Deserialize)]
pub struct PermissionsRequest {
    pub permissions: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpgradeRequestBody {
    pub requested_role: String,
    pub justification: String,
    #[serde(default)]
    pub priority: Option<u8>,
}

#[derive(Debug, Deserialize)]
pub struct ReviewBody {
    pub approve: bool,
    #[serde(default)]
    pub comments: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    #[serde(default)]
    pub status: Option<String>,
}

fn role_problem(err: RoleRepoError) -> ProblemResponse {
    match err {
        RoleRepoError::NotFound => ProblemResponse::not_found("role not found"),
        RoleRepoError::Duplicate(name) => {
            ProblemResponse::conflict("role_exists", format!("role {name} already exists"))
        }
        RoleRepoError::SystemRole => {
            ProblemResponse::conflict("system_role", "built-in roles cannot be deleted")
        }
        RoleRepoError::InUse(count) => ProblemResponse::conflict(
            "role_in_use",
            format!("role is assigned to {count} user(s)"),
        ),
        other => ProblemResponse::internal_error("auth", other),
    }
}

fn definition_problem(err: RoleError) -> ProblemResponse {
    ProblemResponse::bad_request("invalid_role", err.to_string())
}

fn request_problem(err: RoleRequestError) -> ProblemResponse {
    match err {
        RoleRequestError::PendingExists => ProblemResponse::conflict(
            "request_pending",
            "you already have a pending role upgrade request",
        ),
        RoleRequestError::NotFound => ProblemResponse::not_found("request not found"),
        other => ProblemResponse::internal_error("auth", other),
    }
}

fn upgrade_problem(err: UpgradeError) -> ProblemResponse {
    match err {
        UpgradeError::NotPending(_) => ProblemResponse::conflict("not_pending", err.to_string()),
        other => ProblemResponse::bad_request("invalid_request", other.to_string()),
    }
}

pub async fn permission_catalog(
    caller: AuthenticatedUser,
) -> Result<Json<&'static [PermissionInfo]>, ProblemResponse> {
    caller.require(permissions::USERS_MANAGE_ROLES)?;
    Ok(Json(CATALOG))
}

pub async fn list(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
) -> Result<Json<Vec<RoleDefinition>>, ProblemResponse> {
    caller.require(permissions::USERS_MANAGE_ROLES)?;
    let roles = state.storage().roles().list().await.map_err(role_problem)?;
    Ok(Json(roles))
}

pub async fn create(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Json(body): Json<CreateRoleRequest>,
) -> Result<(StatusCode, Json<RoleDefinition>), ProblemResponse> {
    caller.require(permissions::USERS_MANAGE_ROLES)?;
    let role = RoleDefinition::custom(
        &body.name,
        &body.display_name,
        body.description,
        body.permissions,
        body.priority,
    )
    .map_err(definition_problem)?;

    let now = state.now();
    state
        .storage()
        .roles()
        .create(&role, now)
        .await
        .map_err(role_problem)?;

    info!(stage = "auth", role = %role.name, permissions = role.permissions.len(), "role created");
    state.audit().publish(
        AuditEvent::new(AuditKind::Access, "role_created", now)
            .actor(caller.id().to_string())
            .entity("role", role.name.clone()),
    );
    Ok((StatusCode::CREATED, Json(role)))
}

pub async fn replace_permissions(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path(name): Path<String>,
    Json(body): Json<PermissionsRequest>,
) -> Result<Json<RoleDefinition>, ProblemResponse> {
    caller.require(permissions::USERS_MANAGE_ROLES)?;
    let granted = normalize_permissions(body.permissions).map_err(definition_problem)?;
    let keeps_role_management = granted.iter().any(|p| p == permissions::USERS_MANAGE_ROLES);
    if name == SystemRole::Admin.as_str() && !keeps_role_management {
        return Err(ProblemResponse::bad_request(
            "invalid_role",
            "the admin role must keep users.manage_roles",
        ));
    }

    let now = state.now();
    let roles = state.storage().roles();
    roles
        .replace_permissions(&name, &granted, now)
        .await
        .map_err(role_problem)?;
    let role = roles
        .find(&name)
        .await
        .map_err(role_problem)?
        .ok_or_else(|| ProblemResponse::not_found("role not found"))?;

    state.audit().publish(
        AuditEvent::new(AuditKind::Access, "role_permissions_replaced", now)
            .actor(caller.id().to_string())
            .entity("role", name.clone())
            .input(AuditPayload::of(serde_json::json!({ "permissions": granted }))),
    );
    Ok(Json(role))
}

pub async fn remove(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path(name): Path<String>,
) -> Result<StatusCode, ProblemResponse> {
    caller.require(permissions::USERS_MANAGE_ROLES)?;
    state
        .storage()
        .roles()
        .delete(&name)
        .await
        .map_err(role_problem)?;

    state.audit().publish(
        AuditEvent::new(AuditKind::Access, "role_deleted", state.now())
            .actor(caller.id().to_string())
            .entity("role", name),
    );
    Ok(StatusCode::NO_CONTENT)
}

pub async fn create_request(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Json(body): Json<UpgradeRequestBody>,
) -> Result<(StatusCode, Json<RoleUpgradeRequest>), ProblemResponse> {
    let requested: SystemRole = body
        .requested_role
        .parse()
        .map_err(|err: ValidationError| {
            ProblemResponse::bad_request("invalid_request", err.to_string())
        })?;
    // Custom roles rank with plain users for upgrade purposes.
    let current = caller.user.system_role().unwrap_or(SystemRole::User);
    let now = state.now();
    let request = RoleUpgradeRequest::new(
        Uuid::new_v4().to_string(),
        caller.id().to_string(),
        current,
        requested,
        &body.justification,
        body.priority,
        now,
    )
    .map_err(upgrade_problem)?;

    state
        .storage()
        .role_requests()
        .insert(&request)
        .await
        .map_err(request_problem)?;

    info!(stage = "auth", user_id = %caller.id(), requested = %requested, "role upgrade requested");
    state.audit().publish(
        AuditEvent::new(AuditKind::Access, "role_upgrade_requested", now)
            .user(caller.id().to_string())
            .entity("role_upgrade_request", request.id.clone()),
    );
    Ok((StatusCode::CREATED, Json(request)))
}

pub async fn my_requests(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
) -> Result<Json<Vec<RoleUpgradeRequest>>, ProblemResponse> {
    let requests = state
        .storage()
        .role_requests()
        .list_for_user(caller.id())
        .await
        .map_err(request_problem)?;
    Ok(Json(requests))
}

pub async fn list_requests(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Query(query): Query<StatusQuery>,
) -> Result<Json<Vec<RoleUpgradeRequest>>, ProblemResponse> {
    caller.require(permissions::USERS_MANAGE_ROLES)?;
    let status = match query.status.as_deref() {
        Some(raw) => raw
            .parse::<RequestStatus>()
            .map_err(|err| ProblemResponse::bad_request("invalid_status", err.to_string()))?,
        None => RequestStatus::Pending,
    };
    let requests = state
        .storage()
        .role_requests()
        .list_by_status(status)
        .await
        .map_err(request_problem)?;
    Ok(Json(requests))
}

pub async fn review_request(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path(id): Path<String>,
    Json(body): Json<ReviewBody>,
) -> Result<Json<RoleUpgradeRequest>, ProblemResponse> {
    caller.require(permissions::USERS_MANAGE_ROLES)?;
    let repo = state.storage().role_requests();
    let mut request = repo
        .find(&id)
        .await
        .map_err(request_problem)?
        .ok_or_else(|| ProblemResponse::not_found("request not found"))?;

    let reviewer_role = caller.user.system_role().unwrap_or(SystemRole::User);
    if !request.can_be_reviewed_by(reviewer_role) {
        return Err(ProblemResponse::forbidden(format!(
            "{} requests can only be reviewed by an administrator",
            request.requested_role
        )));
    }
    if request.user_id == caller.id() {
        return Err(ProblemResponse::forbidden("you cannot review your own request"));
    }

    let now = state.now();
    let outcome = if body.approve {
        request.approve(caller.id(), body.comments, now)
    } else {
        request.reject(caller.id(), body.comments, now)
    };
    outcome.map_err(upgrade_problem)?;

    repo.save_review(&request, now).await.map_err(request_problem)?;

    info!(
        stage = "auth",
        request_id = %request.id,
        status = %request.status,
        reviewer = %caller.id(),
        "role upgrade reviewed"
    );
    state.audit().publish(
        AuditEvent::new(AuditKind::Access, "role_upgrade_reviewed", now)
            .actor(caller.id().to_string())
            .user(request.user_id.clone())
            .entity("role_upgrade_request", request.id.clone())
            .output(serde_json::json!({ "status": request.status.as_str() })),
    );

    if let Some(draft) = role_request_reviewed(&request) {
        if let Err(err) = state
            .notifier()
            .dispatch_to_user(&request.user_id, &draft, now)
            .await
        {
            warn!(stage = "notification", request_id = %request.id, error = %err, "failed to notify requester");
        }
    }
    Ok(Json(request))
}

pub async fn cancel_request(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path(id): Path<String>,
) -> Result<Json<RoleUpgradeRequest>, ProblemResponse> {
    let repo = state.storage().role_requests();
    let mut request = repo
        .find(&id)
        .await
        .map_err(request_problem)?
        .filter(|request| request.user_id == caller.id())
        .ok_or_else(|| ProblemResponse::not_found("request not found"))?;

    request.cancel().map_err(upgrade_problem)?;
    repo.update(&request).await.map_err(request_problem)?;
    Ok(Json(request))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    use crate::test_support::TestApp;

    #[tokio::test]
    async fn catalog_and_roles_require_manage_roles() {
        let app = TestApp::new().await;
        let (_, manager) = app.user("m-1", "manager@example.com", "manager").await;
        let (_, admin) = app.user("a-1", "admin@example.com", "admin").await;

        let (status, _) = app.get("/api/permissions", &manager).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = app.get("/api/permissions", &admin).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body
            .as_array()
            .expect("catalog")
            .iter()
            .any(|p| p["name"] == "product.update_stock"));

        let (status, body) = app.get("/api/roles", &admin).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().expect("roles").len(), 3);
    }

    #[tokio::test]
    async fn custom_role_lifecycle() {
        let app = TestApp::new().await;
        let (_, admin) = app.user("a-1", "admin@example.com", "admin").await;

        let (status, body) = app
            .post(
                "/api/roles",
                Some(&admin),
                json!({
                    "name": "Warehouse",
                    "display_name": "Warehouse staff",
                    "permissions": ["product.view", "product.update_stock", "product.view"],
                }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["name"], "warehouse");
        assert_eq!(body["permissions"], json!(["product.update_stock", "product.view"]));

        let (status, body) = app
            .post(
                "/api/roles",
                Some(&admin),
                json!({ "name": "bad", "display_name": "Bad", "permissions": ["product.fly"] }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "invalid_role");

        let (status, body) = app
            .put(
                "/api/roles/warehouse/permissions",
                &admin,
                json!({ "permissions": ["product.view"] }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["permissions"], json!(["product.view"]));

        app.user("w-1", "worker@example.com", "warehouse").await;
        let (status, body) = app
            .request(Method::DELETE, "/api/roles/warehouse", Some(&admin), None)
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["type"], "role_in_use");

        let (status, body) = app
            .request(Method::DELETE, "/api/roles/manager", Some(&admin), None)
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["type"], "system_role");
    }

    #[tokio::test]
    async fn upgrade_request_review_flow() {
        let app = TestApp::new().await;
        let (_, user) = app.user("u-1", "user@example.com", "user").await;
        let (_, manager) = app.user("m-1", "manager@example.com", "manager").await;
        let (_, admin) = app.user("a-1", "admin@example.com", "admin").await;

        let (status, created) = app
            .post(
                "/api/role-upgrade-requests",
                Some(&user),
                json!({ "requested_role": "manager", "justification": "I run the night shift" }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["status"], "pending");
        let id = created["id"].as_str().expect("id").to_string();

        let (status, _) = app
            .post(
                "/api/role-upgrade-requests",
                Some(&user),
                json!({ "requested_role": "admin", "justification": "Again" }),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, pending) = app.get("/api/role-upgrade-requests?status=pending", &admin).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(pending.as_array().expect("list").len(), 1);

        // Managers lack users.manage_roles by default.
        let (status, _) = app
            .post(
                &format!("/api/role-upgrade-requests/{id}/review"),
                Some(&manager),
                json!({ "approve": true }),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, reviewed) = app
            .post(
                &format!("/api/role-upgrade-requests/{id}/review"),
                Some(&admin),
                json!({ "approve": true, "comments": "Welcome aboard" }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reviewed["status"], "approved");
        assert_eq!(reviewed["reviewed_by"], "a-1");

        let (_, me) = app.get("/api/auth/me", &user).await;
        assert_eq!(me["user"]["role"], "manager");

        let (_, unread) = app.get("/api/notifications/unread-count", &user).await;
        assert_eq!(unread["count"], 1);
    }

    #[tokio::test]
    async fn rejection_requires_comments_and_owner_can_cancel() {
        let app = TestApp::new().await;
        let (_, user) = app.user("u-1", "user@example.com", "user").await;
        let (_, other) = app.user("u-2", "other@example.com", "user").await;
        let (_, admin) = app.user("a-1", "admin@example.com", "admin").await;

        let (_, created) = app
            .post(
                "/api/role-upgrade-requests",
                Some(&user),
                json!({ "requested_role": "manager", "justification": "Need reports", "priority": 9 }),
            )
            .await;
        assert_eq!(created["priority"], 5);
        let id = created["id"].as_str().expect("id").to_string();

        let (status, _) = app
            .post(
                &format!("/api/role-upgrade-requests/{id}/review"),
                Some(&admin),
                json!({ "approve": false }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = app
            .post(&format!("/api/role-upgrade-requests/{id}/cancel"), Some(&other), json!({}))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, cancelled) = app
            .post(&format!("/api/role-upgrade-requests/{id}/cancel"), Some(&user), json!({}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cancelled["status"], "cancelled");

        let (status, body) = app
            .post(&format!("/api/role-upgrade-requests/{id}/cancel"), Some(&user), json!({}))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["type"], "not_pending");

        let (_, mine) = app.get("/api/role-upgrade-requests/mine", &user).await;
        assert_eq!(mine.as_array().expect("mine").len(), 1);
    }
}
