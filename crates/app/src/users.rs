use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use tracing::info;

use stockflow_core::{
    identity::{validate_name, validate_timezone, SystemRole, User},
    paging::{Page, PageRequest},
    permissions,
};
use stockflow_storage::{ProfileUpdate, UserError};

use crate::account::validation_problem;
use crate::audit::{AuditEvent, AuditKind, AuditPayload};
use crate::auth::AuthenticatedUser;
use crate::problem::ProblemResponse;
use crate::router::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct UserListQuery {
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub page_size: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ProfileRequest {
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub phone_number: Option<String>,
    pub timezone: String,
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub is_active: bool,
}

#[derive(Debug, Deserialize)]
pub struct RoleRequest {
    pub role: String,
}

fn user_problem(err: UserError) -> ProblemResponse {
    match err {
        UserError::NotFound => ProblemResponse::not_found("user not found"),
        UserError::UnknownRole(role) => {
            ProblemResponse::bad_request("unknown_role", format!("role {role} does not exist"))
        }
        UserError::EmailTaken => {
            ProblemResponse::conflict("email_taken", "email is already registered")
        }
        other => ProblemResponse::internal_error("auth", other),
    }
}

pub async fn list(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Query(query): Query<UserListQuery>,
) -> Result<Json<Page<User>>, ProblemResponse> {
    caller.require(permissions::USERS_VIEW_ALL)?;
    let page = state
        .storage()
        .users()
        .page(
            query.search.as_deref(),
            PageRequest::new(query.page, query.page_size),
        )
        .await
        .map_err(user_problem)?;
    Ok(Json(page))
}

pub async fn get_one(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path(id): Path<String>,
) -> Result<Json<User>, ProblemResponse> {
    if id != caller.id() {
        caller.require(permissions::USERS_VIEW_ALL)?;
    }
    let record = state
        .storage()
        .users()
        .find_by_id(&id)
        .await
        .map_err(user_problem)?
        .ok_or_else(|| ProblemResponse::not_found("user not found"))?;
    Ok(Json(record.user))
}

pub async fn update_me(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Json(body): Json<ProfileRequest>,
) -> Result<Json<User>, ProblemResponse> {
    let first_name = validate_name("first_name", &body.first_name).map_err(validation_problem)?;
    let last_name = validate_name("last_name", &body.last_name).map_err(validation_problem)?;
    let timezone = body.timezone.trim();
    validate_timezone(timezone).map_err(validation_problem)?;
    let phone_number = body
        .phone_number
        .as_deref()
        .map(str::trim)
        .filter(|phone| !phone.is_empty());

    let user = state
        .storage()
        .users()
        .update_profile(
            caller.id(),
            &ProfileUpdate {
                first_name: &first_name,
                last_name: &last_name,
                phone_number,
                timezone,
            },
            state.now(),
        )
        .await
        .map_err(user_problem)?;
    Ok(Json(user))
}

pub async fn set_status(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path(id): Path<String>,
    Json(body): Json<StatusRequest>,
) -> Result<Json<User>, ProblemResponse> {
    caller.require(permissions::USERS_DELETE)?;
    if !body.is_active && id == caller.id() {
        return Err(ProblemResponse::bad_request(
            "self_deactivation",
            "you cannot deactivate your own account",
        ));
    }

    let now = state.now();
    let users = state.storage().users();
    users
        .set_active(&id, body.is_active, now)
        .await
        .map_err(user_problem)?;
    let record = users
        .find_by_id(&id)
        .await
        .map_err(user_problem)?
        .ok_or_else(|| ProblemResponse::not_found("user not found"))?;

    info!(stage = "auth", user_id = %id, active = body.is_active, "account status changed");
    state.audit().publish(
        AuditEvent::new(AuditKind::Access, "user_status", now)
            .actor(caller.id().to_string())
            .user(id.clone())
            .input(AuditPayload::of(serde_json::json!({ "is_active": body.is_active }))),
    );
    Ok(Json(record.user))
}

pub async fn set_role(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path(id): Path<String>,
    Json(body): Json<RoleRequest>,
) -> Result<Json<User>, ProblemResponse> {
    caller.require(permissions::USERS_MANAGE_ROLES)?;
    let role_name = body.role.trim().to_ascii_lowercase();
    let role = state
        .storage()
        .roles()
        .find(&role_name)
        .await
        .map_err(|err| ProblemResponse::internal_error("auth", err))?
        .filter(|role| role.is_active)
        .ok_or_else(|| {
            ProblemResponse::bad_request(
                "unknown_role",
                format!("role {role_name} does not exist or is inactive"),
            )
        })?;

    if role.name == SystemRole::Admin.as_str() && caller.user.system_role() != Some(SystemRole::Admin) {
        return Err(ProblemResponse::forbidden("only administrators can grant the admin role"));
    }

    let now = state.now();
    let users = state.storage().users();
    users
        .set_role(&id, &role.name, now)
        .await
        .map_err(user_problem)?;
    let record = users
        .find_by_id(&id)
        .await
        .map_err(user_problem)?
        .ok_or_else(|| ProblemResponse::not_found("user not found"))?;

    info!(stage = "auth", user_id = %id, role = %role.name, "role assigned");
    state.audit().publish(
        AuditEvent::new(AuditKind::Access, "role_assigned", now)
            .actor(caller.id().to_string())
            .user(id.clone())
            .entity("role", role.name.clone()),
    );
    Ok(Json(record.user))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    use crate::test_support::TestApp;

    #[tokio::test]
    async fn listing_requires_view_all() {
        let app = TestApp::new().await;
        let (_, user_token) = app.user("u-1", "user@example.com", "user").await;
        let (_, manager_token) = app.user("m-1", "manager@example.com", "manager").await;

        let (status, _) = app.get("/api/users", &user_token).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = app
            .get("/api/users?search=manager&page_size=5", &manager_token)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_count"], 1);
        assert_eq!(body["page_size"], 5);
        assert_eq!(body["items"][0]["id"], "m-1");
    }

    #[tokio::test]
    async fn users_can_read_only_themselves() {
        let app = TestApp::new().await;
        let (_, token) = app.user("u-1", "user@example.com", "user").await;
        app.user("u-2", "other@example.com", "user").await;

        let (status, body) = app.get("/api/users/u-1", &token).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["email"], "user@example.com");

        let (status, _) = app.get("/api/users/u-2", &token).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn profile_update_validates_timezone() {
        let app = TestApp::new().await;
        let (_, token) = app.user("u-1", "user@example.com", "user").await;

        let (status, _) = app
            .put(
                "/api/users/me",
                &token,
                json!({ "first_name": "Ann", "last_name": "Lee", "timezone": "Nowhere/City" }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = app
            .put(
                "/api/users/me",
                &token,
                json!({
                    "first_name": " Ann ",
                    "last_name": "Lee",
                    "phone_number": "+1 555 0100",
                    "timezone": "America/New_York"
                }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["first_name"], "Ann");
        assert_eq!(body["timezone"], "America/New_York");
    }

    #[tokio::test]
    async fn admins_cannot_deactivate_themselves() {
        let app = TestApp::new().await;
        let (_, admin_token) = app.user("a-1", "admin@example.com", "admin").await;
        let (_, user_token) = app.user("u-1", "user@example.com", "user").await;

        let (status, body) = app
            .request(
                Method::PATCH,
                "/api/users/a-1/status",
                Some(&admin_token),
                Some(json!({ "is_active": false })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "self_deactivation");

        let (status, body) = app
            .request(
                Method::PATCH,
                "/api/users/u-1/status",
                Some(&admin_token),
                Some(json!({ "is_active": false })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["is_active"], false);

        let (status, _) = app.get("/api/auth/me", &user_token).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn role_assignment_requires_existing_active_role() {
        let app = TestApp::new().await;
        let (_, admin_token) = app.user("a-1", "admin@example.com", "admin").await;
        app.user("u-1", "user@example.com", "user").await;

        let (status, body) = app
            .put("/api/users/u-1/role", &admin_token, json!({ "role": "wizard" }))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "unknown_role");

        let (status, body) = app
            .put("/api/users/u-1/role", &admin_token, json!({ "role": "Manager" }))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["role"], "manager");
    }
}
