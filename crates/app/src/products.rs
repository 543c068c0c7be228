use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use stockflow_core::{
    notification::stock_alert,
    paging::{Page, PageRequest},
    permissions,
    product::{
        DashboardStats, Product, ProductDraft, ProductError, ProductFilter, StockAdjustment,
        StockChange,
    },
};
use stockflow_storage::ProductRepoError;

use crate::audit::{AuditEvent, AuditKind, AuditPayload};
use crate::auth::AuthenticatedUser;
use crate::problem::ProblemResponse;
use crate::router::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ProductListQuery {
    #[serde(default)]
    pub active_only: bool,
    #[serde(default)]
    pub in_stock_only: bool,
    #[serde(default)]
    pub low_stock_only: bool,
    #[serde(default)]
    pub low_stock_threshold: Option<i64>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub page_size: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ProductRequest {
    pub name: String,
    pub cost_per_item_cents: i64,
    #[serde(default)]
    pub number_in_stock: i64,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub image_url: Option<String>,
}

fn default_active() -> bool {
    true
}

impl ProductRequest {
    fn into_draft(self) -> Result<ProductDraft, ProblemResponse> {
        ProductDraft::new(
            &self.name,
            self.cost_per_item_cents,
            self.number_in_stock,
            self.is_active,
            self.image_url,
        )
        .map_err(product_error)
    }
}

fn product_error(err: ProductError) -> ProblemResponse {
    match err {
        ProductError::InsufficientStock { .. } => {
            ProblemResponse::conflict("insufficient_stock", err.to_string())
        }
        other => ProblemResponse::bad_request("validation_error", other.to_string()),
    }
}

fn repo_problem(err: ProductRepoError) -> ProblemResponse {
    match err {
        ProductRepoError::NotFound => ProblemResponse::not_found("product not found"),
        ProductRepoError::Invalid(err) => product_error(err),
        other => ProblemResponse::internal_error("inventory", other),
    }
}

pub async fn list(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Query(query): Query<ProductListQuery>,
) -> Result<Json<Page<Product>>, ProblemResponse> {
    caller.require(permissions::PRODUCT_VIEW)?;
    let filter = ProductFilter {
        active_only: query.active_only,
        in_stock_only: query.in_stock_only,
        low_stock_only: query.low_stock_only,
        low_stock_threshold: query
            .low_stock_threshold
            .or(Some(state.settings().low_stock_threshold)),
        search: query.search,
    };
    let page = state
        .storage()
        .products()
        .page(&filter, PageRequest::new(query.page, query.page_size))
        .await
        .map_err(repo_problem)?;
    Ok(Json(page))
}

pub async fn get_one(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path(id): Path<String>,
) -> Result<Json<Product>, ProblemResponse> {
    caller.require(permissions::PRODUCT_VIEW)?;
    state
        .storage()
        .products()
        .find(&id)
        .await
        .map_err(repo_problem)?
        .map(Json)
        .ok_or_else(|| ProblemResponse::not_found("product not found"))
}

pub async fn create(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Json(body): Json<ProductRequest>,
) -> Result<(StatusCode, Json<Product>), ProblemResponse> {
    caller.require(permissions::PRODUCT_CREATE)?;
    let draft = body.into_draft()?;
    let now = state.now();
    let product = state
        .storage()
        .products()
        .insert(&Uuid::new_v4().to_string(), &draft, now)
        .await
        .map_err(repo_problem)?;

    info!(stage = "inventory", product_id = %product.id, stock = product.number_in_stock, "product created");
    state.audit().publish(
        AuditEvent::new(AuditKind::Inventory, "product_created", now)
            .actor(caller.id().to_string())
            .entity("product", product.id.clone())
            .output(json!({ "stock": product.number_in_stock })),
    );
    Ok((StatusCode::CREATED, Json(product)))
}

pub async fn update(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path(id): Path<String>,
    Json(body): Json<ProductRequest>,
) -> Result<Json<Product>, ProblemResponse> {
    caller.require(permissions::PRODUCT_EDIT)?;
    let draft = body.into_draft()?;
    let now = state.now();
    let (product, change) = state
        .storage()
        .products()
        .update(&id, &draft, now)
        .await
        .map_err(repo_problem)?;

    state.audit().publish(
        AuditEvent::new(AuditKind::Inventory, "product_updated", now)
            .actor(caller.id().to_string())
            .entity("product", product.id.clone()),
    );
    if change.previous != change.current {
        record_stock_change(&state, caller.id(), "update", &product, change, now).await;
    }
    Ok(Json(product))
}

pub async fn adjust_stock(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path(id): Path<String>,
    Json(adjustment): Json<StockAdjustment>,
) -> Result<Json<Product>, ProblemResponse> {
    caller.require(permissions::PRODUCT_UPDATE_STOCK)?;
    let now = state.now();
    let (product, change) = state
        .storage()
        .products()
        .adjust_stock(&id, adjustment, now)
        .await
        .map_err(repo_problem)?;

    record_stock_change(&state, caller.id(), adjustment.kind(), &product, change, now).await;
    Ok(Json(product))
}

pub async fn remove(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path(id): Path<String>,
) -> Result<StatusCode, ProblemResponse> {
    caller.require(permissions::PRODUCT_DELETE)?;
    state
        .storage()
        .products()
        .delete(&id)
        .await
        .map_err(repo_problem)?;

    info!(stage = "inventory", product_id = %id, "product deleted");
    state.audit().publish(
        AuditEvent::new(AuditKind::Inventory, "product_deleted", state.now())
            .actor(caller.id().to_string())
            .entity("product", id),
    );
    Ok(StatusCode::NO_CONTENT)
}

pub async fn dashboard_stats(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
) -> Result<Json<DashboardStats>, ProblemResponse> {
    caller.require(permissions::PRODUCT_VIEW_REPORTS)?;
    let stats = state
        .storage()
        .products()
        .dashboard_stats(state.settings().low_stock_threshold)
        .await
        .map_err(repo_problem)?;
    Ok(Json(stats))
}

/// Counts and audits a stock movement, alerting stock handlers when the
/// product dropped into a worse level.
async fn record_stock_change(
    state: &AppState,
    actor: &str,
    kind: &'static str,
    product: &Product,
    change: StockChange,
    now: DateTime<Utc>,
) {
    counter!("inventory_stock_changes_total", "kind" => kind).increment(1);
    info!(
        stage = "inventory",
        product_id = %product.id,
        kind,
        previous = change.previous,
        current = change.current,
        "stock changed"
    );
    state.audit().publish(
        AuditEvent::new(AuditKind::Inventory, "stock_changed", now)
            .actor(actor.to_string())
            .entity("product", product.id.clone())
            .input(AuditPayload::of(json!({ "kind": kind })))
            .output(json!({ "previous": change.previous, "current": change.current })),
    );

    let threshold = state.settings().low_stock_threshold;
    let Some(level) = change.alert_level(threshold) else {
        return;
    };
    let Some(draft) = stock_alert(product, level) else {
        return;
    };
    match state
        .notifier()
        .dispatch_to_permission(permissions::PRODUCT_UPDATE_STOCK, &draft, now)
        .await
    {
        Ok(delivered) => {
            info!(stage = "inventory", product_id = %product.id, level = level.as_str(), delivered, "stock alert raised")
        }
        Err(err) => {
            warn!(stage = "inventory", product_id = %product.id, error = %err, "failed to raise stock alert")
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::{json, Value};

    use crate::test_support::TestApp;

    async fn create_product(app: &TestApp, token: &str, name: &str, stock: i64) -> Value {
        let (status, body) = app
            .post(
                "/api/products",
                Some(token),
                json!({ "name": name, "cost_per_item_cents": 250, "number_in_stock": stock }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        body
    }

    #[tokio::test]
    async fn crud_respects_permissions() {
        let app = TestApp::new().await;
        let (_, user) = app.user("u-1", "user@example.com", "user").await;
        let (_, manager) = app.user("m-1", "manager@example.com", "manager").await;
        let (_, admin) = app.user("a-1", "admin@example.com", "admin").await;

        let (status, _) = app
            .post(
                "/api/products",
                Some(&user),
                json!({ "name": "Widget", "cost_per_item_cents": 100 }),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let product = create_product(&app, &manager, "  Widget ", 40).await;
        assert_eq!(product["name"], "Widget");
        assert_eq!(product["is_active"], true);
        let id = product["id"].as_str().expect("id").to_string();

        let (status, body) = app.get(&format!("/api/products/{id}"), &user).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["number_in_stock"], 40);

        let (status, body) = app
            .put(
                &format!("/api/products/{id}"),
                &manager,
                json!({ "name": "Widget XL", "cost_per_item_cents": 300, "number_in_stock": 40 }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "Widget XL");

        let (status, _) = app
            .request(Method::DELETE, &format!("/api/products/{id}"), Some(&manager), None)
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = app
            .request(Method::DELETE, &format!("/api/products/{id}"), Some(&admin), None)
            .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = app.get(&format!("/api/products/{id}"), &user).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_drafts_are_rejected() {
        let app = TestApp::new().await;
        let (_, manager) = app.user("m-1", "manager@example.com", "manager").await;

        let (status, body) = app
            .post(
                "/api/products",
                Some(&manager),
                json!({ "name": "Widget", "cost_per_item_cents": -1 }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "validation_error");

        let (status, _) = app
            .post(
                "/api/products",
                Some(&manager),
                json!({ "name": "x".repeat(101), "cost_per_item_cents": 1 }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stock_adjustments_alert_handlers() {
        let app = TestApp::new().await;
        let (_, manager) = app.user("m-1", "manager@example.com", "manager").await;
        let (_, user) = app.user("u-1", "user@example.com", "user").await;
        let product = create_product(&app, &manager, "Bolts", 20).await;
        let uri = format!("/api/products/{}/stock", product["id"].as_str().expect("id"));

        let (status, body) = app
            .request(
                Method::PATCH,
                &uri,
                Some(&manager),
                Some(json!({ "mode": "remove", "quantity": 50 })),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["type"], "insufficient_stock");

        let (status, body) = app
            .request(
                Method::PATCH,
                &uri,
                Some(&manager),
                Some(json!({ "mode": "remove", "quantity": 15 })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["number_in_stock"], 5);

        let (_, unread) = app.get("/api/notifications/unread-count", &manager).await;
        assert_eq!(unread["count"], 1);
        let (_, unread) = app.get("/api/notifications/unread-count", &user).await;
        assert_eq!(unread["count"], 0);

        // Still low: no new alert.
        app.request(
            Method::PATCH,
            &uri,
            Some(&manager),
            Some(json!({ "mode": "remove", "quantity": 1 })),
        )
        .await;
        let (_, unread) = app.get("/api/notifications/unread-count", &manager).await;
        assert_eq!(unread["count"], 1);

        let (status, body) = app
            .request(
                Method::PATCH,
                &uri,
                Some(&manager),
                Some(json!({ "mode": "set", "quantity": 0 })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["number_in_stock"], 0);

        let (_, list) = app.get("/api/notifications", &manager).await;
        assert_eq!(list["total_count"], 2);
        assert_eq!(list["items"][0]["priority"], "critical");
        assert_eq!(list["items"][0]["kind"], "stock_alert");
    }

    #[tokio::test]
    async fn listing_filters_and_dashboard() {
        let app = TestApp::new().await;
        let (_, manager) = app.user("m-1", "manager@example.com", "manager").await;
        let (_, user) = app.user("u-1", "user@example.com", "user").await;
        create_product(&app, &manager, "Anchor", 100).await;
        create_product(&app, &manager, "Bracket", 4).await;
        create_product(&app, &manager, "Clamp", 0).await;

        let (status, body) = app.get("/api/products?low_stock_only=true", &user).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_count"], 2);

        let (_, body) = app
            .get("/api/products?in_stock_only=true&search=an", &user)
            .await;
        assert_eq!(body["total_count"], 1);
        assert_eq!(body["items"][0]["name"], "Anchor");

        let (_, body) = app.get("/api/products?page=2&page_size=2", &user).await;
        assert_eq!(body["items"].as_array().expect("items").len(), 1);

        let (status, _) = app.get("/api/products/dashboard-stats", &user).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, stats) = app.get("/api/products/dashboard-stats", &manager).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["total_products"], 3);
        assert_eq!(stats["total_value_cents"], 104 * 250);
        assert_eq!(stats["low_stock_count"], 1);
        assert_eq!(stats["out_of_stock_count"], 1);
        assert_eq!(stats["in_stock_count"], 2);
    }
}
