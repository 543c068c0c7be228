use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use stockflow_core::{
    invoice::{Invoice, InvoiceError, InvoiceFilter},
    paging::{Page, PageRequest},
    permissions,
    product::Product,
};
use stockflow_storage::InvoiceRepoError;

use crate::audit::{AuditEvent, AuditKind};
use crate::auth::AuthenticatedUser;
use crate::problem::ProblemResponse;
use crate::router::AppState;

#[derive(Debug, Serialize)]
pub struct InvoiceView {
    #[serde(flatten)]
    pub invoice: Invoice,
    pub total_item_count: i64,
    pub has_items: bool,
}

impl From<Invoice> for InvoiceView {
    fn from(invoice: Invoice) -> Self {
        Self {
            total_item_count: invoice.total_item_count(),
            has_items: invoice.has_items(),
            invoice,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct InvoiceListQuery {
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub page_size: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ItemRequest {
    pub product_id: String,
    pub quantity: i64,
    /// Defaults to the product's current cost per item.
    #[serde(default)]
    pub unit_price_cents: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateInvoiceRequest {
    #[serde(default)]
    pub created_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub items: Vec<ItemRequest>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateInvoiceRequest {
    #[serde(default)]
    pub created_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct QuantityRequest {
    pub quantity: i64,
}

fn invoice_error(err: InvoiceError) -> ProblemResponse {
    match err {
        InvoiceError::ItemNotFound => ProblemResponse::not_found(err.to_string()),
        InvoiceError::InvalidDateRange => {
            ProblemResponse::bad_request("invalid_date_range", err.to_string())
        }
        other => ProblemResponse::bad_request("validation_error", other.to_string()),
    }
}

fn repo_problem(err: InvoiceRepoError) -> ProblemResponse {
    match err {
        InvoiceRepoError::NotFound => ProblemResponse::not_found("invoice not found"),
        InvoiceRepoError::UnknownUser => {
            ProblemResponse::bad_request("unknown_user", "invoice owner does not exist")
        }
        InvoiceRepoError::Invalid(err) => invoice_error(err),
        other => ProblemResponse::internal_error("invoice", other),
    }
}

fn sees_all(caller: &AuthenticatedUser) -> bool {
    caller.permissions.contains(permissions::INVOICE_VIEW_ALL)
}

/// Loads an invoice the caller may see. Other users' invoices read as missing
/// unless the caller holds `invoice.view_all`.
async fn visible_invoice(
    state: &AppState,
    caller: &AuthenticatedUser,
    id: &str,
) -> Result<Invoice, ProblemResponse> {
    state
        .storage()
        .invoices()
        .find(id)
        .await
        .map_err(repo_problem)?
        .filter(|invoice| sees_all(caller) || invoice.created_by == caller.id())
        .ok_or_else(|| ProblemResponse::not_found("invoice not found"))
}

async fn product_for_item(state: &AppState, product_id: &str) -> Result<Product, ProblemResponse> {
    state
        .storage()
        .products()
        .find(product_id)
        .await
        .map_err(|err| ProblemResponse::internal_error("invoice", err))?
        .ok_or_else(|| {
            ProblemResponse::bad_request("unknown_product", format!("product {product_id} not found"))
        })
}

async fn list_page(
    state: &AppState,
    filter: InvoiceFilter,
    query: &InvoiceListQuery,
) -> Result<Json<Page<InvoiceView>>, ProblemResponse> {
    let page = state
        .storage()
        .invoices()
        .page(&filter, PageRequest::new(query.page, query.page_size))
        .await
        .map_err(repo_problem)?;
    Ok(Json(page.map(InvoiceView::from)))
}

pub async fn list(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Query(query): Query<InvoiceListQuery>,
) -> Result<Json<Page<InvoiceView>>, ProblemResponse> {
    caller.require(permissions::INVOICE_VIEW)?;
    let created_by = if sees_all(&caller) {
        query.created_by.clone()
    } else {
        Some(caller.id().to_string())
    };
    let filter = InvoiceFilter {
        created_by,
        from: query.from,
        to: query.to,
    };
    list_page(&state, filter, &query).await
}

pub async fn mine(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Query(query): Query<InvoiceListQuery>,
) -> Result<Json<Page<InvoiceView>>, ProblemResponse> {
    caller.require(permissions::INVOICE_VIEW)?;
    let filter = InvoiceFilter {
        created_by: Some(caller.id().to_string()),
        from: query.from,
        to: query.to,
    };
    list_page(&state, filter, &query).await
}

pub async fn get_one(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path(id): Path<String>,
) -> Result<Json<InvoiceView>, ProblemResponse> {
    caller.require(permissions::INVOICE_VIEW)?;
    let invoice = visible_invoice(&state, &caller, &id).await?;
    Ok(Json(invoice.into()))
}

pub async fn create(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Json(body): Json<CreateInvoiceRequest>,
) -> Result<(StatusCode, Json<InvoiceView>), ProblemResponse> {
    caller.require(permissions::INVOICE_CREATE)?;
    let now = state.now();
    let mut invoice = Invoice::new(Uuid::new_v4().to_string(), caller.id(), body.created_date, now);
    for item in &body.items {
        let product = product_for_item(&state, &item.product_id).await?;
        invoice
            .add_item(
                &product.id,
                &product.name,
                item.unit_price_cents.unwrap_or(product.cost_per_item_cents),
                item.quantity,
                now,
            )
            .map_err(invoice_error)?;
    }

    state
        .storage()
        .invoices()
        .insert(&invoice)
        .await
        .map_err(repo_problem)?;

    info!(stage = "invoice", invoice_id = %invoice.id, lines = invoice.items.len(), total_cents = invoice.total_cents, "invoice created");
    state.audit().publish(
        AuditEvent::new(AuditKind::Invoice, "invoice_created", now)
            .actor(caller.id().to_string())
            .entity("invoice", invoice.id.clone())
            .output(json!({ "lines": invoice.items.len(), "total_cents": invoice.total_cents })),
    );
    Ok((StatusCode::CREATED, Json(invoice.into())))
}

pub async fn update(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path(id): Path<String>,
    Json(body): Json<UpdateInvoiceRequest>,
) -> Result<Json<InvoiceView>, ProblemResponse> {
    caller.require(permissions::INVOICE_EDIT)?;
    visible_invoice(&state, &caller, &id).await?;
    let now = state.now();
    let invoice = state
        .storage()
        .invoices()
        .modify(&id, |invoice| {
            if let Some(created_date) = body.created_date {
                invoice.set_created_date(created_date, now);
            }
            if let Some(is_active) = body.is_active {
                invoice.set_active(is_active, now);
            }
            Ok(())
        })
        .await
        .map_err(repo_problem)?;

    state.audit().publish(
        AuditEvent::new(AuditKind::Invoice, "invoice_updated", now)
            .actor(caller.id().to_string())
            .entity("invoice", invoice.id.clone())
            .output(json!({ "is_active": invoice.is_active })),
    );
    Ok(Json(invoice.into()))
}

pub async fn remove(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path(id): Path<String>,
) -> Result<StatusCode, ProblemResponse> {
    caller.require(permissions::INVOICE_DELETE)?;
    visible_invoice(&state, &caller, &id).await?;
    state
        .storage()
        .invoices()
        .delete(&id)
        .await
        .map_err(repo_problem)?;

    info!(stage = "invoice", invoice_id = %id, "invoice deleted");
    state.audit().publish(
        AuditEvent::new(AuditKind::Invoice, "invoice_deleted", state.now())
            .actor(caller.id().to_string())
            .entity("invoice", id),
    );
    Ok(StatusCode::NO_CONTENT)
}

pub async fn add_item(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path(id): Path<String>,
    Json(body): Json<ItemRequest>,
) -> Result<Json<InvoiceView>, ProblemResponse> {
    caller.require(permissions::INVOICE_MANAGE_ITEMS)?;
    visible_invoice(&state, &caller, &id).await?;
    let product = product_for_item(&state, &body.product_id).await?;
    let now = state.now();
    let unit_price = body.unit_price_cents.unwrap_or(product.cost_per_item_cents);
    let invoice = state
        .storage()
        .invoices()
        .modify(&id, |invoice| {
            invoice.add_item(&product.id, &product.name, unit_price, body.quantity, now)
        })
        .await
        .map_err(repo_problem)?;

    audit_items(&state, &caller, &invoice, "item_added", &product.id, now);
    Ok(Json(invoice.into()))
}

pub async fn update_item(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path((id, product_id)): Path<(String, String)>,
    Json(body): Json<QuantityRequest>,
) -> Result<Json<InvoiceView>, ProblemResponse> {
    caller.require(permissions::INVOICE_MANAGE_ITEMS)?;
    visible_invoice(&state, &caller, &id).await?;
    let now = state.now();
    let invoice = state
        .storage()
        .invoices()
        .modify(&id, |invoice| {
            invoice.update_item_quantity(&product_id, body.quantity, now)
        })
        .await
        .map_err(repo_problem)?;

    audit_items(&state, &caller, &invoice, "item_updated", &product_id, now);
    Ok(Json(invoice.into()))
}

pub async fn remove_item(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path((id, product_id)): Path<(String, String)>,
) -> Result<Json<InvoiceView>, ProblemResponse> {
    caller.require(permissions::INVOICE_MANAGE_ITEMS)?;
    visible_invoice(&state, &caller, &id).await?;
    let now = state.now();
    let invoice = state
        .storage()
        .invoices()
        .modify(&id, |invoice| invoice.remove_item(&product_id, now))
        .await
        .map_err(repo_problem)?;

    audit_items(&state, &caller, &invoice, "item_removed", &product_id, now);
    Ok(Json(invoice.into()))
}

fn audit_items(
    state: &AppState,
    caller: &AuthenticatedUser,
    invoice: &Invoice,
    action: &'static str,
    product_id: &str,
    now: DateTime<Utc>,
) {
    state.audit().publish(
        AuditEvent::new(AuditKind::Invoice, action, now)
            .actor(caller.id().to_string())
            .entity("invoice", invoice.id.clone())
            .output(json!({ "product_id": product_id, "total_cents": invoice.total_cents })),
    );
}
