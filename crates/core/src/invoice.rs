use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A line on an invoice. Product name and unit price are captured when the
/// line is added, so later product edits do not rewrite issued invoices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceItem {
    pub product_id: String,
    pub product_name: String,
    pub unit_price_cents: i64,
    pub quantity: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl InvoiceItem {
    pub fn line_total_cents(&self) -> i64 {
        self.unit_price_cents.saturating_mul(self.quantity)
    }
}

/// Invoice aggregate. `total_cents` always equals the sum of the line totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub created_by: String,
    pub created_date: DateTime<Utc>,
    pub total_cents: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub items: Vec<InvoiceItem>,
}

impl Invoice {
    pub fn new(
        id: String,
        created_by: &str,
        created_date: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            created_by: created_by.to_string(),
            created_date: created_date.unwrap_or(now),
            total_cents: 0,
            is_active: true,
            created_at: now,
            updated_at: None,
            items: Vec::new(),
        }
    }

    /// Adds a line, or raises the quantity when the product is already listed.
    /// An existing line keeps its original name and price.
    pub fn add_item(
        &mut self,
        product_id: &str,
        product_name: &str,
        unit_price_cents: i64,
        quantity: i64,
        now: DateTime<Utc>,
    ) -> Result<(), InvoiceError> {
        if quantity <= 0 {
            return Err(InvoiceError::NonPositiveQuantity);
        }
        if unit_price_cents < 0 {
            return Err(InvoiceError::NegativeUnitPrice);
        }

        match self.items.iter_mut().find(|item| item.product_id == product_id) {
            Some(item) => {
                item.quantity = item
                    .quantity
                    .checked_add(quantity)
                    .ok_or(InvoiceError::TotalOverflow)?;
                item.updated_at = Some(now);
            }
            None => {
                let product_name = product_name.trim();
                if product_name.is_empty() {
                    return Err(InvoiceError::MissingProductName);
                }
                self.items.push(InvoiceItem {
                    product_id: product_id.to_string(),
                    product_name: product_name.to_string(),
                    unit_price_cents,
                    quantity,
                    created_at: now,
                    updated_at: None,
                });
            }
        }
        self.touch(now)
    }

    /// Sets the quantity of a listed product. Zero or less removes the line.
    pub fn update_item_quantity(
        &mut self,
        product_id: &str,
        quantity: i64,
        now: DateTime<Utc>,
    ) -> Result<(), InvoiceError> {
        if quantity <= 0 {
            return self.remove_item(product_id, now);
        }
        let item = self
            .items
            .iter_mut()
            .find(|item| item.product_id == product_id)
            .ok_or(InvoiceError::ItemNotFound)?;
        item.quantity = quantity;
        item.updated_at = Some(now);
        self.touch(now)
    }

    pub fn remove_item(&mut self, product_id: &str, now: DateTime<Utc>) -> Result<(), InvoiceError> {
        let before = self.items.len();
        self.items.retain(|item| item.product_id != product_id);
        if self.items.len() == before {
            return Err(InvoiceError::ItemNotFound);
        }
        self.touch(now)
    }

    pub fn set_created_date(&mut self, created_date: DateTime<Utc>, now: DateTime<Utc>) {
        self.created_date = created_date;
        self.updated_at = Some(now);
    }

    pub fn set_active(&mut self, is_active: bool, now: DateTime<Utc>) {
        self.is_active = is_active;
        self.updated_at = Some(now);
    }

    pub fn total_item_count(&self) -> i64 {
        self.items.iter().map(|item| item.quantity).sum()
    }

    pub fn has_items(&self) -> bool {
        !self.items.is_empty()
    }

    fn touch(&mut self, now: DateTime<Utc>) -> Result<(), InvoiceError> {
        self.total_cents = self
            .items
            .iter()
            .try_fold(0i64, |total, item| {
                item.unit_price_cents
                    .checked_mul(item.quantity)
                    .and_then(|line| total.checked_add(line))
            })
            .ok_or(InvoiceError::TotalOverflow)?;
        self.updated_at = Some(now);
        Ok(())
    }
}

/// Listing filter. `from` and `to` bound `created_date` inclusively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvoiceFilter {
    pub created_by: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl InvoiceFilter {
    pub fn validate(&self) -> Result<(), InvoiceError> {
        match (self.from, self.to) {
            (Some(from), Some(to)) if from > to => Err(InvoiceError::InvalidDateRange),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvoiceError {
    #[error("quantity must be greater than zero")]
    NonPositiveQuantity,
    #[error("unit price cannot be negative")]
    NegativeUnitPrice,
    #[error("product name is required")]
    MissingProductName,
    #[error("product is not on this invoice")]
    ItemNotFound,
    #[error("invoice total overflow")]
    TotalOverflow,
    #[error("start date cannot be after end date")]
    InvalidDateRange,
}
