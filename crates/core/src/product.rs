use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_LOW_STOCK_THRESHOLD: i64 = 10;
pub const MAX_PRODUCT_NAME_LENGTH: usize = 100;

/// Inventory item. Money is kept in minor units (cents).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub cost_per_item_cents: i64,
    pub number_in_stock: i64,
    pub is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    pub fn total_value_cents(&self) -> i64 {
        self.cost_per_item_cents.saturating_mul(self.number_in_stock)
    }

    pub fn is_in_stock(&self) -> bool {
        self.number_in_stock > 0
    }

    pub fn is_low_stock(&self, threshold: i64) -> bool {
        self.number_in_stock <= threshold
    }

    pub fn stock_level(&self, threshold: i64) -> StockLevel {
        StockLevel::classify(self.number_in_stock, threshold)
    }
}

/// Validated input for creating or replacing product details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductDraft {
    pub name: String,
    pub cost_per_item_cents: i64,
    pub number_in_stock: i64,
    pub is_active: bool,
    pub image_url: Option<String>,
}

impl ProductDraft {
    pub fn new(
        name: &str,
        cost_per_item_cents: i64,
        number_in_stock: i64,
        is_active: bool,
        image_url: Option<String>,
    ) -> Result<Self, ProductError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ProductError::MissingName);
        }
        if name.chars().count() > MAX_PRODUCT_NAME_LENGTH {
            return Err(ProductError::NameTooLong);
        }
        if cost_per_item_cents < 0 {
            return Err(ProductError::NegativeCost);
        }
        if number_in_stock < 0 {
            return Err(ProductError::NegativeStock);
        }
        Ok(Self {
            name: name.to_string(),
            cost_per_item_cents,
            number_in_stock,
            is_active,
            image_url: image_url
                .map(|url| url.trim().to_string())
                .filter(|url| !url.is_empty()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "quantity", rename_all = "snake_case")]
pub enum StockAdjustment {
    Set(i64),
    Add(i64),
    Remove(i64),
}

impl StockAdjustment {
    /// Computes the resulting stock for `current`.
    pub fn apply(self, current: i64) -> Result<i64, ProductError> {
        match self {
            Self::Set(quantity) if quantity < 0 => Err(ProductError::NegativeStock),
            Self::Set(quantity) => Ok(quantity),
            Self::Add(quantity) | Self::Remove(quantity) if quantity <= 0 => {
                Err(ProductError::NonPositiveQuantity)
            }
            Self::Add(quantity) => current
                .checked_add(quantity)
                .ok_or(ProductError::StockOverflow),
            Self::Remove(quantity) if quantity > current => Err(ProductError::InsufficientStock {
                available: current,
                requested: quantity,
            }),
            Self::Remove(quantity) => Ok(current - quantity),
        }
    }

    pub fn kind(self) -> &'static str {
        match self {
            Self::Set(_) => "set",
            Self::Add(_) => "add",
            Self::Remove(_) => "remove",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockLevel {
    OutOfStock,
    Low,
    Healthy,
}

impl StockLevel {
    pub fn classify(stock: i64, threshold: i64) -> Self {
        if stock <= 0 {
            Self::OutOfStock
        } else if stock <= threshold {
            Self::Low
        } else {
            Self::Healthy
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OutOfStock => "out_of_stock",
            Self::Low => "low",
            Self::Healthy => "healthy",
        }
    }
}

/// Outcome of a stock adjustment, used to decide whether to alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockChange {
    pub previous: i64,
    pub current: i64,
}

impl StockChange {
    /// Returns the new level when the change moved the product into a worse level.
    pub fn alert_level(&self, threshold: i64) -> Option<StockLevel> {
        let before = StockLevel::classify(self.previous, threshold);
        let after = StockLevel::classify(self.current, threshold);
        (after < before).then_some(after)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProductFilter {
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
}

impl ProductFilter {
    pub fn threshold(&self) -> i64 {
        self.low_stock_threshold
            .unwrap_or(DEFAULT_LOW_STOCK_THRESHOLD)
            .max(0)
    }

    pub fn search_term(&self) -> Option<&str> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|term| !term.is_empty())
    }

    pub fn matches(&self, product: &Product) -> bool {
        if self.active_only && !product.is_active {
            return false;
        }
        if self.in_stock_only && !product.is_in_stock() {
            return false;
        }
        if self.low_stock_only && !product.is_low_stock(self.threshold()) {
            return false;
        }
        match self.search_term() {
            Some(term) => product
                .name
                .to_lowercase()
                .contains(&term.to_lowercase()),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardStats {
    pub total_products: i64,
    pub total_value_cents: i64,
    pub low_stock_count: i64,
    pub out_of_stock_count: i64,
    pub in_stock_count: i64,
}

impl DashboardStats {
    /// Aggregates over the active products in `products`.
    pub fn compute<'a>(products: impl IntoIterator<Item = &'a Product>, threshold: i64) -> Self {
        products
            .into_iter()
            .filter(|p| p.is_active)
            .fold(Self::default(), |mut stats, product| {
                stats.total_products += 1;
                stats.total_value_cents += product.total_value_cents();
                match product.stock_level(threshold) {
                    StockLevel::OutOfStock => stats.out_of_stock_count += 1,
                    StockLevel::Low => {
                        stats.low_stock_count += 1;
                        stats.in_stock_count += 1;
                    }
                    StockLevel::Healthy => stats.in_stock_count += 1,
                }
                stats
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProductError {
    #[error("product name is required")]
    MissingName,
    #[error("product name must be at most 100 characters")]
    NameTooLong,
    #[error("cost per item cannot be negative")]
    NegativeCost,
    #[error("stock cannot be negative")]
    NegativeStock,
    #[error("quantity must be greater than zero")]
    NonPositiveQuantity,
    #[error("insufficient stock: {available} available, {requested} requested")]
    InsufficientStock { available: i64, requested: i64 },
    #[error("stock value overflow")]
    StockOverflow,
}
