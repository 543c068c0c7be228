use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use thiserror::Error;

use stockflow_core::paging::{Page, PageRequest};
use stockflow_core::product::{
    DashboardStats, Product, ProductDraft, ProductError, ProductFilter, StockAdjustment,
    StockChange,
};

use crate::{like_pattern, to_rfc3339};

const PRODUCT_COLUMNS: &str =
    "id, name, cost_per_item_cents, number_in_stock, is_active, image_url, created_at, updated_at";

/// Repository for inventory products.
#[derive(Clone)]
pub struct ProductRepository {
    pool: SqlitePool,
}

#[derive(Debug, sqlx::FromRow)]
struct ProductRow {
    id: String,
    name: String,
    cost_per_item_cents: i64,
    number_in_stock: i64,
    is_active: bool,
    image_url: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ProductRow> for Product {
    fn from(row: ProductRow) -> Self {
        Product {
            id: row.id,
            name: row.name,
            cost_per_item_cents: row.cost_per_item_cents,
            number_in_stock: row.number_in_stock,
            is_active: row.is_active,
            image_url: row.image_url,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

impl ProductRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(
        &self,
        id: &str,
        draft: &ProductDraft,
        now: DateTime<Utc>,
    ) -> Result<Product, ProductRepoError> {
        let stamp = to_rfc3339(now);
        sqlx::query(
            "INSERT INTO products \
             (id, name, cost_per_item_cents, number_in_stock, is_active, image_url, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(&draft.name)
        .bind(draft.cost_per_item_cents)
        .bind(draft.number_in_stock)
        .bind(draft.is_active)
        .bind(&draft.image_url)
        .bind(&stamp)
        .bind(&stamp)
        .execute(&self.pool)
        .await?;

        self.find(id).await?.ok_or(ProductRepoError::NotFound)
    }

    pub async fn find(&self, id: &str) -> Result<Option<Product>, ProductRepoError> {
        let row = sqlx::query_as::<_, ProductRow>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Product::from))
    }

    /// Replaces the product details, including the stock count.
    pub async fn update(
        &self,
        id: &str,
        draft: &ProductDraft,
        now: DateTime<Utc>,
    ) -> Result<(Product, StockChange), ProductRepoError> {
        let mut tx = self.pool.begin().await?;
        let previous: Option<i64> =
            sqlx::query_scalar("SELECT number_in_stock FROM products WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(previous) = previous else {
            return Err(ProductRepoError::NotFound);
        };

        sqlx::query(
            "UPDATE products SET name = ?, cost_per_item_cents = ?, number_in_stock = ?, \
             is_active = ?, image_url = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&draft.name)
        .bind(draft.cost_per_item_cents)
        .bind(draft.number_in_stock)
        .bind(draft.is_active)
        .bind(&draft.image_url)
        .bind(to_rfc3339(now))
        .bind(id)
        .execute(&mut *tx)
        .await?;

        let product: Product = sqlx::query_as::<_, ProductRow>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE id = ?"
        ))
        .bind(id)
        .fetch_one(&mut *tx)
        .await?
        .into();
        tx.commit().await?;

        let change = StockChange {
            previous,
            current: product.number_in_stock,
        };
        Ok((product, change))
    }

    /// Applies a stock adjustment inside a transaction so concurrent adjustments
    /// never read a stale count.
    pub async fn adjust_stock(
        &self,
        id: &str,
        adjustment: StockAdjustment,
        now: DateTime<Utc>,
    ) -> Result<(Product, StockChange), ProductRepoError> {
        let mut tx = self.pool.begin().await?;
        // Take the write lock before reading.
        sqlx::query("UPDATE products SET updated_at = updated_at WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let previous: Option<i64> =
            sqlx::query_scalar("SELECT number_in_stock FROM products WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(previous) = previous else {
            return Err(ProductRepoError::NotFound);
        };
        let current = adjustment.apply(previous)?;

        sqlx::query("UPDATE products SET number_in_stock = ?, updated_at = ? WHERE id = ?")
            .bind(current)
            .bind(to_rfc3339(now))
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let product: Product = sqlx::query_as::<_, ProductRow>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE id = ?"
        ))
        .bind(id)
        .fetch_one(&mut *tx)
        .await?
        .into();
        tx.commit().await?;

        Ok((product, StockChange { previous, current }))
    }

    pub async fn delete(&self, id: &str) -> Result<(), ProductRepoError> {
        let done = sqlx::query("DELETE FROM products WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(ProductRepoError::NotFound);
        }
        Ok(())
    }

    /// Filtered listing ordered by name.
    pub async fn page(
        &self,
        filter: &ProductFilter,
        request: PageRequest,
    ) -> Result<Page<Product>, ProductRepoError> {
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM products WHERE 1 = 1");
        push_filter(&mut count, filter);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE 1 = 1"
        ));
        push_filter(&mut select, filter);
        select
            .push(" ORDER BY name COLLATE NOCASE, id LIMIT ")
            .push_bind(request.limit())
            .push(" OFFSET ")
            .push_bind(request.offset());
        let rows: Vec<ProductRow> = select.build_query_as().fetch_all(&self.pool).await?;

        Ok(Page::new(
            rows.into_iter().map(Product::from).collect(),
            total,
            request,
        ))
    }

    /// Active products whose name contains `term`, for type-ahead lookups.
    pub async fn search(&self, term: &str, limit: i64) -> Result<Vec<Product>, ProductRepoError> {
        let rows = sqlx::query_as::<_, ProductRow>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products \
             WHERE is_active = 1 AND name LIKE ? ESCAPE '\\' \
             ORDER BY name COLLATE NOCASE LIMIT ?"
        ))
        .bind(like_pattern(term.trim()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Product::from).collect())
    }

    /// Same figures as [`DashboardStats::compute`], aggregated in SQL.
    pub async fn dashboard_stats(&self, threshold: i64) -> Result<DashboardStats, ProductRepoError> {
        let (total_products, total_value_cents, low_stock_count, out_of_stock_count, in_stock_count): (
            i64,
            i64,
            i64,
            i64,
            i64,
        ) = sqlx::query_as(
            "SELECT COUNT(*), \
                    COALESCE(SUM(cost_per_item_cents * number_in_stock), 0), \
                    COALESCE(SUM(CASE WHEN number_in_stock > 0 AND number_in_stock <= ? THEN 1 ELSE 0 END), 0), \
                    COALESCE(SUM(CASE WHEN number_in_stock <= 0 THEN 1 ELSE 0 END), 0), \
                    COALESCE(SUM(CASE WHEN number_in_stock > 0 THEN 1 ELSE 0 END), 0) \
             FROM products WHERE is_active = 1",
        )
        .bind(threshold)
        .fetch_one(&self.pool)
        .await?;

        Ok(DashboardStats {
            total_products,
            total_value_cents,
            low_stock_count,
            out_of_stock_count,
            in_stock_count,
        })
    }
}

fn push_filter(builder: &mut QueryBuilder<'_, Sqlite>, filter: &ProductFilter) {
    if filter.active_only {
        builder.push(" AND is_active = 1");
    }
    if filter.in_stock_only {
        builder.push(" AND number_in_stock > 0");
    }
    if filter.low_stock_only {
        builder
            .push(" AND number_in_stock <= ")
            .push_bind(filter.threshold());
    }
    if let Some(term) = filter.search_term() {
        builder
            .push(" AND name LIKE ")
            .push_bind(like_pattern(term))
            .push(" ESCAPE '\\'");
    }
}

#[derive(Debug, Error)]
pub enum ProductRepoError {
    #[error("product not found")]
    NotFound,
    #[error(transparent)]
    Invalid(#[from] ProductError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    async fn seed(repo: &ProductRepository, id: &str, name: &str, cost: i64, stock: i64) -> Product {
        let draft = ProductDraft::new(name, cost, stock, true, None).expect("valid draft");
        repo.insert(id, &draft, Utc::now()).await.expect("insert")
    }

    #[tokio::test]
    async fn adjust_stock_reports_change_and_rejects_overdraw() {
        let (db, _dir) = test_support::database().await;
        let repo = db.products();
        seed(&repo, "p-1", "Widget", 250, 12).await;

        let (product, change) = repo
            .adjust_stock("p-1", StockAdjustment::Remove(5), Utc::now())
            .await
            .expect("remove");
        assert_eq!(product.number_in_stock, 7);
        assert_eq!(change, StockChange { previous: 12, current: 7 });

        let err = repo
            .adjust_stock("p-1", StockAdjustment::Remove(8), Utc::now())
            .await
            .expect_err("overdraw");
        assert!(matches!(
            err,
            ProductRepoError::Invalid(ProductError::InsufficientStock {
                available: 7,
                requested: 8
            })
        ));

        assert!(matches!(
            repo.adjust_stock("missing", StockAdjustment::Add(1), Utc::now())
                .await,
            Err(ProductRepoError::NotFound)
        ));
    }

    #[tokio::test]
    async fn page_applies_filters() {
        let (db, _dir) = test_support::database().await;
        let repo = db.products();
        seed(&repo, "p-1", "Blue Widget", 100, 0).await;
        seed(&repo, "p-2", "Red Widget", 100, 4).await;
        seed(&repo, "p-3", "Gadget", 100, 40).await;
        let inactive = ProductDraft::new("Old Widget", 100, 3, false, None).expect("draft");
        repo.insert("p-4", &inactive, Utc::now()).await.expect("insert");

        let low = repo
            .page(
                &ProductFilter {
                    active_only: true,
                    low_stock_only: true,
                    ..Default::default()
                },
                PageRequest::default(),
            )
            .await
            .expect("page");
        let names: Vec<_> = low.items.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Blue Widget", "Red Widget"]);

        let search = repo
            .page(
                &ProductFilter {
                    in_stock_only: true,
                    search: Some(" widget ".into()),
                    ..Default::default()
                },
                PageRequest::default(),
            )
            .await
            .expect("page");
        assert_eq!(search.total_count, 2);
    }

    #[tokio::test]
    async fn dashboard_matches_in_memory_computation() {
        let (db, _dir) = test_support::database().await;
        let repo = db.products();
        let mut all = vec![
            seed(&repo, "p-1", "A", 100, 0).await,
            seed(&repo, "p-2", "B", 250, 5).await,
            seed(&repo, "p-3", "C", 10, 50).await,
        ];
        let inactive = ProductDraft::new("D", 999, 9, false, None).expect("draft");
        all.push(repo.insert("p-4", &inactive, Utc::now()).await.expect("insert"));

        let stats = repo.dashboard_stats(10).await.expect("stats");
        assert_eq!(stats, DashboardStats::compute(&all, 10));
        assert_eq!(stats.total_products, 3);
        assert_eq!(stats.total_value_cents, 1250 + 500);
        assert_eq!(stats.low_stock_count, 1);
        assert_eq!(stats.out_of_stock_count, 1);
        assert_eq!(stats.in_stock_count, 2);
    }

    #[tokio::test]
    async fn update_returns_stock_change() {
        let (db, _dir) = test_support::database().await;
        let repo = db.products();
        seed(&repo, "p-1", "Widget", 100, 20).await;

        let draft = ProductDraft::new("Widget v2", 120, 3, true, None).expect("draft");
        let (product, change) = repo.update("p-1", &draft, Utc::now()).await.expect("update");
        assert_eq!(product.name, "Widget v2");
        assert_eq!(change.previous, 20);
        assert_eq!(change.current, 3);

        repo.delete("p-1").await.expect("delete");
        assert!(matches!(repo.delete("p-1").await, Err(ProductRepoError::NotFound)));
    }
}
