use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use thiserror::Error;

use stockflow_core::invoice::{Invoice, InvoiceError, InvoiceFilter, InvoiceItem};
use stockflow_core::paging::{Page, PageRequest};

use crate::{is_foreign_key_violation, opt_rfc3339, to_rfc3339};

const INVOICE_COLUMNS: &str =
    "id, created_by, created_date, total_cents, is_active, created_at, updated_at";
const ITEM_COLUMNS: &str =
    "invoice_id, product_id, product_name, unit_price_cents, quantity, created_at, updated_at";

/// Invoices and their lines. Lines are always written together with the header.
#[derive(Clone)]
pub struct InvoiceRepository {
    pool: SqlitePool,
}

#[derive(Debug, sqlx::FromRow)]
struct InvoiceRow {
    id: String,
    created_by: String,
    created_date: DateTime<Utc>,
    total_cents: i64,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
}

impl InvoiceRow {
    fn into_invoice(self, items: Vec<InvoiceItem>) -> Invoice {
        Invoice {
            id: self.id,
            created_by: self.created_by,
            created_date: self.created_date,
            total_cents: self.total_cents,
            is_active: self.is_active,
            created_at: self.created_at,
            updated_at: self.updated_at,
            items,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ItemRow {
    invoice_id: String,
    product_id: String,
    product_name: String,
    unit_price_cents: i64,
    quantity: i64,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
}

impl From<ItemRow> for InvoiceItem {
    fn from(row: ItemRow) -> Self {
        InvoiceItem {
            product_id: row.product_id,
            product_name: row.product_name,
            unit_price_cents: row.unit_price_cents,
            quantity: row.quantity,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

impl InvoiceRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, invoice: &Invoice) -> Result<(), InvoiceRepoError> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(&format!(
            "INSERT INTO invoices ({INVOICE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&invoice.id)
        .bind(&invoice.created_by)
        .bind(to_rfc3339(invoice.created_date))
        .bind(invoice.total_cents)
        .bind(invoice.is_active)
        .bind(to_rfc3339(invoice.created_at))
        .bind(opt_rfc3339(invoice.updated_at))
        .execute(&mut *tx)
        .await;
        match inserted {
            Ok(_) => {}
            Err(err) if is_foreign_key_violation(&err) => return Err(InvoiceRepoError::UnknownUser),
            Err(err) => return Err(err.into()),
        }
        write_items(&mut *tx, invoice).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn find(&self, id: &str) -> Result<Option<Invoice>, InvoiceRepoError> {
        let mut conn = self.pool.acquire().await?;
        load(&mut *conn, id).await
    }

    /// Loads the invoice under the write lock, applies `change` and persists
    /// the result. A failing `change` leaves the stored invoice untouched.
    pub async fn modify<F>(&self, id: &str, change: F) -> Result<Invoice, InvoiceRepoError>
    where
        F: FnOnce(&mut Invoice) -> Result<(), InvoiceError>,
    {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE invoices SET id = id WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let Some(mut invoice) = load(&mut *tx, id).await? else {
            return Err(InvoiceRepoError::NotFound);
        };
        change(&mut invoice)?;

        sqlx::query(
            "UPDATE invoices SET created_date = ?, total_cents = ?, is_active = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(to_rfc3339(invoice.created_date))
        .bind(invoice.total_cents)
        .bind(invoice.is_active)
        .bind(opt_rfc3339(invoice.updated_at))
        .bind(&invoice.id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM invoice_items WHERE invoice_id = ?")
            .bind(&invoice.id)
            .execute(&mut *tx)
            .await?;
        write_items(&mut *tx, &invoice).await?;
        tx.commit().await?;
        Ok(invoice)
    }

    pub async fn delete(&self, id: &str) -> Result<(), InvoiceRepoError> {
        let done = sqlx::query("DELETE FROM invoices WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(InvoiceRepoError::NotFound);
        }
        Ok(())
    }

    /// Newest `created_date` first.
    pub async fn page(
        &self,
        filter: &InvoiceFilter,
        request: PageRequest,
    ) -> Result<Page<Invoice>, InvoiceRepoError> {
        filter.validate()?;

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM invoices WHERE 1 = 1");
        push_filter(&mut count, filter);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE 1 = 1"
        ));
        push_filter(&mut select, filter);
        select
            .push(" ORDER BY created_date DESC, id LIMIT ")
            .push_bind(request.limit())
            .push(" OFFSET ")
            .push_bind(request.offset());
        let rows: Vec<InvoiceRow> = select.build_query_as().fetch_all(&self.pool).await?;

        let mut items = self.items_for(rows.iter().map(|row| row.id.as_str())).await?;
        let invoices = rows
            .into_iter()
            .map(|row| {
                let lines = items.remove(&row.id).unwrap_or_default();
                row.into_invoice(lines)
            })
            .collect();
        Ok(Page::new(invoices, total, request))
    }

    async fn items_for<'a>(
        &self,
        ids: impl Iterator<Item = &'a str>,
    ) -> Result<HashMap<String, Vec<InvoiceItem>>, InvoiceRepoError> {
        let ids: Vec<&str> = ids.collect();
        let mut grouped: HashMap<String, Vec<InvoiceItem>> = HashMap::new();
        if ids.is_empty() {
            return Ok(grouped);
        }

        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {ITEM_COLUMNS} FROM invoice_items WHERE invoice_id IN ("
        ));
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(id);
        }
        query.push(") ORDER BY invoice_id, position");
        let rows: Vec<ItemRow> = query.build_query_as().fetch_all(&self.pool).await?;
        for row in rows {
            grouped
                .entry(row.invoice_id.clone())
                .or_default()
                .push(row.into());
        }
        Ok(grouped)
    }
}

async fn load(conn: &mut SqliteConnection, id: &str) -> Result<Option<Invoice>, InvoiceRepoError> {
    let row = sqlx::query_as::<_, InvoiceRow>(&format!(
        "SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };

    let items = sqlx::query_as::<_, ItemRow>(&format!(
        "SELECT {ITEM_COLUMNS} FROM invoice_items WHERE invoice_id = ? ORDER BY position"
    ))
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(Some(
        row.into_invoice(items.into_iter().map(InvoiceItem::from).collect()),
    ))
}

async fn write_items(conn: &mut SqliteConnection, invoice: &Invoice) -> Result<(), sqlx::Error> {
    for (position, item) in invoice.items.iter().enumerate() {
        sqlx::query(
            "INSERT INTO invoice_items \
             (invoice_id, product_id, position, product_name, unit_price_cents, quantity, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&invoice.id)
        .bind(&item.product_id)
        .bind(position as i64)
        .bind(&item.product_name)
        .bind(item.unit_price_cents)
        .bind(item.quantity)
        .bind(to_rfc3339(item.created_at))
        .bind(opt_rfc3339(item.updated_at))
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

fn push_filter(builder: &mut QueryBuilder<'_, Sqlite>, filter: &InvoiceFilter) {
    if let Some(created_by) = &filter.created_by {
        builder.push(" AND created_by = ").push_bind(created_by.clone());
    }
    if let Some(from) = filter.from {
        builder.push(" AND created_date >= ").push_bind(to_rfc3339(from));
    }
    if let Some(to) = filter.to {
        builder.push(" AND created_date <= ").push_bind(to_rfc3339(to));
    }
}

#[derive(Debug, Error)]
pub enum InvoiceRepoError {
    #[error("invoice not found")]
    NotFound,
    #[error("invoice owner does not exist")]
    UnknownUser,
    #[error(transparent)]
    Invalid(#[from] InvoiceError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use crate::users::tests::create_user;
    use chrono::{Duration, TimeZone};

    fn day(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, day, 12, 0, 0).unwrap()
    }

    async fn seeded() -> (crate::Database, tempfile::TempDir) {
        let (db, dir) = test_support::database().await;
        create_user(&db, "u-1", "one@example.com", "manager").await;
        create_user(&db, "u-2", "two@example.com", "manager").await;
        (db, dir)
    }

    #[tokio::test]
    async fn insert_and_modify_keep_lines_in_order() {
        let (db, _dir) = seeded().await;
        let repo = db.invoices();

        let mut invoice = Invoice::new("inv-1".into(), "u-1", Some(day(2)), day(2));
        invoice.add_item("p-2", "Nut", 40, 10, day(2)).unwrap();
        invoice.add_item("p-1", "Bolt", 250, 2, day(2)).unwrap();
        repo.insert(&invoice).await.expect("insert");

        let stored = repo.find("inv-1").await.expect("find").expect("exists");
        assert_eq!(stored, invoice);

        let updated = repo
            .modify("inv-1", |invoice| {
                invoice.update_item_quantity("p-2", 0, day(3))?;
                invoice.add_item("p-3", "Washer", 5, 100, day(3))
            })
            .await
            .expect("modify");
        let ids: Vec<_> = updated.items.iter().map(|i| i.product_id.as_str()).collect();
        assert_eq!(ids, vec!["p-1", "p-3"]);
        assert_eq!(updated.total_cents, 500 + 500);
        assert_eq!(repo.find("inv-1").await.expect("find"), Some(updated));
    }

    #[tokio::test]
    async fn failed_change_is_not_persisted() {
        let (db, _dir) = seeded().await;
        let repo = db.invoices();
        let mut invoice = Invoice::new("inv-1".into(), "u-1", None, day(2));
        invoice.add_item("p-1", "Bolt", 250, 2, day(2)).unwrap();
        repo.insert(&invoice).await.expect("insert");

        let err = repo
            .modify("inv-1", |invoice| {
                invoice.remove_item("p-1", day(3))?;
                invoice.remove_item("p-1", day(3))
            })
            .await
            .expect_err("second removal fails");
        assert!(matches!(err, InvoiceRepoError::Invalid(InvoiceError::ItemNotFound)));
        assert_eq!(repo.find("inv-1").await.expect("find"), Some(invoice));

        assert!(matches!(
            repo.modify("missing", |_| Ok(())).await,
            Err(InvoiceRepoError::NotFound)
        ));
    }

    #[tokio::test]
    async fn unknown_owner_is_rejected() {
        let (db, _dir) = seeded().await;
        let invoice = Invoice::new("inv-1".into(), "ghost", None, day(2));
        assert!(matches!(
            db.invoices().insert(&invoice).await,
            Err(InvoiceRepoError::UnknownUser)
        ));
    }

    #[tokio::test]
    async fn page_filters_by_owner_and_date() {
        let (db, _dir) = seeded().await;
        let repo = db.invoices();
        for (id, owner, date) in [
            ("inv-1", "u-1", day(1)),
            ("inv-2", "u-1", day(5)),
            ("inv-3", "u-2", day(9)),
        ] {
            let mut invoice = Invoice::new(id.into(), owner, Some(date), date);
            invoice.add_item("p-1", "Bolt", 100, 1, date).unwrap();
            repo.insert(&invoice).await.expect("insert");
        }

        let all = repo
            .page(&InvoiceFilter::default(), PageRequest::default())
            .await
            .expect("page");
        let ids: Vec<_> = all.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["inv-3", "inv-2", "inv-1"]);
        assert!(all.items.iter().all(|i| i.items.len() == 1));

        let mine = repo
            .page(
                &InvoiceFilter {
                    created_by: Some("u-1".into()),
                    from: Some(day(2)),
                    to: Some(day(9) + Duration::hours(1)),
                },
                PageRequest::default(),
            )
            .await
            .expect("page");
        assert_eq!(mine.total_count, 1);
        assert_eq!(mine.items[0].id, "inv-2");

        let inverted = InvoiceFilter {
            from: Some(day(9)),
            to: Some(day(1)),
            ..Default::default()
        };
        assert!(matches!(
            repo.page(&inverted, PageRequest::default()).await,
            Err(InvoiceRepoError::Invalid(InvoiceError::InvalidDateRange))
        ));

        repo.delete("inv-1").await.expect("delete");
        assert!(matches!(repo.delete("inv-1").await, Err(InvoiceRepoError::NotFound)));
        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM invoice_items")
            .fetch_one(db.pool())
            .await
            .expect("count");
        assert_eq!(remaining, 2);
    }
}
