//! Relational store adapter (SQLite via sqlx).

use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveDate;
use pricetrack_core::{Category, NewCategory, OutcomeKind, ProductObservation, Supermarket};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use sqlx::QueryBuilder;
use thiserror::Error;
use tracing::debug;

/// How long a writer waits for another retailer's batch to commit.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Keeps every bulk statement well below SQLite's host-parameter limit.
pub(crate) const BULK_CHUNK_ROWS: usize = 500;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("running migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("column {column} holds `{value}`, which is not a decimal")]
    InvalidDecimal { column: &'static str, value: String },
}

/// A product row as persisted, with its surrogate id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct StoredProduct {
    pub id: i64,
    pub supermarket_id: i64,
    pub product_code: String,
    pub category_id: i64,
    pub name: String,
    pub url: String,
    pub created_on: NaiveDate,
}

#[derive(Debug, sqlx::FromRow)]
struct CategoryRow {
    id: i64,
    supermarket_id: i64,
    category_code: String,
    name: String,
    last_scraped_on: Option<NaiveDate>,
    last_empty_on: Option<NaiveDate>,
}

impl From<CategoryRow> for Category {
    fn from(row: CategoryRow) -> Self {
        Self {
            id: row.id,
            supermarket_id: row.supermarket_id,
            category_code: row.category_code,
            name: row.name,
            last_scraped_on: row.last_scraped_on,
            last_empty_on: row.last_empty_on,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ObservationRow {
    product_id: i64,
    observed_on: NaiveDate,
    price: Option<String>,
    discounted_price: Option<String>,
    rating: Option<String>,
    rates_count: i64,
    unit: Option<String>,
}

impl TryFrom<ObservationRow> for ProductObservation {
    type Error = StoreError;

    fn try_from(row: ObservationRow) -> Result<Self, Self::Error> {
        Ok(Self {
            product_id: Some(row.product_id),
            observed_on: row.observed_on,
            price: decode_decimal("price", row.price)?,
            discounted_price: decode_decimal("discounted_price", row.discounted_price)?,
            rating: decode_decimal("rating", row.rating)?,
            rates_count: row.rates_count,
            unit: row.unit,
        })
    }
}

fn decode_decimal(column: &'static str, raw: Option<String>) -> Result<Option<Decimal>, StoreError> {
    raw.map(|value| {
        Decimal::from_str(&value).map_err(|_| StoreError::InvalidDecimal { column, value })
    })
    .transpose()
}

/// Decimals are persisted as their canonical text so no precision is lost.
pub(crate) fn encode_decimal(value: Option<Decimal>) -> Option<String> {
    value.map(|d| d.normalize().to_string())
}

const CATEGORY_COLUMNS: &str =
    "id, supermarket_id, category_code, name, last_scraped_on, last_empty_on";

#[derive(Debug, Clone)]
pub struct PriceStore {
    pool: SqlitePool,
}

impl PriceStore {
    /// Opens (creating if missing) the database at `database_url`. Does not migrate.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Private, migrated in-memory database. One long-lived connection so the data survives.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn supermarket_by_name(&self, name: &str) -> Result<Option<Supermarket>, StoreError> {
        let row: Option<(i64, String)> =
            sqlx::query_as("SELECT id, name FROM supermarkets WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id, name)| Supermarket { id, name }))
    }

    pub async fn supermarket_by_id(&self, id: i64) -> Result<Option<Supermarket>, StoreError> {
        let row: Option<(i64, String)> =
            sqlx::query_as("SELECT id, name FROM supermarkets WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id, name)| Supermarket { id, name }))
    }

    /// Insert-if-absent by name; an existing row is returned untouched.
    pub async fn ensure_supermarket(&self, name: &str) -> Result<Supermarket, StoreError> {
        sqlx::query("INSERT INTO supermarkets (name) VALUES (?) ON CONFLICT (name) DO NOTHING")
            .bind(name)
            .execute(&self.pool)
            .await?;
        let (id, name): (i64, String) =
            sqlx::query_as("SELECT id, name FROM supermarkets WHERE name = ?")
                .bind(name)
                .fetch_one(&self.pool)
                .await?;
        Ok(Supermarket { id, name })
    }

    /// Catalogue ingestion: new `(supermarket_id, category_code)` pairs are inserted, existing
    /// rows only get their display name refreshed. Returns the number of rows submitted.
    pub async fn upsert_categories(&self, rows: &[NewCategory]) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        for chunk in rows.chunks(BULK_CHUNK_ROWS) {
            let mut qb: QueryBuilder<'_, sqlx::Sqlite> =
                QueryBuilder::new("INSERT INTO categories (supermarket_id, category_code, name) ");
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.supermarket_id)
                    .push_bind(&row.category_code)
                    .push_bind(&row.name);
            });
            qb.push(" ON CONFLICT (supermarket_id, category_code) DO UPDATE SET name = excluded.name");
            qb.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        debug!(rows = rows.len(), "upserted categories");
        Ok(rows.len())
    }

    pub async fn supermarket_categories(&self, supermarket_id: i64) -> Result<Vec<Category>, StoreError> {
        let rows: Vec<CategoryRow> = sqlx::query_as(&format!(
            "SELECT {CATEGORY_COLUMNS} FROM categories WHERE supermarket_id = ? ORDER BY id"
        ))
        .bind(supermarket_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Category::from).collect())
    }

    pub async fn category_by_id(&self, id: i64) -> Result<Option<Category>, StoreError> {
        let row: Option<CategoryRow> =
            sqlx::query_as(&format!("SELECT {CATEGORY_COLUMNS} FROM categories WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Category::from))
    }

    /// Categories whose last scrape is older than `scraped_before` (or never happened) and
    /// that were not found empty on or after `empty_before`.
    pub async fn categories_due(
        &self,
        supermarket_id: i64,
        scraped_before: NaiveDate,
        empty_before: NaiveDate,
    ) -> Result<Vec<Category>, StoreError> {
        let rows: Vec<CategoryRow> = sqlx::query_as(&format!(
            "SELECT {CATEGORY_COLUMNS} FROM categories \
             WHERE supermarket_id = ? \
               AND (last_scraped_on IS NULL OR last_scraped_on < ?) \
               AND (last_empty_on IS NULL OR last_empty_on < ?) \
             ORDER BY id"
        ))
        .bind(supermarket_id)
        .bind(scraped_before)
        .bind(empty_before)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Category::from).collect())
    }

    /// Writes one freshness column. Returns whether the category exists.
    pub async fn set_category_outcome(
        &self,
        category_id: i64,
        kind: OutcomeKind,
        date: NaiveDate,
    ) -> Result<bool, StoreError> {
        let sql = format!("UPDATE categories SET {} = ? WHERE id = ?", kind.column());
        let result = sqlx::query(&sql)
            .bind(date)
            .bind(category_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn product_by_code(
        &self,
        supermarket_id: i64,
        product_code: &str,
    ) -> Result<Option<StoredProduct>, StoreError> {
        let row = sqlx::query_as::<_, StoredProduct>(
            "SELECT id, supermarket_id, product_code, category_id, name, url, created_on \
             FROM products WHERE supermarket_id = ? AND product_code = ?",
        )
        .bind(supermarket_id)
        .bind(product_code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Observation history of one product, oldest first.
    pub async fn observations_for_product(
        &self,
        product_id: i64,
    ) -> Result<Vec<ProductObservation>, StoreError> {
        let rows: Vec<ObservationRow> = sqlx::query_as(
            "SELECT product_id, observed_on, price, discounted_price, rating, rates_count, unit \
             FROM product_observations WHERE product_id = ? ORDER BY observed_on",
        )
        .bind(product_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ProductObservation::try_from).collect()
    }

    pub async fn count_products(&self, supermarket_id: i64) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM products WHERE supermarket_id = ?")
            .bind(supermarket_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn count_observations(&self, supermarket_id: i64) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM product_observations o \
             JOIN products p ON p.id = o.product_id \
             WHERE p.supermarket_id = ?",
        )
        .bind(supermarket_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

/// Bulk existence lookup used by the key resolver; runs on the caller's connection so it
/// sees uncommitted rows of the surrounding transaction.
pub(crate) async fn products_by_codes(
    conn: &mut SqliteConnection,
    supermarket_id: i64,
    codes: &[String],
) -> Result<Vec<(String, i64, i64)>, sqlx::Error> {
    let mut found = Vec::with_capacity(codes.len());
    for chunk in codes.chunks(BULK_CHUNK_ROWS) {
        let mut qb: QueryBuilder<'_, sqlx::Sqlite> = QueryBuilder::new(
            "SELECT product_code, id, category_id FROM products WHERE supermarket_id = ",
        );
        qb.push_bind(supermarket_id);
        qb.push(" AND product_code IN (");
        let mut separated = qb.separated(", ");
        for code in chunk {
            separated.push_bind(code);
        }
        separated.push_unseparated(")");
        let rows: Vec<(String, i64, i64)> = qb.build_query_as().fetch_all(&mut *conn).await?;
        found.extend(rows);
    }
    Ok(found)
}
