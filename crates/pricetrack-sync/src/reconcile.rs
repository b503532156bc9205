//! Reconciliation of one scraped category batch against the store.
//!
//! One transaction per batch: products are updated or inserted, ids resolved and the day's
//! observations appended. Either all of it commits or none of it does.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;
use pricetrack_core::{BatchItem, Category, ProductBatch};
use serde::Serialize;
use sqlx::sqlite::SqliteConnection;
use sqlx::QueryBuilder;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::resolver::{KeyResolver, KnownProduct};
use crate::store::{encode_decimal, PriceStore, BULK_CHUNK_ROWS};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("batch for category {category_id} is empty")]
    EmptyBatch { category_id: i64 },
    #[error("product code `{product_code}` has no surrogate id after insertion")]
    MissingIdentifier { product_code: String },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl ReconcileError {
    /// Store failures are transient from the caller's point of view; the others are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    pub observed_on: NaiveDate,
    pub products_inserted: usize,
    pub products_updated: usize,
    pub products_moved: usize,
    pub observations_inserted: usize,
    pub observations_skipped: usize,
}

#[derive(Debug, Clone)]
pub struct ReconciliationEngine {
    store: PriceStore,
}

impl ReconciliationEngine {
    pub fn new(store: PriceStore) -> Self {
        Self { store }
    }

    /// Reconcile `batch` into `category`. Every product ends up owned by `category`;
    /// observations already present for the batch date are left as they are.
    pub async fn upsert_batch(
        &self,
        category: &Category,
        batch: ProductBatch,
    ) -> Result<UpsertReport, ReconcileError> {
        if batch.is_empty() {
            return Err(ReconcileError::EmptyBatch {
                category_id: category.id,
            });
        }
        let observed_on = batch.observed_on();
        let span = info_span!(
            "upsert_batch",
            category_id = category.id,
            supermarket_id = category.supermarket_id,
            %observed_on
        );

        let items = first_occurrence_per_code(batch.into_items());
        self.commit_batch(category, observed_on, &items)
            .instrument(span)
            .await
    }

    async fn commit_batch(
        &self,
        category: &Category,
        observed_on: NaiveDate,
        items: &[BatchItem],
    ) -> Result<UpsertReport, ReconcileError> {
        // Write lock up front; a deferred read-then-write transaction cannot wait for it.
        let mut tx = self.store.pool().begin_with("BEGIN IMMEDIATE").await?;
        match apply_batch(&mut tx, category, observed_on, items).await {
            Ok(report) => {
                tx.commit().await?;
                info!(
                    inserted = report.products_inserted,
                    updated = report.products_updated,
                    observations = report.observations_inserted,
                    skipped = report.observations_skipped,
                    "batch reconciled"
                );
                Ok(report)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback after failed batch also failed");
                }
                Err(err)
            }
        }
    }
}

/// Drops repeated product codes, keeping the first occurrence.
fn first_occurrence_per_code(items: Vec<BatchItem>) -> Vec<BatchItem> {
    let total = items.len();
    let mut seen = HashSet::with_capacity(total);
    let kept: Vec<BatchItem> = items
        .into_iter()
        .filter(|item| seen.insert(item.product.product_code.clone()))
        .collect();
    if kept.len() < total {
        warn!(dropped = total - kept.len(), "batch repeats product codes; keeping first occurrence");
    }
    kept
}

async fn apply_batch(
    conn: &mut SqliteConnection,
    category: &Category,
    observed_on: NaiveDate,
    items: &[BatchItem],
) -> Result<UpsertReport, ReconcileError> {
    let resolver = KeyResolver::new(category.supermarket_id);
    let codes: Vec<String> = items
        .iter()
        .map(|item| item.product.product_code.clone())
        .collect();

    let known = resolver.known(conn, &codes).await?;
    let (existing, fresh): (Vec<&BatchItem>, Vec<&BatchItem>) = items
        .iter()
        .partition(|item| known.contains_key(&item.product.product_code));

    let products_moved = count_moved(&known, category.id);
    if products_moved > 0 {
        debug!(moved = products_moved, "products reassigned to this category");
    }

    update_existing(conn, category, &existing).await?;
    insert_new(conn, category, observed_on, &fresh).await?;

    let ids = resolver.resolve(conn, &codes).await?;
    let observations_inserted = insert_observations(conn, observed_on, items, &ids).await?;

    Ok(UpsertReport {
        observed_on,
        products_inserted: fresh.len(),
        products_updated: existing.len(),
        products_moved,
        observations_inserted,
        observations_skipped: items.len() - observations_inserted,
    })
}

fn count_moved(known: &HashMap<String, KnownProduct>, category_id: i64) -> usize {
    known
        .values()
        .filter(|product| product.category_id != category_id)
        .count()
}

/// Refreshes name, url and owning category of already-known products in one statement per chunk.
async fn update_existing(
    conn: &mut SqliteConnection,
    category: &Category,
    existing: &[&BatchItem],
) -> Result<(), ReconcileError> {
    for chunk in existing.chunks(BULK_CHUNK_ROWS) {
        let mut qb: QueryBuilder<'_, sqlx::Sqlite> =
            QueryBuilder::new("WITH src (product_code, name, url) AS (");
        qb.push_values(chunk, |mut b, item| {
            b.push_bind(&item.product.product_code)
                .push_bind(&item.product.name)
                .push_bind(&item.product.url);
        });
        qb.push(") UPDATE products SET name = src.name, url = src.url, category_id = ");
        qb.push_bind(category.id);
        qb.push(" FROM src WHERE products.product_code = src.product_code AND products.supermarket_id = ");
        qb.push_bind(category.supermarket_id);
        qb.build().execute(&mut *conn).await?;
    }
    Ok(())
}

async fn insert_new(
    conn: &mut SqliteConnection,
    category: &Category,
    observed_on: NaiveDate,
    fresh: &[&BatchItem],
) -> Result<(), ReconcileError> {
    for chunk in fresh.chunks(BULK_CHUNK_ROWS) {
        let mut qb: QueryBuilder<'_, sqlx::Sqlite> = QueryBuilder::new(
            "INSERT INTO products (supermarket_id, product_code, category_id, name, url, created_on) ",
        );
        qb.push_values(chunk, |mut b, item| {
            b.push_bind(category.supermarket_id)
                .push_bind(&item.product.product_code)
                .push_bind(category.id)
                .push_bind(&item.product.name)
                .push_bind(&item.product.url)
                .push_bind(observed_on);
        });
        qb.build().execute(&mut *conn).await?;
    }
    Ok(())
}

/// Appends the day's observations; rows already present for `(product_id, observed_on)` win.
async fn insert_observations(
    conn: &mut SqliteConnection,
    observed_on: NaiveDate,
    items: &[BatchItem],
    ids: &HashMap<String, i64>,
) -> Result<usize, ReconcileError> {
    let mut rows = Vec::with_capacity(items.len());
    for item in items {
        let product_id = ids.get(&item.product.product_code).copied().ok_or_else(|| {
            ReconcileError::MissingIdentifier {
                product_code: item.product.product_code.clone(),
            }
        })?;
        rows.push((product_id, &item.observation));
    }

    let mut inserted = 0u64;
    for chunk in rows.chunks(BULK_CHUNK_ROWS) {
        let mut qb: QueryBuilder<'_, sqlx::Sqlite> = QueryBuilder::new(
            "INSERT INTO product_observations \
             (product_id, observed_on, price, discounted_price, rating, rates_count, unit) ",
        );
        qb.push_values(chunk, |mut b, (product_id, observation)| {
            b.push_bind(*product_id)
                .push_bind(observed_on)
                .push_bind(encode_decimal(observation.price))
                .push_bind(encode_decimal(observation.discounted_price))
                .push_bind(encode_decimal(observation.rating))
                .push_bind(observation.rates_count)
                .push_bind(observation.unit.as_deref());
        });
        qb.push(" ON CONFLICT (product_id, observed_on) DO NOTHING");
        inserted += qb.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(inserted as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FreshnessTracker;
    use pricetrack_core::{FixedClock, NewCategory, OutcomeKind, Product, ProductObservation, Supermarket};
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 12, d).expect("valid date")
    }

    fn dec(raw: &str) -> Option<Decimal> {
        Some(Decimal::from_str(raw).expect("decimal"))
    }

    struct Fixture {
        store: PriceStore,
        engine: ReconciliationEngine,
        supermarket: Supermarket,
        milk: Category,
        cheese: Category,
    }

    async fn fixture() -> Fixture {
        let store = PriceStore::open_in_memory().await.expect("store");
        let supermarket = store.ensure_supermarket("Пятёрочка").await.expect("supermarket");
        store
            .upsert_categories(&[
                NewCategory {
                    supermarket_id: supermarket.id,
                    category_code: "milk".into(),
                    name: "Молочное / Молоко".into(),
                },
                NewCategory {
                    supermarket_id: supermarket.id,
                    category_code: "cheese".into(),
                    name: "Молочное / Сыры".into(),
                },
            ])
            .await
            .expect("categories");
        let categories = store.supermarket_categories(supermarket.id).await.expect("categories");
        Fixture {
            engine: ReconciliationEngine::new(store.clone()),
            store,
            supermarket,
            milk: categories[0].clone(),
            cheese: categories[1].clone(),
        }
    }

    fn batch(observed_on: NaiveDate, category: &Category, products: &[(&str, &str, &str)]) -> ProductBatch {
        let mut batch = ProductBatch::new(observed_on);
        for (code, name, price) in products {
            batch
                .push(
                    Product {
                        id: None,
                        product_code: code.to_string(),
                        category_id: category.id,
                        name: name.to_string(),
                        url: format!("https://5ka.ru/product/{code}"),
                        created_on: observed_on,
                    },
                    ProductObservation {
                        product_id: None,
                        observed_on,
                        price: dec(price),
                        discounted_price: None,
                        rating: None,
                        rates_count: 0,
                        unit: None,
                    },
                )
                .expect("same date");
        }
        batch
    }

    #[tokio::test]
    async fn known_products_are_renamed_and_new_ones_inserted() {
        let fx = fixture().await;
        fx.engine
            .upsert_batch(&fx.milk, batch(day(19), &fx.milk, &[("P1", "Old", "10.00")]))
            .await
            .expect("seed");
        let p1_before = fx
            .store
            .product_by_code(fx.supermarket.id, "P1")
            .await
            .expect("lookup")
            .expect("P1 stored");

        let report = fx
            .engine
            .upsert_batch(
                &fx.milk,
                batch(day(20), &fx.milk, &[("P1", "New", "11.00"), ("P2", "Second", "5.50")]),
            )
            .await
            .expect("reconcile");

        assert_eq!(report.observed_on, day(20));
        assert_eq!(report.products_updated, 1);
        assert_eq!(report.products_inserted, 1);
        assert_eq!(report.observations_inserted, 2);

        let p1 = fx
            .store
            .product_by_code(fx.supermarket.id, "P1")
            .await
            .expect("lookup")
            .expect("P1 stored");
        assert_eq!(p1.id, p1_before.id);
        assert_eq!(p1.name, "New");
        assert_eq!(p1.created_on, day(19));

        let p2 = fx
            .store
            .product_by_code(fx.supermarket.id, "P2")
            .await
            .expect("lookup")
            .expect("P2 stored");
        assert_ne!(p2.id, p1.id);
        assert_eq!(p2.created_on, day(20));

        let count_for_day: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM product_observations WHERE observed_on = ?",
        )
        .bind(day(20))
        .fetch_one(fx.store.pool())
        .await
        .expect("count");
        assert_eq!(count_for_day, 2);
    }

    #[tokio::test]
    async fn replaying_a_batch_adds_nothing() {
        let fx = fixture().await;
        let first = batch(day(20), &fx.milk, &[("P1", "Молоко", "89.99"), ("P2", "Кефир", "74.50")]);
        fx.engine.upsert_batch(&fx.milk, first.clone()).await.expect("first");
        let products = fx.store.count_products(fx.supermarket.id).await.expect("count");
        let observations = fx.store.count_observations(fx.supermarket.id).await.expect("count");

        let replay = fx.engine.upsert_batch(&fx.milk, first).await.expect("replay");
        assert_eq!(replay.products_inserted, 0);
        assert_eq!(replay.observations_inserted, 0);
        assert_eq!(replay.observations_skipped, 2);
        assert_eq!(fx.store.count_products(fx.supermarket.id).await.expect("count"), products);
        assert_eq!(
            fx.store.count_observations(fx.supermarket.id).await.expect("count"),
            observations
        );
    }

    #[tokio::test]
    async fn first_observation_of_the_day_wins() {
        let fx = fixture().await;
        fx.engine
            .upsert_batch(&fx.milk, batch(day(20), &fx.milk, &[("P1", "Молоко", "89.99")]))
            .await
            .expect("first");
        fx.engine
            .upsert_batch(&fx.milk, batch(day(20), &fx.milk, &[("P1", "Молоко", "120.00")]))
            .await
            .expect("second");

        let p1 = fx
            .store
            .product_by_code(fx.supermarket.id, "P1")
            .await
            .expect("lookup")
            .expect("P1 stored");
        let history = fx.store.observations_for_product(p1.id).await.expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].price, dec("89.99"));
        assert_eq!(history[0].product_id, Some(p1.id));
    }

    #[tokio::test]
    async fn products_follow_the_category_they_were_last_seen_in() {
        let fx = fixture().await;
        fx.engine
            .upsert_batch(&fx.milk, batch(day(19), &fx.milk, &[("P1", "Сыр", "300.00")]))
            .await
            .expect("seed");
        let report = fx
            .engine
            .upsert_batch(&fx.cheese, batch(day(20), &fx.cheese, &[("P1", "Сыр", "310.00")]))
            .await
            .expect("move");
        assert_eq!(report.products_moved, 1);
        assert_eq!(report.products_inserted, 0);

        let p1 = fx
            .store
            .product_by_code(fx.supermarket.id, "P1")
            .await
            .expect("lookup")
            .expect("P1 stored");
        assert_eq!(p1.category_id, fx.cheese.id);
        assert_eq!(fx.store.observations_for_product(p1.id).await.expect("history").len(), 2);
    }

    #[tokio::test]
    async fn failed_insert_rolls_back_the_whole_batch() {
        let fx = fixture().await;
        fx.engine
            .upsert_batch(&fx.milk, batch(day(19), &fx.milk, &[("P1", "Old", "10.00")]))
            .await
            .expect("seed");

        // An empty code violates the products CHECK constraint after P1 was already updated.
        let err = fx
            .engine
            .upsert_batch(&fx.milk, batch(day(20), &fx.milk, &[("P1", "New", "11.00"), ("", "Broken", "1.00")]))
            .await
            .expect_err("insert must fail");
        assert!(err.is_retryable());

        let p1 = fx
            .store
            .product_by_code(fx.supermarket.id, "P1")
            .await
            .expect("lookup")
            .expect("P1 stored");
        assert_eq!(p1.name, "Old");
        assert_eq!(fx.store.count_products(fx.supermarket.id).await.expect("count"), 1);
        assert_eq!(fx.store.count_observations(fx.supermarket.id).await.expect("count"), 1);
    }

    #[tokio::test]
    async fn empty_batches_are_rejected_before_touching_the_store() {
        let fx = fixture().await;
        let err = fx
            .engine
            .upsert_batch(&fx.milk, ProductBatch::new(day(20)))
            .await
            .expect_err("empty batch");
        assert!(matches!(err, ReconcileError::EmptyBatch { category_id } if category_id == fx.milk.id));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn repeated_codes_keep_the_first_item() {
        let fx = fixture().await;
        let report = fx
            .engine
            .upsert_batch(
                &fx.milk,
                batch(day(20), &fx.milk, &[("P1", "First", "1.00"), ("P1", "Second", "2.00")]),
            )
            .await
            .expect("reconcile");
        assert_eq!(report.products_inserted, 1);
        let p1 = fx
            .store
            .product_by_code(fx.supermarket.id, "P1")
            .await
            .expect("lookup")
            .expect("P1 stored");
        assert_eq!(p1.name, "First");
    }

    #[tokio::test]
    async fn returned_date_feeds_the_freshness_tracker() {
        let fx = fixture().await;
        let tracker = FreshnessTracker::new(fx.store.clone(), FixedClock(day(20)));
        let report = fx
            .engine
            .upsert_batch(&fx.milk, batch(day(20), &fx.milk, &[("P1", "Молоко", "89.99")]))
            .await
            .expect("reconcile");
        tracker
            .record_outcome(&fx.milk, report.observed_on, OutcomeKind::Scraped)
            .await
            .expect("outcome");
        let milk = fx.store.category_by_id(fx.milk.id).await.expect("lookup").expect("milk");
        assert_eq!(milk.last_scraped_on, Some(day(20)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_batches_for_different_supermarkets_all_commit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("prices.db").display());
        let store = PriceStore::connect(&url).await.expect("store");
        store.migrate().await.expect("migrate");
        let engine = ReconciliationEngine::new(store.clone());

        let mut targets = Vec::new();
        for name in ["Пятёрочка", "Магнит", "Лента", "Перекрёсток"] {
            let supermarket = store.ensure_supermarket(name).await.expect("supermarket");
            store
                .upsert_categories(&[NewCategory {
                    supermarket_id: supermarket.id,
                    category_code: "dairy".into(),
                    name: "Молочное".into(),
                }])
                .await
                .expect("category");
            let category = store.supermarket_categories(supermarket.id).await.expect("categories")[0].clone();
            targets.push((supermarket, category));
        }

        let codes: Vec<String> = (0..300).map(|i| format!("SKU{i:04}")).collect();
        for round in 1..=5u32 {
            let mut handles = Vec::new();
            for (_, category) in &targets {
                let engine = engine.clone();
                let category = category.clone();
                let codes = codes.clone();
                handles.push(tokio::spawn(async move {
                    let rows: Vec<(&str, &str, &str)> =
                        codes.iter().map(|code| (code.as_str(), "Товар", "9.90")).collect();
                    engine.upsert_batch(&category, batch(day(round), &category, &rows)).await
                }));
            }
            for handle in handles {
                handle.await.expect("task").expect("batch commits");
            }
        }

        for (supermarket, _) in &targets {
            assert_eq!(store.count_products(supermarket.id).await.expect("count"), 300);
            assert_eq!(store.count_observations(supermarket.id).await.expect("count"), 1500);
        }
    }
}
