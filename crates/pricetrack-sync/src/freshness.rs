//! Category freshness: which category is due for a scrape, and the outcome bookkeeping.

use chrono::{Duration, NaiveDate};
use pricetrack_core::{Category, Clock, OutcomeKind, Supermarket, FRESHNESS_WINDOW_DAYS};
use rand::seq::SliceRandom;
use thiserror::Error;
use tracing::debug;

use crate::store::{PriceStore, StoreError};

#[derive(Debug, Error)]
pub enum FreshnessError {
    #[error("refusing to record {kind:?} on {date}: it is after today ({today})")]
    FutureDate {
        kind: OutcomeKind,
        date: NaiveDate,
        today: NaiveDate,
    },
    #[error("category {0} does not exist")]
    CategoryNotFound(i64),
    #[error(transparent)]
    Database(#[from] StoreError),
}

/// Sole writer of `last_scraped_on` / `last_empty_on`.
#[derive(Debug, Clone)]
pub struct FreshnessTracker<C> {
    store: PriceStore,
    clock: C,
}

impl<C: Clock> FreshnessTracker<C> {
    pub fn new(store: PriceStore, clock: C) -> Self {
        Self { store, clock }
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    /// Never scraped or scraped more than the freshness window ago, and not found empty today.
    pub async fn eligible_categories(
        &self,
        supermarket: &Supermarket,
    ) -> Result<Vec<Category>, FreshnessError> {
        let today = self.today();
        let scraped_before = today - Duration::days(FRESHNESS_WINDOW_DAYS);
        Ok(self
            .store
            .categories_due(supermarket.id, scraped_before, today)
            .await?)
    }

    /// Uniform random pick among eligible categories. `None` means there is nothing to do.
    pub async fn pick_category_to_scrape(
        &self,
        supermarket: &Supermarket,
    ) -> Result<Option<Category>, FreshnessError> {
        let candidates = self.eligible_categories(supermarket).await?;
        let picked = candidates.choose(&mut rand::thread_rng()).cloned();
        debug!(
            supermarket = %supermarket.name,
            candidates = candidates.len(),
            picked = picked.as_ref().map(|c| c.id),
            "picked category to scrape"
        );
        Ok(picked)
    }

    pub async fn record_outcome(
        &self,
        category: &Category,
        date: NaiveDate,
        kind: OutcomeKind,
    ) -> Result<(), FreshnessError> {
        let today = self.today();
        if date > today {
            return Err(FreshnessError::FutureDate { kind, date, today });
        }
        if !self.store.set_category_outcome(category.id, kind, date).await? {
            return Err(FreshnessError::CategoryNotFound(category.id));
        }
        debug!(category_id = category.id, ?kind, %date, "recorded category outcome");
        Ok(())
    }
}
