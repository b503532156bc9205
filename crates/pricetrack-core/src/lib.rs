//! Core domain model for the grocery price tracker.

use chrono::{FixedOffset, NaiveDate, Offset, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "pricetrack-core";

/// Minimum number of days between two scrapes of the same category.
pub const FRESHNESS_WINDOW_DAYS: i64 = 6;

/// A retailer. `name` is the business key; rows are created once and only read afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Supermarket {
    pub id: i64,
    pub name: String,
}

/// A leaf category of a retailer's catalogue, as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub supermarket_id: i64,
    pub category_code: String,
    pub name: String,
    pub last_scraped_on: Option<NaiveDate>,
    pub last_empty_on: Option<NaiveDate>,
}

/// Normalized catalogue entry before it has a surrogate id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCategory {
    pub supermarket_id: i64,
    pub category_code: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    /// Surrogate id; `None` until the product has been reconciled.
    pub id: Option<i64>,
    pub product_code: String,
    pub category_id: i64,
    pub name: String,
    pub url: String,
    pub created_on: NaiveDate,
}

/// One dated price/rating snapshot of a product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductObservation {
    pub product_id: Option<i64>,
    pub observed_on: NaiveDate,
    pub price: Option<Decimal>,
    pub discounted_price: Option<Decimal>,
    pub rating: Option<Decimal>,
    #[serde(default)]
    pub rates_count: i64,
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItem {
    pub product: Product,
    pub observation: ProductObservation,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("observation for product {product_code} is dated {found}, batch is dated {expected}")]
    MixedObservationDate {
        product_code: String,
        expected: NaiveDate,
        found: NaiveDate,
    },
}

/// Products scraped from one category in one fetch. Every observation shares `observed_on`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductBatch {
    observed_on: NaiveDate,
    items: Vec<BatchItem>,
}

impl ProductBatch {
    pub fn new(observed_on: NaiveDate) -> Self {
        Self {
            observed_on,
            items: Vec::new(),
        }
    }

    pub fn push(
        &mut self,
        product: Product,
        observation: ProductObservation,
    ) -> Result<(), CoreError> {
        if observation.observed_on != self.observed_on {
            return Err(CoreError::MixedObservationDate {
                product_code: product.product_code,
                expected: self.observed_on,
                found: observation.observed_on,
            });
        }
        self.items.push(BatchItem {
            product,
            observation,
        });
        Ok(())
    }

    pub fn observed_on(&self) -> NaiveDate {
        self.observed_on
    }

    pub fn items(&self) -> &[BatchItem] {
        &self.items
    }

    pub fn into_items(self) -> Vec<BatchItem> {
        self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Which freshness field a scrape outcome writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Scraped,
    Empty,
}

impl OutcomeKind {
    pub fn column(self) -> &'static str {
        match self {
            Self::Scraped => "last_scraped_on",
            Self::Empty => "last_empty_on",
        }
    }
}

/// Source of "today" in the pipeline's operating timezone.
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

#[derive(Debug, Clone, Copy)]
pub struct OperatingClock {
    offset: FixedOffset,
}

impl OperatingClock {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    /// Falls back to UTC when the hour offset is out of range.
    pub fn from_utc_offset_hours(hours: i32) -> Self {
        let offset = FixedOffset::east_opt(hours.saturating_mul(3600)).unwrap_or_else(|| Utc.fix());
        Self { offset }
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }
}

impl Clock for OperatingClock {
    fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.offset).date_naive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedClock(pub NaiveDate);

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        self.0
    }
}

/// Exact conversion of integer minor units (kopecks, cents) into a two-place decimal.
pub fn decimal_from_minor_units(minor: i64) -> Decimal {
    Decimal::new(minor, 2)
}
