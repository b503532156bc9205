//! Retailer adapter contracts: catalogue normalization and product extraction.

use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::NaiveDate;
use pricetrack_core::{Category, CoreError, NewCategory, ProductBatch, Supermarket};
use pricetrack_storage::{FetchError, FetchedResponse, HttpFetcher, HttpRequest};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

mod lenta;
mod magnit;
mod pyaterochka;

pub use lenta::LentaAdapter;
pub use magnit::MagnitAdapter;
pub use pyaterochka::PyaterochkaAdapter;

pub const CRATE_NAME: &str = "pricetrack-adapters";

/// Per-run, per-retailer values every adapter call receives explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetailerContext {
    pub run_id: Uuid,
    pub supermarket_name: String,
    pub store_code: String,
    pub today: NaiveDate,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
}

impl RetailerContext {
    /// Configured headers plus a `Cookie` header built from the configured cookies.
    pub fn request_headers(&self) -> BTreeMap<String, String> {
        let mut headers = self.headers.clone();
        if !self.cookies.is_empty() {
            let cookie = self
                .cookies
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; ");
            headers.insert("Cookie".to_string(), cookie);
        }
        headers
    }
}

/// Raw product-search response for one category, as returned by the retailer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBatch {
    pub category_code: String,
    pub fetched_on: NaiveDate,
    pub products: Vec<JsonValue>,
}

impl RawBatch {
    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCatalogue {
    pub fetched_on: NaiveDate,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid json payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected payload shape: {0}")]
    Payload(String),
    #[error(transparent)]
    Batch(#[from] CoreError),
}

#[async_trait]
pub trait RetailerAdapter: Send + Sync {
    fn adapter_id(&self) -> &'static str;

    async fn fetch_catalogue(
        &self,
        http: &HttpFetcher,
        ctx: &RetailerContext,
    ) -> Result<RawCatalogue, AdapterError>;

    /// Flatten the retailer's category tree into leaf categories with display names.
    fn parse_catalogue(
        &self,
        raw: &RawCatalogue,
        supermarket: &Supermarket,
    ) -> Result<Vec<NewCategory>, AdapterError>;

    async fn fetch_products(
        &self,
        http: &HttpFetcher,
        ctx: &RetailerContext,
        category: &Category,
    ) -> Result<RawBatch, AdapterError>;

    /// Every product gets `category.id`; every observation is dated `raw.fetched_on`.
    fn parse_products(
        &self,
        raw: &RawBatch,
        category: &Category,
        ctx: &RetailerContext,
    ) -> Result<ProductBatch, AdapterError>;
}

pub fn adapter_for_retailer(adapter_id: &str) -> Option<Box<dyn RetailerAdapter>> {
    match adapter_id {
        "pyaterochka" => Some(Box::new(PyaterochkaAdapter)),
        "magnit" => Some(Box::new(MagnitAdapter)),
        "lenta" => Some(Box::new(LentaAdapter)),
        _ => None,
    }
}

pub(crate) async fn fetch_json(
    http: &HttpFetcher,
    ctx: &RetailerContext,
    request: HttpRequest,
) -> Result<JsonValue, AdapterError> {
    let request = request.with_headers(&ctx.request_headers());
    let response: FetchedResponse = http.fetch(ctx.run_id, &ctx.supermarket_name, &request).await?;
    debug!(status = %response.status, url = %response.final_url, bytes = response.body.len(), "retailer responded");
    Ok(response.json()?)
}

/// Pull the product array out of a search response.
pub(crate) fn products_array(body: &JsonValue, key: &str) -> Result<Vec<JsonValue>, AdapterError> {
    match body.get(key) {
        Some(JsonValue::Array(items)) => Ok(items.clone()),
        Some(JsonValue::Null) => Ok(Vec::new()),
        _ => Err(AdapterError::Payload(format!("missing `{key}` array"))),
    }
}

pub(crate) fn json_path<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    if cur.is_null() {
        None
    } else {
        Some(cur)
    }
}

/// Trimmed string; blank strings count as absent.
pub(crate) fn json_text(value: &JsonValue, path: &[&str]) -> Option<String> {
    json_path(value, path)
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

pub(crate) fn json_i64(value: &JsonValue, path: &[&str]) -> Option<i64> {
    let found = json_path(value, path)?;
    found
        .as_i64()
        .or_else(|| found.as_f64().map(|f| f.round() as i64))
        .or_else(|| found.as_str().and_then(|s| s.trim().parse().ok()))
}

pub(crate) fn json_bool(value: &JsonValue, path: &[&str]) -> bool {
    json_path(value, path)
        .and_then(JsonValue::as_bool)
        .unwrap_or(false)
}

/// Retailer-native identifier rendered as a string, whether it arrives as number or text.
pub(crate) fn json_code(value: &JsonValue, path: &[&str]) -> Result<String, AdapterError> {
    match json_path(value, path) {
        Some(JsonValue::Number(n)) => Ok(n.to_string()),
        Some(JsonValue::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        _ => Err(AdapterError::Payload(format!(
            "missing product code at `{}`",
            path.join(".")
        ))),
    }
}

pub(crate) fn required_text(value: &JsonValue, path: &[&str]) -> Result<String, AdapterError> {
    json_text(value, path)
        .ok_or_else(|| AdapterError::Payload(format!("missing `{}`", path.join("."))))
}

fn parse_decimal(raw: &str) -> Result<Decimal, AdapterError> {
    let raw = raw.trim();
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .map_err(|e| AdapterError::Payload(format!("invalid decimal `{raw}`: {e}")))
}

/// Decimal in major units (rubles). Goes through the textual form, never through float math.
pub(crate) fn json_decimal(value: &JsonValue, path: &[&str]) -> Result<Option<Decimal>, AdapterError> {
    match json_path(value, path) {
        None => Ok(None),
        Some(JsonValue::Number(n)) => parse_decimal(&n.to_string()).map(Some),
        Some(JsonValue::String(s)) if s.trim().is_empty() => Ok(None),
        Some(JsonValue::String(s)) => parse_decimal(s).map(Some),
        Some(other) => Err(AdapterError::Payload(format!(
            "expected decimal at `{}`, found {other}",
            path.join(".")
        ))),
    }
}

/// Decimal reported in minor units (kopecks), divided by 100 exactly.
pub(crate) fn json_minor_units(value: &JsonValue, path: &[&str]) -> Result<Option<Decimal>, AdapterError> {
    if let Some(minor) = json_path(value, path).and_then(JsonValue::as_i64) {
        return Ok(Some(pricetrack_core::decimal_from_minor_units(minor)));
    }
    Ok(json_decimal(value, path)?.map(|major| major / Decimal::ONE_HUNDRED))
}

/// Magnit reports unrated products with a rating of zero.
pub(crate) fn json_rating(value: &JsonValue, path: &[&str]) -> Result<Option<Decimal>, AdapterError> {
    Ok(json_decimal(value, path)?.filter(|r| !r.is_zero()))
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::{Path, PathBuf};

    use chrono::NaiveDate;
    use pricetrack_core::{Category, Supermarket};
    use uuid::Uuid;

    use crate::RetailerContext;

    pub fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    pub fn fixture_text(retailer: &str, file: &str) -> String {
        let path = workspace_root().join("fixtures").join(retailer).join(file);
        std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
    }

    pub fn fixture_json(retailer: &str, file: &str) -> serde_json::Value {
        serde_json::from_str(&fixture_text(retailer, file)).expect("fixture json")
    }

    pub fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 12, 20).expect("date")
    }

    pub fn supermarket(name: &str) -> Supermarket {
        Supermarket {
            id: 3,
            name: name.to_string(),
        }
    }

    pub fn category() -> Category {
        Category {
            id: 1,
            supermarket_id: 3,
            category_code: "12345".into(),
            name: "Some name".into(),
            last_scraped_on: None,
            last_empty_on: None,
        }
    }

    pub fn context(name: &str, store_code: &str) -> RetailerContext {
        RetailerContext {
            run_id: Uuid::nil(),
            supermarket_name: name.to_string(),
            store_code: store_code.to_string(),
            today: today(),
            headers: Default::default(),
            cookies: Default::default(),
        }
    }
}
