//! Lenta (lenta.com): kopeck prices; the session token pins the store location.

use async_trait::async_trait;
use pricetrack_core::{Category, NewCategory, Product, ProductBatch, ProductObservation, Supermarket};
use pricetrack_storage::{HttpFetcher, HttpRequest};
use serde_json::{json, Value as JsonValue};

use crate::{
    fetch_json, json_code, json_decimal, json_i64, json_minor_units, json_text, products_array,
    required_text, AdapterError, RawBatch, RawCatalogue, RetailerAdapter, RetailerContext,
};

const CATEGORIES_URL: &str = "https://lenta.com/api-gateway/v1/catalog/categories";
const ITEMS_URL: &str = "https://lenta.com/api-gateway/v1/catalog/items";
const PAGE_LIMIT: u32 = 200;

/// Promotional sections that duplicate regular categories.
const EXCLUDED_PARENTS: &[&str] = &[
    "Особенно выгодно",
    "Новинки",
    "Новогодний стол",
    "Новогодний декор и подарки",
    "Товары до 99 рублей",
];
const EXCLUDED_PARENT_PREFIX: &str = "Каталог выгодных";

#[derive(Debug, Clone, Copy, Default)]
pub struct LentaAdapter;

#[async_trait]
impl RetailerAdapter for LentaAdapter {
    fn adapter_id(&self) -> &'static str {
        "lenta"
    }

    async fn fetch_catalogue(
        &self,
        http: &HttpFetcher,
        ctx: &RetailerContext,
    ) -> Result<RawCatalogue, AdapterError> {
        let body = fetch_json(http, ctx, HttpRequest::get(CATEGORIES_URL)).await?;
        Ok(RawCatalogue {
            fetched_on: ctx.today,
            body: body.to_string(),
        })
    }

    fn parse_catalogue(
        &self,
        raw: &RawCatalogue,
        supermarket: &Supermarket,
    ) -> Result<Vec<NewCategory>, AdapterError> {
        let body: JsonValue = serde_json::from_str(&raw.body)?;
        let entries = body
            .get("categories")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| AdapterError::Payload("missing `categories` array".into()))?;

        let mut categories = Vec::new();
        for entry in entries {
            if json_i64(entry, &["level"]) != Some(2) {
                continue;
            }
            let Some(parent) = json_text(entry, &["parentName"]) else {
                continue;
            };
            if EXCLUDED_PARENTS.contains(&parent.as_str()) || parent.starts_with(EXCLUDED_PARENT_PREFIX) {
                continue;
            }
            categories.push(NewCategory {
                supermarket_id: supermarket.id,
                category_code: json_code(entry, &["id"])?,
                name: format!("{parent} / {}", required_text(entry, &["name"])?),
            });
        }
        Ok(categories)
    }

    async fn fetch_products(
        &self,
        http: &HttpFetcher,
        ctx: &RetailerContext,
        category: &Category,
    ) -> Result<RawBatch, AdapterError> {
        let category_number: i64 = category.category_code.parse().map_err(|_| {
            AdapterError::Payload(format!(
                "lenta category code `{}` is not numeric",
                category.category_code
            ))
        })?;
        let body = json!({
            "categoryId": category_number,
            "limit": PAGE_LIMIT,
            "offset": 0,
            "sort": {"type": "popular", "order": "desc"},
            "filters": {"range": [], "checkbox": [], "multicheckbox": []},
        });
        let response = fetch_json(http, ctx, HttpRequest::post_json(ITEMS_URL, body)).await?;
        Ok(RawBatch {
            category_code: category.category_code.clone(),
            fetched_on: ctx.today,
            products: products_array(&response, "items")?,
        })
    }

    fn parse_products(
        &self,
        raw: &RawBatch,
        category: &Category,
        _ctx: &RetailerContext,
    ) -> Result<ProductBatch, AdapterError> {
        let mut batch = ProductBatch::new(raw.fetched_on);
        for record in &raw.products {
            let product_code = json_code(record, &["id"])?;
            let slug = required_text(record, &["slug"])?;

            // Lenta always reports the shelf price next to the regular one, even without a promotion.
            let price = json_minor_units(record, &["prices", "priceRegular"])?;
            let discounted_price = json_minor_units(record, &["prices", "price"])?;

            let product = Product {
                id: None,
                url: format!("https://lenta.com/product/{slug}-{product_code}"),
                product_code,
                category_id: category.id,
                name: required_text(record, &["name"])?,
                created_on: raw.fetched_on,
            };
            let observation = ProductObservation {
                product_id: None,
                observed_on: raw.fetched_on,
                price,
                discounted_price,
                rating: json_decimal(record, &["rating", "rate"])?,
                rates_count: json_i64(record, &["rating", "votes"]).unwrap_or(0),
                unit: json_text(record, &["weight", "package"]),
            };
            batch.push(product, observation)?;
        }
        Ok(batch)
    }
}
