//! Pyaterochka (5ka.ru): rubles as decimal strings, two-level catalogue.

use async_trait::async_trait;
use pricetrack_core::{Category, NewCategory, Product, ProductBatch, ProductObservation, Supermarket};
use pricetrack_storage::{HttpFetcher, HttpRequest};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{
    fetch_json, json_code, json_decimal, json_i64, json_text, products_array,
    required_text, AdapterError, RawBatch, RawCatalogue, RetailerAdapter, RetailerContext,
};

const API_BASE: &str = "https://5d.5ka.ru/api/catalog/v1/stores";

#[derive(Debug, Clone, Copy, Default)]
pub struct PyaterochkaAdapter;

impl PyaterochkaAdapter {
    fn product_url(code: &str) -> String {
        format!("https://5ka.ru/product/{code}")
    }
}

#[async_trait]
impl RetailerAdapter for PyaterochkaAdapter {
    fn adapter_id(&self) -> &'static str {
        "pyaterochka"
    }

    async fn fetch_catalogue(
        &self,
        http: &HttpFetcher,
        ctx: &RetailerContext,
    ) -> Result<RawCatalogue, AdapterError> {
        let request = HttpRequest::get(format!("{API_BASE}/{}/categories", ctx.store_code))
            .with_query("mode", "delivery")
            .with_query("include_subcategories", "1");
        let body = fetch_json(http, ctx, request).await?;
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
        let tree: JsonValue = serde_json::from_str(&raw.body)?;
        let top_level = tree
            .as_array()
            .ok_or_else(|| AdapterError::Payload("catalogue is not an array".into()))?;

        let mut categories = Vec::new();
        for top in top_level {
            let parent_name = required_text(top, &["name"])?;
            let Some(subcategories) = top.get("subcategories").and_then(JsonValue::as_array) else {
                continue;
            };
            for sub in subcategories {
                categories.push(NewCategory {
                    supermarket_id: supermarket.id,
                    category_code: json_code(sub, &["id"])?,
                    name: format!("{parent_name} / {}", required_text(sub, &["name"])?),
                });
            }
        }
        Ok(categories)
    }

    async fn fetch_products(
        &self,
        http: &HttpFetcher,
        ctx: &RetailerContext,
        category: &Category,
    ) -> Result<RawBatch, AdapterError> {
        let request = HttpRequest::get(format!(
            "{API_BASE}/{}/categories/{}/products",
            ctx.store_code, category.category_code
        ))
        .with_query("mode", "delivery")
        .with_query("limit", "100");
        let body = fetch_json(http, ctx, request).await?;
        let products = products_array(&body, "products")?;
        debug!(count = products.len(), category = %category.category_code, "fetched products");
        Ok(RawBatch {
            category_code: category.category_code.clone(),
            fetched_on: ctx.today,
            products,
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
            let product_code = json_code(record, &["plu"])?;
            let product = Product {
                id: None,
                url: Self::product_url(&product_code),
                product_code,
                category_id: category.id,
                name: required_text(record, &["name"])?,
                created_on: raw.fetched_on,
            };
            let observation = ProductObservation {
                product_id: None,
                observed_on: raw.fetched_on,
                price: json_decimal(record, &["prices", "regular"])?,
                discounted_price: json_decimal(record, &["prices", "discount"])?,
                rating: json_decimal(record, &["rating", "rating_average"])?,
                rates_count: json_i64(record, &["rating", "rates_count"]).unwrap_or(0),
                unit: json_text(record, &["property_clarification"]),
            };
            batch.push(product, observation)?;
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{category, context, fixture_json, fixture_text, supermarket, today};
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn dec(s: &str) -> Option<Decimal> {
        Some(Decimal::from_str(s).expect("decimal"))
    }

    fn raw_batch() -> RawBatch {
        let body = fixture_json("pyaterochka", "products.json");
        RawBatch {
            category_code: "12345".into(),
            fetched_on: today(),
            products: products_array(&body, "products").expect("products"),
        }
    }

    #[test]
    fn catalogue_is_flattened_to_second_level_with_parent_names() {
        let raw = RawCatalogue {
            fetched_on: today(),
            body: fixture_text("pyaterochka", "catalogue.json"),
        };
        let parsed = PyaterochkaAdapter
            .parse_catalogue(&raw, &supermarket("Пятёрочка"))
            .expect("parse catalogue");

        let expected = [
            ("73C20455", "Новый Год / Готовим оливье"),
            ("73C20456", "Новый Год / Запекаем в духовке"),
            ("73C10301", "Готовая еда / Горячие напитки"),
            ("73C9714", "Готовая еда / Блинчики, сырники и каши"),
        ];
        assert_eq!(parsed.len(), expected.len());
        for (category, (code, name)) in parsed.iter().zip(expected) {
            assert_eq!(category.supermarket_id, 3);
            assert_eq!(category.category_code, code);
            assert_eq!(category.name, name);
        }
    }

    #[test]
    fn products_parse_into_a_same_day_batch() {
        let ctx = context("Пятёрочка", "E703");
        let batch = PyaterochkaAdapter
            .parse_products(&raw_batch(), &category(), &ctx)
            .expect("parse products");

        assert_eq!(batch.observed_on(), today());
        assert_eq!(batch.len(), 3);

        let snickers = &batch.items()[0];
        assert_eq!(snickers.product.product_code, "4133363");
        assert_eq!(snickers.product.category_id, 1);
        assert_eq!(snickers.product.name, "Шоколадный батончик Snickers Super 80г");
        assert_eq!(snickers.product.url, "https://5ka.ru/product/4133363");
        assert_eq!(snickers.product.created_on, today());
        assert_eq!(snickers.observation.price, dec("69.99"));
        assert_eq!(snickers.observation.discounted_price, None);
        assert_eq!(snickers.observation.rating, dec("4.94"));
        assert_eq!(snickers.observation.rates_count, 47688);
        assert_eq!(snickers.observation.unit.as_deref(), Some("80 г"));

        let twix = &batch.items()[1];
        assert_eq!(twix.observation.price, dec("67.99"));
        assert_eq!(twix.observation.discounted_price, dec("59.99"));
    }

    #[test]
    fn missing_optionals_map_to_none_and_zero_count() {
        let ctx = context("Пятёрочка", "E703");
        let batch = PyaterochkaAdapter
            .parse_products(&raw_batch(), &category(), &ctx)
            .expect("parse products");
        let unrated = &batch.items()[2];
        assert_eq!(unrated.observation.price, dec("12.5"));
        assert_eq!(unrated.observation.rating, None);
        assert_eq!(unrated.observation.rates_count, 0);
        assert_eq!(unrated.observation.unit, None);
    }

    #[test]
    fn record_without_code_is_rejected() {
        let raw = RawBatch {
            category_code: "12345".into(),
            fetched_on: today(),
            products: vec![serde_json::json!({"name": "no code", "prices": {}})],
        };
        let err = PyaterochkaAdapter
            .parse_products(&raw, &category(), &context("Пятёрочка", "E703"))
            .expect_err("missing plu");
        assert!(matches!(err, AdapterError::Payload(_)));
    }
}
