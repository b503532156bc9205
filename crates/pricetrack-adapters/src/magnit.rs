//! Magnit (magnit.ru): kopeck prices, catalogue embedded in the home page's Nuxt payload.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use pricetrack_core::{Category, NewCategory, Product, ProductBatch, ProductObservation, Supermarket};
use pricetrack_storage::{HttpFetcher, HttpRequest};
use scraper::{Html, Selector};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, warn};

use crate::{
    fetch_json, json_bool, json_code, json_i64, json_minor_units, json_rating, products_array,
    required_text, AdapterError, RawBatch, RawCatalogue, RetailerAdapter, RetailerContext,
};

const HOME_URL: &str = "https://magnit.ru/";
const SEARCH_URL: &str = "https://magnit.ru/webgate/v2/goods/search";
const PAGE_LIMIT: u32 = 50;

const EXCLUDED_ROOTS: &[&str] = &[
    "Не забудьте заказать",
    "Покупайте с выгодой",
    "Промокод Магнит",
    "Создаём праздник",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct MagnitAdapter;

#[derive(Debug, Clone)]
struct CatalogueNode {
    name: String,
    parent_id: i64,
    has_children: bool,
}

fn category_key(value: &JsonValue) -> Option<i64> {
    let key = value.as_str()?;
    let digits = key.strip_prefix('g')?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn indexed<'a>(payload: &'a [JsonValue], info: &JsonValue, field: &str) -> Option<&'a JsonValue> {
    let index = info.get(field)?.as_u64()? as usize;
    payload.get(index)
}

/// Walk the flattened Nuxt payload. Each category appears as a `g<id>` string whose
/// preceding element is an object of indices pointing at its name, parent key and children.
fn collect_nodes(payload: &[JsonValue]) -> Vec<(i64, CatalogueNode)> {
    let mut seen = HashSet::new();
    let mut nodes = Vec::new();
    for (index, item) in payload.iter().enumerate() {
        let Some(id) = category_key(item) else {
            continue;
        };
        if index == 0 || !seen.insert(id) {
            continue;
        }
        let info = &payload[index - 1];
        if !info.is_object() {
            continue;
        }
        let name = indexed(payload, info, "name").and_then(JsonValue::as_str);
        let parent_id = indexed(payload, info, "parentKey").and_then(category_key);
        let children = indexed(payload, info, "children");
        let (Some(name), Some(parent_id), Some(children)) = (name, parent_id, children) else {
            debug!(id, "skipping catalogue key without usable node info");
            continue;
        };
        let has_children = match children {
            JsonValue::Array(items) => !items.is_empty(),
            JsonValue::Object(map) => !map.is_empty(),
            JsonValue::Null => false,
            _ => true,
        };
        nodes.push((
            id,
            CatalogueNode {
                name: name.trim().to_string(),
                parent_id,
                has_children,
            },
        ));
    }
    nodes
}

/// Ancestor chain from the root down to `id`. Stops at root markers, unknown parents and cycles.
fn lineage(id: i64, nodes: &HashMap<i64, CatalogueNode>) -> Vec<i64> {
    let mut chain = vec![id];
    let mut current = id;
    while let Some(node) = nodes.get(&current) {
        let parent = node.parent_id;
        if parent == 0 || parent == current || !nodes.contains_key(&parent) || chain.contains(&parent) {
            break;
        }
        chain.push(parent);
        current = parent;
    }
    chain.reverse();
    chain
}

fn nuxt_payload(html: &str) -> Result<Vec<JsonValue>, AdapterError> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("#__NUXT_DATA__").map_err(|e| AdapterError::Payload(e.to_string()))?;
    let script = document
        .select(&selector)
        .next()
        .ok_or_else(|| AdapterError::Payload("no #__NUXT_DATA__ script on page".into()))?;
    let text = script.text().collect::<String>();
    match serde_json::from_str::<JsonValue>(&text)? {
        JsonValue::Array(items) => Ok(items),
        _ => Err(AdapterError::Payload("#__NUXT_DATA__ is not an array".into())),
    }
}

#[async_trait]
impl RetailerAdapter for MagnitAdapter {
    fn adapter_id(&self) -> &'static str {
        "magnit"
    }

    async fn fetch_catalogue(
        &self,
        http: &HttpFetcher,
        ctx: &RetailerContext,
    ) -> Result<RawCatalogue, AdapterError> {
        let request = HttpRequest::get(HOME_URL).with_headers(&ctx.request_headers());
        let response = http.fetch(ctx.run_id, &ctx.supermarket_name, &request).await?;
        debug!(status = %response.status, bytes = response.body.len(), "fetched catalogue page");
        Ok(RawCatalogue {
            fetched_on: ctx.today,
            body: response.text(),
        })
    }

    fn parse_catalogue(
        &self,
        raw: &RawCatalogue,
        supermarket: &Supermarket,
    ) -> Result<Vec<NewCategory>, AdapterError> {
        let payload = nuxt_payload(&raw.body)?;
        let ordered = collect_nodes(&payload);
        let nodes: HashMap<i64, CatalogueNode> = ordered.iter().cloned().collect();

        let mut categories = Vec::new();
        for (id, node) in &ordered {
            let chain = lineage(*id, &nodes);
            if chain.len() < 2 || node.has_children {
                continue;
            }
            let full_name = chain
                .iter()
                .filter_map(|ancestor| nodes.get(ancestor).map(|n| n.name.as_str()))
                .collect::<Vec<_>>()
                .join(" / ");
            if EXCLUDED_ROOTS.iter().any(|prefix| full_name.starts_with(prefix)) {
                continue;
            }
            categories.push(NewCategory {
                supermarket_id: supermarket.id,
                category_code: id.to_string(),
                name: full_name,
            });
        }
        if categories.is_empty() {
            warn!("magnit catalogue yielded no leaf categories");
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
                "magnit category code `{}` is not numeric",
                category.category_code
            ))
        })?;
        let body = json!({
            "sort": {"order": "desc", "type": "popularity"},
            "pagination": {"limit": PAGE_LIMIT, "offset": 0},
            "categories": [category_number],
            "includeAdultGoods": true,
            "storeCode": ctx.store_code,
            "storeType": "1",
            "catalogType": "1",
        });
        let response = fetch_json(http, ctx, HttpRequest::post_json(SEARCH_URL, body)).await?;
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
        ctx: &RetailerContext,
    ) -> Result<ProductBatch, AdapterError> {
        let mut batch = ProductBatch::new(raw.fetched_on);
        for record in &raw.products {
            let product_code = json_code(record, &["id"])?;
            let (price, discounted_price) = if json_bool(record, &["promotion", "isPromotion"]) {
                (
                    json_minor_units(record, &["promotion", "oldPrice"])?,
                    json_minor_units(record, &["price"])?,
                )
            } else {
                (json_minor_units(record, &["price"])?, None)
            };
            let product = Product {
                id: None,
                url: format!(
                    "https://magnit.ru/product/{product_code}?shopCode={}",
                    ctx.store_code
                ),
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
                rating: json_rating(record, &["ratings", "rating"])?,
                rates_count: json_i64(record, &["ratings", "scoresCount"]).unwrap_or(0),
                unit: None,
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

    #[test]
    fn catalogue_keeps_leaves_with_full_names() {
        let raw = RawCatalogue {
            fetched_on: today(),
            body: fixture_text("magnit", "catalogue.html"),
        };
        let parsed = MagnitAdapter
            .parse_catalogue(&raw, &supermarket("Магнит"))
            .expect("parse catalogue");

        let actual: Vec<(&str, &str)> = parsed
            .iter()
            .map(|c| (c.category_code.as_str(), c.name.as_str()))
            .collect();
        assert_eq!(
            actual,
            vec![
                ("300", "Молоко, яйца, сыр / Сыры / Твёрдые"),
                ("210", "Молоко, яйца, сыр / Молоко"),
            ]
        );
        assert!(parsed.iter().all(|c| c.supermarket_id == 3));
    }

    #[test]
    fn page_without_payload_is_a_payload_error() {
        let raw = RawCatalogue {
            fetched_on: today(),
            body: "<html><body>maintenance</body></html>".into(),
        };
        let err = MagnitAdapter
            .parse_catalogue(&raw, &supermarket("Магнит"))
            .expect_err("no payload");
        assert!(matches!(err, AdapterError::Payload(_)));
    }

    #[test]
    fn lineage_survives_cycles() {
        let mut nodes = HashMap::new();
        nodes.insert(1, CatalogueNode { name: "a".into(), parent_id: 2, has_children: false });
        nodes.insert(2, CatalogueNode { name: "b".into(), parent_id: 1, has_children: true });
        assert_eq!(lineage(1, &nodes), vec![2, 1]);
    }

    #[test]
    fn promotion_prices_are_split_into_regular_and_discounted() {
        let body = fixture_json("magnit", "products.json");
        let raw = RawBatch {
            category_code: "12345".into(),
            fetched_on: today(),
            products: products_array(&body, "items").expect("items"),
        };
        let batch = MagnitAdapter
            .parse_products(&raw, &category(), &context("Магнит", "703059"))
            .expect("parse products");
        assert_eq!(batch.len(), 3);

        let cream = &batch.items()[0];
        assert_eq!(cream.product.product_code, "1000006090");
        assert_eq!(
            cream.product.url,
            "https://magnit.ru/product/1000006090?shopCode=703059"
        );
        assert_eq!(cream.observation.price, dec("259.99"));
        assert_eq!(cream.observation.discounted_price, dec("129.99"));
        assert_eq!(cream.observation.rating, dec("4.8"));
        assert_eq!(cream.observation.rates_count, 1500);
        assert_eq!(cream.observation.unit, None);

        let campina = &batch.items()[1];
        assert_eq!(campina.observation.price, dec("54.99"));
        assert_eq!(campina.observation.discounted_price, None);
        assert_eq!(campina.observation.rates_count, 1262);

        let unrated = &batch.items()[2];
        assert_eq!(unrated.observation.rating, None);
        assert_eq!(unrated.observation.rates_count, 0);
    }
}
