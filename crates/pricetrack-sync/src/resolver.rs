//! Business code → surrogate id resolution, scoped to one supermarket.

use std::collections::HashMap;

use sqlx::sqlite::SqliteConnection;

use crate::reconcile::ReconcileError;
use crate::store::products_by_codes;

/// What the store already knows about a product code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownProduct {
    pub id: i64,
    pub category_id: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct KeyResolver {
    supermarket_id: i64,
}

impl KeyResolver {
    pub fn new(supermarket_id: i64) -> Self {
        Self { supermarket_id }
    }

    /// The subset of `codes` that already has a product row in this supermarket,
    /// in whichever category it currently lives.
    pub async fn known(
        &self,
        conn: &mut SqliteConnection,
        codes: &[String],
    ) -> Result<HashMap<String, KnownProduct>, ReconcileError> {
        if codes.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = products_by_codes(conn, self.supermarket_id, codes).await?;
        Ok(rows
            .into_iter()
            .map(|(code, id, category_id)| (code, KnownProduct { id, category_id }))
            .collect())
    }

    /// Complete code → id mapping for `codes`. Any code left without an id is an
    /// integrity failure, never a partial result.
    pub async fn resolve(
        &self,
        conn: &mut SqliteConnection,
        codes: &[String],
    ) -> Result<HashMap<String, i64>, ReconcileError> {
        let ids: HashMap<String, i64> = self
            .known(conn, codes)
            .await?
            .into_iter()
            .map(|(code, known)| (code, known.id))
            .collect();
        ensure_complete(codes, &ids)?;
        Ok(ids)
    }
}

pub fn ensure_complete(codes: &[String], ids: &HashMap<String, i64>) -> Result<(), ReconcileError> {
    match codes.iter().find(|code| !ids.contains_key(code.as_str())) {
        Some(code) => Err(ReconcileError::MissingIdentifier {
            product_code: code.clone(),
        }),
        None => Ok(()),
    }
}
