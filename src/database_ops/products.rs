//! Batch Upsert Engine for canonical products.
//!
//! `business_key` is the idempotence anchor: a re-upsert refreshes mutable
//! business fields and never touches `business_key` or `created_at`.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite, SqliteConnection};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, instrument};

use crate::normalization::{CanonicalDraft, SingleRole, Source};

pub const DEFAULT_BATCH_SIZE: usize = 200;
pub const MAX_BATCH_SIZE: usize = 500;

/// A draft whose single-valued entity references have been resolved to ids.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductRow {
    pub business_key: String,
    pub source: Source,
    pub external_product_id: String,
    pub title: String,
    pub release_date: Option<NaiveDate>,
    pub price: Option<i64>,
    pub affiliate_url: Option<String>,
    pub image_urls: Vec<String>,
    pub maker_id: Option<i64>,
    pub label_id: Option<i64>,
    pub series_id: Option<i64>,
    pub director_id: Option<i64>,
    pub raw_record_id: i64,
}

impl ProductRow {
    /// Unresolved roles simply stay `None`.
    pub fn from_draft(
        draft: &CanonicalDraft,
        single_ids: &BTreeMap<SingleRole, i64>,
        raw_record_id: i64,
    ) -> Self {
        let id_of = |role: SingleRole| single_ids.get(&role).copied();
        Self {
            business_key: draft.business_key(),
            source: draft.source,
            external_product_id: draft.external_product_id.clone(),
            title: draft.title.clone(),
            release_date: draft.release_date,
            price: draft.price,
            affiliate_url: draft.affiliate_url.clone(),
            image_urls: draft.image_urls.clone(),
            maker_id: id_of(SingleRole::Maker),
            label_id: id_of(SingleRole::Label),
            series_id: id_of(SingleRole::Series),
            director_id: id_of(SingleRole::Director),
            raw_record_id,
        }
    }
}

/// Collapses repeated business keys, keeping the last row but the first position.
pub fn dedupe_last_wins(rows: &[ProductRow]) -> Vec<&ProductRow> {
    let mut by_key: IndexMap<&str, &ProductRow> = IndexMap::with_capacity(rows.len());
    for row in rows {
        by_key.insert(row.business_key.as_str(), row);
    }
    by_key.into_values().collect()
}

async fn upsert_chunk(conn: &mut SqliteConnection, chunk: &[&ProductRow]) -> Result<u64> {
    let now = Utc::now();
    let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
        "INSERT INTO products (source, external_product_id, business_key, title, release_date, price, \
         affiliate_url, image_urls, maker_id, label_id, series_id, director_id, raw_record_id, \
         created_at, updated_at) ",
    );
    let mut encoded = Vec::with_capacity(chunk.len());
    for row in chunk {
        encoded.push(serde_json::to_string(&row.image_urls)?);
    }
    qb.push_values(chunk.iter().zip(encoded.iter()), |mut b, (row, images)| {
        b.push_bind(row.source.as_str())
            .push_bind(row.external_product_id.as_str())
            .push_bind(row.business_key.as_str())
            .push_bind(row.title.as_str())
            .push_bind(row.release_date)
            .push_bind(row.price)
            .push_bind(row.affiliate_url.as_deref())
            .push_bind(images.as_str())
            .push_bind(row.maker_id)
            .push_bind(row.label_id)
            .push_bind(row.series_id)
            .push_bind(row.director_id)
            .push_bind(row.raw_record_id)
            .push_bind(now)
            .push_bind(now);
    });
    // raw_record_id follows the record whose values the row now holds.
    qb.push(
        " ON CONFLICT (business_key) DO UPDATE SET
            title = excluded.title,
            release_date = excluded.release_date,
            price = excluded.price,
            affiliate_url = excluded.affiliate_url,
            image_urls = excluded.image_urls,
            maker_id = excluded.maker_id,
            label_id = excluded.label_id,
            series_id = excluded.series_id,
            director_id = excluded.director_id,
            raw_record_id = excluded.raw_record_id,
            updated_at = excluded.updated_at",
    );
    Ok(qb.build().execute(&mut *conn).await?.rows_affected())
}

async fn ids_by_business_key(
    conn: &mut SqliteConnection,
    keys: &[&str],
) -> Result<HashMap<String, i64>> {
    let mut qb: QueryBuilder<'_, Sqlite> =
        QueryBuilder::new("SELECT id, business_key FROM products WHERE business_key IN (");
    let mut sep = qb.separated(", ");
    for key in keys {
        sep.push_bind(*key);
    }
    sep.push_unseparated(")");
    let mut ids = HashMap::with_capacity(keys.len());
    for row in qb.build().fetch_all(&mut *conn).await? {
        ids.insert(row.try_get::<String, _>("business_key")?, row.try_get::<i64, _>("id")?);
    }
    Ok(ids)
}

/// Inserts or refreshes products in bounded batches and returns `business_key -> id`
/// for every row. Runs on the caller's connection so the caller owns the
/// transaction; nothing here commits.
#[instrument(skip(conn, rows), fields(row_count = rows.len()))]
pub async fn upsert_products(
    conn: &mut SqliteConnection,
    rows: &[ProductRow],
    batch_size: usize,
) -> Result<HashMap<String, i64>> {
    let unique = dedupe_last_wins(rows);
    let batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);
    let mut ids = HashMap::with_capacity(unique.len());
    for chunk in unique.chunks(batch_size) {
        let written = upsert_chunk(conn, chunk)
            .await
            .context("product upsert batch failed")?;
        let keys: Vec<&str> = chunk.iter().map(|r| r.business_key.as_str()).collect();
        let fetched = ids_by_business_key(conn, &keys).await?;
        debug!(batch = chunk.len(), written, "upsert: product batch applied");
        ids.extend(fetched);
    }
    Ok(ids)
}

/// Read model of a stored product, for operators and tests.
#[derive(Debug, Clone, Serialize)]
pub struct StoredProduct {
    pub id: i64,
    pub source: String,
    pub external_product_id: String,
    pub business_key: String,
    pub title: String,
    pub release_date: Option<NaiveDate>,
    pub price: Option<i64>,
    pub affiliate_url: Option<String>,
    pub image_urls: Vec<String>,
    pub maker_id: Option<i64>,
    pub label_id: Option<i64>,
    pub series_id: Option<i64>,
    pub director_id: Option<i64>,
    pub raw_record_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredProduct {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        let id: i64 = row.try_get("id")?;
        let images: String = row.try_get("image_urls")?;
        Ok(Self {
            id,
            source: row.try_get("source")?,
            external_product_id: row.try_get("external_product_id")?,
            business_key: row.try_get("business_key")?,
            title: row.try_get("title")?,
            release_date: row.try_get("release_date")?,
            price: row.try_get("price")?,
            affiliate_url: row.try_get("affiliate_url")?,
            image_urls: serde_json::from_str(&images)
                .with_context(|| format!("corrupt image_urls on product {id}"))?,
            maker_id: row.try_get("maker_id")?,
            label_id: row.try_get("label_id")?,
            series_id: row.try_get("series_id")?,
            director_id: row.try_get("director_id")?,
            raw_record_id: row.try_get("raw_record_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

pub async fn find_product(
    conn: &mut SqliteConnection,
    business_key: &str,
) -> Result<Option<StoredProduct>> {
    let row = sqlx::query("SELECT * FROM products WHERE business_key = ?")
        .bind(business_key)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(StoredProduct::from_row).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::db::Db;
    use crate::database_ops::raw_store::insert_raw_record;

    fn row(external_id: &str, title: &str, raw_record_id: i64) -> ProductRow {
        let draft = CanonicalDraft::new(Source::A, external_id.into(), title.into());
        ProductRow::from_draft(&draft, &BTreeMap::new(), raw_record_id)
    }

    async fn seeded_db() -> (Db, i64, i64) {
        let db = Db::connect_in_memory().await.unwrap();
        let r1 = insert_raw_record(&db, Source::A, "b1", "{}")
            .await
            .unwrap()
            .unwrap();
        let r2 = insert_raw_record(&db, Source::A, "b2", "{}")
            .await
            .unwrap()
            .unwrap();
        (db, r1, r2)
    }

    #[test]
    fn duplicate_keys_keep_the_last_draft() {
        let rows = vec![row("x1", "first", 1), row("x2", "other", 1), row("x1", "second", 1)];
        let unique = dedupe_last_wins(&rows);
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].title, "second");
        assert_eq!(unique[1].business_key, "A_x2");
    }

    #[tokio::test]
    async fn re_upsert_refreshes_fields_but_keeps_identity() {
        let (db, r1, r2) = seeded_db().await;
        let mut conn = db.pool.acquire().await.unwrap();

        let mut first = row("x1", "Foo", r1);
        first.price = Some(1000);
        first.image_urls = vec!["https://img.example/1.jpg".into()];
        let ids = upsert_products(&mut conn, &[first], DEFAULT_BATCH_SIZE)
            .await
            .unwrap();
        let before = find_product(&mut conn, "A_x1").await.unwrap().unwrap();

        let second = row("x1", "Foo (Remastered)", r2);
        let again = upsert_products(&mut conn, &[second], DEFAULT_BATCH_SIZE)
            .await
            .unwrap();
        let after = find_product(&mut conn, "A_x1").await.unwrap().unwrap();

        assert_eq!(ids["A_x1"], again["A_x1"]);
        assert_eq!(after.id, before.id);
        assert_eq!(after.created_at, before.created_at);
        assert_eq!(after.title, "Foo (Remastered)");
        assert_eq!(after.price, None);
        assert!(after.image_urls.is_empty());
        assert_eq!(after.raw_record_id, Some(r2));

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM products")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn small_batches_still_return_every_id() {
        let (db, r1, _) = seeded_db().await;
        let mut conn = db.pool.acquire().await.unwrap();
        let rows: Vec<ProductRow> = (0..7).map(|i| row(&format!("p{i}"), "T", r1)).collect();
        let ids = upsert_products(&mut conn, &rows, 3).await.unwrap();
        assert_eq!(ids.len(), 7);
        assert!(ids.contains_key("A_p6"));
    }

    #[tokio::test]
    async fn failed_batch_leaves_nothing_behind() {
        let (db, r1, _) = seeded_db().await;
        let mut tx = db.pool.begin().await.unwrap();
        let good = row("ok", "Fine", r1);
        upsert_products(&mut tx, &[good], DEFAULT_BATCH_SIZE)
            .await
            .unwrap();
        // Unknown raw record id violates the foreign key.
        let bad = row("bad", "Broken", 9_999);
        assert!(upsert_products(&mut tx, &[bad], DEFAULT_BATCH_SIZE)
            .await
            .is_err());
        tx.rollback().await.unwrap();

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM products")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn corrupt_image_column_is_reported() {
        let (db, r1, _) = seeded_db().await;
        let mut conn = db.pool.acquire().await.unwrap();
        upsert_products(&mut conn, &[row("x1", "Foo", r1)], DEFAULT_BATCH_SIZE)
            .await
            .unwrap();
        sqlx::query("UPDATE products SET image_urls = 'not json' WHERE business_key = 'A_x1'")
            .execute(&mut *conn)
            .await
            .unwrap();

        let err = find_product(&mut conn, "A_x1").await.unwrap_err();
        assert!(format!("{err:#}").contains("corrupt image_urls"));
    }
}
