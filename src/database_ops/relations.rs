//! Relation Synchronizer: replaces product <-> genre/performer links wholesale.
//!
//! Delete every link of the given products, then insert exactly the current
//! set. Relation sets are small (a few dozen at most), so there is no diffing.

use anyhow::Result;
use itertools::Itertools;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use std::collections::HashMap;
use tracing::{debug, instrument};

use crate::normalization::MultiRole;

const ID_CHUNK: usize = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelationEntry {
    pub role: MultiRole,
    pub entity_id: i64,
}

impl RelationEntry {
    pub fn new(role: MultiRole, entity_id: i64) -> Self {
        Self { role, entity_id }
    }
}

async fn delete_links(
    conn: &mut SqliteConnection,
    role: MultiRole,
    product_ids: &[i64],
) -> Result<u64> {
    let (table, _) = role.link_table();
    let mut deleted = 0;
    for chunk in product_ids.chunks(ID_CHUNK) {
        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new(format!("DELETE FROM {table} WHERE product_id IN ("));
        let mut sep = qb.separated(", ");
        for id in chunk {
            sep.push_bind(*id);
        }
        sep.push_unseparated(")");
        deleted += qb.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(deleted)
}

async fn insert_links(
    conn: &mut SqliteConnection,
    role: MultiRole,
    pairs: &[(i64, i64)],
) -> Result<u64> {
    let (table, column) = role.link_table();
    let mut inserted = 0;
    for chunk in pairs.chunks(ID_CHUNK) {
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!(
            "INSERT OR IGNORE INTO {table} (product_id, {column}) "
        ));
        qb.push_values(chunk, |mut b, (product_id, entity_id)| {
            b.push_bind(*product_id).push_bind(*entity_id);
        });
        inserted += qb.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(inserted)
}

/// Makes the link rows of `product_ids` equal to `relations`.
///
/// Products in `product_ids` without an entry in `relations` end up with no
/// links. Entries for products outside `product_ids` are ignored. Returns the
/// number of link rows written.
#[instrument(skip(conn, product_ids, relations), fields(products = product_ids.len()))]
pub async fn sync_relations(
    conn: &mut SqliteConnection,
    product_ids: &[i64],
    relations: &HashMap<i64, Vec<RelationEntry>>,
) -> Result<u64> {
    if product_ids.is_empty() {
        return Ok(0);
    }
    let product_ids: Vec<i64> = product_ids.iter().copied().sorted().dedup().collect();

    let mut written = 0;
    for role in MultiRole::ALL {
        let deleted = delete_links(conn, role, &product_ids).await?;
        let pairs: Vec<(i64, i64)> = product_ids
            .iter()
            .flat_map(|pid| {
                relations
                    .get(pid)
                    .into_iter()
                    .flatten()
                    .filter(|e| e.role == role)
                    .map(move |e| (*pid, e.entity_id))
            })
            .unique()
            .collect();
        let inserted = if pairs.is_empty() {
            0
        } else {
            insert_links(conn, role, &pairs).await?
        };
        debug!(role = ?role, deleted, inserted, "relations: replaced link rows");
        written += inserted;
    }
    Ok(written)
}

/// Current entity ids linked to a product for one role, ascending.
pub async fn linked_entity_ids(
    conn: &mut SqliteConnection,
    role: MultiRole,
    product_id: i64,
) -> Result<Vec<i64>> {
    let (table, column) = role.link_table();
    let ids = sqlx::query_scalar(&format!(
        "SELECT {column} FROM {table} WHERE product_id = ? ORDER BY {column}"
    ))
    .bind(product_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::db::Db;
    use crate::database_ops::entities::resolve_entities;
    use crate::database_ops::products::{upsert_products, ProductRow, DEFAULT_BATCH_SIZE};
    use crate::database_ops::raw_store::insert_raw_record;
    use crate::normalization::{CanonicalDraft, EntityKind, EntityRef, Source};
    use std::collections::BTreeMap;

    async fn setup() -> (Db, i64, HashMap<String, i64>) {
        let db = Db::connect_in_memory().await.unwrap();
        let raw_id = insert_raw_record(&db, Source::A, "b1", "{}")
            .await
            .unwrap()
            .unwrap();
        let mut conn = db.pool.acquire().await.unwrap();
        let draft = CanonicalDraft::new(Source::A, "p1".into(), "P".into());
        let row = ProductRow::from_draft(&draft, &BTreeMap::new(), raw_id);
        let ids = upsert_products(&mut conn, &[row], DEFAULT_BATCH_SIZE)
            .await
            .unwrap();
        let names: Vec<EntityRef> = ["G1", "G2", "G3"]
            .iter()
            .filter_map(|n| EntityRef::named(n))
            .collect();
        let borrowed: Vec<&EntityRef> = names.iter().collect();
        let genres = resolve_entities(&mut conn, EntityKind::Genre, Source::A, &borrowed)
            .await
            .unwrap();
        drop(conn);
        (db, ids["A_p1"], genres)
    }

    fn genres(ids: &HashMap<String, i64>, names: &[&str]) -> Vec<RelationEntry> {
        names
            .iter()
            .map(|n| RelationEntry::new(MultiRole::Genre, ids[*n]))
            .collect()
    }

    #[tokio::test]
    async fn second_pass_replaces_the_genre_set() {
        let (db, product_id, ids) = setup().await;
        let mut conn = db.pool.acquire().await.unwrap();

        let first = HashMap::from([(product_id, genres(&ids, &["G1", "G2"]))]);
        sync_relations(&mut conn, &[product_id], &first)
            .await
            .unwrap();
        let second = HashMap::from([(product_id, genres(&ids, &["G2", "G3"]))]);
        let written = sync_relations(&mut conn, &[product_id], &second)
            .await
            .unwrap();
        assert_eq!(written, 2);

        let linked = linked_entity_ids(&mut conn, MultiRole::Genre, product_id)
            .await
            .unwrap();
        let mut expected = vec![ids["G2"], ids["G3"]];
        expected.sort();
        assert_eq!(linked, expected);
    }

    #[tokio::test]
    async fn missing_entry_clears_links_and_duplicates_collapse() {
        let (db, product_id, ids) = setup().await;
        let mut conn = db.pool.acquire().await.unwrap();

        let doubled = HashMap::from([(product_id, genres(&ids, &["G1", "G1"]))]);
        let written = sync_relations(&mut conn, &[product_id], &doubled)
            .await
            .unwrap();
        assert_eq!(written, 1);

        sync_relations(&mut conn, &[product_id], &HashMap::new())
            .await
            .unwrap();
        let linked = linked_entity_ids(&mut conn, MultiRole::Genre, product_id)
            .await
            .unwrap();
        assert!(linked.is_empty());
    }
}
