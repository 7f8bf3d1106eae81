//! Entity Resolver: maps master-entity names to ids, creating rows on first sight.
//!
//! Read, insert-missing, re-read. Uniqueness on `(source, name)` is enforced by
//! the store, so a concurrent resolver that wins the insert race is simply
//! picked up by the re-read. No application-level lock is taken.

use anyhow::Result;
use chrono::Utc;
use itertools::Itertools;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use std::collections::HashMap;
use tracing::{debug, instrument, warn};

use crate::normalization::{EntityKind, EntityRef, Source};

/// Names per `IN (...)` / `VALUES` statement; well under SQLite's bind limit.
const NAME_CHUNK: usize = 300;

#[derive(Debug, Clone)]
struct ExistingEntity {
    id: i64,
    external_id: Option<String>,
}

/// Trim/collapse, dedupe by name, keep the first external id offered for each name.
fn dedupe_refs<'a, I>(refs: I) -> Vec<EntityRef>
where
    I: IntoIterator<Item = &'a EntityRef>,
{
    let mut by_name: indexmap::IndexMap<String, Option<String>> = indexmap::IndexMap::new();
    for r in refs {
        let Some(name) = crate::normalization::draft::normalize_entity_name(&r.name) else {
            continue;
        };
        let slot = by_name.entry(name).or_insert(None);
        if slot.is_none() {
            *slot = r.external_id.clone();
        }
    }
    by_name
        .into_iter()
        .map(|(name, external_id)| EntityRef { name, external_id })
        .collect()
}

async fn select_existing(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    source: Source,
    names: &[&str],
) -> Result<HashMap<String, ExistingEntity>> {
    let mut out = HashMap::with_capacity(names.len());
    for chunk in names.chunks(NAME_CHUNK) {
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!(
            "SELECT id, name, external_id FROM {} WHERE source = ",
            kind.table()
        ));
        qb.push_bind(source.as_str());
        qb.push(" AND name IN (");
        let mut sep = qb.separated(", ");
        for name in chunk {
            sep.push_bind(*name);
        }
        sep.push_unseparated(")");
        let rows = qb.build().fetch_all(&mut *conn).await?;
        for row in rows {
            out.insert(
                row.try_get::<String, _>("name")?,
                ExistingEntity {
                    id: row.try_get("id")?,
                    external_id: row.try_get("external_id")?,
                },
            );
        }
    }
    Ok(out)
}

async fn insert_missing(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    source: Source,
    missing: &[&EntityRef],
) -> Result<u64> {
    let now = Utc::now();
    let mut inserted = 0;
    for chunk in missing.chunks(NAME_CHUNK) {
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!(
            "INSERT INTO {} (source, name, external_id, product_count, created_at, updated_at) ",
            kind.table()
        ));
        qb.push_values(chunk, |mut b, r| {
            b.push_bind(source.as_str())
                .push_bind(r.name.as_str())
                .push_bind(r.external_id.as_deref())
                .push_bind(0_i64)
                .push_bind(now)
                .push_bind(now);
        });
        // A concurrent resolver may have inserted the same name already.
        qb.push(" ON CONFLICT (source, name) DO NOTHING");
        inserted += qb.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(inserted)
}

/// Stores a vendor id on rows that were created without one. Never overwrites.
async fn fill_external_ids(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    fills: &[(i64, &str)],
) -> Result<()> {
    let sql = format!(
        "UPDATE {} SET external_id = ?, updated_at = ? WHERE id = ? AND external_id IS NULL",
        kind.table()
    );
    let now = Utc::now();
    for (id, external_id) in fills {
        sqlx::query(&sql)
            .bind(*external_id)
            .bind(now)
            .bind(*id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Resolves entity references of one kind for one source.
///
/// The result maps normalized name to id. Names that still have no row after
/// the insert and re-read are left out and logged; callers treat them as
/// absent (null FK, omitted relation).
#[instrument(skip(conn, refs))]
pub async fn resolve_entities(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    source: Source,
    refs: &[&EntityRef],
) -> Result<HashMap<String, i64>> {
    let found = resolve_with_external_ids(conn, kind, source, refs).await?;
    Ok(found.into_iter().map(|(name, e)| (name, e.id)).collect())
}

async fn resolve_with_external_ids(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    source: Source,
    refs: &[&EntityRef],
) -> Result<HashMap<String, ExistingEntity>> {
    let wanted = dedupe_refs(refs.iter().copied());
    if wanted.is_empty() {
        return Ok(HashMap::new());
    }
    let names: Vec<&str> = wanted.iter().map(|r| r.name.as_str()).collect();
    let mut existing = select_existing(conn, kind, source, &names).await?;

    let fills: Vec<(i64, &str)> = wanted
        .iter()
        .filter_map(|r| {
            let row = existing.get(&r.name)?;
            match (&row.external_id, r.external_id.as_deref()) {
                (None, Some(ext)) => Some((row.id, ext)),
                _ => None,
            }
        })
        .collect();
    if !fills.is_empty() {
        fill_external_ids(conn, kind, &fills).await?;
        for r in &wanted {
            if let (Some(row), Some(ext)) = (existing.get_mut(&r.name), r.external_id.as_ref()) {
                row.external_id.get_or_insert_with(|| ext.clone());
            }
        }
    }

    let missing: Vec<&EntityRef> = wanted
        .iter()
        .filter(|r| !existing.contains_key(&r.name))
        .collect();
    if !missing.is_empty() {
        let inserted = insert_missing(conn, kind, source, &missing).await?;
        let missing_names: Vec<&str> = missing.iter().map(|r| r.name.as_str()).collect();
        let reread = select_existing(conn, kind, source, &missing_names).await?;
        debug!(
            requested = missing.len(),
            inserted,
            reread = reread.len(),
            "resolver: created master rows"
        );
        existing.extend(reread);
    }

    let gaps = wanted
        .iter()
        .filter(|r| !existing.contains_key(&r.name))
        .map(|r| r.name.as_str())
        .collect_vec();
    for name in &gaps {
        warn!(kind = %kind, source = %source, name = %name, "resolver: name left unresolved");
    }

    Ok(existing)
}

type CacheKey = (Source, EntityKind, String);

#[derive(Debug, Clone, Copy)]
struct CachedEntity {
    id: i64,
    has_external_id: bool,
}

/// Per-worker cache in front of [`resolve_entities`].
///
/// Ids learned inside a record's transaction are staged; `commit` publishes
/// them once the transaction is durable and `discard` drops them on rollback,
/// so a cached id never points at a row that was rolled back. A cached row
/// stored without a vendor id goes back to the store when a ref offers one.
#[derive(Debug, Default)]
pub struct EntityResolver {
    cache: HashMap<CacheKey, CachedEntity>,
    staged: HashMap<CacheKey, CachedEntity>,
    hits: u64,
    misses: u64,
}

impl EntityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, key: &CacheKey) -> Option<CachedEntity> {
        self.staged
            .get(key)
            .or_else(|| self.cache.get(key))
            .copied()
    }

    pub async fn resolve(
        &mut self,
        conn: &mut SqliteConnection,
        kind: EntityKind,
        source: Source,
        refs: &[&EntityRef],
    ) -> Result<HashMap<String, i64>> {
        let mut out = HashMap::with_capacity(refs.len());
        let mut uncached: Vec<&EntityRef> = Vec::new();
        for r in refs {
            match self.lookup(&(source, kind, r.name.clone())) {
                Some(hit) if hit.has_external_id || r.external_id.is_none() => {
                    self.hits += 1;
                    out.insert(r.name.clone(), hit.id);
                }
                _ => uncached.push(*r),
            }
        }
        if uncached.is_empty() {
            return Ok(out);
        }
        self.misses += uncached.len() as u64;
        let resolved = resolve_with_external_ids(conn, kind, source, &uncached).await?;
        for (name, entity) in resolved {
            let cached = CachedEntity {
                id: entity.id,
                has_external_id: entity.external_id.is_some(),
            };
            self.staged.insert((source, kind, name.clone()), cached);
            out.insert(name, entity.id);
        }
        Ok(out)
    }

    pub fn commit(&mut self) {
        self.cache.extend(self.staged.drain());
    }

    pub fn discard(&mut self) {
        self.staged.clear();
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// `(hits, misses)` since construction.
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::db::Db;

    fn refs(names: &[&str]) -> Vec<EntityRef> {
        names.iter().filter_map(|n| EntityRef::named(n)).collect()
    }

    async fn count(db: &Db, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&db.pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn repeated_resolution_converges_on_one_row() {
        let db = Db::connect_in_memory().await.unwrap();
        let acme = refs(&["Acme"]);
        let acme: Vec<&EntityRef> = acme.iter().collect();

        let mut seen = Vec::new();
        for _ in 0..3 {
            let mut conn = db.pool.acquire().await.unwrap();
            let ids = resolve_entities(&mut conn, EntityKind::Maker, Source::A, &acme)
                .await
                .unwrap();
            seen.push(ids["Acme"]);
        }
        assert!(seen.iter().all(|id| *id == seen[0]));
        assert_eq!(count(&db, "makers").await, 1);
    }

    #[tokio::test]
    async fn padded_names_collapse_onto_the_same_entity() {
        let db = Db::connect_in_memory().await.unwrap();
        let raw = vec![
            EntityRef {
                name: "Acme".into(),
                external_id: None,
            },
            EntityRef {
                name: "Acme ".into(),
                external_id: None,
            },
        ];
        let borrowed: Vec<&EntityRef> = raw.iter().collect();
        let mut conn = db.pool.acquire().await.unwrap();
        let ids = resolve_entities(&mut conn, EntityKind::Genre, Source::B, &borrowed)
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);
        drop(conn);
        assert_eq!(count(&db, "genres").await, 1);
    }

    #[tokio::test]
    async fn sources_are_separate_namespaces() {
        let db = Db::connect_in_memory().await.unwrap();
        let acme = refs(&["Acme"]);
        let acme: Vec<&EntityRef> = acme.iter().collect();
        let mut conn = db.pool.acquire().await.unwrap();
        let a = resolve_entities(&mut conn, EntityKind::Label, Source::A, &acme)
            .await
            .unwrap();
        let b = resolve_entities(&mut conn, EntityKind::Label, Source::B, &acme)
            .await
            .unwrap();
        assert_ne!(a["Acme"], b["Acme"]);
    }

    #[tokio::test]
    async fn external_id_is_filled_once_and_never_replaced() {
        let db = Db::connect_in_memory().await.unwrap();
        let mut conn = db.pool.acquire().await.unwrap();
        let bare = EntityRef::named("Jane Roe").unwrap();
        let with_id = EntityRef::new("Jane Roe", Some("100".into())).unwrap();
        let other_id = EntityRef::new("Jane Roe", Some("999".into())).unwrap();

        for r in [&bare, &with_id, &other_id] {
            resolve_entities(&mut conn, EntityKind::Performer, Source::A, &[r])
                .await
                .unwrap();
        }
        let stored: Option<String> =
            sqlx::query_scalar("SELECT external_id FROM performers WHERE name = 'Jane Roe'")
                .fetch_one(&mut *conn)
                .await
                .unwrap();
        assert_eq!(stored.as_deref(), Some("100"));
    }

    #[tokio::test]
    async fn resolver_cache_publishes_only_committed_ids() {
        let db = Db::connect_in_memory().await.unwrap();
        let mut resolver = EntityResolver::new();
        let drama = refs(&["Drama"]);
        let drama: Vec<&EntityRef> = drama.iter().collect();

        let mut tx = db.pool.begin().await.unwrap();
        resolver
            .resolve(&mut tx, EntityKind::Genre, Source::A, &drama)
            .await
            .unwrap();
        tx.rollback().await.unwrap();
        resolver.discard();
        assert!(resolver.is_empty());

        let mut tx = db.pool.begin().await.unwrap();
        let ids = resolver
            .resolve(&mut tx, EntityKind::Genre, Source::A, &drama)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        resolver.commit();
        assert_eq!(resolver.len(), 1);

        let mut conn = db.pool.acquire().await.unwrap();
        let again = resolver
            .resolve(&mut conn, EntityKind::Genre, Source::A, &drama)
            .await
            .unwrap();
        assert_eq!(again["Drama"], ids["Drama"]);
        assert_eq!(resolver.stats(), (1, 2));
        let exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM genres WHERE id = ?")
            .bind(ids["Drama"])
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(exists, 1);
    }

    #[tokio::test]
    async fn cached_entity_still_picks_up_a_later_external_id() {
        let db = Db::connect_in_memory().await.unwrap();
        let mut resolver = EntityResolver::new();
        let bare = EntityRef::named("Acme").unwrap();
        let with_id = EntityRef::new("Acme", Some("45".into())).unwrap();

        let mut conn = db.pool.acquire().await.unwrap();
        let first = resolver
            .resolve(&mut conn, EntityKind::Maker, Source::A, &[&bare])
            .await
            .unwrap();
        resolver.commit();
        let second = resolver
            .resolve(&mut conn, EntityKind::Maker, Source::A, &[&with_id])
            .await
            .unwrap();
        resolver.commit();
        assert_eq!(first["Acme"], second["Acme"]);

        let stored: Option<String> =
            sqlx::query_scalar("SELECT external_id FROM makers WHERE name = 'Acme'")
                .fetch_one(&mut *conn)
                .await
                .unwrap();
        assert_eq!(stored.as_deref(), Some("45"));

        // Known id now cached; further refs are served without the store.
        resolver
            .resolve(&mut conn, EntityKind::Maker, Source::A, &[&with_id])
            .await
            .unwrap();
        assert_eq!(resolver.stats(), (1, 2));
    }

    #[tokio::test]
    async fn losing_the_insert_race_returns_the_winners_id() {
        let db = Db::connect_in_memory().await.unwrap();
        let mut conn = db.pool.acquire().await.unwrap();
        let winner = EntityRef::new("Drama", Some("7".into())).unwrap();
        let loser = EntityRef::named("Drama").unwrap();

        let won = insert_missing(&mut conn, EntityKind::Genre, Source::B, &[&winner])
            .await
            .unwrap();
        assert_eq!(won, 1);
        let winner_id: i64 = sqlx::query_scalar("SELECT id FROM genres WHERE name = 'Drama'")
            .fetch_one(&mut *conn)
            .await
            .unwrap();

        // The loser saw no row in its pre-select and inserts anyway.
        let lost = insert_missing(&mut conn, EntityKind::Genre, Source::B, &[&loser])
            .await
            .unwrap();
        assert_eq!(lost, 0);
        let reread = select_existing(&mut conn, EntityKind::Genre, Source::B, &["Drama"])
            .await
            .unwrap();
        assert_eq!(reread["Drama"].id, winner_id);
        assert_eq!(reread["Drama"].external_id.as_deref(), Some("7"));
        drop(conn);
        assert_eq!(count(&db, "genres").await, 1);
    }
}
