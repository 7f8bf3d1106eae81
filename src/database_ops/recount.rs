//! Aggregate Recount: recomputes `product_count` on every master table.
//!
//! Counts come from live FKs and link rows, never from increments, so the
//! operation can be re-run at any time.

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, instrument};

use super::db::Db;
use crate::normalization::{EntityKind, MultiRole, SingleRole, Source};

fn single_role_sql(role: SingleRole) -> String {
    let table = role.kind().table();
    let column = role.column();
    format!(
        "UPDATE {table}
         SET product_count = (
             SELECT COUNT(*) FROM products p
             WHERE p.{column} = {table}.id AND p.source = {table}.source
         ),
         updated_at = ?
         WHERE source = ?"
    )
}

fn multi_role_sql(role: MultiRole) -> String {
    let table = role.kind().table();
    let (link, column) = role.link_table();
    format!(
        "UPDATE {table}
         SET product_count = (
             SELECT COUNT(DISTINCT l.product_id) FROM {link} l
             JOIN products p ON p.id = l.product_id
             WHERE l.{column} = {table}.id AND p.source = {table}.source
         ),
         updated_at = ?
         WHERE source = ?"
    )
}

/// Recounts all six kinds for `source` in one transaction. Returns rows touched per kind.
#[instrument(skip(db))]
pub async fn recount(db: &Db, source: Source) -> Result<Vec<(EntityKind, u64)>> {
    let statements = SingleRole::ALL
        .iter()
        .map(|r| (r.kind(), single_role_sql(*r)))
        .chain(MultiRole::ALL.iter().map(|r| (r.kind(), multi_role_sql(*r))));

    let now = Utc::now();
    let mut tx = db.begin_write().await?;
    let mut touched = Vec::with_capacity(EntityKind::ALL.len());
    for (kind, sql) in statements {
        let res = sqlx::query(&sql)
            .bind(now)
            .bind(source.as_str())
            .execute(&mut *tx)
            .await
            .with_context(|| format!("recount of {kind} failed"))?;
        info!(source = %source, kind = %kind, rows = res.rows_affected(), "recount: product_count refreshed");
        touched.push((kind, res.rows_affected()));
    }
    tx.commit().await?;
    Ok(touched)
}
