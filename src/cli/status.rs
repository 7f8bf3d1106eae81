//! `feedctl status`: raw-record queue state plus canonical/master row counts.

use anyhow::Result;
use serde::Serialize;
use sqlx::Row;
use std::fmt::Write as _;

use crate::database_ops::db::Db;
use crate::normalization::{EntityKind, Source};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceStatus {
    pub source: String,
    pub unprocessed: i64,
    pub processing: i64,
    pub processed_normalized: i64,
    pub processed_empty: i64,
    /// Unprocessed records that already failed at least once.
    pub retrying: i64,
    pub products: i64,
    pub entities: Vec<(String, i64)>,
}

async fn source_status(db: &Db, source: Source) -> Result<SourceStatus> {
    let mut status = SourceStatus {
        source: source.to_string(),
        ..SourceStatus::default()
    };

    let rows = sqlx::query(
        "SELECT status, outcome, COUNT(*) AS n,
                SUM(CASE WHEN last_error IS NOT NULL THEN 1 ELSE 0 END) AS errored
         FROM raw_records WHERE source = ?
         GROUP BY status, outcome",
    )
    .bind(source.as_str())
    .fetch_all(&db.pool)
    .await?;
    for row in rows {
        let n: i64 = row.try_get("n")?;
        let errored: i64 = row.try_get("errored")?;
        match (
            row.try_get::<String, _>("status")?.as_str(),
            row.try_get::<Option<String>, _>("outcome")?.as_deref(),
        ) {
            ("unprocessed", _) => {
                status.unprocessed += n;
                status.retrying += errored;
            }
            ("processing", _) => status.processing += n,
            ("processed", Some("empty")) => status.processed_empty += n,
            ("processed", _) => status.processed_normalized += n,
            _ => {}
        }
    }

    status.products = sqlx::query_scalar("SELECT COUNT(*) FROM products WHERE source = ?")
        .bind(source.as_str())
        .fetch_one(&db.pool)
        .await?;
    for kind in EntityKind::ALL {
        let n: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE source = ?",
            kind.table()
        ))
        .bind(source.as_str())
        .fetch_one(&db.pool)
        .await?;
        status.entities.push((kind.table().to_string(), n));
    }
    Ok(status)
}

/// Status for one source, or every known source.
pub async fn collect(db: &Db, source: Option<Source>) -> Result<Vec<SourceStatus>> {
    let sources: Vec<Source> = match source {
        Some(s) => vec![s],
        None => Source::ALL.to_vec(),
    };
    let mut out = Vec::with_capacity(sources.len());
    for s in sources {
        out.push(source_status(db, s).await?);
    }
    Ok(out)
}

pub fn render(statuses: &[SourceStatus]) -> String {
    let mut out = String::new();
    writeln!(out, "FEED STATUS:").ok();
    for s in statuses {
        writeln!(out, "source {}:", s.source).ok();
        writeln!(
            out,
            "  raw_records: unprocessed={} (retrying={}) processing={} processed={} (empty={})",
            s.unprocessed,
            s.retrying,
            s.processing,
            s.processed_normalized + s.processed_empty,
            s.processed_empty
        )
        .ok();
        writeln!(out, "  products: {}", s.products).ok();
        let entities = s
            .entities
            .iter()
            .map(|(table, n)| format!("{table}={n}"))
            .collect::<Vec<_>>()
            .join(" ");
        writeln!(out, "  entities: {entities}").ok();
    }
    out
}

pub async fn run(db: &Db, source: Option<Source>) -> Result<()> {
    let statuses = collect(db, source).await?;
    println!("{}", render(&statuses));
    Ok(())
}
