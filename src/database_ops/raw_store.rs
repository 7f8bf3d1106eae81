//! Raw Store: append-only inbox of vendor payloads.
//!
//! Crawlers own inserts; the pipeline only reads pages of unprocessed records
//! here. Status transitions belong to `checkpoint::CheckpointTracker`.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, Row};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::{info, instrument, warn};

use super::db::Db;
use crate::normalization::Source;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordStatus {
    Unprocessed,
    Processing,
    Processed,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Unprocessed => "unprocessed",
            RecordStatus::Processing => "processing",
            RecordStatus::Processed => "processed",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unprocessed" => Ok(RecordStatus::Unprocessed),
            "processing" => Ok(RecordStatus::Processing),
            "processed" => Ok(RecordStatus::Processed),
            other => Err(anyhow!("unknown raw record status {other:?}")),
        }
    }
}

/// How a processed record was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordOutcome {
    /// At least one product was upserted from it.
    Normalized,
    /// Valid payload with no usable item.
    Empty,
}

impl RecordOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordOutcome::Normalized => "normalized",
            RecordOutcome::Empty => "empty",
        }
    }
}

impl FromStr for RecordOutcome {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "normalized" => Ok(RecordOutcome::Normalized),
            "empty" => Ok(RecordOutcome::Empty),
            other => Err(anyhow!("unknown raw record outcome {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RawRecord {
    pub id: i64,
    pub source: Source,
    pub external_batch_id: String,
    /// Opaque vendor payload, decoded only by the matching adapter.
    pub payload: String,
    pub status: RecordStatus,
    pub outcome: Option<RecordOutcome>,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub(crate) const RAW_RECORD_COLUMNS: &str = "id, source, external_batch_id, payload, status, \
     outcome, attempts, last_error, created_at, updated_at";

impl RawRecord {
    pub fn processed(&self) -> bool {
        self.status == RecordStatus::Processed
    }

    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self> {
        let source: String = row.try_get("source")?;
        let status: String = row.try_get("status")?;
        let outcome: Option<String> = row.try_get("outcome")?;
        Ok(Self {
            id: row.try_get("id")?,
            source: source.parse()?,
            external_batch_id: row.try_get("external_batch_id")?,
            payload: row.try_get("payload")?,
            status: status.parse()?,
            outcome: outcome.as_deref().map(RecordOutcome::from_str).transpose()?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    #[cfg(test)]
    pub(crate) fn fixture(id: i64, source: Source, payload: &str) -> Self {
        let now = Utc::now();
        Self {
            id,
            source,
            external_batch_id: format!("fixture-{id}"),
            payload: payload.to_string(),
            status: RecordStatus::Unprocessed,
            outcome: None,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Restricts a page to one worker's share of ids (`id % workers == index`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub index: u32,
    pub workers: u32,
}

impl Partition {
    pub const WHOLE: Partition = Partition {
        index: 0,
        workers: 1,
    };
}

/// Unprocessed records of `source` with `id > after_id`, ascending, at most `page_size`.
#[instrument(skip(db))]
pub async fn next_unprocessed_page(
    db: &Db,
    source: Source,
    after_id: i64,
    page_size: i64,
    partition: Partition,
) -> Result<Vec<RawRecord>> {
    let sql = format!(
        "SELECT {RAW_RECORD_COLUMNS} FROM raw_records
         WHERE source = ? AND status = 'unprocessed' AND id > ? AND (id % ?) = ?
         ORDER BY id ASC
         LIMIT ?"
    );
    let rows = sqlx::query(&sql)
        .bind(source.as_str())
        .bind(after_id)
        .bind(i64::from(partition.workers.max(1)))
        .bind(i64::from(partition.index))
        .bind(page_size.max(1))
        .fetch_all(&db.pool)
        .await
        .context("raw store page query failed")?;
    rows.iter().map(RawRecord::from_row).collect()
}

pub async fn get_raw_record(db: &Db, id: i64) -> Result<Option<RawRecord>> {
    let sql = format!("SELECT {RAW_RECORD_COLUMNS} FROM raw_records WHERE id = ?");
    let row = sqlx::query(&sql).bind(id).fetch_optional(&db.pool).await?;
    row.as_ref().map(RawRecord::from_row).transpose()
}

/// Appends a payload; an existing `(source, external_batch_id)` is left untouched.
/// Returns the new id, or `None` for a duplicate.
#[instrument(skip(db, payload))]
pub async fn insert_raw_record(
    db: &Db,
    source: Source,
    external_batch_id: &str,
    payload: &str,
) -> Result<Option<i64>> {
    let now = Utc::now();
    let row = sqlx::query(
        "INSERT INTO raw_records (source, external_batch_id, payload, status, created_at, updated_at)
         VALUES (?, ?, ?, 'unprocessed', ?, ?)
         ON CONFLICT (source, external_batch_id) DO NOTHING
         RETURNING id",
    )
    .bind(source.as_str())
    .bind(external_batch_id)
    .bind(payload)
    .bind(now)
    .bind(now)
    .fetch_optional(&db.pool)
    .await?;
    Ok(row.map(|r| r.get::<i64, _>("id")))
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportSummary {
    pub inserted: usize,
    pub duplicates: usize,
    pub invalid_lines: usize,
}

/// Splits one NDJSON line into `(external_batch_id, payload)`.
///
/// Accepts `{"externalBatchId": "...", "payload": {...}}` or a bare payload, which
/// gets `<stem>-<line>` as its batch id.
fn import_line(line: &str, stem: &str, line_no: usize) -> Option<(String, String)> {
    let value: Value = serde_json::from_str(line).ok()?;
    let batch_id = value
        .get("externalBatchId")
        .or_else(|| value.get("external_batch_id"))
        .and_then(crate::normalization::fields::scalar_string);
    match (batch_id, value.get("payload")) {
        (Some(id), Some(payload)) => Some((id, payload.to_string())),
        _ => Some((format!("{stem}-{line_no}"), value.to_string())),
    }
}

/// Loads newline-delimited JSON payloads into the raw store.
#[instrument(skip(db))]
pub async fn import_ndjson(db: &Db, source: Source, path: &Path) -> Result<ImportSummary> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "import".to_string());

    let mut summary = ImportSummary::default();
    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        if line.trim().is_empty() {
            continue;
        }
        let Some((batch_id, payload)) = import_line(line, &stem, line_no) else {
            warn!(line = line_no, file = %path.display(), "import: line is not valid JSON");
            summary.invalid_lines += 1;
            continue;
        };
        match insert_raw_record(db, source, &batch_id, &payload).await? {
            Some(_) => summary.inserted += 1,
            None => summary.duplicates += 1,
        }
    }
    info!(
        source = %source,
        inserted = summary.inserted,
        duplicates = summary.duplicates,
        invalid_lines = summary.invalid_lines,
        "import: raw records loaded"
    );
    Ok(summary)
}
