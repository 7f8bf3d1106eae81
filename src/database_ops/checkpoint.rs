//! Checkpoint Tracker: the only writer of `raw_records.status`.
//!
//! `unprocessed -> processing -> processed`, or back to `unprocessed` when the
//! record's unit of work fails. Claims are conditional updates, so two workers
//! can never both own one record.

use anyhow::{bail, Result};
use chrono::{Duration as ChronoDuration, Utc};
use sqlx::SqliteConnection;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::db::Db;
use super::raw_store::RecordOutcome;
use crate::normalization::Source;

/// Longest error text kept in `last_error`.
const MAX_ERROR_LEN: usize = 2000;

#[derive(Debug, Clone)]
pub struct CheckpointTracker {
    worker_id: String,
}

impl CheckpointTracker {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
        }
    }

    /// Tracker with a unique id for worker slot `index`.
    pub fn for_worker(index: u32) -> Self {
        Self::new(format!("w{index}-{}", &Uuid::new_v4().simple().to_string()[..8]))
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// `unprocessed -> processing`. Returns `false` when the record is not
    /// unprocessed anymore (claimed by another worker, or already processed).
    #[instrument(skip(self, db), fields(worker = %self.worker_id))]
    pub async fn claim(&self, db: &Db, id: i64) -> Result<bool> {
        let now = Utc::now();
        let res = sqlx::query(
            "UPDATE raw_records
             SET status = 'processing', claimed_by = ?, claimed_at = ?,
                 attempts = attempts + 1, updated_at = ?
             WHERE id = ? AND status = 'unprocessed'",
        )
        .bind(&self.worker_id)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&db.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    /// `processing -> processed`, inside the record's transaction so the flip
    /// commits together with the products it produced.
    pub async fn mark_processed(
        &self,
        conn: &mut SqliteConnection,
        id: i64,
        outcome: RecordOutcome,
    ) -> Result<()> {
        let now = Utc::now();
        let res = sqlx::query(
            "UPDATE raw_records
             SET status = 'processed', outcome = ?, claimed_by = NULL, claimed_at = NULL,
                 last_error = NULL, updated_at = ?
             WHERE id = ? AND status = 'processing' AND claimed_by = ?",
        )
        .bind(outcome.as_str())
        .bind(now)
        .bind(id)
        .bind(&self.worker_id)
        .execute(&mut *conn)
        .await?;
        if res.rows_affected() != 1 {
            bail!(
                "raw record {id} is no longer claimed by {}; refusing to mark processed",
                self.worker_id
            );
        }
        Ok(())
    }

    /// `processing -> unprocessed`, remembering why.
    pub async fn release(&self, db: &Db, id: i64, error: &str) -> Result<()> {
        let now = Utc::now();
        let message: String = error.chars().take(MAX_ERROR_LEN).collect();
        let res = sqlx::query(
            "UPDATE raw_records
             SET status = 'unprocessed', claimed_by = NULL, claimed_at = NULL,
                 last_error = ?, updated_at = ?
             WHERE id = ? AND status = 'processing' AND claimed_by = ?",
        )
        .bind(message)
        .bind(now)
        .bind(id)
        .bind(&self.worker_id)
        .execute(&db.pool)
        .await?;
        if res.rows_affected() == 0 {
            warn!(raw_record_id = id, worker = %self.worker_id, "checkpoint: release found no claim to drop");
        }
        Ok(())
    }
}

/// Flips every processed record of `source` back to unprocessed for a full
/// re-run. In-flight claims are left to their workers.
#[instrument(skip(db))]
pub async fn reset_source(db: &Db, source: Source) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE raw_records
         SET status = 'unprocessed', outcome = NULL, updated_at = ?
         WHERE source = ? AND status = 'processed'",
    )
    .bind(Utc::now())
    .bind(source.as_str())
    .execute(&db.pool)
    .await?;
    info!(source = %source, reset = res.rows_affected(), "checkpoint: reset processed records");
    Ok(res.rows_affected())
}

/// Returns claims older than `timeout` to the queue (crashed or killed workers).
#[instrument(skip(db))]
pub async fn release_stale(db: &Db, source: Source, timeout: Duration) -> Result<u64> {
    let now = Utc::now();
    let cutoff = now - ChronoDuration::from_std(timeout)?;
    let res = sqlx::query(
        "UPDATE raw_records
         SET status = 'unprocessed', claimed_by = NULL, claimed_at = NULL,
             last_error = 'claim expired', updated_at = ?
         WHERE source = ? AND status = 'processing' AND claimed_at <= ?",
    )
    .bind(now)
    .bind(source.as_str())
    .bind(cutoff)
    .execute(&db.pool)
    .await?;
    if res.rows_affected() > 0 {
        warn!(source = %source, released = res.rows_affected(), "checkpoint: released stale claims");
    }
    Ok(res.rows_affected())
}
