//! Normalization pass: claims raw records and drives each one through
//! adapter -> resolver -> upsert -> relation sync -> checkpoint, one
//! transaction per record.

use anyhow::{anyhow, Result};
use futures::future::join_all;
use serde::Serialize;
use sqlx::SqliteConnection;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::config::PipelineConfig;
use crate::database_ops::checkpoint::{release_stale, CheckpointTracker};
use crate::database_ops::db::Db;
use crate::database_ops::entities::EntityResolver;
use crate::database_ops::products::{upsert_products, ProductRow};
use crate::database_ops::raw_store::{next_unprocessed_page, Partition, RawRecord, RecordOutcome};
use crate::database_ops::recount::recount;
use crate::database_ops::relations::{sync_relations, RelationEntry};
use crate::normalization::{adapter_for, AdapterOutput, CanonicalDraft, EntityKind, Source};

/// Counters for one pass; worker summaries are merged into one.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    pub scanned: u64,
    pub claimed: u64,
    pub skipped_claims: u64,
    pub processed: u64,
    pub empty: u64,
    pub failed: u64,
    pub items_skipped: u64,
    pub products_upserted: u64,
    pub relations_written: u64,
    pub resolution_gaps: u64,
}

impl PassSummary {
    pub fn merge(&mut self, other: &PassSummary) {
        self.scanned += other.scanned;
        self.claimed += other.claimed;
        self.skipped_claims += other.skipped_claims;
        self.processed += other.processed;
        self.empty += other.empty;
        self.failed += other.failed;
        self.items_skipped += other.items_skipped;
        self.products_upserted += other.products_upserted;
        self.relations_written += other.relations_written;
        self.resolution_gaps += other.resolution_gaps;
    }
}

/// What one successfully committed record contributed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct RecordStats {
    outcome: Option<RecordOutcome>,
    items_skipped: u64,
    products_upserted: u64,
    relations_written: u64,
    resolution_gaps: u64,
}

/// Shared cap on how many records a pass may claim.
#[derive(Debug)]
struct ClaimBudget {
    remaining: Option<AtomicU64>,
}

impl ClaimBudget {
    fn new(limit: Option<u64>) -> Self {
        Self {
            remaining: limit.map(AtomicU64::new),
        }
    }

    fn take(&self) -> bool {
        match &self.remaining {
            None => true,
            Some(left) => left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok(),
        }
    }

    fn refund(&self) {
        if let Some(left) = &self.remaining {
            left.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn exhausted(&self) -> bool {
        matches!(&self.remaining, Some(left) if left.load(Ordering::SeqCst) == 0)
    }
}

#[derive(Clone)]
pub struct Normalizer {
    db: Db,
    config: PipelineConfig,
}

impl Normalizer {
    pub fn new(db: Db, config: PipelineConfig) -> Self {
        Self { db, config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs one pass over the unprocessed records of `source`.
    ///
    /// Record failures are contained: the record is rolled back, released and
    /// counted. Only raw-store, checkpoint and recount failures end the pass
    /// with an error; records already processed stay processed.
    #[instrument(skip(self), fields(workers = self.config.workers))]
    pub async fn run_pass(&self, source: Source, limit: Option<u64>) -> Result<PassSummary> {
        release_stale(&self.db, source, self.config.claim_timeout).await?;

        let workers = self.config.workers.max(1);
        let budget = Arc::new(ClaimBudget::new(limit));
        let mut tasks = Vec::with_capacity(workers as usize);
        for index in 0..workers {
            let this = self.clone();
            let budget = Arc::clone(&budget);
            let partition = Partition { index, workers };
            tasks.push(tokio::spawn(async move {
                this.run_worker(source, partition, &budget).await
            }));
        }

        let mut summary = PassSummary::default();
        let mut first_err: Option<anyhow::Error> = None;
        for res in join_all(tasks).await {
            match res {
                Ok(Ok(part)) => summary.merge(&part),
                Ok(Err(e)) => {
                    error!(source = %source, error = %format!("{e:#}"), "normalize: worker aborted");
                    first_err.get_or_insert(e);
                }
                Err(join_err) => {
                    error!(source = %source, error = %join_err, "normalize: worker panicked");
                    first_err.get_or_insert(anyhow!(join_err));
                }
            }
        }
        if let Some(e) = first_err {
            warn!(source = %source, ?summary, "normalize: pass ended early");
            return Err(e);
        }

        if self.config.recount {
            recount(&self.db, source).await?;
        }
        info!(
            source = %source,
            scanned = summary.scanned,
            claimed = summary.claimed,
            skipped_claims = summary.skipped_claims,
            processed = summary.processed,
            empty = summary.empty,
            failed = summary.failed,
            items_skipped = summary.items_skipped,
            products_upserted = summary.products_upserted,
            relations_written = summary.relations_written,
            resolution_gaps = summary.resolution_gaps,
            "normalize: pass complete"
        );
        Ok(summary)
    }

    async fn run_worker(
        &self,
        source: Source,
        partition: Partition,
        budget: &ClaimBudget,
    ) -> Result<PassSummary> {
        let tracker = CheckpointTracker::for_worker(partition.index);
        let mut resolver = EntityResolver::new();
        let mut summary = PassSummary::default();
        let mut after_id = 0;

        debug!(worker = tracker.worker_id(), ?partition, "normalize: worker started");
        'pages: loop {
            if budget.exhausted() {
                break;
            }
            let page = next_unprocessed_page(
                &self.db,
                source,
                after_id,
                self.config.page_size,
                partition,
            )
            .await?;
            if page.is_empty() {
                break;
            }
            for raw in page {
                after_id = raw.id;
                summary.scanned += 1;
                if !budget.take() {
                    break 'pages;
                }
                if !tracker.claim(&self.db, raw.id).await? {
                    budget.refund();
                    summary.skipped_claims += 1;
                    continue;
                }
                summary.claimed += 1;

                match self.process_record(&mut resolver, &tracker, &raw).await {
                    Ok(stats) => {
                        resolver.commit();
                        summary.processed += 1;
                        summary.items_skipped += stats.items_skipped;
                        summary.products_upserted += stats.products_upserted;
                        summary.relations_written += stats.relations_written;
                        summary.resolution_gaps += stats.resolution_gaps;
                        if stats.outcome == Some(RecordOutcome::Empty) {
                            summary.empty += 1;
                        }
                    }
                    Err(e) => {
                        resolver.discard();
                        summary.failed += 1;
                        let message = format!("{e:#}");
                        warn!(raw_record_id = raw.id, source = %source, error = %message, "normalize: record failed, left unprocessed");
                        tracker.release(&self.db, raw.id, &message).await?;
                    }
                }
            }
        }
        let (hits, misses) = resolver.stats();
        debug!(
            worker = tracker.worker_id(),
            cached_entities = resolver.len(),
            cache_hits = hits,
            cache_misses = misses,
            "normalize: worker finished"
        );
        Ok(summary)
    }

    /// One record, one transaction: everything commits together or nothing does.
    async fn process_record(
        &self,
        resolver: &mut EntityResolver,
        tracker: &CheckpointTracker,
        raw: &RawRecord,
    ) -> Result<RecordStats> {
        let output = adapter_for(raw.source).normalize(raw)?;

        let mut tx = self.db.begin_write().await?;
        match self.apply_record(&mut tx, resolver, tracker, raw, &output).await {
            Ok(stats) => {
                tx.commit().await?;
                debug!(raw_record_id = raw.id, products = stats.products_upserted, "normalize: record processed");
                Ok(stats)
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!(raw_record_id = raw.id, error = %rb, "normalize: rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn apply_record(
        &self,
        conn: &mut SqliteConnection,
        resolver: &mut EntityResolver,
        tracker: &CheckpointTracker,
        raw: &RawRecord,
        output: &AdapterOutput,
    ) -> Result<RecordStats> {
        let mut stats = RecordStats {
            items_skipped: output.skipped.len() as u64,
            ..RecordStats::default()
        };

        if output.is_empty() {
            warn!(
                raw_record_id = raw.id,
                source = %raw.source,
                items_skipped = stats.items_skipped,
                "normalize: record has no usable items, marking empty"
            );
            tracker
                .mark_processed(conn, raw.id, RecordOutcome::Empty)
                .await?;
            stats.outcome = Some(RecordOutcome::Empty);
            return Ok(stats);
        }

        for chunk in output.drafts.chunks(self.config.batch_size.max(1)) {
            self.apply_chunk(conn, resolver, raw, chunk, &mut stats)
                .await?;
        }

        tracker
            .mark_processed(conn, raw.id, RecordOutcome::Normalized)
            .await?;
        stats.outcome = Some(RecordOutcome::Normalized);
        Ok(stats)
    }

    async fn apply_chunk(
        &self,
        conn: &mut SqliteConnection,
        resolver: &mut EntityResolver,
        raw: &RawRecord,
        drafts: &[CanonicalDraft],
        stats: &mut RecordStats,
    ) -> Result<()> {
        let mut resolved: HashMap<EntityKind, HashMap<String, i64>> = HashMap::new();
        for kind in EntityKind::ALL {
            let refs: Vec<_> = drafts.iter().flat_map(|d| d.refs_of_kind(kind)).collect();
            if refs.is_empty() {
                continue;
            }
            let ids = resolver.resolve(conn, kind, raw.source, &refs).await?;
            resolved.insert(kind, ids);
        }
        let id_for = |kind: EntityKind, name: &str| -> Option<i64> {
            resolved.get(&kind).and_then(|m| m.get(name)).copied()
        };

        let mut rows = Vec::with_capacity(drafts.len());
        let mut links: Vec<(String, Vec<RelationEntry>)> = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let mut single_ids = BTreeMap::new();
            for (role, entity) in &draft.singles {
                match id_for(role.kind(), &entity.name) {
                    Some(id) => {
                        single_ids.insert(*role, id);
                    }
                    None => stats.resolution_gaps += 1,
                }
            }
            let mut entries = Vec::new();
            for (role, entities) in &draft.multis {
                for entity in entities {
                    match id_for(role.kind(), &entity.name) {
                        Some(id) => entries.push(RelationEntry::new(*role, id)),
                        None => stats.resolution_gaps += 1,
                    }
                }
            }
            rows.push(ProductRow::from_draft(draft, &single_ids, raw.id));
            links.push((draft.business_key(), entries));
        }

        let ids = upsert_products(conn, &rows, self.config.batch_size).await?;
        stats.products_upserted += ids.len() as u64;

        // Later drafts for the same business key overwrite earlier ones.
        let mut relations: HashMap<i64, Vec<RelationEntry>> = HashMap::new();
        for (key, entries) in links {
            let product_id = ids
                .get(&key)
                .copied()
                .ok_or_else(|| anyhow!("upsert returned no id for {key}"))?;
            relations.insert(product_id, entries);
        }
        let product_ids: Vec<i64> = relations.keys().copied().collect();
        stats.relations_written += sync_relations(conn, &product_ids, &relations).await?;
        Ok(())
    }
}
