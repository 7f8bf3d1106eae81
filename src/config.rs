//! Pipeline settings resolved from the environment; CLI flags override fields afterwards.

use std::time::Duration;

use crate::database_ops::products::{DEFAULT_BATCH_SIZE, MAX_BATCH_SIZE};
use crate::util::env::{db_url, env_parse};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub busy_timeout: Duration,
    /// Drafts per upsert statement.
    pub batch_size: usize,
    /// Raw records fetched per page.
    pub page_size: i64,
    pub workers: u32,
    pub claim_timeout: Duration,
    /// Recount master-entity product counts after a pass.
    pub recount: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_url: db_url(None),
            max_connections: 5,
            busy_timeout: Duration::from_secs(30),
            batch_size: DEFAULT_BATCH_SIZE,
            page_size: 500,
            workers: 1,
            claim_timeout: Duration::from_secs(900),
            recount: true,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            database_url: d.database_url,
            max_connections: env_parse("DB_MAX_CONNS", d.max_connections).max(1),
            busy_timeout: Duration::from_secs(env_parse(
                "DB_BUSY_TIMEOUT_SECS",
                d.busy_timeout.as_secs(),
            )),
            batch_size: clamp_batch_size(env_parse("NORMALIZE_BATCH_SIZE", d.batch_size)),
            page_size: env_parse("NORMALIZE_PAGE_SIZE", d.page_size).max(1),
            workers: env_parse("NORMALIZE_WORKERS", d.workers).max(1),
            claim_timeout: Duration::from_secs(env_parse(
                "CLAIM_TIMEOUT_SECS",
                d.claim_timeout.as_secs(),
            )),
            recount: d.recount,
        }
    }

    pub fn with_database_url(mut self, url: Option<&str>) -> Self {
        if url.is_some() {
            self.database_url = db_url(url);
        }
        self
    }

    pub fn with_batch_size(mut self, batch_size: Option<usize>) -> Self {
        if let Some(n) = batch_size {
            self.batch_size = clamp_batch_size(n);
        }
        self
    }

    pub fn with_workers(mut self, workers: Option<u32>) -> Self {
        if let Some(n) = workers {
            self.workers = n.max(1);
        }
        self
    }

    /// Workers never outnumber pool connections; each holds one per record.
    pub fn effective_max_connections(&self) -> u32 {
        self.max_connections.max(self.workers)
    }
}

pub fn clamp_batch_size(n: usize) -> usize {
    n.clamp(1, MAX_BATCH_SIZE)
}
