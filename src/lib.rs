pub mod cli;
pub mod config;
pub mod database_ops;
pub mod normalization;
pub mod orchestrator;
pub mod tracing;

pub mod util {
    pub mod env;
}

pub use config::PipelineConfig;
pub use database_ops::db::Db;
pub use orchestrator::{Normalizer, PassSummary};
