//! Domain-specific error types for beacon-hunt.
//!
//! Uses `thiserror` for the component errors that the pipeline inspects and
//! accumulates, and `anyhow` at the application boundary.

use thiserror::Error;

use crate::pipeline::RunReport;

/// Errors produced by the scoring engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScoringError {
    #[error("Insufficient data points for scoring (need at least {required}, got {actual})")]
    InsufficientData { required: usize, actual: usize },
}

/// Errors produced by a store handle.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Write to collection '{collection}' failed: {reason}")]
    WriteFailed { collection: String, reason: String },

    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store snapshot could not be (de)serialized: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors produced while enumerating connection pairs.
#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("Failed to read connection records: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed connection record on line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Run-level fatal errors.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The input sequence broke. `report` holds what was applied before the
    /// pipeline drained and stopped.
    #[error("Collector failed after {} pairs: {source}", .report.stats.pairs_analyzed)]
    Collector {
        #[source]
        source: CollectorError,
        report: Box<RunReport>,
    },

    /// The writer task died. Updates still queued for it were lost, so
    /// `report` may count pairs whose records never reached the store.
    #[error("Writer task failed after {} updates: {source}", .report.stats.updates_applied)]
    Writer {
        #[source]
        source: tokio::task::JoinError,
        report: Box<RunReport>,
    },

    #[error("Writer could not acquire a store handle: {0}")]
    Store(#[from] StoreError),
}

/// Result type alias using anyhow for application-level error handling.
pub type Result<T> = anyhow::Result<T>;
