//! Error types at the store and engine seams.
//!
//! Expected business conditions (no drivers nearby, race lost, lock
//! contention, ineligible driver) are never errors; they are outcome
//! variants on the operations that produce them. The types here cover
//! infrastructure failures only.

use thiserror::Error;

/// Failure talking to the fast store or the durable store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("stored value could not be decoded: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Failure writing an archived route file.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("parquet: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("arrow: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
}

/// Top-level engine failure surfaced to the request-handling layer.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("route archive failed: {0}")]
    Archive(#[from] ArchiveError),
}
