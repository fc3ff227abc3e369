//! Structured error types for cache operations.
//!
//! Every failure a refresh can hit maps to one variant here. Lock contention
//! and stale-lock reclaims are not errors; they are reported through
//! [`crate::refresh::RefreshOutcome`] instead.

use thiserror::Error;

/// Errors from ingestion, storage, and fetching.
///
/// These are designed to be displayable in both the CLI and the status log.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("malformed table: no row starts with header token '{sentinel}'")]
    MalformedTable { sentinel: String },

    #[error("no valid records found ({rows_after_header} rows after header)")]
    EmptyResult { rows_after_header: usize },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("timed out after {waited_secs}s waiting for another process to build the first snapshot")]
    ColdStartTimeout { waited_secs: u64 },
}

impl CacheError {
    /// Short stable label for log lines and status reports.
    pub fn kind(&self) -> &'static str {
        match self {
            CacheError::SourceUnavailable(_) => "source_unavailable",
            CacheError::InvalidPayload(_) => "invalid_payload",
            CacheError::MalformedTable { .. } => "malformed_table",
            CacheError::EmptyResult { .. } => "empty_result",
            CacheError::Storage(_) => "storage",
            CacheError::Serialization(_) => "serialization",
            CacheError::Config(_) => "config",
            CacheError::ColdStartTimeout { .. } => "cold_start_timeout",
        }
    }
}
