//! SheetCache Core: stale-while-revalidate cache for spreadsheet-backed records.
//!
//! This crate contains:
//! - CSV ingestion with sentinel-based header detection and row cleaning
//! - Atomically replaced JSON snapshots with a freshness policy
//! - A lease-file lock so that at most one refresh runs at a time
//! - The refresh coordinator and its non-blocking read path
//! - Source clients (HTTP, local file) and TOML configuration

pub mod config;
pub mod data;
pub mod error;
pub mod refresh;
pub mod source;
pub mod status_log;

pub use config::{CacheConfig, RefreshSettings, SourceConfig};
pub use data::{Freshness, Record, Snapshot, SnapshotStore};
pub use error::CacheError;
pub use refresh::{
    RefreshCoordinator, RefreshOutcome, ServeOrigin, Served, SourceStatus, WarmAction, WarmReport,
};
pub use source::{FetchRequest, FileSource, HttpSource, SourceClient};
pub use status_log::StatusLog;

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time check: types handed to background threads are Send + Sync.
    #[allow(dead_code)]
    fn assert_send_sync() {
        fn require_send<T: Send>() {}
        fn require_sync<T: Sync>() {}

        require_send::<RefreshCoordinator>();
        require_sync::<RefreshCoordinator>();
        require_send::<RefreshOutcome>();
        require_send::<Snapshot>();
        require_sync::<Snapshot>();
        require_send::<CacheError>();
        require_sync::<CacheError>();
    }
}
