//! Ingestion, snapshot storage, freshness, and the refresh lock.

pub mod freshness;
pub mod ingest;
pub mod lock;
pub mod record;
pub mod snapshot;

pub use freshness::Freshness;
pub use ingest::{parse, parse_table, ParsedTable};
pub use lock::{Lease, LockAttempt, LockGuard};
pub use record::Record;
pub use snapshot::{Snapshot, SnapshotStore};
