//! JSON snapshot store.
//!
//! Layout: `{cache_dir}/{source}.json`
//!
//! Features:
//! - Atomic writes (write to a per-writer .tmp, rename into place), so readers
//!   never see a half-written snapshot
//! - Undecodable content reads as "nothing cached" instead of an error
//! - BLAKE3 hash of the records for change detection across refreshes

use super::freshness::now_epoch_secs;
use super::record::Record;
use crate::error::CacheError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// A complete, timestamped set of records. Replaced as a unit, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Commit time in epoch seconds.
    pub timestamp: i64,
    pub records: Vec<Record>,
    /// BLAKE3 hex digest of the serialized records.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data_hash: String,
}

impl Snapshot {
    pub fn new(timestamp: i64, records: Vec<Record>) -> Result<Self, CacheError> {
        let data_hash = hash_records(&records)?;
        Ok(Self {
            timestamp,
            records,
            data_hash,
        })
    }
}

/// BLAKE3 over the JSON encoding of `records`.
pub fn hash_records(records: &[Record]) -> Result<String, CacheError> {
    let bytes = serde_json::to_vec(records)
        .map_err(|e| CacheError::Serialization(format!("hash serialization: {e}")))?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

/// Persists and retrieves one snapshot file.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store for source `name` under `cache_dir`.
    pub fn for_source(cache_dir: impl AsRef<Path>, name: &str) -> Self {
        Self::new(cache_dir.as_ref().join(format!("{name}.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the refresh lock that guards this snapshot.
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Temp file for one writer. Unique per call so overlapping writers never
    /// share an inode.
    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(
            ".{}-{:016x}.tmp",
            std::process::id(),
            rand::random::<u64>()
        ));
        PathBuf::from(name)
    }

    /// Commit `records` stamped with the current time.
    pub fn save(&self, records: Vec<Record>) -> Result<Snapshot, CacheError> {
        self.save_at(records, now_epoch_secs())
    }

    /// Commit `records` stamped with `timestamp`.
    ///
    /// Writes are atomic: write to .tmp then rename.
    pub fn save_at(&self, records: Vec<Record>, timestamp: i64) -> Result<Snapshot, CacheError> {
        let snapshot = Snapshot::new(timestamp, records)?;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .map_err(|e| CacheError::Storage(format!("failed to create dir: {e}")))?;
        }

        let json = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| CacheError::Serialization(format!("snapshot serialization: {e}")))?;

        let tmp_path = self.tmp_path();
        fs::write(&tmp_path, json).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            CacheError::Storage(format!("snapshot write: {e}"))
        })?;

        fs::rename(&tmp_path, &self.path).map_err(|e| {
            // Clean up temp file on rename failure
            let _ = fs::remove_file(&tmp_path);
            CacheError::Storage(format!("atomic rename failed: {e}"))
        })?;

        Ok(snapshot)
    }

    /// The last committed snapshot, or `None` if absent or undecodable.
    pub fn load(&self) -> Option<Snapshot> {
        let content = fs::read(&self.path).ok()?;
        match serde_json::from_slice(&content) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "ignoring undecodable snapshot");
                None
            }
        }
    }

    /// Records of the last committed snapshot, regardless of age.
    pub fn load_ignoring_freshness(&self) -> Option<Vec<Record>> {
        self.load().map(|s| s.records)
    }

    pub fn load_with_timestamp(&self) -> Option<(i64, Vec<Record>)> {
        self.load().map(|s| (s.timestamp, s.records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_records() -> Vec<Record> {
        vec![
            Record::from_pairs([("Bil", "1"), ("Name", "Alpha"), ("Count", "10")]),
            Record::from_pairs([("Bil", "2"), ("Name", ""), ("Count", "5")]),
        ]
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::for_source(dir.path(), "hospital");

        store.save(sample_records()).unwrap();

        assert_eq!(store.load_ignoring_freshness(), Some(sample_records()));
        let (ts, records) = store.load_with_timestamp().unwrap();
        assert!(ts > 0);
        assert_eq!(records, sample_records());
    }

    #[test]
    fn creates_missing_directories() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path().join("a/b/c/data.json"));
        store.save_at(sample_records(), 42).unwrap();
        assert_eq!(store.load().unwrap().timestamp, 42);
        assert_eq!(fs::read_dir(dir.path().join("a/b/c")).unwrap().count(), 1);
    }

    #[test]
    fn writers_use_distinct_temp_files() {
        let store = SnapshotStore::new("/var/cache/facility_data.json");
        assert_ne!(store.tmp_path(), store.tmp_path());
        assert!(store.tmp_path().to_string_lossy().ends_with(".tmp"));
    }

    #[test]
    fn overlapping_writers_leave_one_whole_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::for_source(dir.path(), "hospital");
        let barrier = std::sync::Arc::new(std::sync::Barrier::new(4));

        let handles: Vec<_> = (0..4i64)
            .map(|writer| {
                let store = store.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    for round in 0..25 {
                        let records = vec![Record::from_pairs([
                            ("Bil", writer.to_string()),
                            ("Round", round.to_string()),
                        ])];
                        store.save_at(records, writer * 100 + round).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = store.load().unwrap();
        assert_eq!(snapshot.records.len(), 1);
        assert_eq!(snapshot.data_hash, hash_records(&snapshot.records).unwrap());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn absent_file_loads_none() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::for_source(dir.path(), "missing");
        assert!(store.load_ignoring_freshness().is_none());
        assert!(store.load_with_timestamp().is_none());
    }

    #[test]
    fn corrupt_file_loads_none() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::for_source(dir.path(), "hospital");
        fs::write(store.path(), b"{\"timestamp\": 12, \"records\": [").unwrap();
        assert!(store.load().is_none());
    }

    #[test]
    fn file_without_hash_still_loads() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::for_source(dir.path(), "hospital");
        fs::write(
            store.path(),
            r#"{"timestamp": 7, "records": [{"PTJ": "Hospital A", "Katil": "120"}]}"#,
        )
        .unwrap();
        let snapshot = store.load().unwrap();
        assert_eq!(snapshot.timestamp, 7);
        assert_eq!(snapshot.records[0].get("PTJ"), Some("Hospital A"));
        assert!(snapshot.data_hash.is_empty());
    }

    #[test]
    fn save_replaces_previous_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::for_source(dir.path(), "hospital");
        store.save_at(sample_records(), 1).unwrap();
        let replacement = vec![Record::from_pairs([("Bil", "9")])];
        store.save_at(replacement.clone(), 2).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.timestamp, 2);
        assert_eq!(loaded.records, replacement);
    }

    #[test]
    fn hash_tracks_content() {
        let a = hash_records(&sample_records()).unwrap();
        let b = hash_records(&sample_records()).unwrap();
        let c = hash_records(&sample_records()[..1]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn lock_path_sits_next_to_snapshot() {
        let store = SnapshotStore::new("/var/cache/facility_data.json");
        assert_eq!(
            store.lock_path(),
            PathBuf::from("/var/cache/facility_data.json.lock")
        );
    }
}
