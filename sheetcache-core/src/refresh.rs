//! Refresh coordination and the stale-while-revalidate read path.
//!
//! A refresh walks `Acquiring → Fetching → Parsing → Committing` and returns to
//! idle from any step on failure. The lock guard lives for the whole walk, so
//! it is released on every exit path, including a panic. A failed fetch or
//! parse never touches the committed snapshot. The conditional variant
//! re-checks the snapshot once it holds the lock, so an attempt that lost the
//! race to a fresh commit does not fetch again.
//!
//! The read path always answers from the committed snapshot when one exists,
//! kicking off a detached refresh if it has expired. Only a cold start (no
//! snapshot at all) blocks on a fetch, and it takes the same lock so that
//! concurrent cold starts produce a single fetch.

use crate::config::RefreshSettings;
use crate::data::freshness::{self, now_epoch_secs, Freshness};
use crate::data::ingest;
use crate::data::lock::{self, Lease, LockAttempt};
use crate::data::snapshot::{Snapshot, SnapshotStore};
use crate::error::CacheError;
use crate::source::SourceClient;
use crate::status_log::StatusLog;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How often a blocked cold start re-checks for the winner's snapshot.
const COLD_START_POLL: Duration = Duration::from_millis(100);

/// Result of one refresh attempt.
#[derive(Debug)]
pub enum RefreshOutcome {
    /// A new snapshot was committed.
    Committed {
        records: usize,
        timestamp: i64,
        /// Same records as the snapshot it replaced.
        unchanged: bool,
        reclaimed_stale_lock: bool,
    },
    /// The lock was free but another attempt had already committed a fresh
    /// snapshot, so nothing was fetched.
    AlreadyCurrent { age_secs: i64 },
    /// Another attempt holds the lock. Expected under load, not an error.
    Skipped {
        holder: Option<String>,
        lock_age_secs: i64,
    },
    /// Fetch, parse or commit failed; the previous snapshot is intact.
    Failed {
        error: CacheError,
        reclaimed_stale_lock: bool,
    },
}

impl RefreshOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, RefreshOutcome::Committed { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, RefreshOutcome::Failed { .. })
    }
}

impl fmt::Display for RefreshOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshOutcome::Committed {
                records, unchanged, ..
            } => {
                write!(f, "committed {records} records")?;
                if *unchanged {
                    write!(f, " (unchanged)")?;
                }
                Ok(())
            }
            RefreshOutcome::AlreadyCurrent { age_secs } => {
                write!(f, "already refreshed by another process ({age_secs}s ago)")
            }
            RefreshOutcome::Skipped {
                holder,
                lock_age_secs,
            } => write!(
                f,
                "skipped: refresh already in progress by {} ({lock_age_secs}s)",
                holder.as_deref().unwrap_or("unknown owner")
            ),
            RefreshOutcome::Failed { error, .. } => write!(f, "failed: {error}"),
        }
    }
}

/// Where a served snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOrigin {
    Fresh,
    /// Past its TTL; a background refresh was requested.
    Stale,
    /// Built synchronously because nothing was cached.
    ColdStart,
}

/// Answer from the read path.
#[derive(Debug)]
pub struct Served {
    pub snapshot: Snapshot,
    pub origin: ServeOrigin,
    /// Detached refresh started for a stale snapshot. Callers may drop it.
    pub background: Option<JoinHandle<RefreshOutcome>>,
}

/// What `warm` did.
#[derive(Debug)]
pub enum WarmAction {
    AlreadyFresh { age_secs: i64 },
    Refreshed(RefreshOutcome),
}

#[derive(Debug)]
pub struct WarmReport {
    pub source: String,
    pub action: WarmAction,
}

impl WarmReport {
    pub fn is_failure(&self) -> bool {
        matches!(&self.action, WarmAction::Refreshed(outcome) if outcome.is_failure())
    }
}

/// Point-in-time view of one source's cache files.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub name: String,
    pub snapshot_path: PathBuf,
    pub freshness: Freshness,
    pub timestamp: Option<i64>,
    pub record_count: Option<usize>,
    pub data_hash: Option<String>,
    pub lock: Option<Lease>,
}

/// Owns one source's snapshot, lock and fetch settings.
#[derive(Clone)]
pub struct RefreshCoordinator {
    settings: Arc<RefreshSettings>,
    store: SnapshotStore,
    client: Arc<dyn SourceClient>,
    log: StatusLog,
}

impl RefreshCoordinator {
    pub fn new(settings: RefreshSettings, client: Arc<dyn SourceClient>) -> Self {
        let store = SnapshotStore::for_source(&settings.cache_dir, &settings.name);
        let log = if settings.status_log {
            StatusLog::in_dir(&settings.cache_dir)
        } else {
            StatusLog::disabled()
        };
        Self {
            settings: Arc::new(settings),
            store,
            client,
            log,
        }
    }

    pub fn settings(&self) -> &RefreshSettings {
        &self.settings
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    fn note(&self, message: &str) {
        self.log.append(&self.settings.name, message);
    }

    /// Run one refresh attempt to completion on the calling thread.
    pub fn refresh(&self) -> RefreshOutcome {
        self.run_refresh(false)
    }

    /// Like [`refresh`](Self::refresh), but once the lock is held, skip the
    /// fetch if another attempt committed a fresh snapshot in the meantime.
    pub fn refresh_if_expired(&self) -> RefreshOutcome {
        self.run_refresh(true)
    }

    fn run_refresh(&self, only_if_expired: bool) -> RefreshOutcome {
        let name = &self.settings.name;
        let owner_id = lock::new_owner_id();
        let attempt = lock::try_acquire(
            &self.store.lock_path(),
            &owner_id,
            self.settings.lock_stale_secs,
            now_epoch_secs(),
        );

        let (guard, reclaimed_stale_lock) = match attempt {
            Ok(LockAttempt::Acquired(guard)) => (guard, false),
            Ok(LockAttempt::Reclaimed {
                guard,
                previous_owner,
            }) => {
                let previous = previous_owner.as_deref().unwrap_or("unknown owner");
                warn!(source = %name, previous_owner = %previous, "reclaimed stale refresh lock");
                self.note(&format!("Removed stale lock file (previous owner: {previous})"));
                (guard, true)
            }
            Ok(LockAttempt::Contended { owner_id, age_secs }) => {
                debug!(source = %name, holder = ?owner_id, age_secs, "refresh already in progress");
                self.note("Another process is already refreshing cache");
                return RefreshOutcome::Skipped {
                    holder: owner_id,
                    lock_age_secs: age_secs,
                };
            }
            Err(error) => {
                warn!(source = %name, %error, "could not take refresh lock");
                self.note(&format!("Could not take refresh lock: {error}"));
                return RefreshOutcome::Failed {
                    error,
                    reclaimed_stale_lock: false,
                };
            }
        };

        if only_if_expired {
            if let Freshness::Fresh { age_secs } = self.freshness() {
                debug!(source = %name, age_secs, "snapshot refreshed while waiting for the lock");
                guard.release();
                self.note("Cache was already refreshed by another process");
                return RefreshOutcome::AlreadyCurrent { age_secs };
            }
        }

        info!(source = %name, owner = %guard.owner_id(), "started cache refresh");
        self.note(&format!("Started cache refresh (owner: {})", guard.owner_id()));

        let outcome = match self.fetch_parse_commit() {
            Ok((snapshot, unchanged)) => {
                info!(source = %name, records = snapshot.records.len(), unchanged, "refreshed cache");
                self.note(&format!(
                    "Successfully refreshed cache with {} records",
                    snapshot.records.len()
                ));
                RefreshOutcome::Committed {
                    records: snapshot.records.len(),
                    timestamp: snapshot.timestamp,
                    unchanged,
                    reclaimed_stale_lock,
                }
            }
            Err(error) => {
                warn!(source = %name, kind = error.kind(), %error, "cache refresh failed; keeping previous snapshot");
                self.note(&format!("Refresh failed ({}): {error}", error.kind()));
                RefreshOutcome::Failed {
                    error,
                    reclaimed_stale_lock,
                }
            }
        };

        guard.release();
        self.note("Completed cache refresh");
        outcome
    }

    /// Fetching → Parsing → Committing. Returns the snapshot and whether its
    /// records match the one it replaced.
    fn fetch_parse_commit(&self) -> Result<(Snapshot, bool), CacheError> {
        let request = self.settings.fetch_request();
        let bytes = self.client.fetch(&request)?;
        debug!(source = %self.settings.name, bytes = bytes.len(), client = self.client.name(), "fetched payload");

        let records = ingest::parse(&bytes, &self.settings.sentinel)?;

        let previous_hash = self.store.load().map(|s| s.data_hash);
        let snapshot = self.store.save(records)?;
        let unchanged = previous_hash.as_deref() == Some(snapshot.data_hash.as_str());
        Ok((snapshot, unchanged))
    }

    /// Start [`refresh_if_expired`](Self::refresh_if_expired) on a detached
    /// thread.
    pub fn spawn_refresh(&self) -> Option<JoinHandle<RefreshOutcome>> {
        let this = self.clone();
        thread::Builder::new()
            .name(format!("sheetcache-refresh-{}", self.settings.name))
            .spawn(move || this.refresh_if_expired())
            .map_err(|e| {
                warn!(source = %self.settings.name, error = %e, "failed to spawn background refresh");
            })
            .ok()
    }

    pub fn freshness(&self) -> Freshness {
        let timestamp = self.store.load().map(|s| s.timestamp);
        freshness::evaluate_at(timestamp, self.settings.ttl_secs, now_epoch_secs())
    }

    /// Serve the current snapshot.
    ///
    /// - Fresh snapshot: returned as is.
    /// - Expired snapshot: returned as is, with a background refresh started.
    /// - No snapshot: fetched synchronously; errors surface only here.
    pub fn read(&self) -> Result<Served, CacheError> {
        if let Some(snapshot) = self.store.load() {
            let expired = freshness::is_expired_at(
                Some(snapshot.timestamp),
                self.settings.ttl_secs,
                now_epoch_secs(),
            );
            if !expired {
                return Ok(Served {
                    snapshot,
                    origin: ServeOrigin::Fresh,
                    background: None,
                });
            }
            debug!(source = %self.settings.name, "serving stale snapshot; refreshing in background");
            return Ok(Served {
                snapshot,
                origin: ServeOrigin::Stale,
                background: self.spawn_refresh(),
            });
        }

        self.cold_start().map(|snapshot| Served {
            snapshot,
            origin: ServeOrigin::ColdStart,
            background: None,
        })
    }

    /// Build the first snapshot, or wait for a concurrent attempt to build it.
    fn cold_start(&self) -> Result<Snapshot, CacheError> {
        let started = Instant::now();
        let wait = self.settings.cold_start_wait();
        info!(source = %self.settings.name, "no cached snapshot; fetching synchronously");

        let lock_path = self.store.lock_path();
        let mut first_attempt = true;

        loop {
            if let Some(snapshot) = self.store.load() {
                return Ok(snapshot);
            }
            // While the winner holds the lock, poll quietly instead of
            // re-attempting (and re-logging) every tick.
            if first_attempt || !lock_path.exists() {
                first_attempt = false;
                match self.refresh_if_expired() {
                    RefreshOutcome::Committed { .. } | RefreshOutcome::AlreadyCurrent { .. } => {
                        continue
                    }
                    RefreshOutcome::Failed { error, .. } => return Err(error),
                    RefreshOutcome::Skipped { .. } => {}
                }
            }
            if started.elapsed() >= wait {
                return Err(CacheError::ColdStartTimeout {
                    waited_secs: started.elapsed().as_secs(),
                });
            }
            thread::sleep(COLD_START_POLL);
        }
    }

    /// Cache-warmer entry point: refresh if forced, absent or expired.
    pub fn warm(&self, force: bool) -> WarmReport {
        let action = match self.freshness() {
            Freshness::Fresh { age_secs } if !force => {
                self.note("Cache is still fresh, no update needed");
                WarmAction::AlreadyFresh { age_secs }
            }
            Freshness::Fresh { .. } => WarmAction::Refreshed(self.refresh()),
            _ => WarmAction::Refreshed(self.refresh_if_expired()),
        };
        WarmReport {
            source: self.settings.name.clone(),
            action,
        }
    }

    pub fn status(&self) -> SourceStatus {
        let snapshot = self.store.load();
        let timestamp = snapshot.as_ref().map(|s| s.timestamp);
        SourceStatus {
            name: self.settings.name.clone(),
            snapshot_path: self.store.path().to_path_buf(),
            freshness: freshness::evaluate_at(timestamp, self.settings.ttl_secs, now_epoch_secs()),
            timestamp,
            record_count: snapshot.as_ref().map(|s| s.records.len()),
            data_hash: snapshot
                .map(|s| s.data_hash)
                .filter(|hash| !hash.is_empty()),
            lock: lock::inspect(&self.store.lock_path()),
        }
    }
}

impl fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("source", &self.settings.name)
            .field("snapshot", &self.store.path())
            .field("client", &self.client.name())
            .finish()
    }
}
