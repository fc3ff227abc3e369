//! Single-flight refresh lock backed by a lease file.
//!
//! The lock file sits next to the snapshot (`{snapshot}.lock`) and is created
//! with `create_new`, so exactly one attempt wins. The winner writes a lease
//! naming itself and an explicit expiry. A lease past its expiry is presumed to
//! belong to a crashed refresher and may be reclaimed by another attempt. When
//! the lease content cannot be read (the holder died between creating and
//! writing the file) the file's modification time stands in for `acquired_at`.
//! A stale file is renamed aside before it is discarded, so racing reclaimers
//! cannot delete each other's fresh lease.
//!
//! There is no fencing token: an owner that stays alive past its expiry can
//! have its lease reclaimed. Release is owner-checked, so the stale owner will
//! not delete its successor's lease on the way out.

use crate::error::CacheError;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Content of a lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner_id: String,
    /// Epoch seconds.
    pub acquired_at: i64,
    /// Epoch seconds after which the lease may be reclaimed.
    pub expires_at: i64,
}

/// Outcome of a lock acquisition attempt.
#[derive(Debug)]
pub enum LockAttempt {
    Acquired(LockGuard),
    /// A stale lease was removed and the lock taken over.
    Reclaimed {
        guard: LockGuard,
        previous_owner: Option<String>,
    },
    /// Another attempt holds a live lease.
    Contended {
        owner_id: Option<String>,
        age_secs: i64,
    },
}

/// Fresh owner identity: process id plus a random nonce.
pub fn new_owner_id() -> String {
    format!("{}-{:016x}", std::process::id(), rand::random::<u64>())
}

/// Read the current lease, if the lock file exists and is decodable.
pub fn inspect(path: &Path) -> Option<Lease> {
    let content = fs::read(path).ok()?;
    serde_json::from_slice(&content).ok()
}

/// Try to take the lock at `path` for `owner_id`, reclaiming it if stale.
///
/// `stale_after_secs` is both the lease duration written by the winner and the
/// age past which an unreadable lock file is reclaimed.
pub fn try_acquire(
    path: &Path,
    owner_id: &str,
    stale_after_secs: u64,
    now: i64,
) -> Result<LockAttempt, CacheError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .map_err(|e| CacheError::Storage(format!("failed to create lock dir: {e}")))?;
    }

    let lease = Lease {
        owner_id: owner_id.to_string(),
        acquired_at: now,
        expires_at: now.saturating_add(i64::try_from(stale_after_secs).unwrap_or(i64::MAX)),
    };

    if let Some(guard) = create_lease(path, &lease)? {
        return Ok(LockAttempt::Acquired(guard));
    }

    let existing = inspect(path);
    let (judged, age_secs) = match &existing {
        Some(held) => (Judged::Lease(held.clone()), now.saturating_sub(held.acquired_at)),
        None => match modified_epoch_secs(path) {
            Some(mtime) => (
                Judged::Unreadable { modified_at: mtime },
                now.saturating_sub(mtime),
            ),
            // Released between our create attempt and the inspection.
            None => {
                return Ok(match create_lease(path, &lease)? {
                    Some(guard) => LockAttempt::Acquired(guard),
                    None => LockAttempt::Contended {
                        owner_id: None,
                        age_secs: 0,
                    },
                });
            }
        },
    };

    let stale = match &existing {
        Some(held) => now > held.expires_at,
        None => i128::from(age_secs) > i128::from(stale_after_secs),
    };

    if !stale {
        return Ok(LockAttempt::Contended {
            owner_id: existing.map(|l| l.owner_id),
            age_secs,
        });
    }

    if !remove_if_unchanged(path, &judged, owner_id)? {
        return Ok(LockAttempt::Contended {
            owner_id: inspect(path).map(|l| l.owner_id),
            age_secs: 0,
        });
    }

    let previous_owner = existing.map(|l| l.owner_id);
    Ok(match create_lease(path, &lease)? {
        Some(guard) => LockAttempt::Reclaimed {
            guard,
            previous_owner,
        },
        None => LockAttempt::Contended {
            owner_id: inspect(path).map(|l| l.owner_id),
            age_secs: 0,
        },
    })
}

/// What a lock file looked like when it was judged stale.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Judged {
    Lease(Lease),
    /// No decodable lease; identified by its modification time.
    Unreadable { modified_at: i64 },
}

impl Judged {
    fn matches(&self, path: &Path) -> bool {
        match (self, inspect(path)) {
            (Judged::Lease(judged), Some(current)) => *judged == current,
            (Judged::Unreadable { modified_at }, None) => {
                modified_epoch_secs(path) == Some(*modified_at)
            }
            _ => false,
        }
    }
}

/// Discard the lock at `path` only if it is still the file judged stale.
///
/// The file is first renamed aside, which hands it to exactly one reclaimer,
/// and only then compared. A lock that changed hands in between (e.g. another
/// reclaimer's lease that is created but not yet written) is linked back into
/// place and `false` is returned. The lock holder's open handle keeps pointing
/// at the same inode throughout. If a newcomer takes the empty slot while the
/// lease is aside, the link fails and two holders overlap; this window is a
/// few syscalls wide.
fn remove_if_unchanged(path: &Path, judged: &Judged, owner_id: &str) -> Result<bool, CacheError> {
    let mut aside = path.as_os_str().to_os_string();
    aside.push(format!(".{owner_id}.stale"));
    let aside = PathBuf::from(aside);

    match fs::rename(path, &aside) {
        Ok(()) => {}
        // Another reclaimer moved it first and is taking over.
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(CacheError::Storage(format!("stale lock removal: {e}"))),
    }

    if judged.matches(&aside) {
        if let Err(e) = fs::remove_file(&aside) {
            debug!(path = %aside.display(), error = %e, "could not discard stale lock");
        }
        return Ok(true);
    }

    if let Err(e) = fs::hard_link(&aside, path) {
        debug!(path = %path.display(), error = %e, "lock slot retaken while restoring live lease");
    }
    let _ = fs::remove_file(&aside);
    Ok(false)
}

/// Exclusively create the lock file. `Ok(None)` if it already exists.
fn create_lease(path: &Path, lease: &Lease) -> Result<Option<LockGuard>, CacheError> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(None),
        Err(e) => return Err(CacheError::Storage(format!("lock create: {e}"))),
    };

    let written = serde_json::to_vec(lease)
        .map_err(|e| CacheError::Serialization(format!("lease serialization: {e}")))
        .and_then(|json| {
            file.write_all(&json)
                .map_err(|e| CacheError::Storage(format!("lease write: {e}")))
        });
    if let Err(e) = written {
        let _ = fs::remove_file(path);
        return Err(e);
    }

    Ok(Some(LockGuard {
        path: path.to_path_buf(),
        owner_id: lease.owner_id.clone(),
    }))
}

fn modified_epoch_secs(path: &Path) -> Option<i64> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    Some(chrono::DateTime::<chrono::Utc>::from(modified).timestamp())
}

/// Held lock. Releasing (explicitly or on drop) removes the lock file if it
/// still names this owner.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    owner_id: String,
}

impl LockGuard {
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release now instead of at end of scope.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match inspect(&self.path) {
            Some(lease) if lease.owner_id == self.owner_id => {
                if let Err(e) = fs::remove_file(&self.path) {
                    debug!(path = %self.path.display(), error = %e, "lock release failed");
                }
            }
            Some(lease) => debug!(
                owner = %self.owner_id,
                current = %lease.owner_id,
                "lock was reclaimed by another owner; leaving it in place"
            ),
            None => debug!(path = %self.path.display(), "lock already gone on release"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    const STALE: u64 = 300;

    fn lock_path(dir: &TempDir) -> PathBuf {
        dir.path().join("data.json.lock")
    }

    fn write_lease(path: &Path, owner: &str, acquired_at: i64) {
        let lease = Lease {
            owner_id: owner.into(),
            acquired_at,
            expires_at: acquired_at + STALE as i64,
        };
        fs::write(path, serde_json::to_vec(&lease).unwrap()).unwrap();
    }

    #[test]
    fn acquire_writes_lease_and_drop_releases() {
        let dir = TempDir::new().unwrap();
        let path = lock_path(&dir);

        let LockAttempt::Acquired(guard) = try_acquire(&path, "owner-a", STALE, 1_000).unwrap()
        else {
            panic!("expected Acquired");
        };
        let lease = inspect(&path).unwrap();
        assert_eq!(lease.owner_id, "owner-a");
        assert_eq!(lease.acquired_at, 1_000);
        assert_eq!(lease.expires_at, 1_300);

        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn live_lease_is_contended() {
        let dir = TempDir::new().unwrap();
        let path = lock_path(&dir);
        let _held = try_acquire(&path, "owner-a", STALE, 1_000).unwrap();

        match try_acquire(&path, "owner-b", STALE, 1_300).unwrap() {
            LockAttempt::Contended { owner_id, age_secs } => {
                assert_eq!(owner_id.as_deref(), Some("owner-a"));
                assert_eq!(age_secs, 300);
            }
            other => panic!("expected Contended, got {other:?}"),
        }
        assert_eq!(inspect(&path).unwrap().owner_id, "owner-a");
    }

    #[test]
    fn expired_lease_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let path = lock_path(&dir);
        write_lease(&path, "crashed", 1_000);

        match try_acquire(&path, "owner-b", STALE, 1_301).unwrap() {
            LockAttempt::Reclaimed {
                guard,
                previous_owner,
            } => {
                assert_eq!(previous_owner.as_deref(), Some("crashed"));
                assert_eq!(guard.owner_id(), "owner-b");
                assert_eq!(inspect(&path).unwrap().owner_id, "owner-b");
            }
            other => panic!("expected Reclaimed, got {other:?}"),
        }
        assert!(!path.exists());
    }

    #[test]
    fn unreadable_lock_uses_mtime() {
        let dir = TempDir::new().unwrap();
        let path = lock_path(&dir);
        fs::write(&path, b"12345").unwrap();
        let now = chrono::Utc::now().timestamp();

        assert!(matches!(
            try_acquire(&path, "owner-b", STALE, now).unwrap(),
            LockAttempt::Contended { owner_id: None, .. }
        ));

        let old = SystemTime::now() - Duration::from_secs(STALE + 60);
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(old)
            .unwrap();

        assert!(matches!(
            try_acquire(&path, "owner-b", STALE, now).unwrap(),
            LockAttempt::Reclaimed {
                previous_owner: None,
                ..
            }
        ));
    }

    #[test]
    fn stale_owner_does_not_release_successor() {
        let dir = TempDir::new().unwrap();
        let path = lock_path(&dir);

        let LockAttempt::Acquired(slow) = try_acquire(&path, "slow", STALE, 1_000).unwrap() else {
            panic!("expected Acquired");
        };
        let LockAttempt::Reclaimed { guard: next, .. } =
            try_acquire(&path, "next", STALE, 2_000).unwrap()
        else {
            panic!("expected Reclaimed");
        };

        slow.release();
        assert_eq!(inspect(&path).unwrap().owner_id, "next");
        next.release();
        assert!(!path.exists());
    }

    fn age_file(path: &Path, secs: u64) -> i64 {
        let old = SystemTime::now() - Duration::from_secs(secs);
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(old)
            .unwrap();
        modified_epoch_secs(path).unwrap()
    }

    #[test]
    fn unreadable_lock_replaced_by_unwritten_lease_is_kept() {
        let dir = TempDir::new().unwrap();
        let path = lock_path(&dir);
        fs::write(&path, b"").unwrap();
        let judged = Judged::Unreadable {
            modified_at: age_file(&path, STALE + 60),
        };

        // Another reclaimer got there first: old file gone, new one created
        // but its lease not written yet.
        fs::remove_file(&path).unwrap();
        let mut successor = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .unwrap();

        assert!(!remove_if_unchanged(&path, &judged, "late").unwrap());
        assert!(path.exists());

        // The successor's handle still writes the lease that sits at `path`.
        let lease = Lease {
            owner_id: "first".into(),
            acquired_at: 1,
            expires_at: 301,
        };
        successor
            .write_all(&serde_json::to_vec(&lease).unwrap())
            .unwrap();
        assert_eq!(inspect(&path), Some(lease));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn replaced_lease_is_kept() {
        let dir = TempDir::new().unwrap();
        let path = lock_path(&dir);
        write_lease(&path, "crashed", 1_000);
        let judged = Judged::Lease(inspect(&path).unwrap());

        write_lease(&path, "successor", 2_000);
        assert!(!remove_if_unchanged(&path, &judged, "late").unwrap());
        assert_eq!(inspect(&path).unwrap().owner_id, "successor");
    }

    #[test]
    fn unchanged_stale_lock_is_removed() {
        let dir = TempDir::new().unwrap();
        let path = lock_path(&dir);
        fs::write(&path, b"garbage").unwrap();
        let judged = Judged::Unreadable {
            modified_at: age_file(&path, STALE + 60),
        };

        assert!(remove_if_unchanged(&path, &judged, "reclaimer").unwrap());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn racing_reclaimers_of_unreadable_lock_take_it_once() {
        let dir = TempDir::new().unwrap();
        let path = lock_path(&dir);
        let now = chrono::Utc::now().timestamp();

        for round in 0..20 {
            fs::write(&path, b"").unwrap();
            age_file(&path, STALE + 60);

            let barrier = std::sync::Arc::new(std::sync::Barrier::new(4));
            let handles: Vec<_> = (0..4)
                .map(|i| {
                    let path = path.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        try_acquire(&path, &format!("r{round}-{i}"), STALE, now).unwrap()
                    })
                })
                .collect();
            let attempts: Vec<LockAttempt> =
                handles.into_iter().map(|h| h.join().unwrap()).collect();

            let winners = attempts
                .iter()
                .filter(|a| !matches!(a, LockAttempt::Contended { .. }))
                .count();
            assert_eq!(winners, 1, "round {round}: {attempts:?}");
            drop(attempts);
            assert!(!path.exists());
        }
    }

    #[test]
    fn owner_ids_are_unique() {
        assert_ne!(new_owner_id(), new_owner_id());
    }
}
