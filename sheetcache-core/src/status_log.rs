//! Append-only, human-readable refresh log.
//!
//! One line per event: `YYYY-MM-DD HH:MM:SS - [source] message`. This is for
//! operators tailing the cache directory; nothing parses it.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const LOG_FILE_NAME: &str = "cache_refresh.log";

#[derive(Debug, Clone)]
pub struct StatusLog {
    path: Option<PathBuf>,
}

impl StatusLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// `cache_refresh.log` inside `cache_dir`.
    pub fn in_dir(cache_dir: impl AsRef<Path>) -> Self {
        Self::new(cache_dir.as_ref().join(LOG_FILE_NAME))
    }

    /// A log that discards everything.
    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append one line. Write failures are swallowed: the log is observability only.
    pub fn append(&self, source: &str, message: &str) {
        let Some(path) = &self.path else {
            return;
        };
        let line = format!(
            "{} - [{source}] {message}\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        if let Err(e) = write_line(path, &line) {
            debug!(path = %path.display(), error = %e, "status log write failed");
        }
    }
}

fn write_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn appends_timestamped_lines() {
        let dir = TempDir::new().unwrap();
        let log = StatusLog::in_dir(dir.path().join("cache"));

        log.append("hospital", "Started refresh");
        log.append("hospital", "Completed refresh");

        let content = fs::read_to_string(log.path().unwrap()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" - [hospital] Started refresh"));
        assert_eq!(lines[1].as_bytes()[4], b'-');
    }

    #[test]
    fn disabled_log_writes_nothing() {
        let log = StatusLog::disabled();
        log.append("hospital", "ignored");
        assert!(log.path().is_none());
    }
}
