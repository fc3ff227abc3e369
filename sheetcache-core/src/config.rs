//! Cache configuration.
//!
//! Loaded once from a TOML file and resolved per source into an explicit
//! [`RefreshSettings`] value that the coordinator owns. Nothing is read from
//! ambient process state.
//!
//! ```toml
//! cache_dir = "cache"
//! ttl_secs = 3600
//!
//! [[sources]]
//! name = "hospital"
//! url = "https://docs.google.com/spreadsheets/d/ID/export?format=csv&gid=0"
//! sentinel = "PTJ"
//!
//! # One layout spread over several sheets: cached as pkd_0, pkd_1.
//! [[sources]]
//! name = "pkd"
//! sheets = [
//!     "https://docs.google.com/spreadsheets/d/ID_A/export?format=csv",
//!     "https://docs.google.com/spreadsheets/d/ID_B/export?format=csv",
//! ]
//! sentinel = "Bil"
//! ```

use crate::error::CacheError;
use crate::source::{FetchRequest, DEFAULT_USER_AGENT};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_ttl_secs() -> u64 {
    3600
}

fn default_lock_stale_secs() -> u64 {
    300
}

fn default_fetch_timeout_secs() -> u64 {
    10
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_status_log() -> bool {
    true
}

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Directory holding snapshots, lock files and the status log.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Seconds after which a snapshot is expired.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Seconds after which a refresh lock is presumed abandoned.
    #[serde(default = "default_lock_stale_secs")]
    pub lock_stale_secs: u64,

    /// Upper bound on a single fetch.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Write `cache_refresh.log` into `cache_dir`.
    #[serde(default = "default_status_log")]
    pub status_log: bool,

    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

/// One cached entity and where its data comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// Unique name; also the snapshot file stem.
    pub name: String,
    /// CSV export URL, or a `file://` path.
    #[serde(default)]
    pub url: Option<String>,
    /// Several URLs sharing one layout, used instead of `url`. Sheet `i` is
    /// cached as `{name}_{i}`.
    #[serde(default)]
    pub sheets: Vec<String>,
    /// First-column value identifying the header row.
    pub sentinel: String,
    /// Overrides the global TTL for this source.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

impl SourceConfig {
    /// `(cache name, url)` for each sheet of this source.
    pub fn sheet_urls(&self) -> Vec<(String, &str)> {
        match &self.url {
            Some(url) => vec![(self.name.clone(), url.as_str())],
            None => self
                .sheets
                .iter()
                .enumerate()
                .map(|(index, url)| (format!("{}_{index}", self.name), url.as_str()))
                .collect(),
        }
    }
}

/// Everything one coordinator needs, resolved for a single source.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshSettings {
    pub name: String,
    pub url: String,
    pub sentinel: String,
    pub ttl_secs: u64,
    pub lock_stale_secs: u64,
    pub fetch_timeout: Duration,
    pub user_agent: String,
    pub cache_dir: PathBuf,
    pub status_log: bool,
}

impl RefreshSettings {
    pub fn fetch_request(&self) -> FetchRequest {
        FetchRequest {
            url: self.url.clone(),
            timeout: self.fetch_timeout,
            user_agent: self.user_agent.clone(),
        }
    }

    /// How long a cold start waits for another process's first fetch.
    pub fn cold_start_wait(&self) -> Duration {
        self.fetch_timeout + Duration::from_secs(5)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            ttl_secs: default_ttl_secs(),
            lock_stale_secs: default_lock_stale_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            user_agent: default_user_agent(),
            status_log: default_status_log(),
            sources: Vec::new(),
        }
    }
}

impl CacheConfig {
    /// Parse and validate TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, CacheError> {
        let config: Self =
            toml::from_str(text).map_err(|e| CacheError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file. A relative `cache_dir` is
    /// resolved against the file's directory.
    pub fn load(path: &Path) -> Result<Self, CacheError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CacheError::Config(format!("{}: {e}", path.display())))?;
        let mut config = Self::from_toml_str(&text)?;
        if config.cache_dir.is_relative() {
            if let Some(base) = path.parent() {
                config.cache_dir = base.join(&config.cache_dir);
            }
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CacheError> {
        if self.ttl_secs == 0 {
            return Err(CacheError::Config("ttl_secs must be > 0".into()));
        }
        if self.lock_stale_secs == 0 {
            return Err(CacheError::Config("lock_stale_secs must be > 0".into()));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(CacheError::Config("fetch_timeout_secs must be > 0".into()));
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            let name = source.name.trim();
            if name.is_empty() {
                return Err(CacheError::Config("source name must not be empty".into()));
            }
            if name.contains(['/', '\\']) || name.starts_with('.') {
                return Err(CacheError::Config(format!(
                    "source name '{name}' must be a plain file stem"
                )));
            }
            match (&source.url, source.sheets.is_empty()) {
                (Some(_), false) => {
                    return Err(CacheError::Config(format!(
                        "source '{name}' sets both url and sheets"
                    )))
                }
                (None, true) => {
                    return Err(CacheError::Config(format!("source '{name}' has no url")))
                }
                _ => {}
            }
            for (cache_name, url) in source.sheet_urls() {
                if url.trim().is_empty() {
                    return Err(CacheError::Config(format!("source '{cache_name}' has no url")));
                }
                if !seen.insert(cache_name.clone()) {
                    return Err(CacheError::Config(format!(
                        "duplicate source name '{cache_name}'"
                    )));
                }
            }
            if source.sentinel.trim().is_empty() {
                return Err(CacheError::Config(format!("source '{name}' has no sentinel")));
            }
            if source.ttl_secs == Some(0) {
                return Err(CacheError::Config(format!(
                    "source '{name}': ttl_secs must be > 0"
                )));
            }
        }
        Ok(())
    }

    /// Cache names of every configured source, multi-sheet sources expanded.
    pub fn source_names(&self) -> Vec<String> {
        self.all_settings().into_iter().map(|s| s.name).collect()
    }

    /// Resolve the settings for cache name `name`.
    pub fn settings_for(&self, name: &str) -> Result<RefreshSettings, CacheError> {
        self.all_settings()
            .into_iter()
            .find(|s| s.name == name)
            .ok_or_else(|| {
                CacheError::Config(format!(
                    "unknown source '{name}' (configured: {})",
                    self.source_names().join(", ")
                ))
            })
    }

    /// Settings for every cached sheet, in file order.
    pub fn all_settings(&self) -> Vec<RefreshSettings> {
        self.sources
            .iter()
            .flat_map(|source| {
                source
                    .sheet_urls()
                    .into_iter()
                    .map(move |(name, url)| self.resolve(source, name, url))
            })
            .collect()
    }

    fn resolve(&self, source: &SourceConfig, name: String, url: &str) -> RefreshSettings {
        RefreshSettings {
            name,
            url: url.to_string(),
            sentinel: source.sentinel.trim().to_string(),
            ttl_secs: source.ttl_secs.unwrap_or(self.ttl_secs),
            lock_stale_secs: self.lock_stale_secs,
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            user_agent: self.user_agent.clone(),
            cache_dir: self.cache_dir.clone(),
            status_log: self.status_log,
        }
    }
}
