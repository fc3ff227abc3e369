//! External source clients.
//!
//! The [`SourceClient`] trait abstracts over where raw tabular bytes come from
//! (a published spreadsheet export over HTTP, a local file) so the refresh
//! coordinator can be driven by a mock in tests. Clients only fetch bytes;
//! they know nothing about parsing or the cache.

use crate::error::CacheError;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Default user agent; spreadsheet export endpoints reject some bare clients.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// One fetch: where, how long to wait, and who to say we are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub timeout: Duration,
    pub user_agent: String,
}

/// Trait for byte sources.
pub trait SourceClient: Send + Sync {
    /// Human-readable name of this client.
    fn name(&self) -> &str;

    /// Fetch the raw payload. Any failure, including timeouts and non-success
    /// statuses, is reported as [`CacheError::SourceUnavailable`].
    fn fetch(&self, request: &FetchRequest) -> Result<Vec<u8>, CacheError>;
}

/// Blocking HTTP client. The timeout and user agent are applied per request.
pub struct HttpSource {
    client: reqwest::blocking::Client,
}

impl HttpSource {
    pub fn new() -> Result<Self, CacheError> {
        let client = reqwest::blocking::Client::builder()
            .build()
            .map_err(|e| CacheError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl SourceClient for HttpSource {
    fn name(&self) -> &str {
        "http"
    }

    fn fetch(&self, request: &FetchRequest) -> Result<Vec<u8>, CacheError> {
        let resp = self
            .client
            .get(&request.url)
            .timeout(request.timeout)
            .header(reqwest::header::USER_AGENT, &request.user_agent)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    CacheError::SourceUnavailable(format!(
                        "timed out after {}s: {e}",
                        request.timeout.as_secs()
                    ))
                } else {
                    CacheError::SourceUnavailable(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(CacheError::SourceUnavailable(format!(
                "HTTP {status} from {}",
                request.url
            )));
        }

        resp.bytes()
            .map(|b| b.to_vec())
            .map_err(|e| CacheError::SourceUnavailable(format!("reading body: {e}")))
    }
}

/// Reads a local file. Accepts plain paths and `file://` URLs.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileSource;

impl FileSource {
    fn path_of(url: &str) -> PathBuf {
        PathBuf::from(url.strip_prefix("file://").unwrap_or(url))
    }
}

impl SourceClient for FileSource {
    fn name(&self) -> &str {
        "file"
    }

    fn fetch(&self, request: &FetchRequest) -> Result<Vec<u8>, CacheError> {
        let path = Self::path_of(&request.url);
        fs::read(&path)
            .map_err(|e| CacheError::SourceUnavailable(format!("{}: {e}", path.display())))
    }
}

/// Pick a client for `url`: [`FileSource`] for `file://` URLs, HTTP otherwise.
pub fn client_for_url(url: &str) -> Result<Box<dyn SourceClient>, CacheError> {
    if url.starts_with("file://") {
        Ok(Box::new(FileSource))
    } else {
        Ok(Box::new(HttpSource::new()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(url: String) -> FetchRequest {
        FetchRequest {
            url,
            timeout: Duration::from_secs(1),
            user_agent: DEFAULT_USER_AGENT.into(),
        }
    }

    #[test]
    fn file_source_reads_path_and_file_url() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sheet.csv");
        fs::write(&path, b"Bil,Name\n1,Alpha\n").unwrap();

        let plain = FileSource.fetch(&request(path.display().to_string())).unwrap();
        let url = FileSource
            .fetch(&request(format!("file://{}", path.display())))
            .unwrap();
        assert_eq!(plain, b"Bil,Name\n1,Alpha\n");
        assert_eq!(url, plain);
    }

    #[test]
    fn missing_file_is_source_unavailable() {
        let dir = TempDir::new().unwrap();
        let err = FileSource
            .fetch(&request(dir.path().join("nope.csv").display().to_string()))
            .unwrap_err();
        assert!(matches!(err, CacheError::SourceUnavailable(_)));
    }

    #[test]
    fn picks_client_by_scheme() {
        assert_eq!(client_for_url("file:///tmp/x.csv").unwrap().name(), "file");
        assert_eq!(
            client_for_url("https://docs.google.com/spreadsheets/d/x/export?format=csv")
                .unwrap()
                .name(),
            "http"
        );
    }
}
