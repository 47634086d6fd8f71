//! Remote binary fetching.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{
    HeaderMap, HeaderName, CONTENT_DISPOSITION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE,
};
use reqwest::Client;
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Typed fetch errors enabling retry classification.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP error {status} fetching {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Request for {url} failed (bytes_so_far={bytes_written}): {source}")]
    Http {
        source: reqwest::Error,
        url: String,
        bytes_written: u64,
    },

    #[error("Disk error: {0}")]
    Disk(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FetchError {
    /// Whether this error is transient and worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            FetchError::Http { .. } => true,
            FetchError::Disk(_) => false,
            FetchError::Other(_) => false,
        }
    }
}

/// The response headers attachment validation and naming care about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchHeaders {
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub content_disposition: Option<String>,
    /// Where the request ended up after redirects, when that differs from
    /// the requested URL.
    pub final_location: Option<String>,
}

impl FetchHeaders {
    fn from_response(headers: &HeaderMap, requested: &str, final_url: &str) -> Self {
        let text = |name: HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            content_length: text(CONTENT_LENGTH).and_then(|v| v.trim().parse().ok()),
            content_type: text(CONTENT_TYPE),
            content_encoding: text(CONTENT_ENCODING),
            content_disposition: text(CONTENT_DISPOSITION),
            final_location: (final_url != requested).then(|| final_url.to_string()),
        }
    }
}

/// A binary written to disk by a fetcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedFile {
    pub path: PathBuf,
    pub status: u16,
    pub bytes_written: u64,
    pub headers: FetchHeaders,
}

/// Fetches a remote URL into a local file.
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    async fn get(&self, url: &str, dest: &Path, timeout: Duration) -> Result<FetchedFile, FetchError>;
}

/// Streaming HTTP fetcher.
///
/// Bodies stream into a `.part` file next to `dest`, which is renamed into
/// place once the transfer completes, so `dest` never holds a truncated file.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn build() -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Other(anyhow::anyhow!("Failed to build HTTP client: {e}")))?;
        Ok(Self::new(client))
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

#[async_trait]
impl RemoteFetcher for HttpFetcher {
    async fn get(&self, url: &str, dest: &Path, timeout: Duration) -> Result<FetchedFile, FetchError> {
        let part = part_path(dest);
        let _ = fs::remove_file(&part).await;

        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT_ENCODING, "identity")
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| FetchError::Http {
                source: e,
                url: url.to_string(),
                bytes_written: 0,
            })?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Err(FetchError::HttpStatus {
                status,
                url: url.to_string(),
            });
        }

        let headers = FetchHeaders::from_response(response.headers(), url, response.url().as_str());

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&part)
            .await?;

        let mut bytes_written: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::warn!(
                        "Body error for {} (status={}, content_length={:?}, bytes_so_far={}): {}",
                        url,
                        status,
                        headers.content_length,
                        bytes_written,
                        e
                    );
                    drop(file);
                    let _ = fs::remove_file(&part).await;
                    return Err(FetchError::Http {
                        source: e,
                        url: url.to_string(),
                        bytes_written,
                    });
                }
            };
            file.write_all(&chunk).await?;
            bytes_written += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);

        fs::rename(&part, dest).await?;
        tracing::debug!(url = %url, bytes = bytes_written, "Fetched remote file");

        Ok(FetchedFile {
            path: dest.to_path_buf(),
            status,
            bytes_written,
            headers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_status_classification() {
        let status = |status| FetchError::HttpStatus {
            status,
            url: "x".into(),
        };
        assert!(!status(404).is_retryable());
        assert!(!status(403).is_retryable());
        assert!(status(429).is_retryable());
        assert!(status(500).is_retryable());
        assert!(status(503).is_retryable());
    }

    #[test]
    fn test_disk_and_other_not_retryable() {
        assert!(!FetchError::Disk(std::io::Error::other("disk full")).is_retryable());
        assert!(!FetchError::Other(anyhow::anyhow!("unknown")).is_retryable());
    }

    #[test]
    fn test_connection_error_retryable() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let err = rt
            .block_on(reqwest::Client::new().get("http://127.0.0.1:1").send())
            .unwrap_err();
        let e = FetchError::Http {
            source: err,
            url: "x".into(),
            bytes_written: 0,
        };
        assert!(e.is_retryable());
    }

    #[test]
    fn test_headers_extraction() {
        let mut map = HeaderMap::new();
        map.insert(CONTENT_LENGTH, HeaderValue::from_static("42"));
        map.insert(CONTENT_TYPE, HeaderValue::from_static("image/png"));
        map.insert(
            CONTENT_DISPOSITION,
            HeaderValue::from_static("attachment; filename=\"a.png\""),
        );
        let h = FetchHeaders::from_response(&map, "https://a/x", "https://cdn/x");
        assert_eq!(h.content_length, Some(42));
        assert_eq!(h.content_type.as_deref(), Some("image/png"));
        assert_eq!(h.content_encoding, None);
        assert_eq!(h.final_location.as_deref(), Some("https://cdn/x"));

        let h = FetchHeaders::from_response(&map, "https://a/x", "https://a/x");
        assert_eq!(h.final_location, None);
    }

    #[test]
    fn test_part_path_sits_next_to_dest() {
        assert_eq!(
            part_path(Path::new("/up/2024/01/img.jpg")),
            PathBuf::from("/up/2024/01/img.jpg.part")
        );
    }
}
