//! Payload fetching over HTTP(S) and from local files

use crate::error::{Error, Result};
use crate::host::PayloadFetcher;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const USER_AGENT: &str = concat!("segue/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Where a clip location points
#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Http(String),
    File(PathBuf),
}

fn classify(location: &str) -> Target {
    if location.starts_with("http://") || location.starts_with("https://") {
        Target::Http(location.to_string())
    } else if let Some(path) = location.strip_prefix("file://") {
        Target::File(PathBuf::from(path))
    } else {
        Target::File(PathBuf::from(location))
    }
}

/// Fetches clip payloads with reqwest, or from disk for file locations
pub struct HttpFetcher {
    http_client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Host(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self { http_client })
    }

    async fn fetch_http(&self, url: &str) -> Result<Vec<u8>> {
        let fetch_err = |reason: String| Error::Fetch {
            location: url.to_string(),
            reason,
        };

        tracing::debug!(url = %url, "Fetching clip payload");

        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| fetch_err(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(fetch_err(format!("HTTP {}", status.as_u16())));
        }

        let bytes = response.bytes().await.map_err(|e| fetch_err(e.to_string()))?;
        tracing::debug!(url = %url, bytes = bytes.len(), "Fetched clip payload");
        Ok(bytes.to_vec())
    }

    async fn fetch_file(&self, location: &str, path: PathBuf) -> Result<Vec<u8>> {
        tokio::fs::read(&path).await.map_err(|e| Error::Fetch {
            location: location.to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl PayloadFetcher for HttpFetcher {
    async fn fetch(&self, location: &str, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let work = async {
            match classify(location) {
                Target::Http(url) => self.fetch_http(&url).await,
                Target::File(path) => self.fetch_file(location, path).await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = work => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_classify_locations() {
        assert_eq!(
            classify("https://cdn.example.com/a.mp4"),
            Target::Http("https://cdn.example.com/a.mp4".to_string())
        );
        assert_eq!(classify("file:///tmp/a.mp4"), Target::File(PathBuf::from("/tmp/a.mp4")));
        assert_eq!(classify("clips/a.mp4"), Target::File(PathBuf::from("clips/a.mp4")));
    }

    #[tokio::test]
    async fn test_fetch_local_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"segment").unwrap();
        let location = format!("file://{}", file.path().display());

        let fetcher = HttpFetcher::new().unwrap();
        let bytes = fetcher.fetch(&location, &CancellationToken::new()).await.unwrap();
        assert_eq!(bytes, b"segment");
    }

    #[tokio::test]
    async fn test_missing_file_is_fetch_error() {
        let fetcher = HttpFetcher::new().unwrap();
        let err = fetcher
            .fetch("/definitely/not/here.mp4", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Fetch { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let fetcher = HttpFetcher::new().unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let err = fetcher.fetch("/anything", &token).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
