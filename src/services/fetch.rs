//! Source image retrieval.

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use std::io;
use std::path::PathBuf;
use tracing::debug;

/// Reads the encoded bytes behind an `image_ref`.
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Fetch the full encoded image.
    async fn fetch(&self, reference: &str) -> Result<Vec<u8>>;
}

/// Fetches `http(s)://` references over HTTP and everything else from disk.
///
/// `file://` references may carry an `expires` unix timestamp, as produced by
/// [`LocalStore`](super::LocalStore); an expired reference is rejected.
#[derive(Debug, Clone)]
pub struct ImageFetcher {
    client: Client,
}

/// A local reference split into its path and optional expiry.
#[derive(Debug, PartialEq, Eq)]
struct LocalRef {
    path: PathBuf,
    expires: Option<i64>,
}

fn parse_local(reference: &str) -> LocalRef {
    let Some(rest) = reference.strip_prefix("file://") else {
        return LocalRef {
            path: PathBuf::from(reference),
            expires: None,
        };
    };

    let (path, query) = rest.split_once('?').unwrap_or((rest, ""));
    let expires = query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == "expires")
        .and_then(|(_, v)| v.parse().ok());

    LocalRef {
        path: PathBuf::from(path),
        expires,
    }
}

fn fetch_error(
    reference: &str,
    transient: bool,
    source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> Error {
    Error::Fetch {
        reference: reference.to_string(),
        transient,
        source: source.into(),
    }
}

impl ImageFetcher {
    /// Create a fetcher using the shared HTTP client.
    pub const fn new(client: Client) -> Self {
        Self { client }
    }

    async fn fetch_http(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| Error::Http {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes().await.map_err(|source| Error::Http {
            url: url.to_string(),
            source,
        })?;
        Ok(bytes.to_vec())
    }

    async fn fetch_local(reference: &str) -> Result<Vec<u8>> {
        let local = parse_local(reference);

        if let Some(expires) = local.expires
            && Utc::now().timestamp() > expires
        {
            return Err(fetch_error(reference, false, "signed URL has expired"));
        }

        tokio::fs::read(&local.path).await.map_err(|e| {
            let transient = !matches!(
                e.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
            );
            fetch_error(reference, transient, e)
        })
    }
}

#[async_trait]
impl ImageSource for ImageFetcher {
    async fn fetch(&self, reference: &str) -> Result<Vec<u8>> {
        let bytes = if reference.starts_with("http://") || reference.starts_with("https://") {
            self.fetch_http(reference).await?
        } else {
            Self::fetch_local(reference).await?
        };
        debug!(bytes = bytes.len(), "fetched source image");
        Ok(bytes)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_local_variants() {
        assert_eq!(
            parse_local("/data/a.jpg"),
            LocalRef {
                path: PathBuf::from("/data/a.jpg"),
                expires: None
            }
        );
        assert_eq!(
            parse_local("file:///data/a.jpg?expires=1700000000"),
            LocalRef {
                path: PathBuf::from("/data/a.jpg"),
                expires: Some(1_700_000_000)
            }
        );
    }

    #[tokio::test]
    async fn test_fetch_local_file_url() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.jpg");
        std::fs::write(&path, b"jpeg").unwrap();

        let fetcher = ImageFetcher::new(Client::new());
        let far_future = Utc::now().timestamp() + 3600;
        let url = format!("file://{}?expires={far_future}", path.display());
        assert_eq!(fetcher.fetch(&url).await.unwrap(), b"jpeg");
    }

    #[tokio::test]
    async fn test_expired_url_is_permanent_failure() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.jpg");
        std::fs::write(&path, b"jpeg").unwrap();

        let fetcher = ImageFetcher::new(Client::new());
        let url = format!("file://{}?expires=1", path.display());
        let err = fetcher.fetch(&url).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_missing_file_is_not_transient() {
        let fetcher = ImageFetcher::new(Client::new());
        let err = fetcher.fetch("/definitely/not/here.jpg").await.unwrap_err();
        assert!(matches!(err, Error::Fetch { transient: false, .. }));
    }
}
