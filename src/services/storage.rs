//! Object storage collaborator.

use crate::constants::DEFAULT_SIGNED_URL_TTL_SECS;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Location of a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Storage key, relative to the store.
    pub key: String,
    /// URL the object can be read from until it expires.
    pub url: String,
}

/// Stores encoded images and fragment crops.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `folder` and return its key and URL.
    async fn put(&self, bytes: &[u8], content_type: &str, folder: &str) -> Result<StoredObject>;

    /// Time-limited URL for `key`.
    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String>;

    /// Remove `key`. Returns `false` when it did not exist.
    async fn delete(&self, key: &str) -> Result<bool>;
}

/// File extension for a MIME type.
fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/bmp" => "bmp",
        "image/tiff" => "tiff",
        _ => "bin",
    }
}

/// Lowercase hex SHA-256 of `bytes`.
fn content_digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Object store on the local filesystem.
///
/// Keys are content addressed, so storing the same bytes twice in the same
/// folder yields the same key. Signed URLs are `file://` URLs carrying an
/// `expires` unix timestamp.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
    default_ttl: Duration,
}

impl LocalStore {
    /// Create a store rooted at `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            default_ttl: Duration::from_secs(DEFAULT_SIGNED_URL_TTL_SECS),
        }
    }

    /// Override the lifetime of URLs returned by [`ObjectStore::put`].
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path for `key`.
    ///
    /// # Errors
    ///
    /// Rejects keys that are absolute or escape the root.
    pub fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(Error::Storage {
                key: key.to_string(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "invalid storage key"),
            });
        }
        Ok(self.root.join(relative))
    }

    fn url_for(&self, path: &Path, ttl: Duration) -> String {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expires = Utc::now()
            .checked_add_signed(ttl)
            .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC)
            .timestamp();
        format!("file://{}?expires={expires}", path.display())
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn put(&self, bytes: &[u8], content_type: &str, folder: &str) -> Result<StoredObject> {
        let folder = folder.trim_matches('/');
        let key = format!(
            "{folder}/{}.{}",
            content_digest(bytes),
            extension_for(content_type)
        );
        let path = self.path_for(&key)?;

        let storage_err = |source| Error::Storage {
            key: key.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(storage_err)?;
        }
        tokio::fs::write(&path, bytes).await.map_err(storage_err)?;

        debug!(key = %key, bytes = bytes.len(), "stored object");
        let url = self.url_for(&path, self.default_ttl);
        Ok(StoredObject { key, url })
    }

    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String> {
        let path = self.path_for(key)?;
        if !tokio::fs::try_exists(&path)
            .await
            .map_err(|source| Error::Storage {
                key: key.to_string(),
                source,
            })?
        {
            return Err(Error::Storage {
                key: key.to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "object does not exist"),
            });
        }
        Ok(self.url_for(&path, ttl))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(Error::Storage {
                key: key.to_string(),
                source,
            }),
        }
    }
}
