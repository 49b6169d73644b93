//! Blob storage: opaque bytes addressed by key.
//!
//! Two backends ship with the crate: [`MemoryBlobStore`] for tests and
//! embedding, and [`LocalBlobStore`] which keeps one file per key under a
//! base directory. Both hand out presigned URLs signed by a [`UrlSigner`].

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{ImageVaultError, Result};
use crate::utils::hmac_utils;

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Store `bytes` under `key`, replacing any previous blob, and return its
    /// public URL.
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<String>;

    /// Remove the blob. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Time-limited URL for reading an existing blob.
    async fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String>;
}

/// Reject keys that could escape the store's namespace.
pub fn validate_key(key: &str) -> Result<()> {
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/');
    if key.is_empty()
        || key.starts_with('/')
        || key.ends_with('/')
        || key.split('/').any(|segment| segment.is_empty() || segment == "." || segment == "..")
        || !key.chars().all(allowed)
    {
        return Err(ImageVaultError::Validation(format!(
            "invalid storage key: {:?}",
            key
        )));
    }
    Ok(())
}

/// Builds public and presigned URLs for keys and checks presigned ones.
///
/// A presigned URL looks like
/// `<base>/<key>?expires=<unix seconds>&signature=<hex HMAC-SHA256>` where the
/// signed message is `"<key>\n<expires>"`.
#[derive(Clone)]
pub struct UrlSigner {
    base_url: String,
    secret: Vec<u8>,
}

impl UrlSigner {
    pub fn new(base_url: impl Into<String>, secret: impl Into<Vec<u8>>) -> Result<Self> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(ImageVaultError::Validation(
                "Signing key must not be empty".into(),
            ));
        }
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret,
        })
    }

    pub fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }

    pub fn presign(&self, key: &str, ttl: Duration) -> Result<String> {
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let expires = Utc::now().timestamp().saturating_add(ttl_secs);
        self.presign_until(key, expires)
    }

    pub fn presign_until(&self, key: &str, expires: i64) -> Result<String> {
        let signature = hmac_utils::sign_hex(signed_message(key, expires).as_bytes(), &self.secret)?;
        Ok(format!(
            "{}?expires={}&signature={}",
            self.public_url(key),
            expires,
            signature
        ))
    }

    /// True when `signature` was issued for `key` and `expires` has not passed at `now`.
    pub fn verify(&self, key: &str, expires: i64, signature: &str, now: i64) -> Result<bool> {
        if now > expires {
            return Ok(false);
        }
        hmac_utils::verify_hex(signed_message(key, expires).as_bytes(), signature, &self.secret)
    }
}

fn signed_message(key: &str, expires: i64) -> String {
    format!("{}\n{}", key, expires)
}

struct StoredBlob {
    bytes: Vec<u8>,
    content_type: String,
}

/// Blob store held entirely in memory.
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, StoredBlob>>,
    signer: UrlSigner,
}

impl MemoryBlobStore {
    pub fn new(signer: UrlSigner) -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
            signer,
        }
    }

    /// All stored keys, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.blobs.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn content_type(&self, key: &str) -> Option<String> {
        self.blobs
            .read()
            .await
            .get(key)
            .map(|blob| blob.content_type.clone())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        validate_key(key)?;
        self.blobs
            .read()
            .await
            .get(key)
            .map(|blob| blob.bytes.clone())
            .ok_or_else(|| ImageVaultError::NotFound(format!("blob {}", key)))
    }

    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<String> {
        validate_key(key)?;
        let blob = StoredBlob {
            bytes: bytes.to_vec(),
            content_type: content_type.to_string(),
        };
        self.blobs.write().await.insert(key.to_string(), blob);
        debug!(key, len = bytes.len(), content_type, "stored blob in memory");
        Ok(self.signer.public_url(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        if self.blobs.write().await.remove(key).is_none() {
            warn!(key, "attempted to delete non-existent blob");
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        Ok(self.blobs.read().await.contains_key(key))
    }

    async fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String> {
        if !self.exists(key).await? {
            return Err(ImageVaultError::NotFound(format!("blob {}", key)));
        }
        self.signer.presign(key, ttl)
    }
}

/// Blob store keeping one file per key under `base_path`.
pub struct LocalBlobStore {
    base_path: PathBuf,
    signer: UrlSigner,
}

impl LocalBlobStore {
    pub fn new(base_path: impl Into<PathBuf>, signer: UrlSigner) -> Self {
        Self {
            base_path: base_path.into(),
            signer,
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.base_path.join(key))
    }

    async fn ensure_parent_dir(file_path: &Path) -> Result<()> {
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ImageVaultError::NotFound(format!("blob {}", key)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<String> {
        let path = self.path_for(key)?;
        Self::ensure_parent_dir(&path).await?;

        // Readers never observe a half-written blob.
        let mut tmp = path.clone().into_os_string();
        tmp.push(".part");
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &path).await?;

        debug!(key, len = bytes.len(), content_type, path = %path.display(), "stored blob");
        Ok(self.signer.public_url(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(key, "deleted blob");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(key, "attempted to delete non-existent blob");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String> {
        if !self.exists(key).await? {
            return Err(ImageVaultError::NotFound(format!("blob {}", key)));
        }
        self.signer.presign(key, ttl)
    }
}
