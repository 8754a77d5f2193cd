//! Blob storage capability.
//!
//! The gateway never talks to an object store directly. Every read and write
//! goes through the [`BlobStore`] trait, keyed by plain storage keys such as
//! `packages/<guid>` or `oci/blobs/<digest>`.
//!
//! Two implementations live here:
//!
//! - [`InMemoryBlobStore`] keeps blobs in a [`DashMap`]. Blobs above a
//!   configurable threshold are spilled to temporary files and removed again
//!   when the entry is dropped.
//! - [`TimeoutBlobStore`] wraps any other store and bounds every call with
//!   [`tokio::time::timeout`], so a hung backend surfaces as
//!   [`BlobStoreError::Timeout`].

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tokio::io::AsyncReadExt;
use tracing::{debug, trace, warn};

/// Default size (in bytes) above which [`InMemoryBlobStore`] spills to disk.
///
/// The default is 512 KiB.
pub const DEFAULT_MAX_MEMORY_SIZE: usize = 524_288;

/// Errors reported by a [`BlobStore`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlobStoreError {
    /// No blob is stored under the key.
    #[error("no blob stored under key {key}")]
    NotFound {
        /// The missing key.
        key: String,
    },

    /// The backend failed for another reason.
    #[error("blob store backend error: {0}")]
    Backend(String),

    /// The backend did not answer within the configured bound.
    #[error("blob store call timed out")]
    Timeout,
}

/// Abstract blob storage used by every handler and the upload workers.
#[async_trait]
pub trait BlobStore: Send + Sync + fmt::Debug {
    /// Fetch the blob stored under `key`.
    async fn get(&self, key: &str) -> Result<Bytes, BlobStoreError>;

    /// Store `content` under `key`, replacing any previous blob.
    async fn put(&self, key: &str, content: Bytes) -> Result<(), BlobStoreError>;

    /// Whether a blob is stored under `key`.
    async fn exists(&self, key: &str) -> Result<bool, BlobStoreError>;

    /// Remove the blob stored under `key`.
    async fn delete(&self, key: &str) -> Result<(), BlobStoreError>;
}

// ---------------------------------------------------------------------------
// Resource keys
// ---------------------------------------------------------------------------

/// The three artifact families served on the resource routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Application source packages.
    Packages,
    /// Staged application droplets.
    Droplets,
    /// Buildpack archives.
    Buildpacks,
}

impl ResourceKind {
    /// The path segment (and storage key prefix) for this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Packages => "packages",
            Self::Droplets => "droplets",
            Self::Buildpacks => "buildpacks",
        }
    }

    /// The multipart form field that carries an upload of this kind.
    #[must_use]
    pub fn form_field(self) -> &'static str {
        match self {
            Self::Packages => "package",
            Self::Droplets => "droplet",
            Self::Buildpacks => "buildpack",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = InvalidBlobKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "packages" => Ok(Self::Packages),
            "droplets" => Ok(Self::Droplets),
            "buildpacks" => Ok(Self::Buildpacks),
            other => Err(InvalidBlobKey(format!("unknown resource kind: {other}"))),
        }
    }
}

/// A resource path segment that does not name a valid blob.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid blob key: {0}")]
pub struct InvalidBlobKey(pub String);

/// Storage key of a resource blob: `{kind}/{guid}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobKey {
    kind: ResourceKind,
    guid: String,
}

impl BlobKey {
    /// Build a key, rejecting GUIDs outside `[A-Za-z0-9_.-]+`.
    pub fn new(kind: ResourceKind, guid: &str) -> Result<Self, InvalidBlobKey> {
        let valid = !guid.is_empty()
            && guid
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'));
        if !valid {
            return Err(InvalidBlobKey(format!("invalid guid: {guid:?}")));
        }
        Ok(Self {
            kind,
            guid: guid.to_owned(),
        })
    }

    /// Parse `kind` and `guid` path segments.
    pub fn parse(kind: &str, guid: &str) -> Result<Self, InvalidBlobKey> {
        Self::new(kind.parse()?, guid)
    }

    /// The resource kind.
    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// The resource GUID.
    #[must_use]
    pub fn guid(&self) -> &str {
        &self.guid
    }

    /// The storage key, `{kind}/{guid}`.
    #[must_use]
    pub fn storage_key(&self) -> String {
        self.to_string()
    }

    /// The URL path of the resource, `/{kind}/{guid}`.
    #[must_use]
    pub fn resource_path(&self) -> String {
        format!("/{self}")
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.guid)
    }
}

// ---------------------------------------------------------------------------
// StoredBlob
// ---------------------------------------------------------------------------

/// A stored blob, either in memory or spilled to a file that is removed on
/// drop.
enum StoredBlob {
    InMemory { data: Bytes },
    OnDisk { path: PathBuf, size: u64 },
}

impl fmt::Debug for StoredBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InMemory { data } => f
                .debug_struct("InMemory")
                .field("size", &data.len())
                .finish(),
            Self::OnDisk { path, size } => f
                .debug_struct("OnDisk")
                .field("path", path)
                .field("size", size)
                .finish(),
        }
    }
}

impl Drop for StoredBlob {
    fn drop(&mut self) {
        if let Self::OnDisk { path, .. } = self {
            match std::fs::remove_file(path.as_path()) {
                Ok(()) => trace!(path = %path.display(), "removed spilled blob"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to remove spilled blob");
                }
            }
        }
    }
}

impl StoredBlob {
    async fn read_all(&self) -> Result<Bytes, BlobStoreError> {
        match self {
            Self::InMemory { data } => Ok(data.clone()),
            Self::OnDisk { path, size } => {
                let mut file = tokio::fs::File::open(path).await.map_err(|e| {
                    BlobStoreError::Backend(format!("failed to open {}: {e}", path.display()))
                })?;
                let capacity = usize::try_from(*size).unwrap_or(usize::MAX);
                let mut buf = BytesMut::with_capacity(capacity);
                while file.read_buf(&mut buf).await.map_err(|e| {
                    BlobStoreError::Backend(format!("failed to read {}: {e}", path.display()))
                })? > 0
                {}
                Ok(buf.freeze())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// InMemoryBlobStore
// ---------------------------------------------------------------------------

/// Development blob store with spillover to temporary files.
///
/// ```
/// use blobgate_core::blobstore::{BlobStore, InMemoryBlobStore};
/// use bytes::Bytes;
///
/// # tokio_test::block_on(async {
/// let store = InMemoryBlobStore::new(1024);
/// store.put("packages/abc", Bytes::from("hello")).await.unwrap();
/// assert_eq!(store.get("packages/abc").await.unwrap().as_ref(), b"hello");
/// # });
/// ```
pub struct InMemoryBlobStore {
    blobs: DashMap<String, Arc<StoredBlob>>,
    max_memory_size: usize,
}

impl fmt::Debug for InMemoryBlobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryBlobStore")
            .field("blob_count", &self.blobs.len())
            .field("max_memory_size", &self.max_memory_size)
            .finish()
    }
}

impl Default for InMemoryBlobStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MEMORY_SIZE)
    }
}

impl InMemoryBlobStore {
    /// Create a store that spills blobs larger than `max_memory_size` bytes.
    #[must_use]
    pub fn new(max_memory_size: usize) -> Self {
        debug!(max_memory_size, "creating InMemoryBlobStore");
        Self {
            blobs: DashMap::new(),
            max_memory_size,
        }
    }

    /// Number of stored blobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// Whether the store holds no blobs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    async fn store(&self, data: Bytes) -> Result<StoredBlob, BlobStoreError> {
        if data.len() <= self.max_memory_size {
            return Ok(StoredBlob::InMemory { data });
        }

        let size = data.len() as u64;
        let temp = tempfile::NamedTempFile::new()
            .map_err(|e| BlobStoreError::Backend(format!("failed to create temp file: {e}")))?;
        // Cleanup is handled by StoredBlob's Drop, not the tempfile handle.
        let (_file, path) = temp
            .keep()
            .map_err(|e| BlobStoreError::Backend(format!("failed to keep temp file: {e}")))?;
        let stored = StoredBlob::OnDisk { path, size };
        if let StoredBlob::OnDisk { path, .. } = &stored {
            tokio::fs::write(path, &data).await.map_err(|e| {
                BlobStoreError::Backend(format!("failed to write {}: {e}", path.display()))
            })?;
            trace!(path = %path.display(), size, "spilled blob to disk");
        }
        Ok(stored)
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn get(&self, key: &str) -> Result<Bytes, BlobStoreError> {
        // Clone the Arc out so no shard guard is held across the read.
        let blob = self
            .blobs
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| BlobStoreError::NotFound {
                key: key.to_owned(),
            })?;
        blob.read_all().await
    }

    async fn put(&self, key: &str, content: Bytes) -> Result<(), BlobStoreError> {
        let size = content.len();
        let stored = self.store(content).await?;
        self.blobs.insert(key.to_owned(), Arc::new(stored));
        trace!(key, size, "stored blob");
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobStoreError> {
        Ok(self.blobs.contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
        match self.blobs.remove(key) {
            Some(_) => {
                trace!(key, "deleted blob");
                Ok(())
            }
            None => Err(BlobStoreError::NotFound {
                key: key.to_owned(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// TimeoutBlobStore
// ---------------------------------------------------------------------------

/// Decorator bounding every call on the inner store.
#[derive(Debug)]
pub struct TimeoutBlobStore<S> {
    inner: S,
    timeout: Duration,
}

impl<S: BlobStore> TimeoutBlobStore<S> {
    /// Wrap `inner` so each call fails with [`BlobStoreError::Timeout`] after
    /// `timeout`.
    #[must_use]
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        key: &str,
        fut: impl std::future::Future<Output = Result<T, BlobStoreError>> + Send,
    ) -> Result<T, BlobStoreError> {
        if let Ok(result) = tokio::time::timeout(self.timeout, fut).await {
            result
        } else {
            warn!(op, key, timeout_ms = self.timeout.as_millis(), "blob store call timed out");
            Err(BlobStoreError::Timeout)
        }
    }
}

#[async_trait]
impl<S: BlobStore> BlobStore for TimeoutBlobStore<S> {
    async fn get(&self, key: &str) -> Result<Bytes, BlobStoreError> {
        self.bounded("get", key, self.inner.get(key)).await
    }

    async fn put(&self, key: &str, content: Bytes) -> Result<(), BlobStoreError> {
        self.bounded("put", key, self.inner.put(key, content)).await
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobStoreError> {
        self.bounded("exists", key, self.inner.exists(key)).await
    }

    async fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
        self.bounded("delete", key, self.inner.delete(key)).await
    }
}

#[async_trait]
impl<S: BlobStore + ?Sized> BlobStore for Arc<S> {
    async fn get(&self, key: &str) -> Result<Bytes, BlobStoreError> {
        (**self).get(key).await
    }

    async fn put(&self, key: &str, content: Bytes) -> Result<(), BlobStoreError> {
        (**self).put(key, content).await
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobStoreError> {
        (**self).exists(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
        (**self).delete(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_THRESHOLD: usize = 64;

    /// A backend that never answers.
    #[derive(Debug)]
    struct HangingStore;

    #[async_trait]
    impl BlobStore for HangingStore {
        async fn get(&self, _key: &str) -> Result<Bytes, BlobStoreError> {
            std::future::pending().await
        }
        async fn put(&self, _key: &str, _content: Bytes) -> Result<(), BlobStoreError> {
            std::future::pending().await
        }
        async fn exists(&self, _key: &str) -> Result<bool, BlobStoreError> {
            std::future::pending().await
        }
        async fn delete(&self, _key: &str) -> Result<(), BlobStoreError> {
            std::future::pending().await
        }
    }

    #[test]
    fn test_should_parse_blob_key() {
        let key = BlobKey::parse("packages", "my-guid_1.0").unwrap();
        assert_eq!(key.kind(), ResourceKind::Packages);
        assert_eq!(key.storage_key(), "packages/my-guid_1.0");
        assert_eq!(key.resource_path(), "/packages/my-guid_1.0");
        assert_eq!(key.kind().form_field(), "package");
    }

    #[test]
    fn test_should_reject_invalid_blob_keys() {
        assert!(BlobKey::parse("apps", "abc").is_err());
        assert!(BlobKey::parse("droplets", "").is_err());
        assert!(BlobKey::parse("droplets", "a/b").is_err());
        assert!(BlobKey::parse("droplets", "a@b").is_err());
    }

    #[tokio::test]
    async fn test_should_put_and_get_small_blob() {
        let store = InMemoryBlobStore::new(TEST_THRESHOLD);
        store.put("packages/a", Bytes::from("hello")).await.unwrap();
        assert!(store.exists("packages/a").await.unwrap());
        assert_eq!(store.get("packages/a").await.unwrap().as_ref(), b"hello");
    }

    #[tokio::test]
    async fn test_should_spill_large_blob_and_clean_up_on_delete() {
        let store = InMemoryBlobStore::new(TEST_THRESHOLD);
        let data = Bytes::from(vec![0xAB_u8; TEST_THRESHOLD * 4]);
        store.put("droplets/big", data.clone()).await.unwrap();

        let entry = store.blobs.get("droplets/big").unwrap();
        let path = match entry.value().as_ref() {
            StoredBlob::OnDisk { path, .. } => path.clone(),
            StoredBlob::InMemory { .. } => panic!("expected spilled blob"),
        };
        drop(entry);
        assert!(path.exists());
        assert_eq!(store.get("droplets/big").await.unwrap(), data);

        store.delete("droplets/big").await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_should_report_missing_blob() {
        let store = InMemoryBlobStore::default();
        assert_eq!(
            store.get("packages/none").await.unwrap_err(),
            BlobStoreError::NotFound {
                key: "packages/none".to_owned()
            }
        );
        assert!(!store.exists("packages/none").await.unwrap());
        assert!(store.delete("packages/none").await.is_err());
    }

    #[tokio::test]
    async fn test_should_time_out_hanging_backend() {
        let store = TimeoutBlobStore::new(HangingStore, Duration::from_millis(20));
        assert_eq!(store.get("k").await.unwrap_err(), BlobStoreError::Timeout);
        assert_eq!(
            store.put("k", Bytes::new()).await.unwrap_err(),
            BlobStoreError::Timeout
        );
    }

    #[tokio::test]
    async fn test_should_pass_through_within_timeout() {
        let store = TimeoutBlobStore::new(InMemoryBlobStore::default(), Duration::from_secs(5));
        store.put("k", Bytes::from("v")).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_ref(), b"v");
        assert_eq!(store.inner().len(), 1);
    }
}
