//! Registry request handling.
//!
//! Manifests are stored under `oci/<name>/manifests/<tag>` and blobs under
//! `oci/blobs/<digest>`. Manifests are decoded on every read; nothing is
//! cached.

use std::sync::Arc;

use blobgate_core::blobstore::BlobStore;
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderValue, Method, Response, StatusCode};
use tracing::{debug, warn};

use crate::error::RegistryError;
use crate::manifest::{Manifest, sha256_digest};
use crate::path::{RegistryRoute, RepositoryPath, parse_manifest_path, parse_route};

/// Header carrying the digest of a returned or stored manifest.
pub const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

/// Header advertising the registry API version.
pub const DOCKER_DISTRIBUTION_API_VERSION: &str = "docker-distribution-api-version";

/// A manifest read from the store.
#[derive(Debug, Clone)]
pub struct ManifestDocument {
    /// The manifest's own media type.
    pub media_type: String,
    /// `sha256:<hex>` of the stored bytes.
    pub digest: String,
    /// The stored bytes, served verbatim.
    pub body: Bytes,
}

/// Serves manifests and blobs from a [`BlobStore`].
#[derive(Debug, Clone)]
pub struct RegistryHandler {
    store: Arc<dyn BlobStore>,
}

impl RegistryHandler {
    /// Create a handler over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    /// Storage key of a manifest.
    #[must_use]
    pub fn manifest_key(repo: &RepositoryPath) -> String {
        format!("oci/{}/manifests/{}", repo.name, repo.tag)
    }

    /// Storage key of a blob.
    #[must_use]
    pub fn blob_key(digest: &str) -> String {
        format!("oci/blobs/{digest}")
    }

    /// Fetch the manifest addressed by a `/v2/<name>/manifest/<tag>` path.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::NameInvalid`] for an unparseable path.
    /// - [`RegistryError::ManifestUnknown`] if nothing is stored.
    /// - [`RegistryError::Backend`] if the store fails or the stored bytes
    ///   are not a manifest.
    /// - [`RegistryError::Timeout`] if the store does not answer.
    pub async fn get_manifest(&self, path: &str) -> Result<ManifestDocument, RegistryError> {
        let repo = parse_manifest_path(path)?;
        self.fetch_manifest(&repo).await
    }

    async fn fetch_manifest(&self, repo: &RepositoryPath) -> Result<ManifestDocument, RegistryError> {
        let key = Self::manifest_key(repo);
        let body = self.store.get(&key).await.map_err(|e| {
            RegistryError::from_store(e, || {
                RegistryError::ManifestUnknown(format!("{}:{}", repo.name, repo.tag))
            })
        })?;
        let manifest: Manifest = serde_json::from_slice(&body).map_err(|e| {
            warn!(%key, error = %e, "stored manifest is not decodable");
            RegistryError::Backend(format!("stored manifest {key} is not decodable"))
        })?;
        debug!(name = %repo.name, tag = %repo.tag, "serving manifest");
        Ok(ManifestDocument {
            media_type: manifest.media_type,
            digest: sha256_digest(&body),
            body,
        })
    }

    /// Store a manifest under a `/v2/<name>/manifest/<tag>` path and return
    /// its digest.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::NameInvalid`] for an unparseable path.
    /// - [`RegistryError::ManifestInvalid`] if `body` is not a manifest.
    /// - [`RegistryError::Backend`] or [`RegistryError::Timeout`] if the
    ///   store write fails.
    pub async fn put_manifest(&self, path: &str, body: Bytes) -> Result<String, RegistryError> {
        let repo = parse_manifest_path(path)?;
        let manifest: Manifest = serde_json::from_slice(&body)
            .map_err(|e| RegistryError::ManifestInvalid(e.to_string()))?;
        if manifest.schema_version != 2 {
            return Err(RegistryError::ManifestInvalid(format!(
                "unsupported schema version {}",
                manifest.schema_version
            )));
        }

        let digest = sha256_digest(&body);
        let key = Self::manifest_key(&repo);
        self.store.put(&key, body).await.map_err(|e| {
            RegistryError::from_store(e, || RegistryError::Backend(format!("lost {key}")))
        })?;
        debug!(name = %repo.name, tag = %repo.tag, %digest, "stored manifest");
        Ok(digest)
    }

    /// Fetch a blob by digest.
    ///
    /// # Errors
    ///
    /// [`RegistryError::BlobUnknown`] if nothing is stored, otherwise the
    /// mapped store error.
    pub async fn get_blob(&self, digest: &str) -> Result<Bytes, RegistryError> {
        self.store
            .get(&Self::blob_key(digest))
            .await
            .map_err(|e| RegistryError::from_store(e, || RegistryError::BlobUnknown(digest.to_owned())))
    }

    /// Serve a `/v2` request. Errors become distribution error responses.
    pub async fn handle(&self, method: &Method, path: &str, body: Bytes) -> Response<Bytes> {
        let mut response = match self.dispatch(method, path, body).await {
            Ok(response) => response,
            Err(err) => {
                debug!(%method, path, error = %err, "registry request failed");
                error_response(&err)
            }
        };
        response.headers_mut().insert(
            DOCKER_DISTRIBUTION_API_VERSION,
            HeaderValue::from_static("registry/2.0"),
        );
        response
    }

    async fn dispatch(
        &self,
        method: &Method,
        path: &str,
        body: Bytes,
    ) -> Result<Response<Bytes>, RegistryError> {
        let head = *method == Method::HEAD;
        match parse_route(path)? {
            RegistryRoute::Base => {
                if *method != Method::GET && !head {
                    return Err(unsupported(method));
                }
                let mut response = Response::new(body_unless(head, Bytes::from_static(b"{}")));
                set_header(&mut response, CONTENT_TYPE, "application/json")?;
                Ok(response)
            }
            RegistryRoute::Manifest(repo) => {
                if *method == Method::PUT {
                    let digest = self.put_manifest(path, body).await?;
                    let mut response = Response::new(Bytes::new());
                    *response.status_mut() = StatusCode::CREATED;
                    set_header(&mut response, DOCKER_CONTENT_DIGEST, &digest)?;
                    return Ok(response);
                }
                if *method != Method::GET && !head {
                    return Err(unsupported(method));
                }
                let document = self.fetch_manifest(&repo).await?;
                let length = document.body.len().to_string();
                let mut response = Response::new(body_unless(head, document.body));
                set_header(&mut response, CONTENT_TYPE, &document.media_type)?;
                set_header(&mut response, CONTENT_LENGTH, &length)?;
                set_header(&mut response, DOCKER_CONTENT_DIGEST, &document.digest)?;
                Ok(response)
            }
            RegistryRoute::Blob { digest, .. } => {
                if *method != Method::GET && !head {
                    return Err(unsupported(method));
                }
                let blob = self.get_blob(&digest).await?;
                let length = blob.len().to_string();
                let mut response = Response::new(body_unless(head, blob));
                set_header(&mut response, CONTENT_TYPE, "application/octet-stream")?;
                set_header(&mut response, CONTENT_LENGTH, &length)?;
                set_header(&mut response, DOCKER_CONTENT_DIGEST, &digest)?;
                Ok(response)
            }
        }
    }
}

/// Render a registry error as a distribution error response.
#[must_use]
pub fn error_response(err: &RegistryError) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from(err.to_body()));
    *response.status_mut() = err.status_code();
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn unsupported(method: &Method) -> RegistryError {
    RegistryError::Unsupported(method.to_string())
}

fn body_unless(head: bool, body: Bytes) -> Bytes {
    if head { Bytes::new() } else { body }
}

fn set_header<K>(response: &mut Response<Bytes>, name: K, value: &str) -> Result<(), RegistryError>
where
    K: http::header::IntoHeaderName,
{
    let value = HeaderValue::from_str(value)
        .map_err(|e| RegistryError::Backend(format!("invalid header value {value:?}: {e}")))?;
    response.headers_mut().insert(name, value);
    Ok(())
}
