//! Registry error types.
//!
//! Registry failures are reported with the distribution error body
//! `{"errors":[{"code":"MANIFEST_UNKNOWN","message":"..."}]}` rather than the
//! gateway's own error format.

use blobgate_core::blobstore::BlobStoreError;
use http::StatusCode;
use serde::Serialize;

/// Errors raised by the registry endpoints.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The repository path is not a valid `name/manifest/tag` path.
    #[error("invalid repository name: {0}")]
    NameInvalid(String),

    /// No manifest is stored for the name and tag.
    #[error("manifest unknown: {0}")]
    ManifestUnknown(String),

    /// No blob is stored for the digest.
    #[error("blob unknown: {0}")]
    BlobUnknown(String),

    /// An uploaded manifest could not be decoded.
    #[error("manifest invalid: {0}")]
    ManifestInvalid(String),

    /// The method is not supported on this registry path.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// The blob store failed, or a stored manifest is unreadable.
    #[error("registry backend error: {0}")]
    Backend(String),

    /// The blob store did not answer in time.
    #[error("registry backend timed out")]
    Timeout,
}

impl RegistryError {
    /// HTTP status for this error.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NameInvalid(_) | Self::ManifestUnknown(_) | Self::BlobUnknown(_) => {
                StatusCode::NOT_FOUND
            }
            Self::ManifestInvalid(_) => StatusCode::BAD_REQUEST,
            Self::Unsupported(_) => StatusCode::METHOD_NOT_ALLOWED,
            Self::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Distribution error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NameInvalid(_) => "NAME_INVALID",
            Self::ManifestUnknown(_) => "MANIFEST_UNKNOWN",
            Self::BlobUnknown(_) => "BLOB_UNKNOWN",
            Self::ManifestInvalid(_) => "MANIFEST_INVALID",
            Self::Unsupported(_) => "UNSUPPORTED",
            Self::Backend(_) | Self::Timeout => "UNKNOWN",
        }
    }

    /// Serialized error body.
    #[must_use]
    pub fn to_body(&self) -> Vec<u8> {
        #[derive(Serialize)]
        struct Entry<'a> {
            code: &'a str,
            message: String,
        }
        #[derive(Serialize)]
        struct Body<'a> {
            errors: [Entry<'a>; 1],
        }
        let body = Body {
            errors: [Entry {
                code: self.code(),
                message: self.to_string(),
            }],
        };
        serde_json::to_vec(&body).unwrap_or_default()
    }

    /// Map a blob store failure, reporting a missing key as `not_found`.
    pub(crate) fn from_store(err: BlobStoreError, not_found: impl FnOnce() -> Self) -> Self {
        match err {
            BlobStoreError::NotFound { .. } => not_found(),
            BlobStoreError::Backend(message) => Self::Backend(message),
            BlobStoreError::Timeout => Self::Timeout,
        }
    }
}
