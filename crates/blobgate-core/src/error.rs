//! Gateway error taxonomy.
//!
//! Every failure that reaches the HTTP layer is expressed as a
//! [`GatewayError`]. Each variant maps to exactly one HTTP status code via
//! [`GatewayError::status_code`], so handlers never pick status codes ad hoc.

use http::StatusCode;

use crate::blobstore::BlobStoreError;

/// Errors surfaced by the gateway to its HTTP callers.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The request path or parameters could not be understood.
    ///
    /// Reported as 404: unrecognized routes are indistinguishable from
    /// unknown resources.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// Basic-auth credentials were missing or wrong.
    #[error("authentication required")]
    Unauthenticated,

    /// A public-host request lacked a valid signature.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The addressed blob, manifest or route does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The HTTP method is not supported on this resource.
    #[error("method {0} is not allowed on this resource")]
    MethodNotAllowed(String),

    /// Another write to the same key is still in flight.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The request body could not be interpreted.
    #[error("invalid content: {0}")]
    InvalidContent(String),

    /// The blob store reported an error.
    #[error("backend failure: {0}")]
    Backend(String),

    /// The gateway cannot accept more work right now.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// The blob store did not answer in time.
    #[error("blob store timed out")]
    Timeout,
}

impl GatewayError {
    /// The HTTP status code this error is reported with.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MalformedRequest(_) | Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::InvalidContent(_) => StatusCode::BAD_REQUEST,
            Self::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// A short, stable machine-readable code for the error body.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedRequest(_) | Self::NotFound(_) => "NotFound",
            Self::Unauthenticated => "Unauthenticated",
            Self::Forbidden(_) => "Forbidden",
            Self::MethodNotAllowed(_) => "MethodNotAllowed",
            Self::Conflict(_) => "Conflict",
            Self::InvalidContent(_) => "InvalidContent",
            Self::Backend(_) => "InternalError",
            Self::Unavailable(_) => "ServiceUnavailable",
            Self::Timeout => "GatewayTimeout",
        }
    }
}

impl From<BlobStoreError> for GatewayError {
    fn from(err: BlobStoreError) -> Self {
        match err {
            BlobStoreError::NotFound { key } => Self::NotFound(key),
            BlobStoreError::Backend(message) => Self::Backend(message),
            BlobStoreError::Timeout => Self::Timeout,
        }
    }
}

/// Convenience result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;
