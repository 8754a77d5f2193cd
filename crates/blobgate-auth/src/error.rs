//! Error types for request authentication and URL signing.

/// Errors raised while checking credentials or signatures, or while building
/// presigned URLs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// No `Authorization` header was sent.
    #[error("Missing credentials")]
    MissingCredentials,

    /// The basic-auth credentials are malformed or wrong.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// The signed-URL query parameters are missing or unparseable.
    #[error("Malformed signature: {0}")]
    MalformedSignature(String),

    /// The signed URL's expiry lies in the past.
    #[error("Signature has expired")]
    SignatureExpired,

    /// The signature does not match the path, expiry and verb.
    #[error("Signature does not match")]
    SignatureMismatch,

    /// The request method is not covered by the signed verb.
    #[error("Request method is not covered by the signature")]
    MethodMismatch,

    /// A presigned URL could not be built from the given inputs.
    #[error("Invalid presign request: {0}")]
    InvalidPresignRequest(String),
}
