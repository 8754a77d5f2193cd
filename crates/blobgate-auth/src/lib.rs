//! Request authentication and URL signing for Blobgate.
//!
//! The gateway has two trust boundaries. Internal clients authenticate with
//! HTTP basic auth before they may mint URLs. Public clients carry a signed
//! URL whose HMAC proves the internal side authorized that exact path, verb
//! and expiry. When the bucket is reachable directly, SigV4 presigned URLs
//! replace the gateway's own signatures.
//!
//! # Modules
//!
//! - [`basic`] - basic-auth credential check
//! - [`canonical`] - SigV4 canonical request and signing primitives
//! - [`error`] - authentication error types
//! - [`presign`] - SigV4 presigned URL generation
//! - [`signer`] - HMAC signed URL generation and verification

pub mod basic;
pub mod canonical;
pub mod error;
pub mod presign;
pub mod signer;

pub use basic::{Credentials, verify_basic_auth};
pub use error::AuthError;
pub use presign::S3Presigner;
pub use signer::{SignedMethod, SignedUrlToken, UrlSigner, VerifiedRequest, sign_path, verify_path};
