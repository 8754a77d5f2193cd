//! Core types for Blobgate.
//!
//! This crate holds everything the HTTP layer builds on but that has nothing
//! to do with HTTP framing:
//!
//! - [`blobstore`] - the [`BlobStore`](blobstore::BlobStore) capability,
//!   resource keys, the in-memory backend and the timeout decorator
//! - [`config`] - [`GatewayConfig`] loaded from environment variables
//! - [`error`] - the [`GatewayError`] taxonomy and its status codes
//! - [`upload`] - the [`UploadCoordinator`](upload::UploadCoordinator)
//!
//! # Architecture
//!
//! ```text
//! request handler
//!        |
//!        v
//! UploadCoordinator (job table, worker pool)
//!        |
//!        v
//! TimeoutBlobStore -> BlobStore backend
//! ```

pub mod blobstore;
pub mod config;
pub mod error;
pub mod upload;

pub use config::GatewayConfig;
pub use error::{GatewayError, GatewayResult};
