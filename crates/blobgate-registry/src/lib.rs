//! Container registry endpoints for Blobgate.
//!
//! A small slice of the distribution API over the gateway's blob store:
//! manifest fetch and upload by repository name and tag, blob fetch by
//! digest, and the `/v2/` version check.
//!
//! # Modules
//!
//! - [`error`] - registry errors and their distribution error bodies
//! - [`handler`] - [`RegistryHandler`], mapping `/v2` requests to the store
//! - [`manifest`] - manifest and content descriptor model
//! - [`path`] - repository path parsing

pub mod error;
pub mod handler;
pub mod manifest;
pub mod path;

pub use error::RegistryError;
pub use handler::RegistryHandler;
pub use path::{RegistryRoute, RepositoryPath, parse_manifest_path, parse_route};
