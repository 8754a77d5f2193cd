//! HTTP layer for Blobgate.
//!
//! Provides [`GatewayService`], a hyper service that routes requests by host:
//! the internal host serves the resource, `/sign` and registry endpoints; the
//! public host serves resources through signed URLs only.
//!
//! # Modules
//!
//! - [`body`] - response body type
//! - [`handlers`] - endpoint handlers
//! - [`multipart`] - `multipart/form-data` upload parsing
//! - [`response`] - error rendering and response helpers
//! - [`router`] - host classification and route resolution
//! - [`service`] - [`GatewayService`] and its shared [`GatewayState`]

pub mod body;
pub mod handlers;
pub mod multipart;
pub mod response;
pub mod router;
pub mod service;

pub use body::GatewayBody;
pub use router::{HostKind, HostRouter, Route, RoutedRequest};
pub use service::{GatewayService, GatewayState};
