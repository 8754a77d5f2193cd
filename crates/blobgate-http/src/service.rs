//! The gateway's hyper service.
//!
//! [`GatewayService`] runs every request through the same pipeline:
//!
//! 1. Routing by host, method and path via [`HostRouter`] (health checks and
//!    public signature verification happen here)
//! 2. Request body collection
//! 3. Dispatch to the endpoint handler
//! 4. Error formatting and common response headers (`x-request-id`, `Server`)

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use blobgate_auth::{Credentials, S3Presigner};
use blobgate_core::GatewayConfig;
use blobgate_core::blobstore::{BlobStore, TimeoutBlobStore};
use blobgate_core::config::SigningMode;
use blobgate_core::error::GatewayError;
use blobgate_core::upload::{CoordinatorOptions, UploadCoordinator};
use blobgate_registry::RegistryHandler;
use chrono::Utc;
use http::HeaderValue;
use http::header::{HOST, SERVER};
use http_body_util::BodyExt;
use hyper::service::Service;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::body::GatewayBody;
use crate::handlers;
use crate::response::{REQUEST_ID_HEADER, SERVER_NAME, error_to_response};
use crate::router::{HostRouter, Route};

/// Name reported by the health endpoint.
pub const SERVICE_NAME: &str = "blobgate";

/// Everything a request handler needs, shared by all connections.
pub struct GatewayState {
    /// Effective configuration.
    pub config: GatewayConfig,
    /// Host router, which also owns the URL signer.
    pub router: HostRouter,
    /// Present in S3 signing mode.
    pub presigner: Option<S3Presigner>,
    /// Credentials required by `/sign`.
    pub credentials: Credentials,
    /// The blob store, bounded by the configured timeout.
    pub store: Arc<dyn BlobStore>,
    /// Upload job tracking and the async worker pool.
    pub uploads: UploadCoordinator,
    /// `/v2` endpoints.
    pub registry: RegistryHandler,
}

impl fmt::Debug for GatewayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayState")
            .field("config", &self.config)
            .field("router", &self.router)
            .field("presigner", &self.presigner)
            .field("uploads", &self.uploads)
            .finish_non_exhaustive()
    }
}

impl GatewayState {
    /// Build the gateway around `store`.
    ///
    /// Every store call is wrapped in the configured timeout. Starts the
    /// upload worker pool, so this must run inside a tokio runtime.
    #[must_use]
    pub fn new(config: GatewayConfig, store: Arc<dyn BlobStore>) -> Self {
        let store: Arc<dyn BlobStore> =
            Arc::new(TimeoutBlobStore::new(store, config.blobstore_timeout()));
        let uploads =
            UploadCoordinator::start(Arc::clone(&store), CoordinatorOptions::from(&config));
        let presigner = match config.signing_mode {
            SigningMode::Proxy => None,
            SigningMode::S3 => Some(
                S3Presigner::new(
                    config.s3_bucket.clone(),
                    config.s3_region.clone(),
                    config.s3_access_key_id.clone(),
                    config.s3_secret_access_key.clone(),
                    config.signed_url_ttl_secs,
                )
                .with_endpoint(config.s3_endpoint.clone()),
            ),
        };

        Self {
            router: HostRouter::from_config(&config),
            credentials: Credentials::new(config.username.clone(), config.password.clone()),
            registry: RegistryHandler::new(Arc::clone(&store)),
            presigner,
            store,
            uploads,
            config,
        }
    }
}

/// Hyper service for the gateway.
#[derive(Debug, Clone)]
pub struct GatewayService {
    state: Arc<GatewayState>,
}

impl GatewayService {
    /// Wrap shared state.
    #[must_use]
    pub fn new(state: Arc<GatewayState>) -> Self {
        Self { state }
    }

    /// The shared state.
    #[must_use]
    pub fn state(&self) -> &Arc<GatewayState> {
        &self.state
    }

    /// Stop the upload workers. Queued uploads that never ran are failed.
    pub async fn shutdown(&self) {
        self.state.uploads.shutdown().await;
    }
}

impl<B> Service<http::Request<B>> for GatewayService
where
    B: http_body::Body + Send + 'static,
    B::Data: Send,
    B::Error: fmt::Display + Send,
{
    type Response = http::Response<GatewayBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: http::Request<B>) -> Self::Future {
        let state = Arc::clone(&self.state);

        Box::pin(async move {
            let request_id = Uuid::new_v4().to_string();
            let response = process_request(req, &state, &request_id).await;
            Ok(add_common_headers(response, &request_id))
        })
    }
}

async fn process_request<B>(
    req: http::Request<B>,
    state: &GatewayState,
    request_id: &str,
) -> http::Response<GatewayBody>
where
    B: http_body::Body + Send,
    B::Error: fmt::Display,
{
    let (parts, body) = req.into_parts();
    let method = parts.method;
    let uri = parts.uri;
    let host = parts
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| uri.host());
    let path = uri.path();
    let query = uri.query().unwrap_or_default();
    debug!(%method, %uri, host, request_id, "processing request");

    let now = Utc::now();
    let routed = match state.router.route(&method, host, path, query, now) {
        Ok(routed) => routed,
        Err(err) => {
            warn!(%method, path, host, error = %err, request_id, "failed to route request");
            return error_to_response(&err, request_id);
        }
    };

    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            let err = GatewayError::InvalidContent(format!("failed to read request body: {e}"));
            warn!(error = %err, request_id, "failed to collect request body");
            return error_to_response(&err, request_id);
        }
    };

    let result = match &routed.route {
        Route::Health => handlers::health(SERVICE_NAME),
        Route::Resource(key) => {
            handlers::resource(state, &method, key, &routed.query, &parts.headers, body).await
        }
        Route::Sign { kind, guid } => {
            handlers::sign(state, kind, guid, &routed.query, &parts.headers, now)
        }
        Route::Registry => Ok(handlers::registry(state, &method, path, body).await),
    };

    match result {
        Ok(response) => {
            info!(
                %method, path, host = ?routed.host, status = response.status().as_u16(),
                request_id, "request completed"
            );
            response
        }
        Err(err) => {
            info!(
                %method, path, host = ?routed.host, status = err.status_code().as_u16(),
                error = %err, request_id, "request failed"
            );
            error_to_response(&err, request_id)
        }
    }
}

fn add_common_headers(
    mut response: http::Response<GatewayBody>,
    request_id: &str,
) -> http::Response<GatewayBody> {
    let headers = response.headers_mut();
    if let Ok(hv) = HeaderValue::from_str(request_id) {
        headers.insert(REQUEST_ID_HEADER, hv);
    }
    headers.insert(SERVER, HeaderValue::from_static(SERVER_NAME));
    response
}
