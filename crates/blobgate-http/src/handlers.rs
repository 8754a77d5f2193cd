//! Endpoint handlers.
//!
//! Each handler takes the shared [`GatewayState`] and an already-routed
//! request and returns a response or a [`GatewayError`]. The service turns
//! errors into JSON error responses.

use blobgate_auth::{SignedMethod, verify_basic_auth};
use blobgate_core::blobstore::BlobKey;
use blobgate_core::error::{GatewayError, GatewayResult};
use blobgate_core::upload::{SubmitOutcome, Visibility};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, Method, StatusCode};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::body::GatewayBody;
use crate::multipart::upload_content;
use crate::response::{build_response, empty_response, json_response, registry_response};
use crate::router::query_param;
use crate::service::GatewayState;

/// Response type shared by all handlers.
pub type HandlerResult = GatewayResult<http::Response<GatewayBody>>;

/// `GET /_health`.
pub fn health(service_name: &str) -> HandlerResult {
    json_response(
        StatusCode::OK,
        &json!({ "status": "running", "service": service_name }),
    )
}

/// Dispatch a request for `/{kind}/{guid}` by method.
pub async fn resource(
    state: &GatewayState,
    method: &Method,
    key: &BlobKey,
    query: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> HandlerResult {
    match *method {
        Method::GET => get_resource(state, key, false).await,
        Method::HEAD => get_resource(state, key, true).await,
        Method::PUT => put_resource(state, key, query, headers, body).await,
        Method::DELETE => delete_resource(state, key).await,
        _ => Err(GatewayError::MethodNotAllowed(method.to_string())),
    }
}

/// Check the upload job for `key` before touching the store.
fn ensure_visible(state: &GatewayState, key: &str, hidden: GatewayError) -> GatewayResult<()> {
    match state.uploads.visibility(key) {
        Visibility::Visible => Ok(()),
        Visibility::Hidden => Err(hidden),
        Visibility::Failed(reason) => {
            warn!(key, reason = %reason, "reporting failed upload");
            Err(GatewayError::Backend(reason))
        }
    }
}

async fn get_resource(state: &GatewayState, key: &BlobKey, head: bool) -> HandlerResult {
    let storage_key = key.storage_key();
    ensure_visible(
        state,
        &storage_key,
        GatewayError::NotFound(storage_key.clone()),
    )?;

    if head {
        if !state.store.exists(&storage_key).await? {
            return Err(GatewayError::NotFound(storage_key));
        }
        return empty_response(StatusCode::OK);
    }

    let data = state.store.get(&storage_key).await?;
    debug!(key = %storage_key, size = data.len(), "serving blob");
    build_response(
        http::Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, data.len()),
        GatewayBody::from(data),
    )
}

async fn put_resource(
    state: &GatewayState,
    key: &BlobKey,
    query: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> HandlerResult {
    let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
    let content = upload_content(content_type, body, key.kind().form_field())?;
    let run_async = query_param(query, "async").is_some_and(|v| v.eq_ignore_ascii_case("true"));

    let storage_key = key.storage_key();
    let size = content.len();
    let outcome = state
        .uploads
        .submit(&storage_key, content, run_async)
        .await?;
    info!(key = %storage_key, size, run_async, "accepted upload");

    let status = match outcome {
        SubmitOutcome::Created => StatusCode::CREATED,
        SubmitOutcome::Accepted => StatusCode::ACCEPTED,
    };
    empty_response(status)
}

/// A failed async upload does not block the delete; its error is dropped
/// along with the resource.
async fn delete_resource(state: &GatewayState, key: &BlobKey) -> HandlerResult {
    let storage_key = key.storage_key();
    match state.uploads.visibility(&storage_key) {
        Visibility::Visible => {}
        Visibility::Hidden => {
            return Err(GatewayError::Conflict(format!(
                "upload of {storage_key} is in progress"
            )));
        }
        Visibility::Failed(reason) => {
            debug!(key = %storage_key, reason = %reason, "discarding failed upload before delete");
        }
    }
    state.store.delete(&storage_key).await?;
    info!(key = %storage_key, "deleted blob");
    empty_response(StatusCode::NO_CONTENT)
}

/// `GET /sign/{kind}/{guid}`: return a URL the caller can hand out.
///
/// In proxy mode the URL points at the gateway's public host. In S3 mode it
/// is a presigned URL straight to the bucket.
///
/// Credentials are checked before the resource and `verb`, so an
/// unauthenticated caller always gets 401.
pub fn sign(
    state: &GatewayState,
    kind: &str,
    guid: &str,
    query: &str,
    headers: &HeaderMap,
    now: DateTime<Utc>,
) -> HandlerResult {
    let authorization = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    verify_basic_auth(authorization, &state.credentials).map_err(|e| {
        debug!(error = %e, "rejected sign request");
        GatewayError::Unauthenticated
    })?;

    let key = BlobKey::parse(kind, guid).map_err(|e| GatewayError::NotFound(e.to_string()))?;
    let method = query_param(query, "verb")
        .map_or(Ok(SignedMethod::Get), SignedMethod::from_verb)
        .map_err(|e| GatewayError::MalformedRequest(e.to_string()))?;

    let url = match &state.presigner {
        Some(presigner) => {
            let verb = match method {
                SignedMethod::Get => "GET",
                SignedMethod::Put => "PUT",
            };
            presigner
                .presign(verb, &key.storage_key(), now)
                .map_err(|e| GatewayError::Backend(e.to_string()))?
        }
        None => state
            .router
            .signer()
            .sign(&key.resource_path(), method, now),
    };
    debug!(%key, ?method, "issued signed url");

    build_response(
        http::Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/plain"),
        GatewayBody::from_string(url),
    )
}

/// Anything under `/v2`.
pub async fn registry(
    state: &GatewayState,
    method: &Method,
    path: &str,
    body: Bytes,
) -> http::Response<GatewayBody> {
    registry_response(state.registry.handle(method, path, body).await)
}
