//! Response construction.
//!
//! Gateway errors are rendered as JSON:
//!
//! ```json
//! {"code": "NotFound", "description": "not found: packages/abc"}
//! ```
//!
//! Registry endpoints keep their own distribution error format and are
//! passed through unchanged.

use blobgate_core::error::{GatewayError, GatewayResult};
use bytes::Bytes;
use http::header::{CONTENT_TYPE, WWW_AUTHENTICATE};
use serde::Serialize;

use crate::body::GatewayBody;

/// Header carrying the per-request ID.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// `Server` header value.
pub const SERVER_NAME: &str = "Blobgate";

/// `WWW-Authenticate` challenge sent with 401 responses.
pub const BASIC_CHALLENGE: &str = "Basic realm=\"blobgate\"";

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    description: String,
}

/// Finish a response builder, mapping builder failures to a backend error.
pub(crate) fn build_response(
    builder: http::response::Builder,
    body: GatewayBody,
) -> GatewayResult<http::Response<GatewayBody>> {
    builder
        .body(body)
        .map_err(|e| GatewayError::Backend(format!("failed to build HTTP response: {e}")))
}

/// A `200` (or other) response with a JSON body.
pub(crate) fn json_response<T: Serialize>(
    status: http::StatusCode,
    value: &T,
) -> GatewayResult<http::Response<GatewayBody>> {
    let body = serde_json::to_vec(value)
        .map_err(|e| GatewayError::Backend(format!("failed to encode response: {e}")))?;
    build_response(
        http::Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "application/json"),
        GatewayBody::from_bytes(body),
    )
}

/// A bodiless response.
pub(crate) fn empty_response(
    status: http::StatusCode,
) -> GatewayResult<http::Response<GatewayBody>> {
    build_response(http::Response::builder().status(status), GatewayBody::empty())
}

/// Convert a registry response into a gateway response.
pub(crate) fn registry_response(response: http::Response<Bytes>) -> http::Response<GatewayBody> {
    response.map(GatewayBody::from)
}

/// Render a [`GatewayError`] as a JSON error response.
#[must_use]
pub fn error_to_response(err: &GatewayError, request_id: &str) -> http::Response<GatewayBody> {
    let body = ErrorBody {
        code: err.code(),
        description: err.to_string(),
    };
    let bytes = serde_json::to_vec(&body).unwrap_or_default();

    let mut builder = http::Response::builder()
        .status(err.status_code())
        .header(CONTENT_TYPE, "application/json")
        .header(REQUEST_ID_HEADER, request_id);
    if matches!(err, GatewayError::Unauthenticated) {
        builder = builder.header(WWW_AUTHENTICATE, BASIC_CHALLENGE);
    }

    builder
        .body(GatewayBody::from_bytes(bytes))
        .unwrap_or_else(|_| {
            http::Response::builder()
                .status(http::StatusCode::INTERNAL_SERVER_ERROR)
                .body(GatewayBody::empty())
                .expect("static response should be valid")
        })
}
