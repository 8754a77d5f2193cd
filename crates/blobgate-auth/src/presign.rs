//! SigV4 presigned URLs for direct bucket access.
//!
//! [`S3Presigner`] produces query-string authenticated URLs that let a client
//! read or write an object in the bucket without going through the gateway.
//! Only the `host` header is signed and the payload is `UNSIGNED-PAYLOAD`.

use std::fmt;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::canonical::{
    ALGORITHM, build_canonical_query_string, build_canonical_request, build_canonical_uri,
    build_string_to_sign, compute_signature, derive_signing_key, sha256_hex,
};
use crate::error::AuthError;

/// Longest lifetime SigV4 accepts for a presigned URL (seven days).
pub const MAX_PRESIGN_EXPIRES_SECS: u64 = 604_800;

const SERVICE: &str = "s3";

/// Builds SigV4 presigned URLs for one bucket.
#[derive(Clone)]
pub struct S3Presigner {
    bucket: String,
    region: String,
    access_key_id: String,
    secret_access_key: String,
    endpoint: Option<String>,
    expires_secs: u64,
}

impl fmt::Debug for S3Presigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Presigner")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field("endpoint", &self.endpoint)
            .field("expires_secs", &self.expires_secs)
            .finish_non_exhaustive()
    }
}

impl S3Presigner {
    /// Create a presigner for `bucket` in `region`.
    ///
    /// URLs are virtual-hosted style unless an endpoint is set with
    /// [`with_endpoint`](Self::with_endpoint).
    #[must_use]
    pub fn new(
        bucket: impl Into<String>,
        region: impl Into<String>,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        expires_secs: u64,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            region: region.into(),
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            endpoint: None,
            expires_secs,
        }
    }

    /// Use path-style URLs against `endpoint` (e.g. `http://localhost:4566`).
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: Option<String>) -> Self {
        self.endpoint = endpoint.map(|e| e.trim_end_matches('/').to_owned());
        self
    }

    /// Presign `method` on object `key`, valid from `now`.
    ///
    /// # Errors
    ///
    /// [`AuthError::InvalidPresignRequest`] if the bucket, key or access key
    /// is empty, the expiry is outside `1..=604800` seconds, or the endpoint
    /// has no scheme.
    pub fn presign(&self, method: &str, key: &str, now: DateTime<Utc>) -> Result<String, AuthError> {
        if self.bucket.is_empty() {
            return Err(AuthError::InvalidPresignRequest("bucket is not configured".into()));
        }
        if self.access_key_id.is_empty() {
            return Err(AuthError::InvalidPresignRequest(
                "access key id is not configured".into(),
            ));
        }
        let key = key.trim_start_matches('/');
        if key.is_empty() {
            return Err(AuthError::InvalidPresignRequest("object key is empty".into()));
        }
        if self.expires_secs == 0 || self.expires_secs > MAX_PRESIGN_EXPIRES_SECS {
            return Err(AuthError::InvalidPresignRequest(format!(
                "expiry must be between 1 and {MAX_PRESIGN_EXPIRES_SECS} seconds, got {}",
                self.expires_secs
            )));
        }

        let (scheme, host, path) = self.locate(key)?;
        let timestamp = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let credential_scope = format!("{date}/{}/{SERVICE}/aws4_request", self.region);
        let credential = format!("{}/{credential_scope}", self.access_key_id);
        let expires = self.expires_secs.to_string();

        let canonical_uri = build_canonical_uri(&path);
        let canonical_query = build_canonical_query_string(&[
            ("X-Amz-Algorithm", ALGORITHM),
            ("X-Amz-Credential", &credential),
            ("X-Amz-Date", &timestamp),
            ("X-Amz-Expires", &expires),
            ("X-Amz-SignedHeaders", "host"),
        ]);
        let canonical_request =
            build_canonical_request(method, &canonical_uri, &canonical_query, &host);
        let string_to_sign = build_string_to_sign(
            &timestamp,
            &credential_scope,
            &sha256_hex(canonical_request.as_bytes()),
        );
        let signing_key =
            derive_signing_key(&self.secret_access_key, &date, &self.region, SERVICE);
        let signature = compute_signature(&signing_key, &string_to_sign);

        debug!(method, key, host = %host, "presigned object URL");
        Ok(format!(
            "{scheme}://{host}{canonical_uri}?{canonical_query}&X-Amz-Signature={signature}"
        ))
    }

    /// Scheme, host and object path for `key`.
    fn locate(&self, key: &str) -> Result<(String, String, String), AuthError> {
        match &self.endpoint {
            Some(endpoint) => {
                let (scheme, host) = endpoint.split_once("://").ok_or_else(|| {
                    AuthError::InvalidPresignRequest(format!("endpoint has no scheme: {endpoint}"))
                })?;
                let host = host.trim_end_matches('/');
                Ok((
                    scheme.to_owned(),
                    host.to_owned(),
                    format!("/{}/{key}", self.bucket),
                ))
            }
            None => {
                let host = if self.region.is_empty() || self.region == "us-east-1" {
                    format!("{}.s3.amazonaws.com", self.bucket)
                } else {
                    format!("{}.s3.{}.amazonaws.com", self.bucket, self.region)
                };
                Ok(("https".to_owned(), host, format!("/{key}")))
            }
        }
    }
}
