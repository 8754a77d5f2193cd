//! Gateway configuration.
//!
//! Provides [`GatewayConfig`], loaded once at startup from environment
//! variables and then shared immutably with every component.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

/// How `/sign/...` produces download and upload URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SigningMode {
    /// HMAC-signed URLs that point back at this gateway's public host.
    #[default]
    Proxy,
    /// SigV4 presigned URLs that point straight at the S3 bucket.
    S3,
}

impl FromStr for SigningMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("proxy") {
            Ok(Self::Proxy)
        } else if s.eq_ignore_ascii_case("s3") {
            Ok(Self::S3)
        } else {
            Err(format!("unknown signing mode: {s}"))
        }
    }
}

/// Blobgate configuration.
///
/// # Examples
///
/// ```
/// use blobgate_core::config::GatewayConfig;
///
/// let config = GatewayConfig::builder()
///     .signing_secret("s3cr3t".to_owned())
///     .upload_workers(2)
///     .build();
/// assert_eq!(config.upload_workers, 2);
/// assert_eq!(config.internal_host_prefix, "internal.");
/// ```
#[derive(Clone, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Bind address for the gateway.
    #[builder(default = String::from("0.0.0.0:8080"))]
    pub gateway_listen: String,

    /// Host prefix that selects the internal (trusted) API.
    #[builder(default = String::from("internal."))]
    pub internal_host_prefix: String,

    /// Host prefix that selects the public (signed-URL) API.
    #[builder(default = String::from("public."))]
    pub public_host_prefix: String,

    /// Base URL prepended to signed resource paths.
    #[builder(default = String::from("http://public.127.0.0.1.nip.io:8080"))]
    pub public_endpoint: String,

    /// HMAC key for signed URLs.
    #[builder(default)]
    pub signing_secret: String,

    /// Lifetime of a signed URL in seconds.
    #[builder(default = 3600)]
    pub signed_url_ttl_secs: u64,

    /// Signing backend for `/sign/...`.
    #[builder(default)]
    pub signing_mode: SigningMode,

    /// Basic-auth username for the internal `/sign` endpoint.
    #[builder(default)]
    pub username: String,

    /// Basic-auth password for the internal `/sign` endpoint.
    #[builder(default)]
    pub password: String,

    /// Number of background upload workers.
    #[builder(default = 4)]
    pub upload_workers: usize,

    /// Capacity of the async upload queue.
    #[builder(default = 64)]
    pub upload_queue_capacity: usize,

    /// How long finished upload jobs stay visible, in seconds.
    #[builder(default = 600)]
    pub job_retention_secs: u64,

    /// Upper bound for a single blob store call, in seconds.
    #[builder(default = 30)]
    pub blobstore_timeout_secs: u64,

    /// Blobs larger than this many bytes are spilled to disk by the
    /// in-memory store.
    #[builder(default = 524_288)]
    pub max_memory_blob_size: usize,

    /// Bucket used for presigned URLs.
    #[builder(default)]
    pub s3_bucket: String,

    /// Region used for presigned URLs.
    #[builder(default = String::from("us-east-1"))]
    pub s3_region: String,

    /// Access key ID used for presigned URLs.
    #[builder(default)]
    pub s3_access_key_id: String,

    /// Secret access key used for presigned URLs.
    #[builder(default)]
    pub s3_secret_access_key: String,

    /// Endpoint override; switches presigned URLs to path style.
    #[builder(default)]
    pub s3_endpoint: Option<String>,

    /// Log level filter string.
    #[builder(default = String::from("info"))]
    pub log_level: String,
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("gateway_listen", &self.gateway_listen)
            .field("internal_host_prefix", &self.internal_host_prefix)
            .field("public_host_prefix", &self.public_host_prefix)
            .field("public_endpoint", &self.public_endpoint)
            .field("signing_secret", &"<redacted>")
            .field("signed_url_ttl_secs", &self.signed_url_ttl_secs)
            .field("signing_mode", &self.signing_mode)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("upload_workers", &self.upload_workers)
            .field("upload_queue_capacity", &self.upload_queue_capacity)
            .field("job_retention_secs", &self.job_retention_secs)
            .field("blobstore_timeout_secs", &self.blobstore_timeout_secs)
            .field("max_memory_blob_size", &self.max_memory_blob_size)
            .field("s3_bucket", &self.s3_bucket)
            .field("s3_region", &self.s3_region)
            .field("s3_access_key_id", &self.s3_access_key_id)
            .field("s3_secret_access_key", &"<redacted>")
            .field("s3_endpoint", &self.s3_endpoint)
            .field("log_level", &self.log_level)
            .finish()
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl GatewayConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `GATEWAY_LISTEN` | `0.0.0.0:8080` |
    /// | `BLOBGATE_INTERNAL_HOST_PREFIX` | `internal.` |
    /// | `BLOBGATE_PUBLIC_HOST_PREFIX` | `public.` |
    /// | `BLOBGATE_PUBLIC_ENDPOINT` | `http://public.127.0.0.1.nip.io:8080` |
    /// | `BLOBGATE_SIGNING_SECRET` | empty |
    /// | `BLOBGATE_SIGNED_URL_TTL_SECS` | `3600` |
    /// | `BLOBGATE_SIGNING_MODE` | `proxy` |
    /// | `BLOBGATE_USERNAME` / `BLOBGATE_PASSWORD` | empty |
    /// | `BLOBGATE_UPLOAD_WORKERS` | `4` |
    /// | `BLOBGATE_UPLOAD_QUEUE_CAPACITY` | `64` |
    /// | `BLOBGATE_JOB_RETENTION_SECS` | `600` |
    /// | `BLOBGATE_BLOBSTORE_TIMEOUT_SECS` | `30` |
    /// | `BLOBGATE_MAX_MEMORY_BLOB_SIZE` | `524288` |
    /// | `BLOBGATE_S3_BUCKET` | empty |
    /// | `BLOBGATE_S3_REGION` | `us-east-1` |
    /// | `BLOBGATE_S3_ACCESS_KEY_ID` / `BLOBGATE_S3_SECRET_ACCESS_KEY` | empty |
    /// | `BLOBGATE_S3_ENDPOINT` | unset |
    /// | `LOG_LEVEL` | `info` |
    ///
    /// Unparseable numbers keep their defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(v) = lookup("GATEWAY_LISTEN") {
            config.gateway_listen = v;
        }
        if let Some(v) = lookup("BLOBGATE_INTERNAL_HOST_PREFIX") {
            config.internal_host_prefix = v;
        }
        if let Some(v) = lookup("BLOBGATE_PUBLIC_HOST_PREFIX") {
            config.public_host_prefix = v;
        }
        if let Some(v) = lookup("BLOBGATE_PUBLIC_ENDPOINT") {
            config.public_endpoint = v.trim_end_matches('/').to_owned();
        }
        if let Some(v) = lookup("BLOBGATE_SIGNING_SECRET") {
            config.signing_secret = v;
        }
        set_parsed(&lookup, "BLOBGATE_SIGNED_URL_TTL_SECS", &mut config.signed_url_ttl_secs);
        set_parsed(&lookup, "BLOBGATE_SIGNING_MODE", &mut config.signing_mode);
        if let Some(v) = lookup("BLOBGATE_USERNAME") {
            config.username = v;
        }
        if let Some(v) = lookup("BLOBGATE_PASSWORD") {
            config.password = v;
        }
        set_parsed(&lookup, "BLOBGATE_UPLOAD_WORKERS", &mut config.upload_workers);
        set_parsed(&lookup, "BLOBGATE_UPLOAD_QUEUE_CAPACITY", &mut config.upload_queue_capacity);
        set_parsed(&lookup, "BLOBGATE_JOB_RETENTION_SECS", &mut config.job_retention_secs);
        set_parsed(&lookup, "BLOBGATE_BLOBSTORE_TIMEOUT_SECS", &mut config.blobstore_timeout_secs);
        set_parsed(&lookup, "BLOBGATE_MAX_MEMORY_BLOB_SIZE", &mut config.max_memory_blob_size);
        if let Some(v) = lookup("BLOBGATE_S3_BUCKET") {
            config.s3_bucket = v;
        }
        if let Some(v) = lookup("BLOBGATE_S3_REGION") {
            config.s3_region = v;
        }
        if let Some(v) = lookup("BLOBGATE_S3_ACCESS_KEY_ID") {
            config.s3_access_key_id = v;
        }
        if let Some(v) = lookup("BLOBGATE_S3_SECRET_ACCESS_KEY") {
            config.s3_secret_access_key = v;
        }
        if let Some(v) = lookup("BLOBGATE_S3_ENDPOINT") {
            if !v.is_empty() {
                config.s3_endpoint = Some(v.trim_end_matches('/').to_owned());
            }
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            config.log_level = v;
        }

        config
    }

    /// Lifetime of a signed URL.
    #[must_use]
    pub fn signed_url_ttl(&self) -> Duration {
        Duration::from_secs(self.signed_url_ttl_secs)
    }

    /// Retention of finished upload jobs.
    #[must_use]
    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }

    /// Bound for a single blob store call.
    #[must_use]
    pub fn blobstore_timeout(&self) -> Duration {
        Duration::from_secs(self.blobstore_timeout_secs)
    }
}

fn set_parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, slot: &mut T) {
    if let Some(v) = lookup(name) {
        match v.trim().parse::<T>() {
            Ok(parsed) => *slot = parsed,
            Err(_) => tracing::warn!(name, value = %v, "ignoring unparseable config value"),
        }
    }
}
