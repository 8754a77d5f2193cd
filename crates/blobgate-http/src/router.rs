//! Host-based request routing.
//!
//! The gateway serves two audiences on one listener, told apart by the
//! `Host` header:
//!
//! - the **internal** host (`internal.` prefix by default) is trusted. It
//!   exposes the resource endpoints, `/sign` and the registry.
//! - the **public** host (`public.` prefix by default) only accepts signed
//!   URLs. The signature is checked before anything else, so an unsigned
//!   request learns nothing about which resources exist.
//!
//! Health checks are answered on any host, including none at all.

use blobgate_auth::{AuthError, UrlSigner};
use blobgate_core::GatewayConfig;
use blobgate_core::blobstore::{BlobKey, ResourceKind};
use blobgate_core::error::{GatewayError, GatewayResult};
use chrono::{DateTime, Utc};
use http::Method;
use tracing::debug;

const HEALTH_PATHS: [&str; 2] = ["/_health", "/health"];
const SIGNED_PREFIX: &str = "/signed";

/// Which audience a request is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKind {
    /// The trusted, internal host.
    Internal,
    /// The public host reached through signed URLs.
    Public,
    /// Neither prefix matched.
    Unknown,
}

/// The endpoint a request resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Liveness probe.
    Health,
    /// `/{kind}/{guid}`.
    Resource(BlobKey),
    /// `/sign/{kind}/{guid}`: issue a signed URL. The segments are validated
    /// by the handler once the caller has authenticated.
    Sign {
        /// Raw resource kind segment.
        kind: String,
        /// Raw GUID segment.
        guid: String,
    },
    /// Anything under `/v2`.
    Registry,
}

/// A routed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedRequest {
    /// The host the request was classified as.
    pub host: HostKind,
    /// The resolved endpoint.
    pub route: Route,
    /// Query parameters handed to the endpoint. On the public host the
    /// signature parameters have been removed.
    pub query: String,
}

/// Routes requests by host, method and path.
#[derive(Debug, Clone)]
pub struct HostRouter {
    internal_prefix: String,
    public_prefix: String,
    signer: UrlSigner,
}

impl HostRouter {
    /// Create a router. Prefixes are matched case-insensitively.
    #[must_use]
    pub fn new(
        internal_prefix: impl Into<String>,
        public_prefix: impl Into<String>,
        signer: UrlSigner,
    ) -> Self {
        Self {
            internal_prefix: internal_prefix.into().to_ascii_lowercase(),
            public_prefix: public_prefix.into().to_ascii_lowercase(),
            signer,
        }
    }

    /// Router and URL signer built from `config`.
    #[must_use]
    pub fn from_config(config: &GatewayConfig) -> Self {
        let signer = UrlSigner::new(
            config.signing_secret.as_bytes(),
            &config.public_endpoint,
            config.signed_url_ttl(),
        );
        Self::new(
            config.internal_host_prefix.clone(),
            config.public_host_prefix.clone(),
            signer,
        )
    }

    /// The signer used to verify public requests and issue URLs.
    #[must_use]
    pub fn signer(&self) -> &UrlSigner {
        &self.signer
    }

    /// Classify a `Host` header value.
    #[must_use]
    pub fn classify(&self, host: &str) -> HostKind {
        let host = strip_port(host).to_ascii_lowercase();
        if !self.internal_prefix.is_empty() && host.starts_with(&self.internal_prefix) {
            HostKind::Internal
        } else if !self.public_prefix.is_empty() && host.starts_with(&self.public_prefix) {
            HostKind::Public
        } else {
            HostKind::Unknown
        }
    }

    /// Resolve a request to a [`Route`].
    ///
    /// # Errors
    ///
    /// - [`GatewayError::NotFound`] for an unknown host or path.
    /// - [`GatewayError::MethodNotAllowed`] for a known path with an
    ///   unsupported method.
    /// - [`GatewayError::Forbidden`] for a public request whose signature is
    ///   missing, invalid, expired or does not cover the method.
    /// - [`GatewayError::MalformedRequest`] for an unknown `verb` on `/sign`.
    pub fn route(
        &self,
        method: &Method,
        host: Option<&str>,
        path: &str,
        query: &str,
        now: DateTime<Utc>,
    ) -> GatewayResult<RoutedRequest> {
        let kind = host.map_or(HostKind::Unknown, |h| self.classify(h));

        if HEALTH_PATHS.contains(&path) && (*method == Method::GET || *method == Method::HEAD) {
            return Ok(RoutedRequest {
                host: kind,
                route: Route::Health,
                query: String::new(),
            });
        }

        let (route, query) = match kind {
            HostKind::Internal => (route_internal(method, path)?, query.to_owned()),
            HostKind::Public => self.route_public(method, path, query, now)?,
            HostKind::Unknown => {
                debug!(host = host.unwrap_or_default(), "request for unknown host");
                return Err(GatewayError::NotFound(format!(
                    "unknown host '{}'",
                    host.unwrap_or_default()
                )));
            }
        };
        Ok(RoutedRequest {
            host: kind,
            route,
            query,
        })
    }

    fn route_public(
        &self,
        method: &Method,
        path: &str,
        query: &str,
        now: DateTime<Utc>,
    ) -> GatewayResult<(Route, String)> {
        let path = match path.strip_prefix(SIGNED_PREFIX) {
            Some(rest) if rest.starts_with('/') => rest,
            _ => path,
        };
        let verified = self
            .signer
            .verify(path, query, now)
            .map_err(|e| forbidden(&e))?;
        if !verified.method.allows(method) {
            return Err(forbidden(&AuthError::MethodMismatch));
        }
        let key = resource_key(&verified.path)
            .ok_or_else(|| GatewayError::NotFound(verified.path.clone()))??;
        Ok((Route::Resource(key), verified.query))
    }
}

fn route_internal(method: &Method, path: &str) -> GatewayResult<Route> {
    if path == "/v2" || path.starts_with("/v2/") {
        return Ok(Route::Registry);
    }

    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    match segments.as_slice() {
        ["sign", kind, guid] => {
            if *method != Method::GET {
                return Err(GatewayError::MethodNotAllowed(method.to_string()));
            }
            Ok(Route::Sign {
                kind: (*kind).to_owned(),
                guid: (*guid).to_owned(),
            })
        }
        _ => {
            let key = resource_key(path).ok_or_else(|| GatewayError::NotFound(path.to_owned()))??;
            if [Method::GET, Method::HEAD, Method::PUT, Method::DELETE].contains(method) {
                Ok(Route::Resource(key))
            } else {
                Err(GatewayError::MethodNotAllowed(method.to_string()))
            }
        }
    }
}

/// Parse `/{kind}/{guid}`. `None` if the path does not have that shape,
/// `Some(Err)` if the kind is known but the guid is invalid.
fn resource_key(path: &str) -> Option<GatewayResult<BlobKey>> {
    let (kind, guid) = path.strip_prefix('/')?.split_once('/')?;
    let kind: ResourceKind = kind.parse().ok()?;
    Some(BlobKey::new(kind, guid).map_err(|e| GatewayError::NotFound(e.to_string())))
}

fn forbidden(err: &AuthError) -> GatewayError {
    debug!(error = %err, "rejected public request");
    GatewayError::Forbidden(err.to_string())
}

/// Strip a trailing `:port`, keeping bracketed IPv6 literals intact.
#[must_use]
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split_once(']').map_or(host, |(addr, _)| addr);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// The raw value of the first `name` parameter in `query`.
#[must_use]
pub fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use blobgate_auth::SignedMethod;
    use chrono::TimeZone;

    use super::*;

    const SECRET: &str = "s3cr3t";

    fn router() -> HostRouter {
        HostRouter::new(
            "internal.",
            "public.",
            UrlSigner::new(SECRET, "http://public.example.com", Duration::from_secs(3600)),
        )
    }

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn internal(method: Method, path: &str, query: &str) -> GatewayResult<RoutedRequest> {
        router().route(&method, Some("internal.example.com:8080"), path, query, now())
    }

    fn signed_query(path: &str, method: SignedMethod) -> String {
        let url = router().signer().sign(path, method, now());
        url.split_once('?').unwrap().1.to_owned()
    }

    #[test]
    fn test_should_classify_hosts() {
        let r = router();
        assert_eq!(r.classify("internal.example.com"), HostKind::Internal);
        assert_eq!(r.classify("INTERNAL.example.com:8080"), HostKind::Internal);
        assert_eq!(r.classify("public.127.0.0.1.nip.io:8080"), HostKind::Public);
        assert_eq!(r.classify("example.com"), HostKind::Unknown);
        assert_eq!(r.classify("[::1]:8080"), HostKind::Unknown);
    }

    #[test]
    fn test_should_strip_ports() {
        assert_eq!(strip_port("host:8080"), "host");
        assert_eq!(strip_port("host"), "host");
        assert_eq!(strip_port("[::1]:443"), "::1");
    }

    #[test]
    fn test_should_answer_health_on_any_host() {
        let routed = router()
            .route(&Method::GET, None, "/_health", "", now())
            .unwrap();
        assert_eq!(routed.route, Route::Health);
        let routed = router()
            .route(&Method::GET, Some("whatever"), "/health", "", now())
            .unwrap();
        assert_eq!(routed.route, Route::Health);
    }

    #[test]
    fn test_should_reject_unknown_host() {
        let err = router()
            .route(&Method::GET, Some("other.example.com"), "/packages/abc", "", now())
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[test]
    fn test_should_route_internal_resources() {
        let routed = internal(Method::PUT, "/packages/abc", "async=true").unwrap();
        assert_eq!(routed.host, HostKind::Internal);
        assert_eq!(
            routed.route,
            Route::Resource(BlobKey::parse("packages", "abc").unwrap())
        );
        assert_eq!(routed.query, "async=true");

        for method in [Method::GET, Method::HEAD, Method::DELETE] {
            assert!(internal(method, "/droplets/d-1", "").is_ok());
        }
        assert!(matches!(
            internal(Method::POST, "/buildpacks/b", ""),
            Err(GatewayError::MethodNotAllowed(_))
        ));
        assert!(matches!(
            internal(Method::GET, "/widgets/abc", ""),
            Err(GatewayError::NotFound(_))
        ));
        assert!(matches!(
            internal(Method::GET, "/packages/a/b", ""),
            Err(GatewayError::NotFound(_))
        ));
    }

    #[test]
    fn test_should_route_sign_requests() {
        let routed = internal(Method::GET, "/sign/packages/abc", "verb=put").unwrap();
        assert_eq!(
            routed.route,
            Route::Sign {
                kind: "packages".to_owned(),
                guid: "abc".to_owned(),
            }
        );
        assert_eq!(routed.query, "verb=put");
        // Arguments are checked after authentication, not here.
        let routed = internal(Method::GET, "/sign/widgets/abc", "verb=delete").unwrap();
        assert!(matches!(routed.route, Route::Sign { .. }));
        assert!(matches!(
            internal(Method::PUT, "/sign/packages/abc", ""),
            Err(GatewayError::MethodNotAllowed(_))
        ));
    }

    #[test]
    fn test_should_route_registry_paths() {
        assert_eq!(internal(Method::GET, "/v2", "").unwrap().route, Route::Registry);
        assert_eq!(
            internal(Method::PUT, "/v2/a/b/manifest/latest", "").unwrap().route,
            Route::Registry
        );
    }

    #[test]
    fn test_should_require_signature_on_public_host() {
        let r = router();
        let err = r
            .route(&Method::GET, Some("public.example.com"), "/packages/abc", "", now())
            .unwrap_err();
        assert!(matches!(err, GatewayError::Forbidden(_)));

        // Unsigned requests never reach route resolution.
        let err = r
            .route(&Method::GET, Some("public.example.com"), "/nope", "", now())
            .unwrap_err();
        assert!(matches!(err, GatewayError::Forbidden(_)));
    }

    #[test]
    fn test_should_route_signed_public_requests() {
        let query = format!("{}&async=true", signed_query("/packages/abc", SignedMethod::Put));
        let routed = router()
            .route(
                &Method::PUT,
                Some("public.example.com"),
                "/signed/packages/abc",
                &query,
                now(),
            )
            .unwrap();
        assert_eq!(routed.host, HostKind::Public);
        assert_eq!(
            routed.route,
            Route::Resource(BlobKey::parse("packages", "abc").unwrap())
        );
        assert_eq!(routed.query, "async=true");
    }

    #[test]
    fn test_should_reject_method_outside_signature() {
        let query = signed_query("/packages/abc", SignedMethod::Get);
        let r = router();
        let host = Some("public.example.com");
        assert!(
            r.route(&Method::HEAD, host, "/packages/abc", &query, now())
                .is_ok()
        );
        for method in [Method::PUT, Method::DELETE] {
            let err = r
                .route(&method, host, "/packages/abc", &query, now())
                .unwrap_err();
            assert!(matches!(err, GatewayError::Forbidden(_)), "{method}");
        }
    }

    #[test]
    fn test_should_reject_signature_for_other_path() {
        let query = signed_query("/packages/abc", SignedMethod::Get);
        let err = router()
            .route(
                &Method::GET,
                Some("public.example.com"),
                "/packages/other",
                &query,
                now(),
            )
            .unwrap_err();
        assert!(matches!(err, GatewayError::Forbidden(_)));
    }

    #[test]
    fn test_should_read_query_params() {
        assert_eq!(query_param("a=1&verb=put", "verb"), Some("put"));
        assert_eq!(query_param("async", "async"), Some(""));
        assert_eq!(query_param("a=1", "verb"), None);
        assert_eq!(query_param("", "verb"), None);
    }
}
