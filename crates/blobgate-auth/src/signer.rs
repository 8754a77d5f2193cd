//! HMAC signed URLs for the public host.
//!
//! A signed URL carries its own authorization in the query string:
//!
//! ```text
//! /packages/<guid>?[verb=put&]expires=<unix-seconds>&signature=<hex>
//! ```
//!
//! The signature is `HMAC-SHA256(secret, path ++ "\n" ++ expires)`. The
//! newline keeps the split between path and expiry unambiguous, since it
//! cannot occur in a request path. Write tokens append `"\nPUT"` to the MAC
//! input, so a read token can never be turned into a write token by editing
//! the query. Tokens are never stored; the gateway recomputes the MAC on
//! every request.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::canonical::hmac_sha256;
use crate::error::AuthError;

/// The verb a signed URL authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignedMethod {
    /// Download; also covers `HEAD`.
    Get,
    /// Upload.
    Put,
}

impl SignedMethod {
    /// Parse the `verb` query parameter of `/sign` or a signed URL.
    pub fn from_verb(verb: &str) -> Result<Self, AuthError> {
        if verb.eq_ignore_ascii_case("get") {
            Ok(Self::Get)
        } else if verb.eq_ignore_ascii_case("put") {
            Ok(Self::Put)
        } else {
            Err(AuthError::MalformedSignature(format!("unknown verb: {verb}")))
        }
    }

    /// Whether a request with `method` may use a token for this verb.
    #[must_use]
    pub fn allows(self, method: &http::Method) -> bool {
        match self {
            Self::Get => *method == http::Method::GET || *method == http::Method::HEAD,
            Self::Put => *method == http::Method::PUT,
        }
    }

    fn mac_suffix(self) -> &'static str {
        match self {
            Self::Get => "",
            Self::Put => "\nPUT",
        }
    }
}

/// A signed URL's authorization data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedUrlToken {
    /// The resource path the token is bound to.
    pub resource_path: String,
    /// When the token stops being valid.
    pub expires: DateTime<Utc>,
    /// The verb the token authorizes.
    pub method: SignedMethod,
    /// Hex-encoded HMAC.
    pub signature: String,
}

impl SignedUrlToken {
    /// Sign `path` for `method` until `expires`.
    #[must_use]
    pub fn new(path: &str, method: SignedMethod, secret: &[u8], expires: DateTime<Utc>) -> Self {
        let mac = compute_mac(secret, path, expires.timestamp(), method);
        Self {
            resource_path: path.to_owned(),
            expires,
            method,
            signature: hex::encode(mac),
        }
    }

    /// The token as a path with query string.
    #[must_use]
    pub fn to_path_and_query(&self) -> String {
        let verb = match self.method {
            SignedMethod::Get => "",
            SignedMethod::Put => "verb=put&",
        };
        format!(
            "{}?{verb}expires={}&signature={}",
            self.resource_path,
            self.expires.timestamp(),
            self.signature
        )
    }
}

/// A request whose signature checked out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedRequest {
    /// The signed resource path.
    pub path: String,
    /// The verb the signature authorizes.
    pub method: SignedMethod,
    /// Query parameters other than `verb`, `expires` and `signature`, in
    /// their original order and encoding.
    pub query: String,
}

/// Sign `path` and return `path?[verb=put&]expires=..&signature=..`.
///
/// ```
/// use blobgate_auth::signer::{SignedMethod, sign_path, verify_path};
/// use chrono::{Duration, Utc};
///
/// let now = Utc::now();
/// let signed = sign_path("/packages/abc", SignedMethod::Get, b"secret", now + Duration::hours(1));
/// let (path, query) = signed.split_once('?').unwrap();
/// assert!(verify_path(path, query, b"secret", now).is_ok());
/// ```
#[must_use]
pub fn sign_path(path: &str, method: SignedMethod, secret: &[u8], expires: DateTime<Utc>) -> String {
    SignedUrlToken::new(path, method, secret, expires).to_path_and_query()
}

/// Check the signature carried in `query` for `path` at time `now`.
///
/// The MAC is compared before the expiry, so an edited expiry is reported as
/// a mismatch rather than as expired.
///
/// # Errors
///
/// - [`AuthError::MalformedSignature`] if `expires` or `signature` is
///   missing or unparseable, or `verb` is unknown.
/// - [`AuthError::SignatureMismatch`] if the MAC does not match.
/// - [`AuthError::SignatureExpired`] if `now` is past the expiry.
pub fn verify_path(
    path: &str,
    query: &str,
    secret: &[u8],
    now: DateTime<Utc>,
) -> Result<VerifiedRequest, AuthError> {
    let mut expires = None;
    let mut signature = None;
    let mut method = SignedMethod::Get;
    let mut rest = Vec::new();

    for pair in query.split('&').filter(|s| !s.is_empty()) {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        match name {
            "expires" => expires = Some(value),
            "signature" => signature = Some(value),
            "verb" => method = SignedMethod::from_verb(value)?,
            _ => rest.push(pair),
        }
    }

    let expires = expires
        .ok_or_else(|| AuthError::MalformedSignature("missing expires".into()))?
        .parse::<i64>()
        .map_err(|_| AuthError::MalformedSignature("expires is not an integer".into()))?;
    let provided = hex::decode(
        signature.ok_or_else(|| AuthError::MalformedSignature("missing signature".into()))?,
    )
    .map_err(|_| AuthError::MalformedSignature("signature is not hex".into()))?;

    let expected = compute_mac(secret, path, expires, method);
    if !bool::from(expected.as_slice().ct_eq(provided.as_slice())) {
        debug!(path, "signed URL failed MAC check");
        return Err(AuthError::SignatureMismatch);
    }
    if now.timestamp() > expires {
        debug!(path, expires, "signed URL expired");
        return Err(AuthError::SignatureExpired);
    }

    Ok(VerifiedRequest {
        path: path.to_owned(),
        method,
        query: rest.join("&"),
    })
}

fn compute_mac(secret: &[u8], path: &str, expires: i64, method: SignedMethod) -> Vec<u8> {
    let input = format!("{path}\n{expires}{}", method.mac_suffix());
    hmac_sha256(secret, input.as_bytes())
}

/// Issues signed URLs rooted at the gateway's public endpoint.
#[derive(Clone)]
pub struct UrlSigner {
    secret: Vec<u8>,
    public_endpoint: String,
    ttl: Duration,
}

impl fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UrlSigner")
            .field("public_endpoint", &self.public_endpoint)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl UrlSigner {
    /// Create a signer for URLs under `public_endpoint`.
    #[must_use]
    pub fn new(secret: impl Into<Vec<u8>>, public_endpoint: &str, ttl: Duration) -> Self {
        Self {
            secret: secret.into(),
            public_endpoint: public_endpoint.trim_end_matches('/').to_owned(),
            ttl,
        }
    }

    /// Absolute signed URL for `path`, valid for the configured TTL.
    #[must_use]
    pub fn sign(&self, path: &str, method: SignedMethod, now: DateTime<Utc>) -> String {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        let expires = now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        format!(
            "{}{}",
            self.public_endpoint,
            sign_path(path, method, &self.secret, expires)
        )
    }

    /// Verify a request against this signer's secret.
    ///
    /// # Errors
    ///
    /// See [`verify_path`].
    pub fn verify(
        &self,
        path: &str,
        query: &str,
        now: DateTime<Utc>,
    ) -> Result<VerifiedRequest, AuthError> {
        verify_path(path, query, &self.secret, now)
    }
}
