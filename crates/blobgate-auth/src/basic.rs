//! HTTP basic authentication for the internal `/sign` endpoint.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use subtle::ConstantTimeEq;

use crate::error::AuthError;

/// Username and password accepted by [`verify_basic_auth`].
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Create credentials.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// The username.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Whether both fields are empty, i.e. nothing was configured.
    #[must_use]
    pub fn is_unset(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }

    /// Value for an `Authorization` header carrying these credentials.
    #[must_use]
    pub fn to_header_value(&self) -> String {
        let encoded = STANDARD.encode(format!("{}:{}", self.username, self.password));
        format!("Basic {encoded}")
    }
}

/// Check an `Authorization` header against `expected`.
///
/// Unset credentials reject every request.
///
/// ```
/// use blobgate_auth::basic::{Credentials, verify_basic_auth};
///
/// let creds = Credentials::new("the-username", "the-password");
/// let header = creds.to_header_value();
/// assert!(verify_basic_auth(Some(&header), &creds).is_ok());
/// assert!(verify_basic_auth(None, &creds).is_err());
/// ```
///
/// # Errors
///
/// - [`AuthError::MissingCredentials`] without a header.
/// - [`AuthError::InvalidCredentials`] if the header is not valid basic auth
///   or the credentials do not match.
pub fn verify_basic_auth(header: Option<&str>, expected: &Credentials) -> Result<(), AuthError> {
    let header = header.ok_or(AuthError::MissingCredentials)?;
    let (scheme, encoded) = header
        .trim()
        .split_once(' ')
        .ok_or(AuthError::InvalidCredentials)?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return Err(AuthError::InvalidCredentials);
    }
    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|_| AuthError::InvalidCredentials)?;
    let decoded = String::from_utf8(decoded).map_err(|_| AuthError::InvalidCredentials)?;
    let (username, password) = decoded
        .split_once(':')
        .ok_or(AuthError::InvalidCredentials)?;

    if expected.is_unset() {
        return Err(AuthError::InvalidCredentials);
    }
    let user_ok = username.as_bytes().ct_eq(expected.username.as_bytes());
    let pass_ok = password.as_bytes().ct_eq(expected.password.as_bytes());
    if bool::from(user_ok & pass_ok) {
        Ok(())
    } else {
        Err(AuthError::InvalidCredentials)
    }
}
