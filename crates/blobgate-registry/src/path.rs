//! Registry path parsing.
//!
//! Repository names may contain any number of `/`, so the manifest path
//! `/v2/<name>/manifest/<tag>` cannot be split on a fixed segment count. The
//! parser works in two passes: it first checks the whole remainder against
//! the allowed character set, then splits at the last `/manifest/` boundary.
//! Any character outside `[A-Za-z0-9/_.-]` makes the path invalid.

use crate::error::RegistryError;

const PREFIX: &str = "/v2/";
const MANIFEST_SEGMENT: &str = "/manifest/";
const BLOBS_SEGMENT: &str = "/blobs/";

/// Repository name and tag of a manifest request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryPath {
    /// Repository name, possibly with `/` separators.
    pub name: String,
    /// Tag, a single segment.
    pub tag: String,
}

/// A recognized registry route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryRoute {
    /// `/v2` or `/v2/`, the API version check.
    Base,
    /// `/v2/<name>/manifest/<tag>`.
    Manifest(RepositoryPath),
    /// `/v2/<name>/blobs/<algorithm>:<hex>`.
    Blob {
        /// Repository name.
        name: String,
        /// Content digest.
        digest: String,
    },
}

fn is_allowed(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'/' | b'_' | b'.' | b'-')
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.split('/').all(|segment| !segment.is_empty())
}

/// Parse `/v2/<name>/manifest/<tag>`.
///
/// ```
/// use blobgate_registry::path::parse_manifest_path;
///
/// let parsed = parse_manifest_path("/v2/image/tag/v/22/name/manifest/image-tag").unwrap();
/// assert_eq!(parsed.name, "image/tag/v/22/name");
/// assert_eq!(parsed.tag, "image-tag");
/// assert!(parse_manifest_path("/v2/image/tag@/v/!22/name/manifest/image-tag").is_err());
/// ```
///
/// # Errors
///
/// [`RegistryError::NameInvalid`] if the prefix is missing, a character is
/// outside the allowed set, or the name or tag is empty.
pub fn parse_manifest_path(path: &str) -> Result<RepositoryPath, RegistryError> {
    let invalid = || RegistryError::NameInvalid(path.to_owned());

    let rest = path.strip_prefix(PREFIX).ok_or_else(invalid)?;
    if !rest.bytes().all(is_allowed) {
        return Err(invalid());
    }

    // Prepend a slash so a name-less "manifest/<tag>" still finds a boundary
    // and fails on the empty name.
    let scoped = format!("/{rest}");
    let boundary = scoped.rfind(MANIFEST_SEGMENT).ok_or_else(invalid)?;
    let name = &scoped[1..boundary.max(1)];
    let tag = &scoped[boundary + MANIFEST_SEGMENT.len()..];

    if !is_valid_name(name) || tag.is_empty() || tag.contains('/') {
        return Err(invalid());
    }
    Ok(RepositoryPath {
        name: name.to_owned(),
        tag: tag.to_owned(),
    })
}

/// Parse `<algorithm>:<hex>`, e.g. `sha256:ab12...`.
fn is_valid_digest(digest: &str) -> bool {
    let Some((algorithm, hex)) = digest.split_once(':') else {
        return false;
    };
    !algorithm.is_empty()
        && algorithm
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        && !hex.is_empty()
        && hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Classify a `/v2` path.
///
/// # Errors
///
/// [`RegistryError::NameInvalid`] for anything that is not a base, manifest
/// or blob path.
pub fn parse_route(path: &str) -> Result<RegistryRoute, RegistryError> {
    if path == "/v2" || path == PREFIX {
        return Ok(RegistryRoute::Base);
    }

    let rest = path
        .strip_prefix(PREFIX)
        .ok_or_else(|| RegistryError::NameInvalid(path.to_owned()))?;
    let scoped = format!("/{rest}");
    if let Some(boundary) = scoped.rfind(BLOBS_SEGMENT) {
        let name = &scoped[1..boundary.max(1)];
        let digest = &scoped[boundary + BLOBS_SEGMENT.len()..];
        if is_valid_digest(digest) && name.bytes().all(is_allowed) && is_valid_name(name) {
            return Ok(RegistryRoute::Blob {
                name: name.to_owned(),
                digest: digest.to_owned(),
            });
        }
    }

    parse_manifest_path(path).map(RegistryRoute::Manifest)
}
