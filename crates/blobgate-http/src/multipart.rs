//! `multipart/form-data` upload bodies.
//!
//! Uploads arrive as a form with one file field named after the resource
//! kind (`package`, `droplet` or `buildpack`). The parser works on the
//! already-collected body and hands out zero-copy slices of it.

use blobgate_core::error::{GatewayError, GatewayResult};
use bytes::Bytes;

/// One part of a multipart form.
#[derive(Debug, Clone)]
pub struct FormPart {
    /// The `name` parameter of the part's `Content-Disposition`.
    pub name: String,
    /// The `filename` parameter, if the part is a file.
    pub filename: Option<String>,
    /// The part's own `Content-Type`, lowercased.
    pub content_type: Option<String>,
    /// The part body.
    pub data: Bytes,
}

/// Whether `content_type` is `multipart/form-data`.
#[must_use]
pub fn is_multipart(content_type: &str) -> bool {
    content_type
        .trim_start()
        .to_ascii_lowercase()
        .starts_with("multipart/form-data")
}

/// Extract the boundary from `multipart/form-data; boundary=...`.
///
/// # Errors
///
/// [`GatewayError::InvalidContent`] if the type is not multipart or the
/// boundary is missing or empty.
pub fn extract_boundary(content_type: &str) -> GatewayResult<String> {
    if !is_multipart(content_type) {
        return Err(GatewayError::InvalidContent(format!(
            "expected multipart/form-data, got {content_type}"
        )));
    }
    let boundary = header_params(content_type)
        .find(|(name, _)| name.eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value)
        .ok_or_else(|| GatewayError::InvalidContent("missing multipart boundary".to_owned()))?;
    if boundary.is_empty() {
        return Err(GatewayError::InvalidContent(
            "empty multipart boundary".to_owned(),
        ));
    }
    Ok(boundary)
}

/// Split a form body into its named parts. Parts without a name are skipped.
///
/// # Errors
///
/// [`GatewayError::InvalidContent`] if the opening boundary is absent.
pub fn parse_form(body: &Bytes, boundary: &str) -> GatewayResult<Vec<FormPart>> {
    let delimiter = format!("--{boundary}");
    let delimiter = delimiter.as_bytes();

    let start = find_bytes(body, delimiter).ok_or_else(|| {
        GatewayError::InvalidContent("multipart body has no opening boundary".to_owned())
    })?;
    let mut offset = start + delimiter.len();
    let mut parts = Vec::new();

    loop {
        let rest = &body[offset..];
        if rest.starts_with(b"--") {
            break;
        }
        offset += crlf_len(rest);

        let (end, next) = match find_bytes(&body[offset..], delimiter) {
            Some(pos) => (offset + pos, Some(offset + pos + delimiter.len())),
            None => (body.len(), None),
        };
        let end = if body[offset..end].ends_with(b"\r\n") {
            end - 2
        } else {
            end
        };
        if let Some(part) = parse_part(body, offset, end) {
            parts.push(part);
        }

        match next {
            Some(next) => offset = next,
            None => break,
        }
    }
    Ok(parts)
}

/// The upload content of a request body.
///
/// A `multipart/form-data` body yields the part named `field`. Any other
/// content type is taken as the raw blob.
///
/// # Errors
///
/// [`GatewayError::InvalidContent`] if the form is malformed or lacks
/// `field`.
pub fn upload_content(content_type: Option<&str>, body: Bytes, field: &str) -> GatewayResult<Bytes> {
    let Some(content_type) = content_type.filter(|ct| is_multipart(ct)) else {
        return Ok(body);
    };
    let boundary = extract_boundary(content_type)?;
    parse_form(&body, &boundary)?
        .into_iter()
        .find(|part| part.name == field)
        .map(|part| part.data)
        .ok_or_else(|| GatewayError::InvalidContent(format!("missing form field '{field}'")))
}

fn parse_part(body: &Bytes, start: usize, end: usize) -> Option<FormPart> {
    let separator = find_bytes(&body[start..end], b"\r\n\r\n")?;
    let headers = String::from_utf8_lossy(&body[start..start + separator]);
    let data_start = start + separator + 4;

    let mut name = None;
    let mut filename = None;
    let mut content_type = None;
    for line in headers.split("\r\n") {
        let Some((header, value)) = line.split_once(':') else {
            continue;
        };
        if header.trim().eq_ignore_ascii_case("content-disposition") {
            for (param, param_value) in header_params(value) {
                if param.eq_ignore_ascii_case("name") {
                    name = Some(param_value);
                } else if param.eq_ignore_ascii_case("filename") {
                    filename = Some(param_value);
                }
            }
        } else if header.trim().eq_ignore_ascii_case("content-type") {
            content_type = Some(value.trim().to_ascii_lowercase());
        }
    }

    Some(FormPart {
        name: name?,
        filename,
        content_type,
        data: body.slice(data_start..end),
    })
}

/// `key=value` parameters after the first `;` of a header value.
///
/// Quoted values may contain `;`. Matching whole parameter names keeps
/// `name` from matching inside `filename`.
fn header_params(value: &str) -> impl Iterator<Item = (String, String)> + '_ {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in value.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            ';' if !quoted => segments.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    segments.push(current);

    segments.into_iter().skip(1).filter_map(|segment| {
        let (name, value) = segment.split_once('=')?;
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        Some((name.trim().to_owned(), value.to_owned()))
    })
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn crlf_len(data: &[u8]) -> usize {
    if data.starts_with(b"\r\n") {
        2
    } else if data.starts_with(b"\n") {
        1
    } else {
        0
    }
}
