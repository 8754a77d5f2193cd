//! Response body type for the gateway.
//!
//! Blobs are held fully in memory by the time a response is built, so the
//! body is either a single buffered chunk or empty.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::Frame;
use http_body_util::Full;

/// The body of every gateway response.
#[derive(Debug, Default)]
pub enum GatewayBody {
    /// A single in-memory chunk.
    Buffered(Full<Bytes>),
    /// No content (204 responses, HEAD, redirects).
    #[default]
    Empty,
}

impl GatewayBody {
    /// Body from bytes.
    #[must_use]
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self::Buffered(Full::new(data.into()))
    }

    /// Body from a string.
    #[must_use]
    pub fn from_string(s: impl Into<String>) -> Self {
        Self::Buffered(Full::new(Bytes::from(s.into())))
    }

    /// Empty body.
    #[must_use]
    pub fn empty() -> Self {
        Self::Empty
    }
}

impl From<Bytes> for GatewayBody {
    fn from(data: Bytes) -> Self {
        if data.is_empty() {
            Self::Empty
        } else {
            Self::from_bytes(data)
        }
    }
}

impl http_body::Body for GatewayBody {
    type Data = Bytes;
    type Error = std::convert::Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.get_mut() {
            Self::Buffered(full) => Pin::new(full)
                .poll_frame(cx)
                .map_err(|never| match never {}),
            Self::Empty => Poll::Ready(None),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            Self::Buffered(full) => full.is_end_stream(),
            Self::Empty => true,
        }
    }

    fn size_hint(&self) -> http_body::SizeHint {
        match self {
            Self::Buffered(full) => full.size_hint(),
            Self::Empty => http_body::SizeHint::with_exact(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use http_body::Body;
    use http_body_util::BodyExt;

    use super::*;

    #[test]
    fn test_should_treat_empty_body_as_finished() {
        let body = GatewayBody::empty();
        assert!(body.is_end_stream());
        assert_eq!(body.size_hint().exact(), Some(0));
    }

    #[test]
    fn test_should_report_buffered_size() {
        let body = GatewayBody::from_string("lalala");
        assert!(!body.is_end_stream());
        assert_eq!(body.size_hint().exact(), Some(6));
    }

    #[test]
    fn test_should_collapse_empty_bytes() {
        assert!(matches!(GatewayBody::from(Bytes::new()), GatewayBody::Empty));
    }

    #[tokio::test]
    async fn test_should_collect_buffered_bytes() {
        let body = GatewayBody::from_bytes(Bytes::from_static(b"blob"));
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected.as_ref(), b"blob");
    }
}
