//! End-to-end tests for a running Blobgate server.
//!
//! These tests require a server listening on `127.0.0.1:8080` (override with
//! `BLOBGATE_TEST_ADDR`) and started with
//! `BLOBGATE_USERNAME=the-username BLOBGATE_PASSWORD=the-password`. The
//! internal and public host names are resolved to that address by the test
//! client, so no DNS is needed. They are marked `#[ignore]` so they don't run
//! during normal `cargo test`.
//!
//! Run them with:
//! ```text
//! cargo test -p blobgate-integration -- --ignored
//! ```

use std::io::{Cursor, Write};
use std::net::SocketAddr;
use std::sync::Once;

static INIT: Once = Once::new();

/// Internal host name used by the tests.
pub const INTERNAL_HOST: &str = "internal.127.0.0.1.nip.io";

/// Public host name used by the tests.
pub const PUBLIC_HOST: &str = "public.127.0.0.1.nip.io";

/// Basic-auth username the server is expected to run with.
pub const USERNAME: &str = "the-username";

/// Basic-auth password the server is expected to run with.
pub const PASSWORD: &str = "the-password";

const BOUNDARY: &str = "blobgate-integration-boundary";

/// Initialize tracing (once).
fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .init();
    });
}

/// Address of the server under test.
fn server_addr() -> SocketAddr {
    std::env::var("BLOBGATE_TEST_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8080".to_owned())
        .parse()
        .expect("BLOBGATE_TEST_ADDR must be a socket address")
}

/// An HTTP client that resolves both gateway hosts to the server under test.
#[must_use]
pub fn client() -> reqwest::Client {
    init_tracing();
    let addr = server_addr();
    reqwest::Client::builder()
        .resolve(INTERNAL_HOST, addr)
        .resolve(PUBLIC_HOST, addr)
        .build()
        .expect("failed to build HTTP client")
}

/// `http://internal...:port{path}`.
#[must_use]
pub fn internal_url(path: &str) -> String {
    format!("http://{INTERNAL_HOST}:{}{path}", server_addr().port())
}

/// `http://public...:port{path}`.
#[must_use]
pub fn public_url(path: &str) -> String {
    format!("http://{PUBLIC_HOST}:{}{path}", server_addr().port())
}

/// A fresh resource GUID.
#[must_use]
pub fn test_guid(prefix: &str) -> String {
    let id = uuid::Uuid::new_v4().to_string()[..8].to_owned();
    format!("{prefix}-{id}")
}

/// A zip archive holding one file.
#[must_use]
pub fn zip_with(name: &str, contents: &[u8]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file(name, zip::write::SimpleFileOptions::default())
        .expect("start zip entry");
    writer.write_all(contents).expect("write zip entry");
    writer.finish().expect("finish zip").into_inner()
}

/// Attach `data` as the multipart field `field`.
#[must_use]
pub fn with_form_file(
    request: reqwest::RequestBuilder,
    field: &str,
    data: &[u8],
) -> reqwest::RequestBuilder {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(
        format!("Content-Disposition: form-data; name=\"{field}\"; filename=\"{field}.zip\"\r\n")
            .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/zip\r\n\r\n");
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    request
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(body)
}

/// Ask the internal host for a signed URL.
pub async fn sign(client: &reqwest::Client, path: &str) -> anyhow::Result<String> {
    let response = client
        .get(internal_url(path))
        .basic_auth(USERNAME, Some(PASSWORD))
        .send()
        .await?
        .error_for_status()?;
    Ok(response.text().await?)
}

mod test_registry;
mod test_signed;
mod test_upload;
