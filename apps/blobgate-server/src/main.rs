//! Blobgate server: a blobstore gateway for packages, droplets and buildpacks.
//!
//! One listener serves two hosts. The internal host (trusted callers) uploads,
//! downloads and deletes blobs, issues signed URLs and serves the registry
//! endpoints. The public host serves blobs only through signed URLs.
//!
//! # Usage
//!
//! ```text
//! BLOBGATE_SIGNING_SECRET=... BLOBGATE_USERNAME=... BLOBGATE_PASSWORD=... blobgate-server
//! ```
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `GATEWAY_LISTEN` | `0.0.0.0:8080` | Bind address |
//! | `BLOBGATE_INTERNAL_HOST_PREFIX` | `internal.` | Host prefix of the internal API |
//! | `BLOBGATE_PUBLIC_HOST_PREFIX` | `public.` | Host prefix of the signed-URL API |
//! | `BLOBGATE_PUBLIC_ENDPOINT` | `http://public.127.0.0.1.nip.io:8080` | Base of issued URLs |
//! | `BLOBGATE_SIGNING_SECRET` | *(empty)* | HMAC key for signed URLs |
//! | `BLOBGATE_SIGNED_URL_TTL_SECS` | `3600` | Signed URL lifetime |
//! | `BLOBGATE_SIGNING_MODE` | `proxy` | `proxy` or `s3` |
//! | `BLOBGATE_USERNAME` / `BLOBGATE_PASSWORD` | *(empty)* | Basic auth for `/sign` |
//! | `BLOBGATE_UPLOAD_WORKERS` | `4` | Async upload workers |
//! | `BLOBGATE_UPLOAD_QUEUE_CAPACITY` | `64` | Async upload queue size |
//! | `BLOBGATE_JOB_RETENTION_SECS` | `600` | Retention of finished upload jobs |
//! | `BLOBGATE_BLOBSTORE_TIMEOUT_SECS` | `30` | Bound on each blob store call |
//! | `BLOBGATE_MAX_MEMORY_BLOB_SIZE` | `524288` | Larger blobs spill to disk |
//! | `BLOBGATE_S3_*` | | Bucket, region, keys and endpoint for `s3` mode |
//! | `LOG_LEVEL` | `info` | Log level filter |
//! | `RUST_LOG` | *(unset)* | Fine-grained tracing filter (overrides `LOG_LEVEL`) |

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use blobgate_core::GatewayConfig;
use blobgate_core::blobstore::InMemoryBlobStore;
use blobgate_core::config::SigningMode;
use blobgate_http::{GatewayService, GatewayState};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as HttpConnBuilder;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Server version reported at startup.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the tracing subscriber.
///
/// Uses `RUST_LOG` if set, otherwise falls back to the `LOG_LEVEL` config value.
fn init_tracing(log_level: &str) -> Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::try_new(log_level)
            .with_context(|| format!("invalid log level filter: {log_level}"))?
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    Ok(())
}

/// Log settings that leave the gateway open or unusable.
fn warn_on_weak_config(config: &GatewayConfig) {
    if config.signing_mode == SigningMode::Proxy && config.signing_secret.is_empty() {
        warn!("BLOBGATE_SIGNING_SECRET is empty; signed URLs can be forged");
    }
    if config.username.is_empty() || config.password.is_empty() {
        warn!("BLOBGATE_USERNAME/BLOBGATE_PASSWORD unset; /sign will reject every request");
    }
}

/// Resolve when Ctrl-C or, on unix, SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("received shutdown signal, draining connections");
}

/// Run the accept loop, serving connections until a shutdown signal is received.
async fn serve(listener: TcpListener, service: GatewayService) -> Result<()> {
    let graceful = hyper_util::server::graceful::GracefulShutdown::new();
    let http = HttpConnBuilder::new(TokioExecutor::new());

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        continue;
                    }
                };

                let conn = http.serve_connection(TokioIo::new(stream), service.clone());
                let conn = graceful.watch(conn.into_owned());

                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        error!(peer_addr = %peer_addr, error = %e, "connection error");
                    }
                });
            }

            () = &mut shutdown => {
                info!("shutting down gracefully");
                break;
            }
        }
    }

    graceful.shutdown().await;
    info!("all connections drained");

    service.shutdown().await;
    info!("upload workers stopped, exiting");

    Ok(())
}

/// Request the health endpoint of a running gateway.
///
/// Exits with code 0 if healthy, 1 otherwise.
async fn run_health_check(addr: &str) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("cannot connect to {addr}"))?;

    let (mut reader, mut writer) = stream.into_split();

    let request = format!("GET /_health HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    writer.write_all(request.as_bytes()).await?;
    writer.shutdown().await?;

    let mut response = String::new();
    reader.read_to_string(&mut response).await?;

    if response.contains("200 OK") && response.contains("\"status\":\"running\"") {
        Ok(())
    } else {
        anyhow::bail!("unhealthy response from {addr}")
    }
}

/// Build the gateway state with the in-memory store.
fn build_service(config: GatewayConfig) -> GatewayService {
    let store = Arc::new(InMemoryBlobStore::new(config.max_memory_blob_size));
    GatewayService::new(Arc::new(GatewayState::new(config, store)))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --health-check flag for Docker HEALTHCHECK.
    if std::env::args().any(|a| a == "--health-check") {
        let config = GatewayConfig::from_env();
        let addr = config.gateway_listen.replace("0.0.0.0", "127.0.0.1");
        let healthy = run_health_check(&addr).await.is_ok();
        std::process::exit(i32::from(!healthy));
    }

    let config = GatewayConfig::from_env();

    init_tracing(&config.log_level)?;

    info!(
        gateway_listen = %config.gateway_listen,
        internal_host_prefix = %config.internal_host_prefix,
        public_host_prefix = %config.public_host_prefix,
        public_endpoint = %config.public_endpoint,
        signing_mode = ?config.signing_mode,
        upload_workers = config.upload_workers,
        version = VERSION,
        "starting Blobgate",
    );
    warn_on_weak_config(&config);

    let addr: SocketAddr = config
        .gateway_listen
        .parse()
        .with_context(|| format!("invalid bind address: {}", config.gateway_listen))?;
    let service = build_service(config);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;

    info!(%addr, "listening for connections");

    serve(listener, service).await
}
