//! Demonstration server running a few endpoints behind the guard stack.
//!
//! ```text
//! RUST_LOG=info demo-server --max-bandwidth 65536 --max-request-content-length 1048576
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use axum::body::{Body, Bytes};
use axum::extract::Path;
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use flowguard_tower::{apply_guards, GuardConfig};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Serve demo endpoints behind the standard guard stack.
#[derive(Parser, Debug)]
#[command(name = "demo-server")]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:3000")]
    listen: SocketAddr,

    /// Concurrent requests admitted before shedding with 503
    #[arg(long)]
    max_concurrent_requests: Option<u64>,

    /// Decoded request-URI characters admitted before 414
    #[arg(long)]
    max_url_length: Option<usize>,

    /// Decoded query-string characters admitted before 414
    #[arg(long)]
    max_query_string_length: Option<usize>,

    /// Milliseconds to hold each request before handling
    #[arg(long)]
    min_response_delay_ms: Option<u64>,

    /// Seconds of body inactivity before a transfer is aborted
    #[arg(long)]
    connection_timeout_secs: Option<u64>,

    /// Request body bytes admitted before 413
    #[arg(long)]
    max_request_content_length: Option<u64>,

    /// Process-wide bytes-per-second budget shared by all exchanges
    #[arg(long)]
    max_bandwidth: Option<u64>,
}

impl Cli {
    fn guard_config(&self) -> GuardConfig {
        GuardConfig {
            max_concurrent_requests: self.max_concurrent_requests,
            max_url_length: self.max_url_length,
            max_query_string_length: self.max_query_string_length,
            min_response_delay: self.min_response_delay_ms.map(Duration::from_millis),
            connection_timeout: self.connection_timeout_secs.map(Duration::from_secs),
            max_request_content_length: self.max_request_content_length,
            max_bandwidth: self.max_bandwidth,
        }
    }
}

async fn upload(body: Bytes) -> String {
    format!("received {} bytes\n", body.len())
}

async fn download(Path(bytes): Path<u64>) -> Body {
    // Capped so a demo request cannot exhaust memory.
    let len = usize::try_from(bytes.min(64 * 1024 * 1024)).unwrap_or(usize::MAX);
    Body::from(vec![b'z'; len])
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "failed to install the shutdown signal handler");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.guard_config();
    tracing::info!(?config, "starting demo server");

    let router = Router::new()
        .route("/healthz", get(|| async { "ok\n" }))
        .route("/upload", post(upload))
        .route("/download/{bytes}", get(download));
    // Trace sits outside the guards so rejected requests are logged too.
    let app = apply_guards(router, &config).layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("binding {}", cli.listen))?;
    tracing::info!(addr = %cli.listen, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
