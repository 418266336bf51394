//! polyserve: static file server over HTTP/1, HTTP/2 and HTTP/3.
//!
//! # Architecture Overview
//!
//! ```text
//!   TCP / TLS / optional-TLS sockets        UDP sockets
//!               │                                │
//!               ▼                                ▼
//!        ┌─────────────┐                  ┌─────────────┐
//!        │  TcpRunner  │                  │ QuicRunner  │
//!        │  H1Engine   │──ALPN h2──▶ H2   │  H3Engine   │
//!        │  h2c ───────┼──────────▶ H2    └──────┬──────┘
//!        └──────┬──────┘                         │
//!               └───────────┬────────────────────┘
//!                           ▼
//!              FailFast ─▶ AbortGate ─▶ ServeDir
//! ```
//!
//! The first SIGINT/SIGTERM starts a graceful shutdown; a second one, or
//! the grace period running out, closes every connection. A handler
//! failure exits with status 2.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use polyserve::config::{load_config, Options};
use polyserve::http::{from_service, Handler};
use polyserve::lifecycle::shutdown_signals;
use polyserve::net;
use polyserve::observability::{logging, metrics};
use polyserve::{Error, Server};

const DEFAULT_ADDRESS: &str = "127.0.0.1:8080";

#[derive(Debug, Parser)]
#[command(name = "polyserve")]
#[command(about = "Serve a directory over HTTP/1, HTTP/2 and HTTP/3", long_about = None)]
struct Cli {
    /// TOML configuration file; listener flags are ignored when set
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory to serve
    #[arg(short, long, default_value = ".")]
    root: PathBuf,

    /// Plain TCP address (repeatable)
    #[arg(long)]
    tcp: Vec<String>,

    /// TLS address (repeatable)
    #[arg(long)]
    tls: Vec<String>,

    /// Address accepting both TLS and plaintext (repeatable)
    #[arg(long)]
    optional_tls: Vec<String>,

    /// QUIC address for HTTP/3 (repeatable)
    #[arg(long)]
    quic: Vec<String>,

    /// Certificate chain (PEM) for TLS and QUIC addresses
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Private key (PEM) for TLS and QUIC addresses
    #[arg(long)]
    key: Option<PathBuf>,

    /// Serve Prometheus metrics on this address
    #[arg(long)]
    metrics_address: Option<SocketAddr>,

    /// Seconds to drain connections before closing them
    #[arg(long, default_value_t = 30)]
    grace_period_secs: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init_logging(logging::DEFAULT_FILTER);
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => {
            tracing::info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) if e.is_fatal() => {
            tracing::error!(error = %e, "Handler failed, exiting");
            ExitCode::from(2)
        }
        Err(e) => {
            tracing::error!(error = %e, "Server failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Error> {
    if let Some(addr) = cli.metrics_address {
        metrics::init_metrics(addr);
    }

    let handler = from_service(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .service(ServeDir::new(&cli.root)),
    );
    let options = match &cli.config {
        Some(path) => {
            let config = load_config(path).map_err(|e| Error::Config(e.to_string()))?;
            Options::from_config(&config, handler)?
        }
        None => options_from_flags(&cli, handler)?,
    };
    tracing::info!(root = %cli.root.display(), "Serving directory");

    let stop = CancellationToken::new();
    let force = CancellationToken::new();
    tokio::spawn(shutdown_signals(
        stop.clone(),
        force.clone(),
        Duration::from_secs(cli.grace_period_secs),
    ));

    Server::new(options)
        .run(&force, move |serving| async move {
            tracing::info!("Ready");
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = serving.cancelled() => {
                    tracing::warn!("Server stopped serving, shutting down");
                }
            }
            Ok(())
        })
        .await
}

fn options_from_flags(cli: &Cli, handler: std::sync::Arc<dyn Handler>) -> Result<Options, Error> {
    let needs_tls = !cli.tls.is_empty() || !cli.optional_tls.is_empty() || !cli.quic.is_empty();
    let tls = if needs_tls {
        let (Some(cert), Some(key)) = (&cli.cert, &cli.key) else {
            return Err(Error::Config("--cert and --key are required for TLS and QUIC".into()));
        };
        Some(net::load_tls_config(cert, key)?)
    } else {
        None
    };

    let mut options = Options::new(handler);
    for address in &cli.tcp {
        options = options.with_stream_socket(net::tcp(address.clone()));
    }
    if let Some(tls) = &tls {
        for address in &cli.tls {
            options = options.with_stream_socket(net::tls(address.clone(), tls.clone()));
        }
        for address in &cli.optional_tls {
            options = options.with_stream_socket(net::optional_tls(
                address.clone(),
                tls.clone(),
                Duration::ZERO,
            ));
        }
        for address in &cli.quic {
            options = options.with_packet_socket(net::udp(address.clone()));
        }
        if !cli.quic.is_empty() {
            options = options.with_h3_tls(tls.clone());
        }
    }
    if options.stream_sockets.is_empty() && options.packet_sockets.is_empty() {
        options = options.with_stream_socket(net::tcp(DEFAULT_ADDRESS));
    }
    Ok(options)
}
