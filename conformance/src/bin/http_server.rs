//! Serves the conformance protocol over the HTTP transport (spec §4.6,
//! §6): an axum router bound to a TCP listener.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use tablerpc_conformance::build_protocol;
use tablerpc_core::server::http::{build_router, HttpServerConfig};

#[derive(Parser, Debug)]
#[command(name = "tablerpc-http-server", about = "Conformance protocol over the HTTP transport")]
struct Cli {
    /// Port to listen on (0 for ephemeral).
    #[arg(short = 'p', long = "port", default_value_t = 0)]
    port: u16,

    /// Path prefix to serve routes under, e.g. "/rpc".
    #[arg(long = "prefix", default_value = "")]
    prefix: String,

    /// zstd compression level for response bodies; unset leaves responses
    /// uncompressed.
    #[arg(long = "compression-level")]
    compression_level: Option<i32>,

    /// Allowed CORS origin; unset serves no CORS headers.
    #[arg(long = "cors-origin")]
    cors_origin: Option<String>,

    /// Suppress request logging.
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let log_level = if cli.quiet { "warn" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .init();

    let protocol = Arc::new(build_protocol());
    let config = HttpServerConfig {
        prefix: cli.prefix,
        compression_level: cli.compression_level,
        cors_origin: cli.cors_origin,
        ..HttpServerConfig::default()
    };

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", cli.port)).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "tablerpc-http-server listening");

    let router = build_router(protocol, config);
    axum::serve(listener, router).await?;
    Ok(())
}
