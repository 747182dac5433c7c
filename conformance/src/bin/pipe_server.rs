//! Serves the conformance protocol over the pipe transport: one TCP
//! connection stands in for a process's duplex byte channel, same as a
//! child process's stdin/stdout pair would (spec §4.8, §5).

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use tablerpc_conformance::build_protocol;
use tablerpc_core::server::pipe::PipeServer;

#[derive(Parser, Debug)]
#[command(name = "tablerpc-pipe-server", about = "Conformance protocol over the pipe transport")]
struct Cli {
    /// Port to listen on (0 for ephemeral).
    #[arg(short = 'p', long = "port", default_value_t = 0)]
    port: u16,

    /// Suppress per-connection logging.
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

    let listener = TcpListener::bind(("127.0.0.1", cli.port)).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "tablerpc-pipe-server listening");

    let protocol = Arc::new(build_protocol());

    loop {
        let (stream, peer) = listener.accept().await?;
        let protocol = protocol.clone();
        tokio::spawn(async move {
            tracing::info!(%peer, "connection accepted");
            let server = PipeServer::new(protocol);
            let (reader, writer) = tokio::io::split(stream);
            if let Err(err) = server.serve(reader, writer).await {
                tracing::warn!(%peer, error = %err, "pipe connection ended with a transport error");
            } else {
                tracing::info!(%peer, "connection closed");
            }
        });
    }
}
