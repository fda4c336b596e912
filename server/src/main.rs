use clap::Parser;
use log::{error, info};
use server::api::{self, ApiState};
use server::network::Server;
use server::store::{JsonStore, RunStore};
use std::path::PathBuf;
use std::sync::Arc;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// IP address to bind both listeners to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Port of the real-time channel
    #[clap(short, long, default_value = "8080")]
    port: u16,
    /// Port of the HTTP API
    #[clap(long, default_value = "3000")]
    http_port: u16,
    /// JSON file holding challenges and runs
    #[clap(short, long, default_value = "bingo.json")]
    data_file: PathBuf,
    /// Keep everything in memory and ignore --data-file
    #[clap(long)]
    in_memory: bool,
    /// Maximum number of concurrent real-time connections
    #[clap(short, long, default_value = "256")]
    max_connections: usize,
}

/// Parses arguments, opens the store, then runs the HTTP API and the
/// real-time server side by side until one stops or Ctrl+C arrives.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let store: Arc<dyn RunStore> = if args.in_memory {
        info!("Using in-memory store");
        Arc::new(JsonStore::in_memory())
    } else {
        Arc::new(JsonStore::open(&args.data_file).await?)
    };

    let http_addr = format!("{}:{}", args.host, args.http_port);
    let http_listener = tokio::net::TcpListener::bind(&http_addr).await?;
    info!("HTTP API listening on {}", http_listener.local_addr()?);
    let app = api::router(ApiState::new(Arc::clone(&store)));

    let live_addr = format!("{}:{}", args.host, args.port);
    let server = Server::bind(&live_addr, store, args.max_connections).await?;
    let shutdown = server.shutdown_handle();

    let mut http_handle = tokio::spawn(async move { axum::serve(http_listener, app).await });
    let mut live_handle = tokio::spawn(server.run());

    tokio::select! {
        result = &mut http_handle => {
            match result {
                Ok(Err(e)) => error!("HTTP server failed: {}", e),
                Err(e) => error!("HTTP task panicked: {}", e),
                Ok(Ok(())) => info!("HTTP server stopped"),
            }
        }
        result = &mut live_handle => {
            match result {
                Ok(Err(e)) => error!("Real-time server failed: {}", e),
                Err(e) => error!("Real-time task panicked: {}", e),
                Ok(Ok(())) => info!("Real-time server stopped"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    // Let the room workers drain before exiting
    shutdown.shutdown();
    if !live_handle.is_finished() {
        if let Err(e) = live_handle.await {
            error!("Real-time task panicked during shutdown: {}", e);
        }
    }
    http_handle.abort();

    Ok(())
}
