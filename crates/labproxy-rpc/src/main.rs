//! labproxy demo server.
//!
//! Serves a simulated motor. The motor is constructed from the arguments of
//! the first client to connect.

use anyhow::Result;
use clap::Parser;
use labproxy::{Server, ServerOptions};
use labproxy_rpc::DummyMotor;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "labproxy-rpc")]
#[command(about = "Serve a simulated motor over labproxy")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Enable debug logging (ignored when RUST_LOG is set)
    #[arg(short, long)]
    debug: bool,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Seconds without a request before a client is evicted
    #[arg(long)]
    liveness_budget: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let default_level = if args.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false);
    if args.json_logs {
        builder.json().init();
    } else {
        builder.compact().init();
    }

    info!("Starting labproxy motor server");

    let mut options = ServerOptions::default();
    if let Some(secs) = args.liveness_budget {
        options.liveness_budget = Duration::from_secs(secs);
    }

    let mut server = Server::<DummyMotor>::new(options)?;
    let addr = server.start((args.host.as_str(), args.port)).await?;

    // Print port for launchers to read (intentional stdout)
    println!("LABPROXY_PORT={}", addr.port());

    info!("Motor server running on {}", addr);

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutdown signal received, exiting");
        }
        _ = server.wait() => {
            info!("Server killed by client, exiting");
        }
    }

    server.stop().await;
    Ok(())
}
