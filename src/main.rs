//! WebSocket Broadcast Server - Entry Point
//!
//! Binds the listener, runs the accept loop on its own task and, for the
//! demo, broadcasts a timestamped greeting to every client on an interval.

use std::time::Duration;

use chrono::Local;
use clap::Parser;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use ws_broadcast::config::DEFAULT_PORT;
use ws_broadcast::{BroadcastServer, Broadcaster, ServerConfig};

#[derive(Parser)]
#[command(name = "ws_broadcast_server")]
#[command(about = "WebSocket server that broadcasts to every connected client")]
#[command(version)]
struct Cli {
    /// Host to bind (wildcard by default)
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Demo broadcast period in milliseconds (0 disables it)
    #[arg(long, default_value_t = 1000)]
    broadcast_interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=ws_broadcast=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("ws_broadcast=info,ws_broadcast_server=info")),
        )
        .init();

    let cli = Cli::parse();

    // Bind failure is fatal: report and exit
    let server = BroadcastServer::bind(ServerConfig::new(cli.bind, cli.port)).await?;
    info!("WebSocket broadcast server listening on {}", server.local_addr()?);

    if cli.broadcast_interval_ms > 0 {
        let period = Duration::from_millis(cli.broadcast_interval_ms);
        tokio::spawn(demo_broadcast(server.broadcaster(), period));
    }

    let accept_loop = tokio::spawn(server.run_until(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    }));

    accept_loop.await?;
    Ok(())
}

/// Broadcast `"<time>,hello from server"` to everyone every `period`
async fn demo_broadcast(broadcaster: Broadcaster, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let message = format!("{},hello from server", Local::now().format("%H:%M:%S %3f"));

        match broadcaster.broadcast("test", &message).await {
            Ok(report) => debug!(
                delivered = report.delivered,
                skipped = report.skipped,
                failed = report.failed.len(),
                "{}",
                message
            ),
            Err(e) => error!("Failed to serialize broadcast: {}", e),
        }
    }
}
