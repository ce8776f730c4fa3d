//! WebSocket Broadcast Client - Entry Point
//!
//! Connects with the machine name as identity and prints every message
//! the server broadcasts until the server closes or Ctrl-C is pressed.

use chrono::Local;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ws_broadcast::config::{machine_name, DEFAULT_CHANNEL, DEFAULT_PORT};
use ws_broadcast::{ClientConfig, ClientSession};

#[derive(Parser)]
#[command(name = "ws_broadcast_client")]
#[command(about = "Listens to a WebSocket broadcast server")]
#[command(version)]
struct Cli {
    /// Server host
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Server port
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Channel label placed in the request path
    #[arg(long, default_value = DEFAULT_CHANNEL)]
    channel: String,

    /// Identity sent to the server (defaults to the machine name)
    #[arg(long)]
    name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("ws_broadcast=warn,ws_broadcast_client=info")),
        )
        .init();

    let cli = Cli::parse();
    let identity = cli.name.unwrap_or_else(machine_name);
    let session = ClientSession::new(ClientConfig::new(cli.host, cli.port, cli.channel, identity));

    let mut handle = session.connect().await?;
    info!("Connected to {} as {}", session.config().url(), session.config().identity);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut closing = false;

    loop {
        tokio::select! {
            received = handle.recv() => match received {
                Some(text) => println!("{} Received:{} ", Local::now().format("%H:%M:%S %3f"), text),
                None => break,
            },
            _ = &mut ctrl_c, if !closing => {
                closing = true;
                if let Err(e) = handle.close().await {
                    warn!("Close failed: {}", e);
                    break;
                }
            }
        }
    }

    let exit = handle.join().await?;
    info!(?exit, "Session ended");
    Ok(())
}
