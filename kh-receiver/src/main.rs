//! kh-receiver: entry point.
//!
//! ```text
//! kh-receiver                              Prompt for the sender and receive
//! kh-receiver --address 10.0.0.2 --port 7777
//!                                          First session without prompting
//! kh-receiver --config <path>              Load a custom config TOML
//! kh-receiver --gen-config                 Write default config to stdout
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::Ordering;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kh_receiver::config::ReceiverConfig;
use kh_receiver::service::ReceiverApp;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "kh-receiver", about = "Depth + color stream receiver")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "kh-receiver.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Sender IP for the first session.
    #[arg(short, long)]
    address: Option<IpAddr>,

    /// Sender port for the first session.
    #[arg(short, long)]
    port: Option<u16>,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&ReceiverConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = ReceiverConfig::load(&cli.config);

    // CLI overrides.
    if let Some(address) = cli.address {
        config.network.address = address.to_string();
    }
    if let Some(port) = cli.port {
        config.network.port = port;
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("kh-receiver v{}", env!("CARGO_PKG_VERSION"));

    // Both given on the command line: skip the first prompt.
    let first = match (cli.address, cli.port) {
        (Some(address), Some(port)) => Some(SocketAddr::new(address, port)),
        _ => None,
    };

    let app = ReceiverApp::new(config);
    let stop = app.stop_handle();

    // Ctrl-C handler.
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.store(false, Ordering::SeqCst);
    });

    app.run(first).await?;

    Ok(())
}
