//! kh-sender: entry point.
//!
//! ```text
//! kh-sender                    Prompt for a port and stream
//! kh-sender --port 7777        Start the first session on port 7777
//! kh-sender --config <path>    Load a custom config TOML
//! kh-sender --gen-config       Write default config to stdout
//! ```

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kh_sender::config::SenderConfig;
use kh_sender::service::SenderApp;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "kh-sender", about = "Depth + color streaming sender")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "kh-sender.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// UDP port for the first session (skips the prompt).
    #[arg(short, long)]
    port: Option<u16>,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&SenderConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    // Load config.
    let config = SenderConfig::load(&cli.config);

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("kh-sender v{}", env!("CARGO_PKG_VERSION"));
    let calibration = config.calibration();
    info!(
        "depth {}x{}, color {}x{}, {} fps nominal, fec group {}",
        calibration.depth_width,
        calibration.depth_height,
        calibration.color_width,
        calibration.color_height,
        config.stream.frame_rate,
        config.stream.fec_group_size,
    );

    let app = SenderApp::new(config);
    let stop = app.stop_handle();

    // Ctrl-C handler.
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.store(false, Ordering::SeqCst);
    });

    app.run(cli.port).await?;

    Ok(())
}
