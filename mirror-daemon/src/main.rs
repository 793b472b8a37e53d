//! mirrord entry point.
//!
//! ```text
//! mirrord                   Run in the foreground
//! mirrord --config <path>   Load a custom config TOML
//! mirrord --gen-config      Write default config to stdout
//! mirrord --write-config    Write default config to the --config path
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mirror_daemon::config::DaemonConfig;
use mirror_daemon::console::ConsoleSurface;
use mirror_daemon::service::MirrorService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "mirrord", about = "Screen mirroring daemon")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "mirrord.toml")]
    config: PathBuf,

    /// Override the listen port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Write the default configuration to the --config path and exit.
    #[arg(long)]
    write_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&DaemonConfig::default())?;
        println!("{text}");
        return Ok(());
    }
    if cli.write_config {
        DaemonConfig::write_default(&cli.config)?;
        println!("Wrote {}", cli.config.display());
        return Ok(());
    }

    let mut config = DaemonConfig::load(&cli.config);
    if let Some(port) = cli.port {
        config.network.port = port;
    }

    init_tracing(&config)?;

    info!("mirrord v{}", env!("CARGO_PKG_VERSION"));
    info!("listen: {}:{}", config.network.bind_address, config.network.port);
    info!(
        "capture: {}x{} @ {} fps",
        config.capture.width, config.capture.height, config.capture.framerate
    );

    let service = MirrorService::new(config);
    let stop = service.stop_handle();
    let console = ConsoleSurface::new(service.session_handle()).spawn(stop.clone())?;

    let stop_on_signal = stop.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop_on_signal.cancel();
    });

    let result = service.run().await;
    stop.cancel();
    if console.join().is_err() {
        error!("console surface panicked");
    }
    result?;
    Ok(())
}

fn init_tracing(config: &DaemonConfig) -> std::io::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    if config.logging.file.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.logging.file)?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file))
            .init();
    }
    Ok(())
}
