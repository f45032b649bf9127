//! Celestial TTS - Entry Point
//!
//! Loads the configuration, starts the model service and serves until Ctrl-C.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, warn};

use celestial_core::{app, config::Config, logging};
use celestial_models::MockLoader;

/// Celestial TTS model runtime
#[derive(Parser, Debug)]
#[command(name = "celestial-tts", author, version)]
struct Args {
    /// Config file (defaults to ./config.toml, then ~/.config/celestial-tts/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Model id to load at startup; may be repeated
    #[arg(long = "preload", value_name = "MODEL")]
    preload: Vec<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    logging::init(args.log_json);

    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    warn!("No neural backend is linked into this build, serving mock voices");
    let signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
    };

    if let Err(e) = app::run(&config, Arc::new(MockLoader::new()), &args.preload, signal).await {
        error!(error = %e, "Celestial TTS failed");
        std::process::exit(1);
    }
}
