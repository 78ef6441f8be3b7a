// src/main.rs

//! The main entry point for the steward monitor process.

use anyhow::Result;
use std::env;
use steward::config::Config;
use steward::monitor;
use tracing::{error, info};
use tracing_subscriber::filter::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("steward version {VERSION}");
        return Ok(());
    }

    // Determine the configuration path. It can be provided via a --config
    // flag; otherwise it defaults to "steward.toml". A missing default file
    // simply means running with the built-in defaults.
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config = match config_path {
        Some(path) => match Config::from_file(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Failed to load configuration from \"{path}\": {e}");
                std::process::exit(1);
            }
        },
        None => Config::from_file("steward.toml").unwrap_or_default(),
    };

    // Initialize logging. The RUST_LOG environment variable overrides the
    // configured default level.
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .compact()
        .with_ansi(true)
        .init();

    info!("Starting steward monitor...");

    if let Err(e) = monitor::run(config).await {
        error!("Monitor runtime error: {}", e);
        return Err(e);
    }

    Ok(())
}
