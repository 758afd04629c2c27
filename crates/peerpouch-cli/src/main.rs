//! PeerPouch CLI: runs the in-process demo and shows configuration.

mod cli;
mod demo;
mod ui;

use crate::cli::*;
use clap::Parser;
use peerpouch_hub::config::load_config;
use peerpouch_types::config::PeerPouchConfig;

fn init_tracing_stderr(config: &PeerPouchConfig) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref());
    init_tracing_stderr(&config);

    match cli.command {
        Commands::Demo { docs } => cmd_demo(config, docs),
        Commands::Config => cmd_config(&config),
    }
}

fn cmd_demo(config: PeerPouchConfig, docs: usize) {
    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            ui::error(&format!("Failed to start async runtime: {e}"));
            std::process::exit(1);
        }
    };
    if let Err(e) = rt.block_on(demo::run(config, docs)) {
        ui::error(&format!("Demo failed: {e}"));
        std::process::exit(1);
    }
}

fn cmd_config(config: &PeerPouchConfig) {
    match toml::to_string_pretty(config) {
        Ok(text) => println!("{text}"),
        Err(e) => {
            ui::error(&format!("Failed to render config: {e}"));
            std::process::exit(1);
        }
    }
}
