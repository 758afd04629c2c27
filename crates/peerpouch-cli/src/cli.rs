//! Clap CLI definitions for PeerPouch.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  peerpouch demo                Share a database and use it from a second endpoint
  peerpouch demo --docs 10      Same, with ten seeded documents
  peerpouch config              Print the effective configuration";

/// PeerPouch: databases shared peer to peer, negotiated through a hub.
#[derive(Parser)]
#[command(name = "peerpouch", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run an in-process share/connect round trip over the in-memory hub.
    Demo {
        /// Documents to seed the shared database with.
        #[arg(long, default_value_t = 3)]
        docs: usize,
    },
    /// Print the effective configuration as TOML.
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_demo() {
        let cli = Cli::parse_from(["peerpouch", "demo", "--docs", "5"]);
        assert!(matches!(cli.command, Commands::Demo { docs: 5 }));
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_parse_global_config() {
        let cli = Cli::parse_from(["peerpouch", "config", "--config", "/tmp/pp.toml"]);
        assert!(matches!(cli.command, Commands::Config));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/pp.toml")));
    }
}
