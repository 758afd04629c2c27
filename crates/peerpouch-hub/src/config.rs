//! Configuration loading from `~/.peerpouch/config.toml` with defaults.

use peerpouch_types::config::PeerPouchConfig;
use std::path::{Path, PathBuf};
use tracing::info;

/// Load configuration from a TOML file, with defaults.
///
/// A missing, unreadable or malformed file is not an error: the defaults are
/// used and a warning is logged.
pub fn load_config(path: Option<&Path>) -> PeerPouchConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return PeerPouchConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<PeerPouchConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                PeerPouchConfig::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            PeerPouchConfig::default()
        }
    }
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    peerpouch_home().join("config.toml")
}

/// Get the default PeerPouch home directory.
pub fn peerpouch_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".peerpouch")
}
