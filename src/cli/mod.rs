//! CLI command implementations
//!
//! Each sub-module owns one group of commands; `main.rs` only parses
//! arguments, sets up logging and dispatches here.

pub mod config;
pub mod data;
pub mod deploy;
pub mod train;

use labflow::config::{LabConfig, CONFIG_FILENAME};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Config path from `--config`, falling back to `labflow.toml`
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILENAME))
}

/// Load the config file (if any) and apply environment overrides
pub fn load_config(explicit: Option<&Path>) -> anyhow::Result<LabConfig> {
    let path = config_path(explicit);
    let mut config = match explicit {
        Some(_) => LabConfig::load(&path)?,
        None => LabConfig::load_or_default(&path)?,
    };
    config.apply_env();
    debug!("Configuration loaded from {}", path.display());
    Ok(config)
}

/// Multi-threaded runtime for the async commands
pub fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_path_default() {
        assert_eq!(config_path(None), PathBuf::from("labflow.toml"));
        assert_eq!(
            config_path(Some(Path::new("/etc/lab.toml"))),
            PathBuf::from("/etc/lab.toml")
        );
    }

    #[test]
    fn test_explicit_missing_config_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(load_config(Some(&dir.path().join("absent.toml"))).is_err());
    }
}
