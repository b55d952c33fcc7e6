//! Command-line interface and config loading.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use vx_domain::config::Config;

const DEFAULT_CONFIG_PATH: &str = "voxgate.toml";

#[derive(Parser)]
#[command(name = "voxgate", about = "Real-time voice assistant gateway")]
pub struct Cli {
    /// Path to the TOML config file.
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the gateway (default).
    Serve,
    /// Config inspection helpers.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version.
    Version,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Check the config for problems and exit non-zero on errors.
    Validate,
    /// Print the effective config as TOML.
    Show,
}

/// Load the config file, falling back to built-in defaults when it
/// does not exist.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<(Config, PathBuf)> {
    let path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    if !path.exists() {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        return Ok((Config::default(), path));
    }

    let raw = std::fs::read_to_string(&path)?;
    let config: Config = toml::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", path.display()))?;
    Ok((config, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let (config, _) = load_config(Some(Path::new("/nonexistent/voxgate.toml"))).unwrap();
        assert_eq!(config.server.port, 8990);
    }

    #[test]
    fn parse_error_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "not [valid toml").unwrap();
        assert!(load_config(Some(&path)).is_err());
    }

    #[test]
    fn valid_file_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ok.toml");
        std::fs::write(&path, "[server]\nport = 9000\n").unwrap();
        let (config, _) = load_config(Some(&path)).unwrap();
        assert_eq!(config.server.port, 9000);
    }
}
