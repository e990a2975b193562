//! User defaults from `~/.claude-squad/config.toml`.
//!
//! Per-repo state never lives here, only the knobs a user sets once for
//! every repo: which assistant to launch, how branches are named, and how
//! fast the auto-confirm daemon polls.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Command line run inside new sessions. Default: "claude"
    #[serde(default = "default_program")]
    pub default_program: String,

    /// Prefix for instance branches, e.g. `claudesquad/mytask`.
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,

    /// Poll interval of the auto-confirm daemon, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub daemon_poll_interval_ms: u64,

    /// Launch the auto-confirm daemon on controller exit without `-y`.
    #[serde(default)]
    pub auto_yes: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            default_program: default_program(),
            branch_prefix: default_branch_prefix(),
            daemon_poll_interval_ms: default_poll_interval_ms(),
            auto_yes: false,
        }
    }
}

impl Config {
    pub fn daemon_poll_interval(&self) -> Duration {
        Duration::from_millis(self.daemon_poll_interval_ms)
    }
}

fn default_program() -> String {
    "claude".to_string()
}

fn default_branch_prefix() -> String {
    "claudesquad/".to_string()
}

fn default_poll_interval_ms() -> u64 {
    250
}

/// Path of the global config file: `~/.claude-squad/config.toml`.
pub fn config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("could not determine home directory")?;
    Ok(home.join(".claude-squad").join("config.toml"))
}

/// Load the config, or defaults if the file doesn't exist.
pub fn load() -> Result<Config> {
    let path = config_path()?;
    if path.exists() {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    } else {
        Ok(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = Config::default();
        assert_eq!(config.default_program, "claude");
        assert_eq!(config.branch_prefix, "claudesquad/");
        assert_eq!(config.daemon_poll_interval_ms, 250);
        assert!(!config.auto_yes);
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
default_program = "aider --model sonnet"
branch_prefix = "squad/"
daemon_poll_interval_ms = 500
auto_yes = true
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.default_program, "aider --model sonnet");
        assert_eq!(config.branch_prefix, "squad/");
        assert_eq!(config.daemon_poll_interval(), Duration::from_millis(500));
        assert!(config.auto_yes);
    }

    #[test]
    fn parse_partial_config_fills_defaults() {
        let config: Config = toml::from_str("branch_prefix = \"wip/\"").unwrap();
        assert_eq!(config.branch_prefix, "wip/");
        assert_eq!(config.default_program, "claude");
        assert_eq!(config.daemon_poll_interval_ms, 250);
    }

    #[test]
    fn config_path_is_under_home() {
        let path = config_path().unwrap();
        assert!(path.ends_with(".claude-squad/config.toml"));
    }
}
