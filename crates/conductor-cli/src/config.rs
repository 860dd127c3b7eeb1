//! Configuration file management for conductor.
//!
//! Provides a TOML-based config file at `~/.config/conductor/config.toml`
//! and a resolution chain: CLI flag > env var > config file > default.
//! Orchestration tunables (lock TTL, queue timeout, ...) come from the
//! environment via `conductor_core::orchestrator::Settings::from_env`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use conductor_core::orchestrator::Settings;
use conductor_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    #[serde(default)]
    pub broker: BrokerSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BrokerSection {
    /// Broker URL; empty means the in-process local broker.
    #[serde(default)]
    pub url: String,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the conductor config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/conductor` or
/// `~/.config/conductor`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("conductor");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("conductor")
}

/// Return the path to the conductor config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct ConductorConfig {
    pub db_config: DbConfig,
    pub broker_url: Option<String>,
    pub settings: Settings,
}

impl ConductorConfig {
    /// Resolve configuration using the chain:
    /// CLI flag > env var > config file > default.
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("CONDUCTOR_DATABASE_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };

        let broker_url = std::env::var("CONDUCTOR_BROKER_URL").ok().or_else(|| {
            file_config
                .as_ref()
                .map(|cfg| cfg.broker.url.clone())
                .filter(|url| !url.is_empty())
        });

        Ok(Self {
            db_config: DbConfig::new(db_url),
            broker_url,
            settings: Settings::from_env(),
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("conductor/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }

    #[test]
    fn config_file_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");

        let original = ConfigFile {
            database: DatabaseSection {
                url: "postgresql://testhost:5432/testdb".to_string(),
            },
            broker: BrokerSection {
                url: "amqp://broker:5672".to_string(),
            },
        };

        let contents = toml::to_string_pretty(&original).unwrap();
        std::fs::write(&path, &contents).unwrap();

        let loaded: ConfigFile =
            toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.database.url, original.database.url);
        assert_eq!(loaded.broker.url, original.broker.url);
    }

    #[test]
    fn broker_section_defaults_to_empty() {
        let parsed: ConfigFile =
            toml::from_str("[database]\nurl = \"postgresql://localhost:5432/c\"\n").unwrap();
        assert!(parsed.broker.url.is_empty());
    }
}
