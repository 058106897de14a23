// Host settings for the geotrack CLI
//
// Engine configuration lives in the engine's own store. This file only
// holds what the host process needs before the engine exists:
// - macOS: ~/Library/Application Support/geotrack/cli.json
// - Linux: ~/.config/geotrack/cli.json
// - Windows: %APPDATA%\geotrack\cli.json

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Engine database directory, defaults to the platform data dir
    pub storage_path: Option<String>,

    /// Write a daily rolling log file next to the database
    pub file_logging: bool,

    /// Pause between replayed script lines in milliseconds
    pub replay_delay_ms: u64,

    /// HTTP timeout for collector uploads in seconds
    pub http_timeout_secs: u64,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            storage_path: None,
            file_logging: true,
            replay_delay_ms: 0,
            http_timeout_secs: 30,
        }
    }
}

/// Keys handled here rather than by the engine
pub const KEYS: [&str; 4] = [
    "storage_path",
    "file_logging",
    "replay_delay_ms",
    "http_timeout_secs",
];

impl CliConfig {
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("geotrack");
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        Ok(config_dir)
    }

    pub fn default_data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("geotrack");
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;
        Ok(data_dir)
    }

    /// Directory holding the engine database
    pub fn storage_dir(&self) -> Result<PathBuf> {
        match &self.storage_path {
            Some(path) => {
                let path = PathBuf::from(path);
                std::fs::create_dir_all(&path).context("Failed to create storage directory")?;
                Ok(path)
            }
            None => Ok(Self::default_data_dir()?.join("storage")),
        }
    }

    /// Load from the default location, creating it on first use
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_dir()?.join("cli.json"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read CLI config")?;
            serde_json::from_str(&contents).context("Failed to parse CLI config")
        } else {
            let config = Self::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_dir()?.join("cli.json"))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize CLI config")?;
        std::fs::write(path, contents).context("Failed to write CLI config")?;
        Ok(())
    }

    /// Update one key in memory. Callers persist with `save`.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "storage_path" => {
                self.storage_path = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "file_logging" => {
                self.file_logging = value.parse().context("Invalid boolean value")?;
            }
            "replay_delay_ms" => {
                self.replay_delay_ms = value.parse().context("Invalid number")?;
            }
            "http_timeout_secs" => {
                let secs: u64 = value.parse().context("Invalid number")?;
                anyhow::ensure!(secs > 0, "http_timeout_secs must be positive");
                self.http_timeout_secs = secs;
            }
            _ => anyhow::bail!("Unknown CLI key: {}", key),
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "storage_path" => Some(
                self.storage_path
                    .clone()
                    .unwrap_or_else(|| "(auto)".to_string()),
            ),
            "file_logging" => Some(self.file_logging.to_string()),
            "replay_delay_ms" => Some(self.replay_delay_ms.to_string()),
            "http_timeout_secs" => Some(self.http_timeout_secs.to_string()),
            _ => None,
        }
    }

    pub fn list(&self) -> Vec<(String, String)> {
        KEYS.iter()
            .filter_map(|key| self.get(key).map(|value| (key.to_string(), value)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_creates_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cli.json");

        let config = CliConfig::load_from(&path).unwrap();
        assert_eq!(config, CliConfig::default());
        assert!(path.exists());
    }

    #[test]
    fn test_set_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cli.json");

        let mut config = CliConfig::load_from(&path).unwrap();
        config.set("replay_delay_ms", "250").unwrap();
        config.set("storage_path", "/tmp/geotrack-db").unwrap();
        config.save_to(&path).unwrap();

        let reloaded = CliConfig::load_from(&path).unwrap();
        assert_eq!(reloaded.replay_delay_ms, 250);
        assert_eq!(reloaded.get("storage_path").as_deref(), Some("/tmp/geotrack-db"));

        config.set("storage_path", "").unwrap();
        assert_eq!(config.get("storage_path").as_deref(), Some("(auto)"));
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = CliConfig::default();
        assert!(config.set("file_logging", "maybe").is_err());
        assert!(config.set("http_timeout_secs", "0").is_err());
        assert!(config.set("listen_port", "80").is_err());
        assert_eq!(config.list().len(), KEYS.len());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cli.json");
        std::fs::write(&path, r#"{ "replay_delay_ms": 5 }"#).unwrap();

        let config = CliConfig::load_from(&path).unwrap();
        assert_eq!(config.replay_delay_ms, 5);
        assert!(config.file_logging);
    }
}
