//! Engine configuration
//!
//! A single serializable [`Config`] holds every tunable. Components never read
//! it through a global: they take an `Arc<ConfigSnapshot>` from the
//! [`ConfigHandle`] at the start of a processing cycle and use that snapshot
//! until the cycle ends. Reconfiguration swaps the whole snapshot.

use crate::location::LocationProviderKind;
use crate::store::backend::StorageBackend;
use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

const CONFIG_KEY: &[u8] = b"config_current";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Invalid(String),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Storage error: {0}")]
    StorageError(String),
}

/// Provider accuracy class requested from the fix source
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Accuracy {
    /// GPS grade
    High,
    /// ~100 m, wifi/cell assisted
    Medium,
    /// ~1 km, cell only
    Low,
    /// Region monitoring / significant changes
    Passive,
}

impl Accuracy {
    /// Map a desired accuracy in meters onto an accuracy class
    pub fn from_meters(meters: u32) -> Self {
        match meters {
            0..=99 => Accuracy::High,
            100..=999 => Accuracy::Medium,
            1000..=9999 => Accuracy::Low,
            _ => Accuracy::Passive,
        }
    }

    /// One class coarser (saturates at Passive)
    pub fn coarser(self) -> Self {
        match self {
            Accuracy::High => Accuracy::Medium,
            Accuracy::Medium => Accuracy::Low,
            Accuracy::Low | Accuracy::Passive => Accuracy::Passive,
        }
    }

    pub fn meters(self) -> u32 {
        match self {
            Accuracy::High => 0,
            Accuracy::Medium => 100,
            Accuracy::Low => 1000,
            Accuracy::Passive => 10000,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Provider kind stamped on samples
    pub location_provider: LocationProviderKind,
    /// Desired accuracy in meters (0, 100, 1000, 10000)
    pub desired_accuracy: u32,
    /// Stationary radius in meters
    pub stationary_radius: f64,
    /// Minimum horizontal distance between accepted samples, in meters
    pub distance_filter: f64,
    /// Sampling interval in background / stationary operation
    pub interval_ms: u64,
    /// Sampling interval in foreground operation
    pub fastest_interval_ms: u64,
    /// Activity recognition cadence
    pub activities_interval_ms: u64,
    /// Quiescence window after which a moving device is considered stationary
    pub stationary_timeout_ms: u64,
    /// Minimum STILL confidence (percent) confirming a stationary device
    pub still_confidence: u8,
    pub stop_on_still_activity: bool,
    pub stop_on_terminate: bool,
    pub start_on_boot: bool,
    /// Start in FOREGROUND mode
    pub start_foreground: bool,
    /// Request passive accuracy while in background
    pub save_battery_on_background: bool,
    /// Stop provider updates entirely while in background
    pub pause_location_updates: bool,
    pub debug: bool,
    /// Collector endpoint
    pub url: Option<String>,
    /// Endpoint receiving previously failed deliveries
    pub sync_url: Option<String>,
    /// Number of pending samples that triggers a sync, also the batch size
    #[serde(deserialize_with = "count_from_number_or_string")]
    pub sync_threshold: u32,
    pub sync_interval_ms: u64,
    pub http_headers: BTreeMap<String, String>,
    /// Retention cap of the location store
    pub max_locations: u32,
    /// Body template for one location, "@field" strings are substituted
    pub post_template: Option<serde_json::Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            location_provider: LocationProviderKind::DistanceFilter,
            desired_accuracy: 100,
            stationary_radius: 50.0,
            distance_filter: 500.0,
            interval_ms: 600_000,
            fastest_interval_ms: 120_000,
            activities_interval_ms: 10_000,
            stationary_timeout_ms: 300_000,
            still_confidence: 75,
            stop_on_still_activity: true,
            stop_on_terminate: true,
            start_on_boot: false,
            start_foreground: false,
            save_battery_on_background: false,
            pause_location_updates: false,
            debug: false,
            url: None,
            sync_url: None,
            sync_threshold: 100,
            sync_interval_ms: 60_000,
            http_headers: BTreeMap::new(),
            max_locations: 10_000,
            post_template: None,
        }
    }
}

// The host binding documents syncThreshold as a number but declares it as a
// string, so both encodings are accepted. It is always a count of samples.
fn count_from_number_or_string<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Count {
        Number(u32),
        Text(String),
    }

    match Count::deserialize(deserializer)? {
        Count::Number(n) => Ok(n),
        Count::Text(s) => s
            .trim()
            .parse::<u32>()
            .map_err(|_| serde::de::Error::custom(format!("invalid sync_threshold: {:?}", s))),
    }
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.stationary_radius >= 0.0) {
            return Err(ConfigError::Invalid(
                "stationary_radius must be >= 0".to_string(),
            ));
        }
        if !(self.distance_filter >= 0.0) {
            return Err(ConfigError::Invalid("distance_filter must be >= 0".to_string()));
        }
        if self.max_locations == 0 {
            return Err(ConfigError::Invalid("max_locations must be >= 1".to_string()));
        }
        if self.fastest_interval_ms > self.interval_ms {
            return Err(ConfigError::Invalid(
                "fastest_interval_ms cannot exceed interval_ms".to_string(),
            ));
        }
        if self.still_confidence > 100 {
            return Err(ConfigError::Invalid(
                "still_confidence is a percentage (0-100)".to_string(),
            ));
        }
        for (name, url) in [("url", &self.url), ("sync_url", &self.sync_url)] {
            if let Some(url) = url {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(ConfigError::Invalid(format!(
                        "{} must be an http(s) url, got {}",
                        name, url
                    )));
                }
            }
        }
        Ok(())
    }

    /// Merge a partial JSON object over this configuration
    pub fn merged(&self, patch: &serde_json::Value) -> Result<Config, ConfigError> {
        let patch = patch
            .as_object()
            .ok_or_else(|| ConfigError::Invalid("options must be a JSON object".to_string()))?;

        let mut current = serde_json::to_value(self)?;
        if let Some(fields) = current.as_object_mut() {
            for (key, value) in patch {
                if !fields.contains_key(key) {
                    return Err(ConfigError::Invalid(format!("unknown option: {}", key)));
                }
                fields.insert(key.clone(), value.clone());
            }
        }

        let merged: Config = serde_json::from_value(current)?;
        merged.validate()?;
        Ok(merged)
    }

    /// Desired accuracy as a provider accuracy class
    pub fn accuracy(&self) -> Accuracy {
        Accuracy::from_meters(self.desired_accuracy)
    }
}

/// Immutable, versioned configuration snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub config: Config,
}

/// Owner of the current configuration snapshot
pub struct ConfigHandle {
    current: RwLock<Arc<ConfigSnapshot>>,
    backend: Option<Arc<dyn StorageBackend>>,
}

impl ConfigHandle {
    /// In-memory handle starting from `config`
    pub fn new(config: Config) -> Self {
        Self {
            current: RwLock::new(Arc::new(ConfigSnapshot { version: 1, config })),
            backend: None,
        }
    }

    /// Handle persisted in `backend`, loading the last stored configuration
    pub fn persistent(backend: Arc<dyn StorageBackend>) -> Result<Self, ConfigError> {
        let stored = backend
            .get(CONFIG_KEY)
            .map_err(ConfigError::StorageError)?;

        let config = match stored {
            Some(bytes) => serde_json::from_slice::<Config>(&bytes)?,
            None => Config::default(),
        };

        Ok(Self {
            current: RwLock::new(Arc::new(ConfigSnapshot { version: 1, config })),
            backend: Some(backend),
        })
    }

    /// Consistent snapshot for one processing cycle
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.current.read().clone()
    }

    /// Validate, persist and atomically install a new configuration
    pub fn replace(&self, config: Config) -> Result<Arc<ConfigSnapshot>, ConfigError> {
        config.validate()?;

        if let Some(backend) = &self.backend {
            let bytes = serde_json::to_vec(&config)?;
            backend
                .put(CONFIG_KEY, &bytes)
                .map_err(ConfigError::StorageError)?;
            backend.flush().map_err(ConfigError::StorageError)?;
        }

        let mut current = self.current.write();
        let next = Arc::new(ConfigSnapshot {
            version: current.version + 1,
            config,
        });
        *current = next.clone();
        Ok(next)
    }

    /// Merge a partial JSON object over the current configuration
    pub fn apply_patch(&self, patch: &serde_json::Value) -> Result<Arc<ConfigSnapshot>, ConfigError> {
        let merged = self.snapshot().config.merged(patch)?;
        self.replace(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::backend::MemoryStorage;
    use serde_json::json;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sync_threshold, 100);
        assert_eq!(config.max_locations, 10_000);
        assert_eq!(config.accuracy(), Accuracy::Medium);
    }

    #[test]
    fn test_sync_threshold_accepts_string_and_number() {
        let config: Config = serde_json::from_value(json!({ "sync_threshold": "25" })).unwrap();
        assert_eq!(config.sync_threshold, 25);

        let config: Config = serde_json::from_value(json!({ "sync_threshold": 7 })).unwrap();
        assert_eq!(config.sync_threshold, 7);

        assert!(serde_json::from_value::<Config>(json!({ "sync_threshold": "many" })).is_err());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.max_locations = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.fastest_interval_ms = config.interval_ms + 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.url = Some("ftp://collector".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_merge_partial_options() {
        let config = Config::default();
        let merged = config
            .merged(&json!({ "distance_filter": 10.0, "url": "https://example.test/loc" }))
            .unwrap();
        assert_eq!(merged.distance_filter, 10.0);
        assert_eq!(merged.url.as_deref(), Some("https://example.test/loc"));
        assert_eq!(merged.stationary_radius, config.stationary_radius);

        assert!(config.merged(&json!({ "no_such_option": 1 })).is_err());
        assert!(config.merged(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_replace_bumps_version() {
        let handle = ConfigHandle::new(Config::default());
        let before = handle.snapshot();
        let after = handle.apply_patch(&json!({ "max_locations": 3 })).unwrap();

        assert_eq!(after.version, before.version + 1);
        assert_eq!(handle.snapshot().config.max_locations, 3);
        // The old snapshot stays untouched for whoever still holds it
        assert_eq!(before.config.max_locations, 10_000);
    }

    #[test]
    fn test_invalid_patch_keeps_current() {
        let handle = ConfigHandle::new(Config::default());
        assert!(handle.apply_patch(&json!({ "max_locations": 0 })).is_err());
        assert_eq!(handle.snapshot().version, 1);
    }

    #[test]
    fn test_persistent_handle_reloads() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::new());
        {
            let handle = ConfigHandle::persistent(backend.clone()).unwrap();
            handle.apply_patch(&json!({ "sync_threshold": "5" })).unwrap();
        }
        let handle = ConfigHandle::persistent(backend).unwrap();
        assert_eq!(handle.snapshot().config.sync_threshold, 5);
    }
}
