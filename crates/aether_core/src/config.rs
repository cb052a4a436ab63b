//! Configuration system for Aether
//!
//! Every section has serde defaults, so a config file only needs the values
//! it wants to change.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::error::{ConfigError, CoreError};
use crate::id::RoomId;

/// Whether this participant is a dedicated tracking device or a browser user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantMode {
    #[default]
    Web,
    Agent,
}

/// Identity this participant presents to the room
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParticipantConfig {
    /// Name shown to other members. Derived from `mode` when unset.
    pub display_name: Option<String>,
    pub mode: ParticipantMode,
    /// Room to join. When unset a new room named after the connection is created.
    pub room: Option<RoomId>,
    /// Base URL used to build share links.
    pub share_base_url: String,
}

impl ParticipantConfig {
    pub fn display_name(&self) -> &str {
        match (&self.display_name, self.mode) {
            (Some(name), _) => name,
            (None, ParticipantMode::Agent) => "Mobile Agent",
            (None, ParticipantMode::Web) => "Web User",
        }
    }
}

impl Default for ParticipantConfig {
    fn default() -> Self {
        Self {
            display_name: None,
            mode: ParticipantMode::Web,
            room: None,
            share_base_url: "http://localhost:5173".to_string(),
        }
    }
}

/// Transmission buffer storage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Maximum number of pending samples; the oldest is evicted beyond this.
    pub capacity: usize,
    /// Directory of the sled database holding the queue.
    pub path: PathBuf,
    /// Fixed key the queue is stored under.
    pub key: String,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 500,
            path: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("aether")
                .join("buffer"),
            key: "aether_offline_buffer".to_string(),
        }
    }
}

/// Alert rule thresholds. Speeds share the unit of the incoming samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Below this speed a sample counts as stopped.
    pub stop_speed: f64,
    /// Continuous stop time before `stop_detected` fires.
    pub stop_minutes: f64,
    /// Distance to the destination that counts as arrived.
    pub arrival_radius_km: f64,
    /// Above this speed `high_speed` fires.
    pub high_speed: f64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            stop_speed: 1.0,
            stop_minutes: 5.0,
            arrival_radius_km: 0.05,
            high_speed: 80.0,
        }
    }
}

/// Session loop and sample classification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub poll_interval_secs: u64,
    pub accuracy_high_m: f64,
    pub accuracy_medium_m: f64,
    /// Minimum speed change between samples that counts as a trend.
    pub trend_delta: f64,
}

impl SessionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 2,
            accuracy_high_m: 20.0,
            accuracy_medium_m: 50.0,
            trend_delta: 0.5,
        }
    }
}

/// External geocoding / routing services
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub geocoder_url: String,
    pub router_url: String,
    pub timeout_secs: u64,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            geocoder_url: "https://nominatim.openstreetmap.org/search".to_string(),
            router_url: "https://router.project-osrm.org/route/v1".to_string(),
            timeout_secs: 10,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub participant: ParticipantConfig,
    pub buffer: BufferConfig,
    pub alerts: AlertConfig,
    pub session: SessionConfig,
    pub services: ServicesConfig,
}

impl TrackerConfig {
    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.buffer.capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "buffer.capacity".into(),
                reason: "must be greater than zero".into(),
            });
        }
        if self.buffer.key.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "buffer.key".into(),
                reason: "must not be empty".into(),
            });
        }
        if self.session.accuracy_high_m > self.session.accuracy_medium_m {
            return Err(ConfigError::InvalidValue {
                field: "session.accuracy_high_m".into(),
                reason: "must not exceed session.accuracy_medium_m".into(),
            });
        }
        Ok(())
    }

    /// Load configuration from standard locations
    pub async fn load() -> Result<Self> {
        load_config_from_standard_locations().await
    }

    /// Load configuration from a specific file
    pub async fn load_from(path: &Path) -> Result<Self> {
        load_config(path).await
    }

    /// Save configuration to a specific file
    pub async fn save_to(&self, path: &Path) -> Result<()> {
        save_config(self, path).await
    }
}

/// Load configuration from a TOML file
pub async fn load_config(path: &Path) -> Result<TrackerConfig> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        CoreError::config(
            path.display().to_string(),
            "file",
            "readable TOML file",
            ConfigError::Io(e.to_string()),
        )
    })?;

    let config: TrackerConfig = toml::from_str(&content).map_err(|e| {
        CoreError::config(
            path.display().to_string(),
            "content",
            "valid TOML configuration",
            ConfigError::TomlParse(e.to_string()),
        )
    })?;

    config.validate().map_err(|cause| {
        let field = match &cause {
            ConfigError::InvalidValue { field, .. } => field.clone(),
            _ => "content".to_string(),
        };
        CoreError::config(path.display().to_string(), field, "a usable value", cause)
    })?;

    Ok(config)
}

/// Save configuration to a TOML file
pub async fn save_config(config: &TrackerConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            CoreError::config(
                parent.display().to_string(),
                "directory",
                "writable directory",
                ConfigError::Io(e.to_string()),
            )
        })?;
    }

    let content = toml::to_string_pretty(config).map_err(|e| {
        CoreError::config(
            path.display().to_string(),
            "serialization",
            "serializable config structure",
            ConfigError::TomlSerialize(e.to_string()),
        )
    })?;

    tokio::fs::write(path, content).await.map_err(|e| {
        CoreError::config(
            path.display().to_string(),
            "file",
            "writable file location",
            ConfigError::Io(e.to_string()),
        )
    })?;

    Ok(())
}

/// Standard config file locations
pub fn config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // Project-specific config
    paths.push(PathBuf::from("aether.toml"));

    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("aether").join("config.toml"));
    }

    if let Some(home_dir) = dirs::home_dir() {
        paths.push(home_dir.join(".aether").join("config.toml"));
    }

    paths
}

/// Load configuration from standard locations
pub async fn load_config_from_standard_locations() -> Result<TrackerConfig> {
    for path in config_paths() {
        if path.exists() {
            tracing::debug!(path = %path.display(), "loading config");
            return load_config(&path).await;
        }
    }

    // No config found, return default
    Ok(TrackerConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = TrackerConfig::default();
        assert_eq!(config.buffer.capacity, 500);
        assert_eq!(config.buffer.key, "aether_offline_buffer");
        assert_eq!(config.alerts.stop_minutes, 5.0);
        assert_eq!(config.alerts.arrival_radius_km, 0.05);
        assert_eq!(config.alerts.high_speed, 80.0);
        assert_eq!(config.session.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.participant.display_name(), "Web User");
    }

    #[test]
    fn test_config_serialization() {
        let config = TrackerConfig::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("[buffer]"));
        assert!(toml.contains("[alerts]"));
        assert!(toml.contains("[services]"));
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: TrackerConfig = toml::from_str(
            r#"
            [participant]
            mode = "agent"
            room = "convoy-7"

            [alerts]
            high_speed = 120.0
            "#,
        )
        .unwrap();
        assert_eq!(config.participant.display_name(), "Mobile Agent");
        assert_eq!(config.participant.room, Some(RoomId::new("convoy-7")));
        assert_eq!(config.alerts.high_speed, 120.0);
        assert_eq!(config.alerts.stop_speed, 1.0);
        assert_eq!(config.buffer.capacity, 500);
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = TrackerConfig::default();
        config.buffer.capacity = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "buffer.capacity"
        ));
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("aether.toml");

        let mut config = TrackerConfig::default();
        config.participant.display_name = Some("Scout".into());
        config.buffer.capacity = 42;
        config.save_to(&path).await.unwrap();

        let loaded = TrackerConfig::load_from(&path).await.unwrap();
        assert_eq!(loaded.participant.display_name(), "Scout");
        assert_eq!(loaded.buffer.capacity, 42);
    }

    #[tokio::test]
    async fn test_load_invalid_file_reports_field() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("aether.toml");
        tokio::fs::write(&path, "[buffer]\ncapacity = 0\n").await.unwrap();

        let err = load_config(&path).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::ConfigurationError { ref field, .. } if field == "buffer.capacity"
        ));
    }
}
