//! YAML settings (schema v1)
//!
//! ```yaml
//! version: 1
//! preset: conservative
//! overrides:
//!   max_fanout: 2000
//! outbox:
//!   batch_size: 50
//! window:
//!   window_ms: 250
//! ```
//!
//! The fanout section starts from a named preset and applies `overrides`
//! field by field. `outbox` and `window` are plain config structs; absent
//! fields keep their defaults.

use crate::error::OrchestratorError;
use crate::fanout::{FanoutConfig, FanoutOverrides, FanoutPreset, WindowConfig};
use crate::outbox::OutboxWorkerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

pub const SUPPORTED_VERSIONS: [u32; 1] = [1];

/// Configuration error type
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Range validation error
    #[error("Invalid range for field '{field}': {value} not in {min}..={max}. {hint}")]
    Range {
        field: String,
        value: String,
        min: String,
        max: String,
        hint: String,
    },

    #[error("Missing 'version' field in settings file. Add 'version: 1' to the top of your YAML file.")]
    MissingVersion,

    #[error("Unsupported settings version {found}. Supported versions: {}", supported.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", "))]
    UnsupportedVersion { found: u32, supported: Vec<u32> },

    #[error("Unknown preset '{0}'. Valid presets: default, high_throughput, conservative, disabled")]
    UnknownPreset(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl From<ConfigError> for OrchestratorError {
    fn from(err: ConfigError) -> Self {
        OrchestratorError::config(err)
    }
}

/// On-disk schema v1
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsFileV1 {
    /// Optional only so a missing field yields `MissingVersion`
    pub version: Option<u32>,

    #[serde(default = "default_preset_name")]
    pub preset: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides: Option<FanoutOverrides>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbox: Option<OutboxWorkerConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<WindowConfig>,
}

fn default_preset_name() -> String {
    FanoutPreset::Default.as_str().to_string()
}

/// Resolved settings
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub preset: FanoutPreset,
    pub overrides: FanoutOverrides,
    /// Preset with overrides applied
    pub fanout: FanoutConfig,
    pub outbox: OutboxWorkerConfig,
    pub window: WindowConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self::preset(FanoutPreset::Default)
    }
}

impl Settings {
    pub fn preset(preset: FanoutPreset) -> Self {
        Self {
            preset,
            overrides: FanoutOverrides::default(),
            fanout: FanoutConfig::preset(preset),
            outbox: OutboxWorkerConfig::default(),
            window: WindowConfig::default(),
        }
    }

    /// Parse and validate a v1 document
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let file: SettingsFileV1 = serde_yaml::from_str(content)?;

        let version = file.version.ok_or(ConfigError::MissingVersion)?;
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(ConfigError::UnsupportedVersion {
                found: version,
                supported: SUPPORTED_VERSIONS.to_vec(),
            });
        }

        let preset = FanoutPreset::from_str(&file.preset)
            .map_err(|_| ConfigError::UnknownPreset(file.preset.clone()))?;

        let overrides = file.overrides.unwrap_or_default();
        let mut fanout = FanoutConfig::preset(preset);
        overrides.apply(&mut fanout);

        let settings = Self {
            preset,
            overrides,
            fanout,
            outbox: file.outbox.unwrap_or_default(),
            window: file.window.unwrap_or_default(),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        let file = SettingsFileV1 {
            version: Some(1),
            preset: self.preset.to_string(),
            overrides: (self.overrides != FanoutOverrides::default()).then(|| self.overrides.clone()),
            outbox: Some(self.outbox.clone()),
            window: Some(self.window.clone()),
        };
        Ok(serde_yaml::to_string(&file)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.fanout.validate()?;
        self.outbox.validate()?;
        if self.window.max_batch_size == 0 {
            return Err(ConfigError::Range {
                field: "window.max_batch_size".to_string(),
                value: "0".to_string(),
                min: "1".to_string(),
                max: usize::MAX.to_string(),
                hint: "A window must hold at least one request".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::CircuitBreakerAction;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_preset_with_overrides() {
        let yaml = r#"
version: 1
preset: conservative
overrides:
  max_fanout: 2000
outbox:
  batch_size: 50
  worker_id: worker-a
"#;
        let settings = Settings::from_yaml_str(yaml).unwrap();
        assert_eq!(settings.preset, FanoutPreset::Conservative);
        assert_eq!(settings.fanout.max_fanout, 2000);
        // Untouched preset fields survive
        assert_eq!(settings.fanout.batch_size, 20);
        assert_eq!(settings.fanout.circuit_breaker_action, CircuitBreakerAction::Error);
        assert_eq!(settings.outbox.batch_size, 50);
        assert_eq!(settings.outbox.worker_id, "worker-a");
        assert_eq!(settings.window, WindowConfig::default());
    }

    #[test]
    fn test_missing_version() {
        let err = Settings::from_yaml_str("preset: default\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingVersion));
    }

    #[test]
    fn test_unsupported_version() {
        let err = Settings::from_yaml_str("version: 2\npreset: default\n").unwrap_err();
        match err {
            ConfigError::UnsupportedVersion { found, supported } => {
                assert_eq!(found, 2);
                assert_eq!(supported, vec![1]);
            }
            other => panic!("Expected UnsupportedVersion, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_preset_and_fields() {
        let err = Settings::from_yaml_str("version: 1\npreset: turbo\n").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownPreset(ref p) if p == "turbo"));

        let err = Settings::from_yaml_str("version: 1\npreset: default\nbogus: 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));

        let err = Settings::from_yaml_str("version: 1\noverrides:\n  max_fanuot: 5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));
    }

    #[test]
    fn test_validation_runs_on_load() {
        let err = Settings::from_yaml_str("version: 1\noverrides:\n  batch_size: 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Range { ref field, .. } if field == "fanout.batch_size"));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let mut settings = Settings::preset(FanoutPreset::HighThroughput);
        settings.overrides.max_fanout = Some(1234);
        settings.overrides.apply(&mut settings.fanout);

        let yaml = settings.to_yaml().unwrap();
        assert!(yaml.contains("version: 1"));
        assert!(yaml.contains("preset: high_throughput"));
        assert!(yaml.contains("max_fanout: 1234"));

        let reloaded = Settings::from_yaml_str(&yaml).unwrap();
        assert_eq!(reloaded, settings);
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"version: 1\npreset: disabled\n").unwrap();

        let settings = Settings::from_yaml(file.path()).unwrap();
        assert!(!settings.fanout.enabled);

        let missing = Settings::from_yaml("/nonexistent/settings.yaml").unwrap_err();
        assert!(matches!(missing, ConfigError::Io(_)));
    }

    #[test]
    fn test_config_error_converts() {
        let err: OrchestratorError = ConfigError::MissingVersion.into();
        assert!(matches!(err, OrchestratorError::Config(_)));
    }
}
