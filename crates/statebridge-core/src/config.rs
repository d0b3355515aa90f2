use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// LoggingConfig
// ---------------------------------------------------------------------------

/// Settings for the logging middleware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Log action payloads alongside the action type.
    #[serde(default)]
    pub include_payload: bool,
    /// Log the resulting state after every action.
    #[serde(default)]
    pub include_state: bool,
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            include_payload: false,
            include_state: false,
        }
    }
}

// ---------------------------------------------------------------------------
// BridgeConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Safety timeout for an unacknowledged dispatch.
    #[serde(default = "default_dispatch_timeout_ms")]
    pub dispatch_timeout_ms: u64,
    /// How long a consumer waits for a thunk registration ack.
    #[serde(default = "default_registration_timeout_ms")]
    pub registration_timeout_ms: u64,
    /// Upper bound on consumers with live bookkeeping.
    #[serde(default = "default_max_tracked_consumers")]
    pub max_tracked_consumers: usize,
    /// Interval of the stale-consumer sweep; `None` disables it.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: Option<u64>,
    #[serde(default = "default_max_serialization_depth")]
    pub max_serialization_depth: usize,
    #[serde(default)]
    pub enforce_access_control: bool,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Longer on Windows, where channel round trips are slower.
fn default_dispatch_timeout_ms() -> u64 {
    if cfg!(target_os = "windows") {
        20_000
    } else {
        10_000
    }
}

fn default_registration_timeout_ms() -> u64 {
    5_000
}

fn default_max_tracked_consumers() -> usize {
    100
}

fn default_sweep_interval_secs() -> Option<u64> {
    Some(60)
}

fn default_max_serialization_depth() -> usize {
    10
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            dispatch_timeout_ms: default_dispatch_timeout_ms(),
            registration_timeout_ms: default_registration_timeout_ms(),
            max_tracked_consumers: default_max_tracked_consumers(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_serialization_depth: default_max_serialization_depth(),
            enforce_access_control: false,
            logging: LoggingConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Load a YAML config file. Missing fields fall back to their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(BridgeError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        let data = std::fs::read_to_string(path)?;
        let config: BridgeConfig = serde_yaml::from_str(&data)?;
        Ok(config)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.max_tracked_consumers == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "max_tracked_consumers is 0: every new consumer evicts the previous one"
                    .to_string(),
            });
        }
        if self.max_serialization_depth == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "max_serialization_depth is 0: consumers only ever see a truncation marker"
                    .to_string(),
            });
        }
        if self.dispatch_timeout_ms < 1_000 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "dispatch_timeout_ms is {}ms: slow actions will be reported complete before they apply",
                    self.dispatch_timeout_ms
                ),
            });
        }
        if self.sweep_interval_secs == Some(0) {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "sweep_interval_secs is 0: periodic sweep disabled".to_string(),
            });
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_are_valid() {
        let config = BridgeConfig::default();
        assert!(config.validate().is_empty());
        assert_eq!(config.max_serialization_depth, 10);
        assert_eq!(config.sweep_interval(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn load_fills_missing_fields_with_defaults() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "max_tracked_consumers: 3\nenforce_access_control: true").unwrap();

        let config = BridgeConfig::load(f.path()).unwrap();
        assert_eq!(config.max_tracked_consumers, 3);
        assert!(config.enforce_access_control);
        assert_eq!(config.registration_timeout_ms, 5_000);
        assert!(config.logging.enabled);
    }

    #[test]
    fn null_sweep_interval_disables_sweep() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "sweep_interval_secs: null").unwrap();

        let config = BridgeConfig::load(f.path()).unwrap();
        assert_eq!(config.sweep_interval(), None);
    }

    #[test]
    fn load_missing_file_is_config_error() {
        let err = BridgeConfig::load(Path::new("/nonexistent/statebridge.yaml")).unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[test]
    fn validate_flags_zero_limits() {
        let config = BridgeConfig {
            max_tracked_consumers: 0,
            max_serialization_depth: 0,
            dispatch_timeout_ms: 50,
            ..Default::default()
        };
        let warnings = config.validate();
        assert_eq!(warnings.len(), 3);
        assert_eq!(
            warnings
                .iter()
                .filter(|w| w.level == WarnLevel::Error)
                .count(),
            2
        );
    }
}
