use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

/// Tunables of a transfer. Every field has a default, so a config file only
/// needs the keys it overrides.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct TransferConfig {
    /// Number of concurrent segments for objects of known size
    pub segment_count: usize,
    /// Objects smaller than this are fetched as a single segment
    pub min_segmented_size: u64,
    pub sample_interval_ms: u64,
    pub report_interval_ms: u64,
    /// Fail a segment whose stream delivers nothing for this long
    pub stall_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub user_agent: String,
    /// Replace an existing destination file instead of skipping the transfer
    pub force: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            segment_count: 4,
            min_segmented_size: 1024 * 1024,
            sample_interval_ms: 500,
            report_interval_ms: 1000,
            stall_timeout_secs: 30,
            connect_timeout_secs: 10,
            user_agent: concat!("segfetch/", env!("CARGO_PKG_VERSION")).to_string(),
            force: false,
        }
    }
}

impl TransferConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: TransferConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.segment_count == 0 {
            return Err(ConfigError::Invalid("segment_count must be greater than 0"));
        }
        if self.sample_interval_ms == 0 || self.report_interval_ms == 0 {
            return Err(ConfigError::Invalid("progress intervals must be greater than 0"));
        }
        if self.report_interval_ms < self.sample_interval_ms {
            return Err(ConfigError::Invalid(
                "report_interval_ms must not be shorter than sample_interval_ms",
            ));
        }
        if self.stall_timeout_secs == 0 || self.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be greater than 0"));
        }
        if self.user_agent.trim().is_empty() {
            return Err(ConfigError::Invalid("user_agent must not be empty"));
        }
        Ok(())
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = TransferConfig::default();
        assert_eq!(config.segment_count, 4);
        assert_eq!(config.sample_interval(), Duration::from_millis(500));
        assert_eq!(config.report_interval(), Duration::from_secs(1));
        assert!(config.user_agent.starts_with("segfetch/"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = TransferConfig::default();
        config.segment_count = 0;
        assert!(config.validate().is_err());

        let mut config = TransferConfig::default();
        config.report_interval_ms = 100;
        assert!(config.validate().is_err());

        let mut config = TransferConfig::default();
        config.stall_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = TransferConfig::default();
        config.user_agent = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segfetch.toml");
        std::fs::write(&path, "segment_count = 8\nforce = true\n").unwrap();

        let config = TransferConfig::load(&path).unwrap();
        assert_eq!(config.segment_count, 8);
        assert!(config.force);
        assert_eq!(config.report_interval_ms, 1000);
    }

    #[test]
    fn test_config_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segfetch.toml");

        std::fs::write(&path, "segment_count = \"many\"").unwrap();
        assert!(matches!(TransferConfig::load(&path), Err(ConfigError::Parse(_))));

        std::fs::write(&path, "segment_count = 0").unwrap();
        assert!(matches!(TransferConfig::load(&path), Err(ConfigError::Invalid(_))));
    }
}
