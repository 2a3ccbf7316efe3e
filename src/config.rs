//! Configuration management for quotagate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{LimiterError, Result};

/// Prefix for environment variable overrides, e.g. `QUOTAGATE__MODE=distributed`.
const ENV_PREFIX: &str = "QUOTAGATE";

/// Which backend the factory builds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// In-process buckets.
    #[default]
    Standalone,
    /// Buckets coordinated through a shared store.
    Distributed,
}

impl FromStr for Mode {
    type Err = LimiterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standalone" => Ok(Mode::Standalone),
            "distributed" => Ok(Mode::Distributed),
            other => Err(LimiterError::Config(format!("unknown limiter mode '{}'", other))),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Standalone => write!(f, "standalone"),
            Mode::Distributed => write!(f, "distributed"),
        }
    }
}

/// Main configuration for a limiter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Backend selection
    #[serde(default)]
    pub mode: Mode,

    /// In-process backend settings
    #[serde(default)]
    pub standalone: StandaloneConfig,

    /// Store-coordinated backend settings
    #[serde(default)]
    pub distributed: DistributedConfig,
}

/// Standalone backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandaloneConfig {
    /// How often the idle sweep runs, in milliseconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_ms: u64,

    /// Buckets untouched for longer than this are evicted, in milliseconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,
}

impl Default for StandaloneConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_ms: default_cleanup_interval(),
            idle_timeout_ms: default_idle_timeout(),
        }
    }
}

impl StandaloneConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

fn default_cleanup_interval() -> u64 {
    60_000
}

fn default_idle_timeout() -> u64 {
    300_000
}

/// Distributed backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedConfig {
    /// Prepended to every logical key before it reaches the store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Attempts made by the compare-and-swap store emulation before giving up
    #[serde(default = "default_cas_max_attempts")]
    pub cas_max_attempts: u32,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            cas_max_attempts: default_cas_max_attempts(),
        }
    }
}

fn default_key_prefix() -> String {
    "ratelimit:".to_string()
}

fn default_cas_max_attempts() -> u32 {
    16
}

impl LimiterConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: LimiterConfig =
            serde_yaml::from_str(yaml).map_err(|e| LimiterError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional YAML file layered under
    /// `QUOTAGATE__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }
        let config: LimiterConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| LimiterError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no backend could run with.
    pub fn validate(&self) -> Result<()> {
        if self.standalone.cleanup_interval_ms == 0 {
            return Err(LimiterError::Config(
                "standalone.cleanup_interval_ms must be positive".into(),
            ));
        }
        if self.standalone.idle_timeout_ms == 0 {
            return Err(LimiterError::Config(
                "standalone.idle_timeout_ms must be positive".into(),
            ));
        }
        if self.distributed.cas_max_attempts == 0 {
            return Err(LimiterError::Config(
                "distributed.cas_max_attempts must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LimiterConfig::default();
        assert_eq!(config.mode, Mode::Standalone);
        assert_eq!(config.standalone.cleanup_interval(), Duration::from_secs(60));
        assert_eq!(config.standalone.idle_timeout(), Duration::from_secs(300));
        assert_eq!(config.distributed.key_prefix, "ratelimit:");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
mode: distributed
standalone:
  cleanup_interval_ms: 500
distributed:
  key_prefix: "api:"
"#;
        let config = LimiterConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.mode, Mode::Distributed);
        assert_eq!(config.standalone.cleanup_interval_ms, 500);
        assert_eq!(config.standalone.idle_timeout_ms, 300_000);
        assert_eq!(config.distributed.key_prefix, "api:");
        assert_eq!(config.distributed.cas_max_attempts, 16);
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let result = LimiterConfig::from_yaml("mode: cluster\n");
        assert!(matches!(result, Err(LimiterError::Config(_))));

        assert!(matches!("cluster".parse::<Mode>(), Err(LimiterError::Config(_))));
        assert_eq!(" Distributed ".parse::<Mode>().unwrap(), Mode::Distributed);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let yaml = "standalone:\n  cleanup_interval_ms: 0\n";
        assert!(matches!(
            LimiterConfig::from_yaml(yaml),
            Err(LimiterError::Config(_))
        ));
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = LimiterConfig::load(None).unwrap();
        assert_eq!(config.standalone.idle_timeout_ms, default_idle_timeout());
    }
}
