use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::orchestrator::HealthDefaults;

/// Optional per-user defaults. Every field may be omitted.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct UserConfig {
    /// Port for the dashboard API
    pub dashboard_port: Option<u16>,
    /// Time between interrupt and force kill when stopping a service
    pub grace_period_ms: Option<u64>,
    /// Lines of output kept per service
    pub log_buffer_lines: Option<usize>,
    pub health: HealthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    pub interval_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub failure_threshold: Option<u32>,
    pub degraded_latency_ms: Option<u64>,
}

impl HealthConfig {
    pub fn defaults(&self) -> HealthDefaults {
        let base = HealthDefaults::default();
        HealthDefaults {
            interval: self
                .interval_ms
                .map(Duration::from_millis)
                .unwrap_or(base.interval),
            timeout: self
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(base.timeout),
            failure_threshold: self
                .failure_threshold
                .unwrap_or(base.failure_threshold)
                .max(1),
            degraded_latency: self
                .degraded_latency_ms
                .map(Duration::from_millis)
                .unwrap_or(base.degraded_latency),
        }
    }
}

impl UserConfig {
    /// $DEVRUN_CONFIG_DIR/config.toml or ~/.config/devrun/config.toml
    pub fn config_path() -> PathBuf {
        crate::clienv::config_dir().join("config.toml")
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Loading user config");

        if !path.exists() {
            tracing::trace!("Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        tracing::trace!(?config, "User config loaded");
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        tracing::trace!(path = %path.display(), "Saving user config");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;

        tracing::trace!("User config saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = UserConfig::load_from(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, UserConfig::default());
        assert_eq!(config.health.defaults(), HealthDefaults::default());
    }

    #[test]
    fn partial_file_overrides_only_given_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "grace_period_ms = 1500\n[health]\nfailure_threshold = 5\n",
        )
        .unwrap();

        let config = UserConfig::load_from(&path).unwrap();
        assert_eq!(config.grace_period_ms, Some(1500));
        assert_eq!(config.dashboard_port, None);

        let health = config.health.defaults();
        assert_eq!(health.failure_threshold, 5);
        assert_eq!(health.interval, HealthDefaults::default().interval);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "dashbord_port = 1\n").unwrap();
        assert!(UserConfig::load_from(&path).is_err());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = UserConfig {
            dashboard_port: Some(5000),
            log_buffer_lines: Some(200),
            ..Default::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(UserConfig::load_from(&path).unwrap(), config);
    }
}
