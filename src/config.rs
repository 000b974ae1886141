use crate::{PortalError, Result as PortalResult};
use anyhow::{Context, Result};
use file_portal_shared_memory::{
    WaitPolicy, CONDITION_VARIABLE_STRIKE_LIMIT, CONDITION_VARIABLE_TIMEOUT, DEFAULT_SEGMENT_SIZE,
    MAX_REGION_SIZE, SHARED_MEMORY_NAME,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Portal configuration, shared by the client and server roles
///
/// Both processes must agree on the segment name, wait timeout and strike
/// limit; the segment size only matters to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalConfig {
    /// Name of the POSIX shared memory segment
    #[serde(default = "default_segment_name")]
    pub segment_name: String,

    /// Segment size in bytes, decides how many chunks the pool holds
    #[serde(default = "default_segment_size")]
    pub segment_size: usize,

    /// Bound on a single condition variable wait, in milliseconds
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,

    /// Consecutive timeouts before a transfer is abandoned
    #[serde(default = "default_strike_limit")]
    pub strike_limit: u32,

    /// Directory the server writes received files into
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Main loop status poll interval, in seconds
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_segment_name() -> String {
    SHARED_MEMORY_NAME.to_string()
}

fn default_segment_size() -> usize {
    DEFAULT_SEGMENT_SIZE
}

fn default_wait_timeout_ms() -> u64 {
    CONDITION_VARIABLE_TIMEOUT.as_millis() as u64
}

fn default_strike_limit() -> u32 {
    CONDITION_VARIABLE_STRIKE_LIMIT
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_poll_interval_secs() -> u64 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            segment_name: default_segment_name(),
            segment_size: default_segment_size(),
            wait_timeout_ms: default_wait_timeout_ms(),
            strike_limit: default_strike_limit(),
            output_dir: default_output_dir(),
            poll_interval_secs: default_poll_interval_secs(),
            log_level: default_log_level(),
        }
    }
}

impl PortalConfig {
    /// Load configuration from a toml file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Cannot read config file: {:?}", path.as_ref()))?;

        let config: PortalConfig = toml::from_str(&content)
            .with_context(|| format!("Cannot parse config file: {:?}", path.as_ref()))?;

        Ok(config)
    }

    /// Save configuration to a toml file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("Cannot create directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).with_context(|| "Cannot serialize config")?;

        std::fs::write(&path, content)
            .with_context(|| format!("Cannot write config file: {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Reject values no session can run with
    pub fn validate(&self) -> PortalResult<()> {
        let name = self.segment_name.strip_prefix('/').unwrap_or(&self.segment_name);
        if name.is_empty() || name.contains('/') {
            return Err(PortalError::Configuration(format!(
                "segment_name {:?} must be a single path component",
                self.segment_name
            )));
        }
        if self.segment_size == 0 || self.segment_size > MAX_REGION_SIZE {
            return Err(PortalError::Configuration(format!(
                "segment_size {} is out of range",
                self.segment_size
            )));
        }
        if self.wait_timeout_ms == 0 {
            return Err(PortalError::Configuration("wait_timeout_ms must be positive".to_string()));
        }
        if self.strike_limit == 0 {
            return Err(PortalError::Configuration("strike_limit must be positive".to_string()));
        }
        if self.poll_interval_secs == 0 {
            return Err(PortalError::Configuration("poll_interval_secs must be positive".to_string()));
        }

        Ok(())
    }

    pub fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy::new(Duration::from_millis(self.wait_timeout_ms), self.strike_limit)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_match_shared_constants() {
        let config = PortalConfig::default();
        assert_eq!(config.segment_name, SHARED_MEMORY_NAME);
        assert_eq!(config.segment_size, DEFAULT_SEGMENT_SIZE);
        assert_eq!(config.wait_policy(), WaitPolicy::default());
        assert_eq!(config.poll_interval(), Duration::from_secs(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("portal.toml");
        std::fs::write(&path, "output_dir = \"/var/spool/portal\"\nstrike_limit = 5\n").unwrap();

        let config = PortalConfig::from_file(&path).unwrap();
        assert_eq!(config.output_dir, PathBuf::from("/var/spool/portal"));
        assert_eq!(config.strike_limit, 5);
        assert_eq!(config.segment_size, DEFAULT_SEGMENT_SIZE);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("portal.toml");
        let config = PortalConfig {
            wait_timeout_ms: 250,
            log_level: "debug".to_string(),
            ..PortalConfig::default()
        };

        config.save_to_file(&path).unwrap();
        assert_eq!(PortalConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let nested = PortalConfig { segment_name: "/a/b".to_string(), ..PortalConfig::default() };
        assert!(matches!(nested.validate(), Err(PortalError::Configuration(_))));

        let no_strikes = PortalConfig { strike_limit: 0, ..PortalConfig::default() };
        assert!(no_strikes.validate().is_err());

        let no_timeout = PortalConfig { wait_timeout_ms: 0, ..PortalConfig::default() };
        assert!(no_timeout.validate().is_err());
    }

    #[test]
    fn test_unreadable_file_has_context() {
        let err = PortalConfig::from_file("/nonexistent/portal.toml").unwrap_err();
        assert!(err.to_string().contains("Cannot read config file"));
    }
}
