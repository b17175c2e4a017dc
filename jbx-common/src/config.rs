//! Configuration loading and resolution
//!
//! Every timing window and quota threshold the kiosk relies on is a named,
//! overridable field here rather than an inline literal. Resolution follows
//! the usual priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file under the platform config directory
//! 4. Compiled defaults (fallback)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Policy for identical pending requests in the priority queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// A user may request the same song twice
    #[default]
    Allow,
    /// Reject a request whose track id is already pending
    Reject,
}

/// Kiosk configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JbxConfig {
    /// Mailbox re-read interval for the poll delivery path (milliseconds)
    pub poll_interval_ms: u64,

    /// Deadline for a matching status while Initializing/Playing (seconds)
    pub heartbeat_timeout_secs: u64,

    /// Longer grace given to error-classified statuses before the forced
    /// advance (seconds)
    pub error_grace_secs: u64,

    /// Window in which a repeated play command for the same track is
    /// suppressed (seconds)
    pub play_dedup_window_secs: u64,

    /// Quota percentage that triggers proactive credential rotation
    pub soft_quota_percent: f32,

    /// Quota percentage past which a credential is no longer considered valid
    pub hard_quota_percent: f32,

    /// How long an exhausted credential sits out of rotation (seconds)
    pub exhaustion_cooldown_secs: u64,

    /// Consecutive failures before a provider is skipped for a resource
    pub provider_strike_limit: u32,

    /// How long a struck-out provider is skipped for a resource (seconds)
    pub provider_skip_window_secs: u64,

    /// Minimum cool-down before the same resource is retried on a provider
    /// after a retryable failure (seconds)
    pub retry_backoff_secs: u64,

    /// Upper bound on tracks accepted from one catalog load
    pub catalog_track_cap: usize,

    /// Most-recent rotation events kept for display
    pub rotation_log_cap: usize,

    /// Presentation surface creation attempts before giving up as a fatal
    /// configuration error
    pub surface_create_attempts: u32,

    /// Priority queue duplicate handling
    pub duplicate_policy: DuplicatePolicy,
}

impl Default for JbxConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            heartbeat_timeout_secs: 10,
            error_grace_secs: 11,
            play_dedup_window_secs: 2,
            soft_quota_percent: 80.0,
            hard_quota_percent: 95.0,
            exhaustion_cooldown_secs: 3600,
            provider_strike_limit: 3,
            provider_skip_window_secs: 300,
            retry_backoff_secs: 30,
            catalog_track_cap: 2000,
            rotation_log_cap: 10,
            surface_create_attempts: 3,
            duplicate_policy: DuplicatePolicy::Allow,
        }
    }
}

impl JbxConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn error_grace(&self) -> Duration {
        Duration::from_secs(self.error_grace_secs)
    }

    pub fn play_dedup_window(&self) -> Duration {
        Duration::from_secs(self.play_dedup_window_secs)
    }

    pub fn exhaustion_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.exhaustion_cooldown_secs as i64)
    }

    pub fn provider_skip_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.provider_skip_window_secs as i64)
    }

    pub fn retry_backoff(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retry_backoff_secs as i64)
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Cannot read {}: {}", path.display(), e)))?;
        toml::from_str(&raw).map_err(|e| Error::Config(format!("Invalid config: {}", e)))
    }

    /// Resolve and load configuration
    ///
    /// Priority: explicit CLI path, then the `JBX_CONFIG` environment
    /// variable, then `jbx/config.toml` under the platform config directory,
    /// then compiled defaults.
    pub fn resolve(cli_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = cli_path {
            return Self::load_from(path);
        }

        if let Ok(path) = std::env::var("JBX_CONFIG") {
            return Self::load_from(Path::new(&path));
        }

        if let Some(path) = default_config_path() {
            if path.exists() {
                return Self::load_from(&path);
            }
        }

        Ok(Self::default())
    }
}

/// Default configuration file location for the platform
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("jbx").join("config.toml"))
}

/// Default data directory (resume snapshots live here)
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("jbx"))
        .unwrap_or_else(|| PathBuf::from("./jbx_data"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_observed_values() {
        let cfg = JbxConfig::default();
        assert_eq!(cfg.poll_interval(), Duration::from_millis(250));
        assert_eq!(cfg.heartbeat_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.error_grace(), Duration::from_secs(11));
        assert_eq!(cfg.soft_quota_percent, 80.0);
        assert_eq!(cfg.hard_quota_percent, 95.0);
        assert_eq!(cfg.exhaustion_cooldown(), chrono::Duration::hours(1));
        assert_eq!(cfg.provider_skip_window(), chrono::Duration::minutes(5));
        assert_eq!(cfg.catalog_track_cap, 2000);
        assert_eq!(cfg.duplicate_policy, DuplicatePolicy::Allow);
    }

    #[test]
    fn test_partial_toml_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "heartbeat_timeout_secs = 5\nduplicate_policy = \"reject\""
        )
        .unwrap();

        let cfg = JbxConfig::load_from(file.path()).unwrap();
        assert_eq!(cfg.heartbeat_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.duplicate_policy, DuplicatePolicy::Reject);
        // Untouched fields keep their defaults
        assert_eq!(cfg.poll_interval_ms, 250);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "poll_interval_ms = \"soon\"").unwrap();

        let err = JbxConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
