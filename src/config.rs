//! Configuration types for bulk-lookup

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// External lookup service settings
///
/// Groups settings for the paid lookup API: endpoint, credential, timing.
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LookupConfig {
    /// Lookup API endpoint URL
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Lookup API credential (required, validated at startup)
    #[serde(default)]
    pub api_token: String,

    /// Query kind sent with every request (default: "standart")
    #[serde(default = "default_query_kind")]
    pub query_kind: String,

    /// Per-call timeout budget (default: 30 seconds)
    #[serde(default = "default_call_timeout", with = "duration_secs")]
    pub call_timeout: Duration,

    /// Fixed delay inserted after every live call to avoid bursty
    /// sub-window submission (default: 500 ms)
    #[serde(default = "default_inter_call_delay", with = "duration_millis")]
    pub inter_call_delay: Duration,

    /// Name of the required key column in the source table (default: "tax_id")
    #[serde(default = "default_key_column")]
    pub key_column: String,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_token: String::new(),
            query_kind: default_query_kind(),
            call_timeout: default_call_timeout(),
            inter_call_delay: default_inter_call_delay(),
            key_column: default_key_column(),
        }
    }
}

/// Rate governor settings
///
/// The quota is an external service constraint, so one governor instance is
/// shared by every job in the process.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum calls permitted per window (default: 100)
    #[serde(default = "default_quota")]
    pub quota: u32,

    /// Window duration; the call after the quota blocks until this much time
    /// has passed since the window opened (default: 16 minutes)
    #[serde(default = "default_window", with = "duration_secs")]
    pub window: Duration,

    /// How often to emit a progress notice while blocked (default: 60 seconds)
    #[serde(default = "default_wait_notice_interval", with = "duration_secs")]
    pub wait_notice_interval: Duration,

    /// Assumed average cost of one call, used only for worst-case ETA
    /// estimates (default: 1 second)
    #[serde(default = "default_avg_call_cost", with = "duration_secs")]
    pub avg_call_cost: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            quota: default_quota(),
            window: default_window(),
            wait_notice_interval: default_wait_notice_interval(),
            avg_call_cost: default_avg_call_cost(),
        }
    }
}

/// Checkpoint and artifact settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Directory for durable checkpoint files (default: "./checkpoints")
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,

    /// Directory for transient artifacts (default: "./temp")
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Persist a checkpoint every this many processed rows (default: 50)
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,

    /// Ship a partial-result artifact every this many processed rows;
    /// must be greater than `checkpoint_interval` (default: 100)
    #[serde(default = "default_artifact_interval")]
    pub artifact_interval: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: default_checkpoint_dir(),
            temp_dir: default_temp_dir(),
            checkpoint_interval: default_checkpoint_interval(),
            artifact_interval: default_artifact_interval(),
        }
    }
}

/// Progress reporting settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Minimum wall-clock time between progress updates (default: 5 seconds)
    #[serde(default = "default_update_interval", with = "duration_secs")]
    pub update_interval: Duration,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            update_interval: default_update_interval(),
        }
    }
}

/// Main configuration for the batch engine
///
/// Fields are organized into logical sub-configs:
/// - [`lookup`](LookupConfig) — external service endpoint and timing
/// - [`rate_limit`](RateLimitConfig) — quota window
/// - [`checkpoint`](CheckpointConfig) — persistence intervals and directories
/// - [`progress`](ProgressConfig) — status update cadence
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// External lookup service settings
    #[serde(default)]
    pub lookup: LookupConfig,

    /// Rate governor settings
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Checkpoint and artifact settings
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Progress reporting settings
    #[serde(default)]
    pub progress: ProgressConfig,
}

impl Config {
    /// Validate the configuration, returning a `Config` error naming the
    /// offending key on the first problem found.
    ///
    /// Called by the engine before any job can start; a bad configuration
    /// never reaches the row loop.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::Error;

        if self.lookup.api_token.trim().is_empty() {
            return Err(Error::Config {
                message: "api_token is empty".to_string(),
                key: Some("lookup.api_token".to_string()),
            });
        }
        if self.lookup.api_url.trim().is_empty() {
            return Err(Error::Config {
                message: "api_url is empty".to_string(),
                key: Some("lookup.api_url".to_string()),
            });
        }
        if self.rate_limit.quota == 0 {
            return Err(Error::Config {
                message: "quota must be at least 1".to_string(),
                key: Some("rate_limit.quota".to_string()),
            });
        }
        if self.checkpoint.checkpoint_interval == 0 {
            return Err(Error::Config {
                message: "checkpoint_interval must be at least 1".to_string(),
                key: Some("checkpoint.checkpoint_interval".to_string()),
            });
        }
        if self.checkpoint.artifact_interval <= self.checkpoint.checkpoint_interval {
            return Err(Error::Config {
                message: "artifact_interval must be greater than checkpoint_interval".to_string(),
                key: Some("checkpoint.artifact_interval".to_string()),
            });
        }
        Ok(())
    }
}

fn default_api_url() -> String {
    "https://api.example.com/query".to_string()
}

fn default_query_kind() -> String {
    "standart".to_string()
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_inter_call_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_key_column() -> String {
    "tax_id".to_string()
}

fn default_quota() -> u32 {
    100
}

fn default_window() -> Duration {
    Duration::from_secs(16 * 60)
}

fn default_wait_notice_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_avg_call_cost() -> Duration {
    Duration::from_secs(1)
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("./checkpoints")
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("./temp")
}

fn default_checkpoint_interval() -> usize {
    50
}

fn default_artifact_interval() -> usize {
    100
}

fn default_update_interval() -> Duration {
    Duration::from_secs(5)
}

/// Serialize/deserialize a Duration as whole seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Serialize/deserialize a Duration as whole milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            lookup: LookupConfig {
                api_token: "token".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.rate_limit.quota, 100);
        assert_eq!(config.rate_limit.window, Duration::from_secs(960));
        assert_eq!(config.checkpoint.checkpoint_interval, 50);
        assert_eq!(config.checkpoint.artifact_interval, 100);
        assert_eq!(config.lookup.call_timeout, Duration::from_secs(30));
        assert_eq!(config.lookup.inter_call_delay, Duration::from_millis(500));
        assert_eq!(config.lookup.key_column, "tax_id");
        assert_eq!(config.progress.update_interval, Duration::from_secs(5));
    }

    #[test]
    fn validate_accepts_valid_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_token() {
        let config = Config::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("api_token"));
    }

    #[test]
    fn validate_rejects_zero_quota() {
        let mut config = valid_config();
        config.rate_limit.quota = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_artifact_interval_not_above_checkpoint_interval() {
        let mut config = valid_config();
        config.checkpoint.artifact_interval = config.checkpoint.checkpoint_interval;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("artifact_interval"));
    }

    #[test]
    fn round_trips_through_json() {
        let config = valid_config();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.rate_limit.quota, config.rate_limit.quota);
        assert_eq!(parsed.lookup.call_timeout, config.lookup.call_timeout);
        assert_eq!(
            parsed.lookup.inter_call_delay,
            config.lookup.inter_call_delay
        );
    }

    #[test]
    fn deserializes_from_empty_object_with_defaults() {
        let parsed: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed.rate_limit.quota, 100);
        assert_eq!(parsed.checkpoint.checkpoint_interval, 50);
    }
}
