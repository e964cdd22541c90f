use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub rtc: RtcConfig,
    pub presence: PresenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Media session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtcConfig {
    /// Upper bound for acquiring a microphone, camera or screen track
    pub device_timeout_ms: u64,
    /// Upper bound for the transport join call (exceeding it fails the join)
    pub transport_join_timeout_ms: u64,
    /// Upper bound for publish/unpublish/subscribe/leave calls
    pub transport_op_timeout_ms: u64,
    /// Capacity of the remote event channel feeding the registry
    pub event_channel_capacity: usize,
    /// Capacity of the session event broadcast channel
    pub state_broadcast_capacity: usize,
    /// Interval of the directory sweep removing ended sessions
    pub directory_cleanup_interval_secs: u64,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            device_timeout_ms: 10_000,
            transport_join_timeout_ms: 15_000,
            transport_op_timeout_ms: 10_000,
            event_channel_capacity: 256,
            state_broadcast_capacity: 128,
            directory_cleanup_interval_secs: 60,
        }
    }
}

impl RtcConfig {
    #[must_use]
    pub const fn device_timeout(&self) -> Duration {
        Duration::from_millis(self.device_timeout_ms)
    }

    #[must_use]
    pub const fn transport_join_timeout(&self) -> Duration {
        Duration::from_millis(self.transport_join_timeout_ms)
    }

    #[must_use]
    pub const fn transport_op_timeout(&self) -> Duration {
        Duration::from_millis(self.transport_op_timeout_ms)
    }
}

/// Presence store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Name written when the caller has no display name
    pub default_display_name: String,
    /// First delay before restarting a dropped change feed
    pub watch_initial_backoff_ms: u64,
    /// Delay cap for change feed restarts
    pub watch_max_backoff_ms: u64,
    /// Consecutive failed restarts before the feed is abandoned
    pub watch_max_retries: usize,
    /// Upper bound for a single put/delete against the store
    pub operation_timeout_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            default_display_name: "User".to_string(),
            watch_initial_backoff_ms: 500,
            watch_max_backoff_ms: 30_000,
            watch_max_retries: 8,
            operation_timeout_ms: 5_000,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> crate::Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // TELECARE_RTC__DEVICE_TIMEOUT_MS, TELECARE_LOGGING__LEVEL, ...
        builder = builder.add_source(
            Environment::with_prefix("TELECARE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Load from environment variables only
    pub fn from_env() -> crate::Result<Self> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> crate::Result<Self> {
        Self::load(Some(path))
    }

    /// Check the configuration for values that would break a session at runtime
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if crate::logging::parse_log_level(&self.logging.level).is_err() {
            errors.push(format!("logging.level: unknown level '{}'", self.logging.level));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format: expected 'json' or 'pretty', got '{}'",
                self.logging.format
            ));
        }

        let rtc = &self.rtc;
        for (name, value) in [
            ("rtc.device_timeout_ms", rtc.device_timeout_ms),
            ("rtc.transport_join_timeout_ms", rtc.transport_join_timeout_ms),
            ("rtc.transport_op_timeout_ms", rtc.transport_op_timeout_ms),
            ("rtc.directory_cleanup_interval_secs", rtc.directory_cleanup_interval_secs),
            ("presence.operation_timeout_ms", self.presence.operation_timeout_ms),
        ] {
            if value == 0 {
                errors.push(format!("{name}: must be greater than zero"));
            }
        }
        if rtc.event_channel_capacity == 0 {
            errors.push("rtc.event_channel_capacity: must be greater than zero".to_string());
        }
        if rtc.state_broadcast_capacity == 0 {
            errors.push("rtc.state_broadcast_capacity: must be greater than zero".to_string());
        }

        let presence = &self.presence;
        if presence.watch_max_backoff_ms < presence.watch_initial_backoff_ms {
            errors.push(format!(
                "presence.watch_max_backoff_ms ({}) is smaller than watch_initial_backoff_ms ({})",
                presence.watch_max_backoff_ms, presence.watch_initial_backoff_ms
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
