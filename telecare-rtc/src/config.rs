//! Coordinator configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Presence synchronizer tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceSettings {
    /// Name written when the caller passes an empty display name
    pub default_display_name: String,
    /// First delay before restarting a dropped change feed
    pub watch_initial_backoff: Duration,
    /// Delay cap for change feed restarts
    pub watch_max_backoff: Duration,
    /// Consecutive failed restarts before the feed is abandoned
    pub watch_max_retries: usize,
    /// Upper bound for one store call
    pub operation_timeout: Duration,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self::from(&telecare_core::config::PresenceConfig::default())
    }
}

impl From<&telecare_core::config::PresenceConfig> for PresenceSettings {
    fn from(config: &telecare_core::config::PresenceConfig) -> Self {
        Self {
            default_display_name: config.default_display_name.clone(),
            watch_initial_backoff: Duration::from_millis(config.watch_initial_backoff_ms),
            watch_max_backoff: Duration::from_millis(config.watch_max_backoff_ms),
            watch_max_retries: config.watch_max_retries,
            operation_timeout: Duration::from_millis(config.operation_timeout_ms),
        }
    }
}

/// Session coordinator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Upper bound for acquiring one local track
    pub device_timeout: Duration,
    /// Upper bound for the transport join; exceeding it fails the join
    pub transport_join_timeout: Duration,
    /// Upper bound for publish, unpublish, subscribe and leave
    pub transport_op_timeout: Duration,
    /// Capacity of the channel feeding the registry worker
    pub event_channel_capacity: usize,
    /// Capacity of the session event broadcast
    pub state_broadcast_capacity: usize,
    pub presence: PresenceSettings,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from(&telecare_core::Config::default())
    }
}

impl From<&telecare_core::Config> for CoordinatorConfig {
    fn from(config: &telecare_core::Config) -> Self {
        Self {
            device_timeout: config.rtc.device_timeout(),
            transport_join_timeout: config.rtc.transport_join_timeout(),
            transport_op_timeout: config.rtc.transport_op_timeout(),
            event_channel_capacity: config.rtc.event_channel_capacity,
            state_broadcast_capacity: config.rtc.state_broadcast_capacity,
            presence: PresenceSettings::from(&config.presence),
        }
    }
}
