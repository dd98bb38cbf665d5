use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Watcher delivery tuning
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct WatchConfig {
    /// Buffer between the store subscription and the delivery task
    /// Default: 1024
    #[serde(default = "default_subscription_buffer_size")]
    pub subscription_buffer_size: usize,

    /// How long delivery waits on a full sink before dropping the event
    /// Default: 1000ms
    #[serde(default = "default_delivery_timeout")]
    pub delivery_timeout_in_ms: u64,

    /// Issue `CONFIG SET notify-keyspace-events KA` before subscribing
    /// Default: true
    #[serde(default = "default_configure_keyspace_events")]
    pub configure_keyspace_events: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            subscription_buffer_size: default_subscription_buffer_size(),
            delivery_timeout_in_ms: default_delivery_timeout(),
            configure_keyspace_events: default_configure_keyspace_events(),
        }
    }
}

impl WatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.subscription_buffer_size == 0 {
            return Err(Error::Config(ConfigError::Message(
                "watch.subscription_buffer_size must be greater than 0".into(),
            )));
        }
        if self.delivery_timeout_in_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "watch.delivery_timeout_in_ms must be greater than 0".into(),
            )));
        }
        Ok(())
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_in_ms)
    }
}

fn default_subscription_buffer_size() -> usize {
    1024
}
fn default_delivery_timeout() -> u64 {
    1000
}
fn default_configure_keyspace_events() -> bool {
    true
}
