use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Client tuning shared by every topology
///
/// Zero timeouts and sizes fall back to the defaults below, so a config file
/// generated with all-zero values is still usable.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Password sent with AUTH on every new connection (empty disables AUTH)
    #[serde(default)]
    pub password: String,

    /// TCP connect timeout in milliseconds
    /// Default: 5000
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_in_ms: u64,

    /// Socket read deadline per reply in milliseconds
    /// Default: 3000
    #[serde(default = "default_read_timeout")]
    pub read_timeout_in_ms: u64,

    /// Socket write deadline per command in milliseconds
    /// Default: 3000
    #[serde(default = "default_write_timeout")]
    pub write_timeout_in_ms: u64,

    /// Connection pool tuning
    #[serde(default)]
    pub pool: PoolConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum number of connections per endpoint
    /// Default: 10
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// How long a caller waits for a free connection, in milliseconds
    /// Default: read timeout + 1s
    #[serde(default)]
    pub pool_timeout_in_ms: u64,

    /// Idle connections older than this are closed, in milliseconds
    /// Default: 5 minutes
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_in_ms: u64,

    /// Frequency of the idle connection reaper, in milliseconds
    /// Default: 1 minute
    #[serde(default = "default_idle_check_frequency")]
    pub idle_check_frequency_in_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            password: String::new(),
            dial_timeout_in_ms: default_dial_timeout(),
            read_timeout_in_ms: default_read_timeout(),
            write_timeout_in_ms: default_write_timeout(),
            pool: PoolConfig::default(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            pool_timeout_in_ms: 0,
            idle_timeout_in_ms: default_idle_timeout(),
            idle_check_frequency_in_ms: default_idle_check_frequency(),
        }
    }
}

impl ClientConfig {
    pub fn dial_timeout(&self) -> Duration {
        millis_or(self.dial_timeout_in_ms, default_dial_timeout())
    }

    pub fn read_timeout(&self) -> Duration {
        millis_or(self.read_timeout_in_ms, default_read_timeout())
    }

    pub fn write_timeout(&self) -> Duration {
        millis_or(self.write_timeout_in_ms, default_write_timeout())
    }

    pub fn pool_size(&self) -> usize {
        if self.pool.pool_size == 0 {
            default_pool_size()
        } else {
            self.pool.pool_size
        }
    }

    pub fn pool_timeout(&self) -> Duration {
        if self.pool.pool_timeout_in_ms == 0 {
            self.read_timeout() + Duration::from_secs(1)
        } else {
            Duration::from_millis(self.pool.pool_timeout_in_ms)
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        millis_or(self.pool.idle_timeout_in_ms, default_idle_timeout())
    }

    pub fn idle_check_frequency(&self) -> Duration {
        millis_or(
            self.pool.idle_check_frequency_in_ms,
            default_idle_check_frequency(),
        )
    }

    /// Validates timeout relationships
    pub fn validate(&self) -> Result<()> {
        if self.pool.idle_timeout_in_ms != 0
            && self.pool.idle_check_frequency_in_ms != 0
            && self.pool.idle_check_frequency_in_ms > self.pool.idle_timeout_in_ms
        {
            return Err(Error::Config(ConfigError::Message(format!(
                "idle_check_frequency_in_ms {} must not exceed idle_timeout_in_ms {}",
                self.pool.idle_check_frequency_in_ms, self.pool.idle_timeout_in_ms
            ))));
        }
        Ok(())
    }
}

fn millis_or(
    value: u64,
    default: u64,
) -> Duration {
    if value == 0 {
        Duration::from_millis(default)
    } else {
        Duration::from_millis(value)
    }
}

fn default_dial_timeout() -> u64 {
    5000
}
fn default_read_timeout() -> u64 {
    3000
}
fn default_write_timeout() -> u64 {
    3000
}
fn default_pool_size() -> usize {
    10
}
fn default_idle_timeout() -> u64 {
    300_000
}
fn default_idle_check_frequency() -> u64 {
    60_000
}
