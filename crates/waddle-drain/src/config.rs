//! Drain configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! - `WADDLE_DRAIN_CAPACITY`: Drain table size. Default: `4096`
//! - `WADDLE_DRAIN_FALLBACK`: What a reuseport group does when every member is
//!   draining (`hashed`, `first` or `reject`). Default: `hashed`
//! - `WADDLE_DRAIN_POLL_INITIAL_MS`: First delay while waiting for a draining
//!   socket to empty. Default: `50`
//! - `WADDLE_DRAIN_POLL_MAX_MS`: Backoff cap. Default: `1000`
//! - `WADDLE_DRAIN_POLL_ATTEMPTS`: Polls before giving up. Default: `6`
//! - `WADDLE_DRAIN_POLL_ZERO_STREAK`: Consecutive empty polls that count as
//!   drained. Default: `3`

use std::str::FromStr;
#[cfg(unix)]
use std::time::Duration;

use tracing::info;

use crate::error::DrainError;
use crate::group::FallbackPolicy;
use crate::store::{LruDrainStore, DEFAULT_CAPACITY};

#[cfg(unix)]
use crate::socket::EmptyWaitConfig;

/// Drain settings for one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainConfig {
    /// Maximum entries in the drain table.
    pub capacity: usize,
    /// Group behavior when every member is draining.
    pub fallback: FallbackPolicy,
    /// Polling schedule used while waiting for a socket to empty.
    #[cfg(unix)]
    pub empty_wait: EmptyWaitConfig,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            fallback: FallbackPolicy::default(),
            #[cfg(unix)]
            empty_wait: EmptyWaitConfig::default(),
        }
    }
}

impl DrainConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, DrainError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its
    /// value. Unset variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, DrainError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let capacity = parse_var(&lookup, "WADDLE_DRAIN_CAPACITY")?.unwrap_or(defaults.capacity);
        if capacity == 0 {
            return Err(DrainError::InvalidCapacity(capacity));
        }

        let fallback = match lookup("WADDLE_DRAIN_FALLBACK") {
            Some(raw) => raw.parse().map_err(|_| DrainError::InvalidConfig {
                key: "WADDLE_DRAIN_FALLBACK",
                value: raw,
            })?,
            None => defaults.fallback,
        };

        #[cfg(unix)]
        let empty_wait = {
            let base = defaults.empty_wait;
            EmptyWaitConfig {
                initial_backoff: parse_var(&lookup, "WADDLE_DRAIN_POLL_INITIAL_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(base.initial_backoff),
                max_backoff: parse_var(&lookup, "WADDLE_DRAIN_POLL_MAX_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(base.max_backoff),
                max_attempts: parse_nonzero(&lookup, "WADDLE_DRAIN_POLL_ATTEMPTS")?
                    .unwrap_or(base.max_attempts),
                zero_streak: parse_nonzero(&lookup, "WADDLE_DRAIN_POLL_ZERO_STREAK")?
                    .unwrap_or(base.zero_streak),
            }
        };

        Ok(Self {
            capacity,
            fallback,
            #[cfg(unix)]
            empty_wait,
        })
    }

    /// Build the drain table described by this configuration.
    pub fn build_store(&self) -> Result<LruDrainStore, DrainError> {
        LruDrainStore::with_capacity(self.capacity)
    }

    /// Log the current drain configuration.
    pub fn log_config(&self) {
        info!("Drain table capacity: {}", self.capacity);
        info!("All-draining fallback: {}", self.fallback);
        #[cfg(unix)]
        info!(
            initial_ms = self.empty_wait.initial_backoff.as_millis() as u64,
            max_ms = self.empty_wait.max_backoff.as_millis() as u64,
            attempts = self.empty_wait.max_attempts,
            zero_streak = self.empty_wait.zero_streak,
            "Drain wait schedule"
        );
    }
}

fn parse_var<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, DrainError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| DrainError::InvalidConfig { key, value: raw }),
        None => Ok(None),
    }
}

/// Like [`parse_var`], but `0` is rejected.
#[cfg(unix)]
fn parse_nonzero<F>(lookup: &F, key: &'static str) -> Result<Option<u32>, DrainError>
where
    F: Fn(&str) -> Option<String>,
{
    match parse_var::<u32, F>(lookup, key)? {
        Some(0) => Err(DrainError::InvalidConfig {
            key,
            value: "0".to_string(),
        }),
        parsed => Ok(parsed),
    }
}
