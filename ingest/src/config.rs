use serde::Deserialize;
use std::time::Duration;
use url::Url;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("port cannot be 0")]
    InvalidPort,
    #[error("lock duration cannot be 0")]
    InvalidLockDuration,
    #[error("search window cannot be 0 days")]
    InvalidSearchWindow,
    #[error("run timeout cannot be 0")]
    InvalidRunTimeout,
    #[error("run timeout ({run_timeout_secs}s) must be shorter than the lock duration ({lock_duration_secs}s)")]
    RunOutlivesLock {
        run_timeout_secs: u64,
        lock_duration_secs: u64,
    },
    #[error("websocket ttl cannot be 0")]
    InvalidWebsocketTtl,
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct IngestConfig {
    /// How long one run holds the driver's lock.
    #[serde(default = "default_lock_duration_secs")]
    pub lock_duration_secs: u64,
    /// The upstream caps the finish-time range of a single search.
    #[serde(default = "default_search_window_days")]
    pub search_window_days: u32,
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            lock_duration_secs: default_lock_duration_secs(),
            search_window_days: default_search_window_days(),
            run_timeout_secs: default_run_timeout_secs(),
        }
    }
}

fn default_lock_duration_secs() -> u64 {
    900
}

fn default_search_window_days() -> u32 {
    90
}

fn default_run_timeout_secs() -> u64 {
    600
}

impl IngestConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.lock_duration_secs == 0 {
            return Err(ValidationError::InvalidLockDuration);
        }
        if self.search_window_days == 0 {
            return Err(ValidationError::InvalidSearchWindow);
        }
        if self.run_timeout_secs == 0 {
            return Err(ValidationError::InvalidRunTimeout);
        }
        if self.run_timeout_secs >= self.lock_duration_secs {
            return Err(ValidationError::RunOutlivesLock {
                run_timeout_secs: self.run_timeout_secs,
                lock_duration_secs: self.lock_duration_secs,
            });
        }
        Ok(())
    }

    pub fn lock_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lock_duration_secs as i64)
    }

    pub fn search_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.search_window_days as i64)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct NotifyConfig {
    /// Management endpoint of the websocket gateway.
    pub endpoint: Url,
    #[serde(default = "default_notify_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_websocket_ttl_secs")]
    pub websocket_ttl_secs: u64,
}

fn default_notify_timeout_secs() -> u64 {
    10
}

fn default_websocket_ttl_secs() -> u64 {
    2 * 60 * 60
}

impl NotifyConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.websocket_ttl_secs == 0 {
            return Err(ValidationError::InvalidWebsocketTtl);
        }
        Ok(())
    }
}
