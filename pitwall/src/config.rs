use ingest::config::{IngestConfig, Listener, NotifyConfig};
use racedata::config::{BlobCacheConfig, UpstreamConfig};
use serde::Deserialize;
use shared::telemetry::{LoggingConfig, MetricsConfig};
use std::fs::File;
use store::config::TableType;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub listener: Listener,
    #[serde(default = "default_admin_listener")]
    pub admin_listener: Listener,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub metrics: Option<MetricsConfig>,
    pub upstream: UpstreamConfig,
    pub blob_cache: BlobCacheConfig,
    /// The in-memory table when absent.
    #[serde(default)]
    pub table: TableType,
    #[serde(default)]
    pub ingest: IngestConfig,
    /// Websocket push is disabled when absent.
    pub notify: Option<NotifyConfig>,
}

fn default_admin_listener() -> Listener {
    Listener {
        host: "127.0.0.1".into(),
        port: 9090,
    }
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data = serde_yaml::from_reader(file)?;

        Ok(data)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;
        if self.listener == self.admin_listener {
            return Err(ConfigError::SharedListener);
        }
        self.upstream.validate()?;
        self.blob_cache.validate()?;
        self.table.validate()?;
        self.ingest.validate()?;
        if let Some(notify) = &self.notify {
            notify.validate()?;
        }
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid upstream config: {0}")]
    Upstream(#[from] racedata::config::ValidationError),
    #[error("invalid table config: {0}")]
    Table(#[from] store::config::ValidationError),
    #[error("invalid service config: {0}")]
    Service(#[from] ingest::config::ValidationError),
    #[error("listener and admin_listener cannot share an address")]
    SharedListener,
}
