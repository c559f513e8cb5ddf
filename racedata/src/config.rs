use serde::Deserialize;
use url::Url;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("client_id cannot be empty")]
    EmptyClientId,
    #[error("request timeout cannot be 0")]
    InvalidTimeout,
    #[error("blob cache ttl cannot be 0")]
    InvalidTtl,
    #[error("blob cache base_dir cannot be empty")]
    EmptyBaseDir,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct OAuthConfig {
    pub token_url: Url,
    pub client_id: String,
    pub client_secret: String,
    /// Only needed for the authorization-code flow.
    pub redirect_uri: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    /// Base URL of the data API, e.g. `https://members-ng.iracing.com`.
    pub base_url: Url,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    pub oauth: OAuthConfig,
}

fn default_timeout_secs() -> u64 {
    30
}

impl UpstreamConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.oauth.client_id.trim().is_empty() {
            return Err(ValidationError::EmptyClientId);
        }
        if self.timeout_secs == 0 {
            return Err(ValidationError::InvalidTimeout);
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    None,
    #[default]
    Zstd1,
    Zstd3,
}

impl Compression {
    pub fn zstd_level(&self) -> Option<i32> {
        match self {
            Compression::None => None,
            Compression::Zstd1 => Some(1),
            Compression::Zstd3 => Some(3),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum BlobStoreType {
    Filesystem { base_dir: String },
    Memory,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct BlobCacheConfig {
    #[serde(flatten)]
    pub r#type: BlobStoreType,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default)]
    pub compression: Compression,
}

fn default_ttl_secs() -> u64 {
    24 * 60 * 60
}

impl BlobCacheConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.ttl_secs == 0 {
            return Err(ValidationError::InvalidTtl);
        }
        if let BlobStoreType::Filesystem { base_dir } = &self.r#type
            && base_dir.is_empty()
        {
            return Err(ValidationError::EmptyBaseDir);
        }
        Ok(())
    }
}
