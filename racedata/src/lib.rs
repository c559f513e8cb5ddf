pub mod auth;
pub mod blob;
pub mod cache;
pub mod catalog;
pub mod client;
pub mod config;
pub mod metrics_defs;
pub mod ratelimit;
pub mod types;

pub use auth::{AccessToken, TokenClient, TokenError};
pub use cache::{CacheError, CacheLayers, Fetch};
pub use catalog::Catalog;
pub use client::{ClientError, RaceDataClient};
