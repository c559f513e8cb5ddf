//! Client for the upstream data API.
//!
//! Every data endpoint answers an authenticated GET with one of two shapes:
//!
//! - linked: `{"link": "<signed url>"}`. The payload is fetched from the signed
//!   URL with a second, unauthenticated GET.
//! - chunked: `{"data": {"success": bool, "chunk_info": {...}}}`, possibly itself
//!   behind a link. Each chunk file is a JSON array; the result is the
//!   concatenation of every chunk in manifest order.
//!
//! There is no retry logic here. A 401 on the authenticated call surfaces as
//! `ClientError::Unauthorized` so the caller can re-authenticate, everything
//! else is returned as-is.

use crate::auth::AccessToken;
use crate::config::UpstreamConfig;
use crate::metrics_defs::{UPSTREAM_CHUNKS_FETCHED, UPSTREAM_REQUEST_DURATION, UPSTREAM_UNAUTHORIZED};
use crate::ratelimit::RateLimit;
use crate::types::{
    Car, CarAssetMap, ChunkInfo, ChunkedEnvelope, CustId, LapData, LinkEnvelope, MemberInfo,
    SeriesResult, SubsessionId, SubsessionResult, Track, TrackAssetMap,
};
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use shared::{counter, histogram};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("upstream rejected the access token")]
    Unauthorized,
    #[error("upstream returned {status} for {url}")]
    Status { status: StatusCode, url: String },
    #[error("request to upstream failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid upstream url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("malformed upstream payload from {url}: {source}")]
    Malformed {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("upstream reported an unsuccessful result for {0}")]
    Unsuccessful(String),
    #[error("manifest for {0} reports rows but lists no chunks")]
    EmptyManifest(String),
    #[error("chunk {index}/{total} failed: {source}")]
    Chunk {
        index: usize,
        total: usize,
        #[source]
        source: Box<ClientError>,
    },
    #[error("chunk task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ClientError {
    /// True when the caller should re-authenticate rather than retry.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ClientError::Unauthorized)
    }
}

pub struct RaceDataClient {
    client: reqwest::Client,
    base_url: Url,
    last_rate_limit: Mutex<Option<RateLimit>>,
}

impl RaceDataClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self::with_client(client, config.base_url.clone()))
    }

    pub fn with_client(client: reqwest::Client, base_url: Url) -> Self {
        RaceDataClient {
            client,
            base_url,
            last_rate_limit: Mutex::new(None),
        }
    }

    /// Quota reported by the most recent authenticated response, if any.
    pub fn rate_limit(&self) -> Option<RateLimit> {
        *self.last_rate_limit.lock()
    }

    pub async fn member_info(&self, token: &AccessToken) -> Result<MemberInfo, ClientError> {
        self.get_linked("/data/member/info", &[], token).await
    }

    /// Official results for `cust_id` with a finish time in `[begin, end)`.
    pub async fn search_series(
        &self,
        token: &AccessToken,
        cust_id: CustId,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SeriesResult>, ClientError> {
        let query = [
            ("cust_id", cust_id.to_string()),
            ("finish_range_begin", begin.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("finish_range_end", end.to_rfc3339_opts(SecondsFormat::Secs, true)),
        ];
        self.get_chunked("/data/results/search_series", &query, token)
            .await
    }

    pub async fn subsession_result(
        &self,
        token: &AccessToken,
        subsession_id: SubsessionId,
    ) -> Result<SubsessionResult, ClientError> {
        let query = [("subsession_id", subsession_id.to_string())];
        self.get_linked("/data/results/get", &query, token).await
    }

    /// Main event laps of one driver in one subsession.
    pub async fn lap_data(
        &self,
        token: &AccessToken,
        subsession_id: SubsessionId,
        cust_id: CustId,
    ) -> Result<Vec<LapData>, ClientError> {
        let query = [
            ("subsession_id", subsession_id.to_string()),
            ("simsession_number", "0".to_string()),
            ("cust_id", cust_id.to_string()),
        ];
        self.get_chunked("/data/results/lap_data", &query, token)
            .await
    }

    pub async fn tracks(&self, token: &AccessToken) -> Result<Vec<Track>, ClientError> {
        self.get_linked("/data/track/get", &[], token).await
    }

    pub async fn cars(&self, token: &AccessToken) -> Result<Vec<Car>, ClientError> {
        self.get_linked("/data/car/get", &[], token).await
    }

    pub async fn track_assets(&self, token: &AccessToken) -> Result<TrackAssetMap, ClientError> {
        self.get_linked("/data/track/assets", &[], token).await
    }

    pub async fn car_assets(&self, token: &AccessToken) -> Result<CarAssetMap, ClientError> {
        self.get_linked("/data/car/assets", &[], token).await
    }

    /// Resolves a linked response into its payload.
    pub async fn get_linked<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        token: &AccessToken,
    ) -> Result<T, ClientError> {
        let (url, body) = self.get_authenticated(path, query, token).await?;
        let envelope: LinkEnvelope = decode(&url, &body)?;
        let payload = self.get_unauthenticated(&envelope.link).await?;
        decode(&envelope.link, &payload)
    }

    /// Resolves a chunked response into the concatenation of all its chunks.
    pub async fn get_chunked<T: DeserializeOwned + Send + 'static>(
        &self,
        path: &str,
        query: &[(&str, String)],
        token: &AccessToken,
    ) -> Result<Vec<T>, ClientError> {
        let (mut url, mut body) = self.get_authenticated(path, query, token).await?;

        if let Ok(envelope) = serde_json::from_slice::<LinkEnvelope>(&body) {
            body = self.get_unauthenticated(&envelope.link).await?;
            url = envelope.link;
        }

        let envelope: ChunkedEnvelope = decode(&url, &body)?;
        if !envelope.data.success {
            return Err(ClientError::Unsuccessful(redact(&url)));
        }

        let info = envelope.data.chunk_info;
        if info.rows == 0 {
            return Ok(Vec::new());
        }
        if info.chunk_file_names.is_empty() {
            return Err(ClientError::EmptyManifest(redact(&url)));
        }

        self.fetch_chunks(info).await
    }

    /// Downloads every chunk concurrently and concatenates them in manifest order.
    /// The first failing chunk aborts the remaining downloads.
    async fn fetch_chunks<T: DeserializeOwned + Send + 'static>(
        &self,
        info: ChunkInfo,
    ) -> Result<Vec<T>, ClientError> {
        let total = info.chunk_file_names.len();
        let mut join_set = JoinSet::new();

        for (index, name) in info.chunk_file_names.iter().enumerate() {
            let client = self.client.clone();
            let url = format!("{}{}", info.base_download_url, name);
            join_set.spawn(async move {
                let page = fetch_unauthenticated(&client, &url)
                    .await
                    .and_then(|body| decode::<Vec<T>>(&url, &body));
                (index, page)
            });
        }

        let mut pages: Vec<Option<Vec<T>>> = (0..total).map(|_| None).collect();

        while let Some(joined) = join_set.join_next().await {
            let (index, page) = joined?;
            match page {
                Ok(rows) => pages[index] = Some(rows),
                Err(e) => {
                    tracing::warn!(chunk = index + 1, total, error = %e, "chunk download failed");
                    return Err(ClientError::Chunk {
                        index: index + 1,
                        total,
                        source: Box::new(e),
                    });
                }
            }
        }

        counter!(UPSTREAM_CHUNKS_FETCHED).increment(total as u64);
        Ok(pages.into_iter().flatten().flatten().collect())
    }

    async fn get_authenticated(
        &self,
        path: &str,
        query: &[(&str, String)],
        token: &AccessToken,
    ) -> Result<(String, Bytes), ClientError> {
        let url = self.base_url.join(path)?;
        let started = Instant::now();

        let response = self
            .client
            .get(url.clone())
            .bearer_auth(token.as_str())
            .query(query)
            .send()
            .await?;

        let status = response.status();
        histogram!(UPSTREAM_REQUEST_DURATION, "status" => status.as_u16().to_string())
            .record(started.elapsed().as_secs_f64());

        if let Some(rate_limit) = RateLimit::from_headers(response.headers()) {
            rate_limit.observe();
            *self.last_rate_limit.lock() = Some(rate_limit);
        }

        if status == StatusCode::UNAUTHORIZED {
            counter!(UPSTREAM_UNAUTHORIZED).increment(1);
            return Err(ClientError::Unauthorized);
        }
        if !status.is_success() {
            return Err(ClientError::Status {
                status,
                url: url.to_string(),
            });
        }

        Ok((url.to_string(), response.bytes().await?))
    }

    async fn get_unauthenticated(&self, url: &str) -> Result<Bytes, ClientError> {
        fetch_unauthenticated(&self.client, url).await
    }
}

async fn fetch_unauthenticated(client: &reqwest::Client, url: &str) -> Result<Bytes, ClientError> {
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(ClientError::Status {
            status,
            url: redact(url),
        });
    }
    Ok(response.bytes().await?)
}

fn decode<T: DeserializeOwned>(url: &str, body: &[u8]) -> Result<T, ClientError> {
    serde_json::from_slice(body).map_err(|source| ClientError::Malformed {
        url: redact(url),
        source,
    })
}

// Signed URLs carry credentials in the query string.
fn redact(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.to_string()
        }
        Err(_) => url.split('?').next().unwrap_or_default().to_string(),
    }
}
