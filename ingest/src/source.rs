//! The upstream operations ingestion depends on, behind one seam so runs can be
//! exercised without a live upstream.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use racedata::types::{
    Car, CarAssetMap, LapData, MemberInfo, SeriesResult, SubsessionResult, Track, TrackAssetMap,
};
use racedata::{AccessToken, CacheError, Catalog, ClientError, RaceDataClient};
use std::sync::Arc;

#[async_trait]
pub trait RaceSource: Send + Sync {
    async fn member_info(&self, token: &AccessToken) -> Result<MemberInfo, ClientError>;

    async fn search_series(
        &self,
        token: &AccessToken,
        driver_id: i64,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SeriesResult>, ClientError>;

    async fn subsession_result(
        &self,
        token: &AccessToken,
        subsession_id: i64,
    ) -> Result<SubsessionResult, ClientError>;

    async fn lap_data(
        &self,
        token: &AccessToken,
        subsession_id: i64,
        driver_id: i64,
    ) -> Result<Vec<LapData>, ClientError>;

    async fn tracks(&self, token: &AccessToken) -> Result<Arc<Vec<Track>>, CacheError>;

    async fn cars(&self, token: &AccessToken) -> Result<Arc<Vec<Car>>, CacheError>;

    async fn track_assets(&self, token: &AccessToken) -> Result<Arc<TrackAssetMap>, CacheError>;

    async fn car_assets(&self, token: &AccessToken) -> Result<Arc<CarAssetMap>, CacheError>;
}

/// Live upstream: data calls go straight to the client, catalogs through the
/// reference caches.
pub struct UpstreamSource {
    client: Arc<RaceDataClient>,
    catalog: Arc<Catalog>,
}

impl UpstreamSource {
    pub fn new(client: Arc<RaceDataClient>, catalog: Arc<Catalog>) -> Self {
        UpstreamSource { client, catalog }
    }
}

#[async_trait]
impl RaceSource for UpstreamSource {
    async fn member_info(&self, token: &AccessToken) -> Result<MemberInfo, ClientError> {
        self.client.member_info(token).await
    }

    async fn search_series(
        &self,
        token: &AccessToken,
        driver_id: i64,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SeriesResult>, ClientError> {
        self.client.search_series(token, driver_id, begin, end).await
    }

    async fn subsession_result(
        &self,
        token: &AccessToken,
        subsession_id: i64,
    ) -> Result<SubsessionResult, ClientError> {
        self.client.subsession_result(token, subsession_id).await
    }

    async fn lap_data(
        &self,
        token: &AccessToken,
        subsession_id: i64,
        driver_id: i64,
    ) -> Result<Vec<LapData>, ClientError> {
        self.client.lap_data(token, subsession_id, driver_id).await
    }

    async fn tracks(&self, token: &AccessToken) -> Result<Arc<Vec<Track>>, CacheError> {
        self.catalog.tracks(token).await
    }

    async fn cars(&self, token: &AccessToken) -> Result<Arc<Vec<Car>>, CacheError> {
        self.catalog.cars(token).await
    }

    async fn track_assets(&self, token: &AccessToken) -> Result<Arc<TrackAssetMap>, CacheError> {
        self.catalog.track_assets(token).await
    }

    async fn car_assets(&self, token: &AccessToken) -> Result<Arc<CarAssetMap>, CacheError> {
        self.catalog.car_assets(token).await
    }
}
