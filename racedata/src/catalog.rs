use crate::auth::AccessToken;
use crate::cache::{CacheError, CacheLayers, Fetch, FetchFn, MemoryCache};
use crate::client::RaceDataClient;
use crate::types::{Car, CarAssetMap, Track, TrackAssetMap};
use std::sync::Arc;

pub const TRACKS_KEY: &str = "catalog/tracks";
pub const CARS_KEY: &str = "catalog/cars";
pub const TRACK_ASSETS_KEY: &str = "catalog/track_assets";
pub const CAR_ASSETS_KEY: &str = "catalog/car_assets";

/// Global reference data, each kind behind its own memory, blob and remote
/// chain.
pub struct Catalog {
    tracks: MemoryCache<Vec<Track>>,
    cars: MemoryCache<Vec<Car>>,
    track_assets: MemoryCache<TrackAssetMap>,
    car_assets: MemoryCache<CarAssetMap>,
}

impl Catalog {
    pub fn new(client: Arc<RaceDataClient>, layers: &CacheLayers) -> Self {
        let tracks = {
            let client = client.clone();
            FetchFn(move |token: AccessToken| {
                let client = client.clone();
                async move { client.tracks(&token).await }
            })
        };
        let cars = {
            let client = client.clone();
            FetchFn(move |token: AccessToken| {
                let client = client.clone();
                async move { client.cars(&token).await }
            })
        };
        let track_assets = {
            let client = client.clone();
            FetchFn(move |token: AccessToken| {
                let client = client.clone();
                async move { client.track_assets(&token).await }
            })
        };
        let car_assets = FetchFn(move |token: AccessToken| {
            let client = client.clone();
            async move { client.car_assets(&token).await }
        });

        Catalog {
            tracks: layers.wrap(TRACKS_KEY, Box::new(tracks)),
            cars: layers.wrap(CARS_KEY, Box::new(cars)),
            track_assets: layers.wrap(TRACK_ASSETS_KEY, Box::new(track_assets)),
            car_assets: layers.wrap(CAR_ASSETS_KEY, Box::new(car_assets)),
        }
    }

    pub async fn tracks(&self, token: &AccessToken) -> Result<Arc<Vec<Track>>, CacheError> {
        self.tracks.fetch(token).await
    }

    pub async fn cars(&self, token: &AccessToken) -> Result<Arc<Vec<Car>>, CacheError> {
        self.cars.fetch(token).await
    }

    pub async fn track_assets(&self, token: &AccessToken) -> Result<Arc<TrackAssetMap>, CacheError> {
        self.track_assets.fetch(token).await
    }

    pub async fn car_assets(&self, token: &AccessToken) -> Result<Arc<CarAssetMap>, CacheError> {
        self.car_assets.fetch(token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::config::{BlobCacheConfig, BlobStoreType, Compression};
    use serde_json::json;
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_catalog_is_fetched_once_and_persisted() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/data/car/get"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "link": format!("{}/signed/cars", server.uri()) })),
            )
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/signed/cars"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "car_id": 67, "car_name": "Global Mazda MX-5 Cup", "car_name_abbreviated": "MX5", "hp": 155 },
                { "car_id": 132, "car_name": "BMW M4 GT3", "car_name_abbreviated": "M4 GT3", "hp": 502 }
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let client = Arc::new(RaceDataClient::with_client(
            reqwest::Client::new(),
            Url::parse(&server.uri()).unwrap(),
        ));
        let store = Arc::new(MemoryBlobStore::new());
        let layers = CacheLayers::new(
            store.clone(),
            BlobCacheConfig {
                r#type: BlobStoreType::Memory,
                ttl_secs: 3600,
                compression: Compression::Zstd1,
            },
        );
        let catalog = Catalog::new(client.clone(), &layers);
        let token = AccessToken::new("tok");

        let cars = catalog.cars(&token).await.unwrap();
        assert_eq!(cars.len(), 2);
        assert_eq!(cars[1].car_name, "BMW M4 GT3");
        assert_eq!(catalog.cars(&token).await.unwrap().len(), 2);
        assert!(store.contains(CARS_KEY));

        // A new process with the same blob store does not go upstream.
        let restarted = Catalog::new(client, &layers);
        assert_eq!(restarted.cars(&token).await.unwrap().len(), 2);
    }
}
