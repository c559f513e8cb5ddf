//! Fixtures for exercising ingestion without a live upstream.

use crate::source::RaceSource;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::Mutex;
use racedata::types::{
    Car, CarAssetMap, CarAssets, CarClassResult, CarInClass, DriverResult, LapData, MemberInfo,
    SeriesResult, SimSessionResult, SubsessionResult, Track, TrackAssetMap, TrackAssets, TrackRef,
};
use racedata::{AccessToken, CacheError, ClientError};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use store::testutils::TEST_TRACK_ID;

pub const TEST_CAR_ID: i64 = 67;
pub const TEST_CLASS_ID: i64 = 74;

#[derive(Clone, Copy, Debug)]
pub enum Failure {
    Unavailable,
    Unauthorized,
}

impl Failure {
    fn error(self, what: &str) -> ClientError {
        match self {
            Failure::Unavailable => ClientError::Status {
                status: StatusCode::BAD_GATEWAY,
                url: what.to_string(),
            },
            Failure::Unauthorized => ClientError::Unauthorized,
        }
    }
}

/// An in-memory upstream. Searches answer with every known race the driver
/// took part in whose finish time falls in the requested range.
#[derive(Default)]
pub struct FakeSource {
    races: Mutex<Vec<SubsessionResult>>,
    laps: Mutex<HashMap<(i64, i64), Vec<LapData>>>,
    members: Mutex<HashMap<String, MemberInfo>>,
    failures: Mutex<HashMap<i64, Failure>>,
    search_failure: Mutex<Option<Failure>>,
    searches: Mutex<Vec<(DateTime<Utc>, DateTime<Utc>)>>,
    result_calls: AtomicUsize,
    lap_calls: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_race(&self, race: SubsessionResult) {
        self.races.lock().push(race);
    }

    pub fn add_laps(&self, subsession_id: i64, driver_id: i64, laps: Vec<LapData>) {
        self.laps.lock().insert((subsession_id, driver_id), laps);
    }

    pub fn add_member(&self, token: &str, member: MemberInfo) {
        self.members.lock().insert(token.to_string(), member);
    }

    /// Makes every fetch of one subsession's result fail.
    pub fn fail_result(&self, subsession_id: i64, failure: Failure) {
        self.failures.lock().insert(subsession_id, failure);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
        *self.search_failure.lock() = None;
    }

    pub fn fail_search(&self, failure: Failure) {
        *self.search_failure.lock() = Some(failure);
    }

    /// Finish-time ranges searched so far, in call order.
    pub fn searches(&self) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        self.searches.lock().clone()
    }

    pub fn result_calls(&self) -> usize {
        self.result_calls.load(Ordering::SeqCst)
    }

    pub fn lap_calls(&self) -> usize {
        self.lap_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RaceSource for FakeSource {
    async fn member_info(&self, token: &AccessToken) -> Result<MemberInfo, ClientError> {
        self.members
            .lock()
            .get(token.as_str())
            .cloned()
            .ok_or(ClientError::Unauthorized)
    }

    async fn search_series(
        &self,
        _token: &AccessToken,
        driver_id: i64,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SeriesResult>, ClientError> {
        self.searches.lock().push((begin, end));
        if let Some(failure) = *self.search_failure.lock() {
            return Err(failure.error("/data/results/search_series"));
        }

        Ok(self
            .races
            .lock()
            .iter()
            .filter(|race| race.end_time >= begin && race.end_time < end)
            .filter(|race| {
                race.main_event()
                    .is_some_and(|main| main.results.iter().any(|r| r.cust_id == driver_id))
            })
            .map(series_result)
            .collect())
    }

    async fn subsession_result(
        &self,
        _token: &AccessToken,
        subsession_id: i64,
    ) -> Result<SubsessionResult, ClientError> {
        self.result_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = self.failures.lock().get(&subsession_id) {
            return Err(failure.error("/data/results/get"));
        }
        self.races
            .lock()
            .iter()
            .find(|race| race.subsession_id == subsession_id)
            .cloned()
            .ok_or(ClientError::Status {
                status: StatusCode::NOT_FOUND,
                url: "/data/results/get".into(),
            })
    }

    async fn lap_data(
        &self,
        _token: &AccessToken,
        subsession_id: i64,
        driver_id: i64,
    ) -> Result<Vec<LapData>, ClientError> {
        self.lap_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .laps
            .lock()
            .get(&(subsession_id, driver_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn tracks(&self, _token: &AccessToken) -> Result<Arc<Vec<Track>>, CacheError> {
        Ok(Arc::new(vec![Track {
            track_id: TEST_TRACK_ID,
            track_name: "Summit Point Raceway".into(),
            config_name: None,
            category: "road".into(),
            track_config_length: 2.0,
            corners_per_lap: 10,
        }]))
    }

    async fn cars(&self, _token: &AccessToken) -> Result<Arc<Vec<Car>>, CacheError> {
        Ok(Arc::new(vec![Car {
            car_id: TEST_CAR_ID,
            car_name: "Global Mazda MX-5 Cup".into(),
            car_name_abbreviated: "MX5".into(),
            hp: 155,
        }]))
    }

    async fn track_assets(&self, _token: &AccessToken) -> Result<Arc<TrackAssetMap>, CacheError> {
        let assets = TrackAssets {
            track_id: TEST_TRACK_ID,
            folder: Some("/img/tracks/summit".into()),
            logo: None,
            track_map: Some("/img/tracks/summit/map/".into()),
        };
        Ok(Arc::new(HashMap::from([(TEST_TRACK_ID.to_string(), assets)])))
    }

    async fn car_assets(&self, _token: &AccessToken) -> Result<Arc<CarAssetMap>, CacheError> {
        let assets = CarAssets {
            car_id: TEST_CAR_ID,
            folder: Some("/img/cars/mx5".into()),
            logo: None,
            small_image: Some("mx5_small.jpg".into()),
        };
        Ok(Arc::new(HashMap::from([(TEST_CAR_ID.to_string(), assets)])))
    }
}

fn series_result(race: &SubsessionResult) -> SeriesResult {
    SeriesResult {
        subsession_id: race.subsession_id,
        session_id: race.session_id,
        series_id: race.series_id,
        series_name: race.series_name.clone(),
        start_time: race.start_time,
        end_time: race.end_time,
        track: race.track.clone(),
        event_strength_of_field: race.event_strength_of_field,
    }
}

/// A thirty minute single-class race with the drivers finishing in the order
/// given. The main event comes first, followed by qualifying.
pub fn subsession(subsession_id: i64, start: DateTime<Utc>, drivers: &[i64]) -> SubsessionResult {
    let results: Vec<DriverResult> = drivers
        .iter()
        .enumerate()
        .map(|(i, &cust_id)| DriverResult {
            cust_id,
            display_name: format!("Driver {cust_id}"),
            finish_position: i as i64,
            finish_position_in_class: i as i64,
            starting_position: i as i64,
            car_id: TEST_CAR_ID,
            car_class_id: TEST_CLASS_ID,
            laps_complete: 12,
            laps_lead: 0,
            incidents: 4,
            best_lap_time: 781_234,
            average_lap: 790_411,
            oldi_rating: 1500,
            newi_rating: 1512,
            old_sub_level: 301,
            new_sub_level: 312,
            reason_out: "Running".into(),
        })
        .collect();

    SubsessionResult {
        subsession_id,
        session_id: subsession_id * 10,
        series_id: 139,
        series_name: "Global Mazda MX-5 Fanatec Cup".into(),
        start_time: start,
        end_time: start + Duration::minutes(30),
        track: TrackRef {
            track_id: TEST_TRACK_ID,
            track_name: "Summit Point Raceway".into(),
            config_name: None,
        },
        event_strength_of_field: 1500,
        license_category: Some("road".into()),
        official_session: true,
        car_classes: vec![CarClassResult {
            car_class_id: TEST_CLASS_ID,
            short_name: "MX-5 Cup".into(),
            name: "Mazda MX-5 Cup".into(),
            strength_of_field: 1500,
            num_entries: drivers.len() as i64,
            cars_in_class: vec![CarInClass { car_id: TEST_CAR_ID }],
        }],
        session_results: vec![
            SimSessionResult {
                simsession_number: 0,
                simsession_type_name: "Race".into(),
                simsession_name: "RACE".into(),
                results: results.clone(),
            },
            SimSessionResult {
                simsession_number: -1,
                simsession_type_name: "Open Qualifying".into(),
                simsession_name: "QUALIFY".into(),
                results,
            },
        ],
    }
}

pub fn lap_rows(driver_id: i64, count: i64) -> Vec<LapData> {
    (1..=count)
        .map(|lap_number| LapData {
            cust_id: driver_id,
            lap_number,
            flags: 0,
            incident: false,
            session_time: lap_number * 790_000,
            lap_time: 790_000 + lap_number,
            personal_best_lap: lap_number == count,
            lap_events: Vec::new(),
        })
        .collect()
}

pub fn member(driver_id: i64) -> MemberInfo {
    MemberInfo {
        cust_id: driver_id,
        display_name: format!("Driver {driver_id}"),
        member_since: NaiveDate::from_ymd_opt(2023, 11, 1).unwrap_or_default(),
        last_login: None,
    }
}
