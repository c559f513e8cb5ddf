//! Payload types returned by the upstream data API.
//!
//! Reference catalog types are also written to the blob cache with bincode, so
//! they must stay self-describing-free: no flattening, no untagged enums, no
//! skipped fields.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type CustId = i64;
pub type SubsessionId = i64;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct MemberInfo {
    pub cust_id: CustId,
    pub display_name: String,
    pub member_since: NaiveDate,
    #[serde(default)]
    pub last_login: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct TrackRef {
    pub track_id: i64,
    pub track_name: String,
    #[serde(default)]
    pub config_name: Option<String>,
}

/// One row of a series result search.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct SeriesResult {
    pub subsession_id: SubsessionId,
    pub session_id: i64,
    pub series_id: i64,
    pub series_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub track: TrackRef,
    #[serde(default)]
    pub event_strength_of_field: i64,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct SubsessionResult {
    pub subsession_id: SubsessionId,
    pub session_id: i64,
    pub series_id: i64,
    pub series_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub track: TrackRef,
    #[serde(default)]
    pub event_strength_of_field: i64,
    #[serde(default)]
    pub license_category: Option<String>,
    #[serde(default)]
    pub official_session: bool,
    #[serde(default)]
    pub car_classes: Vec<CarClassResult>,
    pub session_results: Vec<SimSessionResult>,
}

impl SubsessionResult {
    /// The main event of the subsession. Qualifying and practice carry
    /// negative simsession numbers; the race is always 0.
    pub fn main_event(&self) -> Option<&SimSessionResult> {
        self.session_results
            .iter()
            .find(|session| session.simsession_number == 0)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct CarClassResult {
    pub car_class_id: i64,
    pub short_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub strength_of_field: i64,
    #[serde(default)]
    pub num_entries: i64,
    #[serde(default)]
    pub cars_in_class: Vec<CarInClass>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct CarInClass {
    pub car_id: i64,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct SimSessionResult {
    pub simsession_number: i64,
    pub simsession_type_name: String,
    #[serde(default)]
    pub simsession_name: String,
    pub results: Vec<DriverResult>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct DriverResult {
    pub cust_id: CustId,
    pub display_name: String,
    pub finish_position: i64,
    #[serde(default)]
    pub finish_position_in_class: i64,
    #[serde(default)]
    pub starting_position: i64,
    pub car_id: i64,
    pub car_class_id: i64,
    #[serde(default)]
    pub laps_complete: i64,
    #[serde(default)]
    pub laps_lead: i64,
    #[serde(default)]
    pub incidents: i64,
    /// Ten-thousandths of a second, -1 when no valid lap was set.
    #[serde(default)]
    pub best_lap_time: i64,
    #[serde(default)]
    pub average_lap: i64,
    #[serde(default)]
    pub oldi_rating: i64,
    #[serde(default)]
    pub newi_rating: i64,
    #[serde(default)]
    pub old_sub_level: i64,
    #[serde(default)]
    pub new_sub_level: i64,
    #[serde(default)]
    pub reason_out: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct LapData {
    pub cust_id: CustId,
    pub lap_number: i64,
    #[serde(default)]
    pub flags: i64,
    #[serde(default)]
    pub incident: bool,
    #[serde(default)]
    pub session_time: i64,
    /// Ten-thousandths of a second, -1 for an invalid lap.
    pub lap_time: i64,
    #[serde(default)]
    pub personal_best_lap: bool,
    #[serde(default)]
    pub lap_events: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Track {
    pub track_id: i64,
    pub track_name: String,
    #[serde(default)]
    pub config_name: Option<String>,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub track_config_length: f64,
    #[serde(default)]
    pub corners_per_lap: i64,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Car {
    pub car_id: i64,
    pub car_name: String,
    #[serde(default)]
    pub car_name_abbreviated: String,
    #[serde(default)]
    pub hp: i64,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct TrackAssets {
    pub track_id: i64,
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub logo: Option<String>,
    #[serde(default)]
    pub track_map: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct CarAssets {
    pub car_id: i64,
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub logo: Option<String>,
    #[serde(default)]
    pub small_image: Option<String>,
}

pub type TrackAssetMap = HashMap<String, TrackAssets>;
pub type CarAssetMap = HashMap<String, CarAssets>;

/// `{"link": "<signed url>"}`
#[derive(Debug, Deserialize)]
pub(crate) struct LinkEnvelope {
    pub link: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ChunkInfo {
    pub rows: u64,
    #[serde(default)]
    pub base_download_url: String,
    #[serde(default)]
    pub chunk_file_names: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChunkedData {
    pub success: bool,
    pub chunk_info: ChunkInfo,
}

/// `{"data": {"success": bool, "chunk_info": {...}}}`
#[derive(Debug, Deserialize)]
pub(crate) struct ChunkedEnvelope {
    pub data: ChunkedData,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subsession_main_event() {
        let json = serde_json::json!({
            "subsession_id": 12345,
            "session_id": 99,
            "series_id": 7,
            "series_name": "Skip Barber",
            "start_time": "2023-11-14T22:13:20Z",
            "end_time": "2023-11-14T22:43:20Z",
            "track": {"track_id": 1, "track_name": "Lime Rock"},
            "session_results": [
                {"simsession_number": -1, "simsession_type_name": "Qualifying", "results": []},
                {"simsession_number": 0, "simsession_type_name": "Race", "results": [{
                    "cust_id": 1001, "display_name": "A Driver", "finish_position": 0,
                    "car_id": 1, "car_class_id": 2
                }]}
            ]
        });
        let result: SubsessionResult = serde_json::from_value(json).unwrap();
        let race = result.main_event().unwrap();
        assert_eq!(race.simsession_type_name, "Race");
        assert_eq!(race.results[0].cust_id, 1001);
        assert!(result.car_classes.is_empty());
        assert_eq!(result.start_time.timestamp(), 1700000000);
    }

    #[test]
    fn test_member_since_date() {
        let json = r#"{"cust_id": 1001, "display_name": "A Driver", "member_since": "2015-03-02"}"#;
        let member: MemberInfo = serde_json::from_str(json).unwrap();
        assert_eq!(member.member_since, NaiveDate::from_ymd_opt(2015, 3, 2).unwrap());
        assert_eq!(member.last_login, None);
    }
}
