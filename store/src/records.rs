//! Records persisted in the table. Each one serializes to the flat attribute
//! map of a single item; timestamps are stored as whole unix seconds.

use crate::errors::StoreError;
use crate::table::Attributes;
use chrono::serde::{ts_seconds, ts_seconds_option};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const LOCKED_UNTIL: &str = "locked_until";
pub const RACES_INGESTED_TO: &str = "races_ingested_to";
pub const INGESTION_BLOCKED_UNTIL: &str = "ingestion_blocked_until";
pub const SESSION_COUNT: &str = "session_count";
pub const LOGIN_COUNT: &str = "login_count";
pub const LAST_LOGIN: &str = "last_login";
pub const DISPLAY_NAME: &str = "display_name";
/// Set on a driver's projection once the race is counted in their `session_count`.
pub const COUNTED: &str = "counted";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Driver {
    pub driver_id: i64,
    pub display_name: String,
    #[serde(with = "ts_seconds")]
    pub member_since: DateTime<Utc>,
    #[serde(with = "ts_seconds")]
    pub first_login: DateTime<Utc>,
    #[serde(default, with = "ts_seconds_option", skip_serializing_if = "Option::is_none")]
    pub last_login: Option<DateTime<Utc>>,
    #[serde(default)]
    pub login_count: i64,
    /// Exclusive upper bound of finish times already ingested.
    #[serde(default, with = "ts_seconds_option", skip_serializing_if = "Option::is_none")]
    pub races_ingested_to: Option<DateTime<Utc>>,
    #[serde(default, with = "ts_seconds_option", skip_serializing_if = "Option::is_none")]
    pub ingestion_blocked_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub session_count: i64,
    #[serde(default)]
    pub entitlements: Vec<String>,
}

/// Profile supplied on login.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NewDriver {
    pub driver_id: i64,
    pub display_name: String,
    #[serde(with = "ts_seconds")]
    pub member_since: DateTime<Utc>,
    #[serde(default)]
    pub entitlements: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IngestionLock {
    pub driver_id: i64,
    #[serde(with = "ts_seconds")]
    pub locked_until: DateTime<Utc>,
}

/// One event. Written last when a race is persisted; its presence means
/// every other record of the race is in place.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub subsession_id: i64,
    pub session_id: i64,
    pub series_id: i64,
    pub series_name: String,
    #[serde(with = "ts_seconds")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "ts_seconds")]
    pub end_time: DateTime<Utc>,
    pub track_id: i64,
    pub track_name: String,
    #[serde(default)]
    pub config_name: Option<String>,
    #[serde(default)]
    pub license_category: Option<String>,
    pub official: bool,
    pub strength_of_field: i64,
    pub num_drivers: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CarClass {
    pub subsession_id: i64,
    pub car_class_id: i64,
    pub short_name: String,
    pub name: String,
    pub strength_of_field: i64,
    pub num_entries: i64,
    pub car_ids: Vec<i64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionDriver {
    pub subsession_id: i64,
    pub driver_id: i64,
    pub display_name: String,
    pub car_id: i64,
    pub car_class_id: i64,
    pub finish_position: i64,
    pub finish_position_in_class: i64,
    pub starting_position: i64,
    pub laps_complete: i64,
    pub laps_lead: i64,
    pub incidents: i64,
    /// Lap times are in ten-thousandths of a second.
    pub best_lap_time: i64,
    pub average_lap: i64,
    pub old_irating: i64,
    pub new_irating: i64,
    pub old_license_level: i64,
    pub new_license_level: i64,
    pub reason_out: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionDriverLap {
    pub subsession_id: i64,
    pub driver_id: i64,
    pub lap_number: i64,
    pub flags: i64,
    pub incident: bool,
    pub session_time: i64,
    pub lap_time: i64,
    pub personal_best: bool,
    #[serde(default)]
    pub lap_events: Vec<String>,
}

/// Driver-scoped projection of one race result, keyed by start time.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DriverSession {
    pub driver_id: i64,
    pub subsession_id: i64,
    #[serde(with = "ts_seconds")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "ts_seconds")]
    pub end_time: DateTime<Utc>,
    pub series_id: i64,
    pub series_name: String,
    pub track_id: i64,
    pub track_name: String,
    pub car_id: i64,
    #[serde(default)]
    pub car_name: Option<String>,
    pub car_class_id: i64,
    pub finish_position: i64,
    pub finish_position_in_class: i64,
    pub starting_position: i64,
    pub incidents: i64,
    pub laps_complete: i64,
    pub old_irating: i64,
    pub new_irating: i64,
    pub strength_of_field: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TrackSession {
    pub track_id: i64,
    pub subsession_id: i64,
    #[serde(with = "ts_seconds")]
    pub start_time: DateTime<Utc>,
    pub series_name: String,
}

/// Everything needed to persist one race.
#[derive(Clone, Debug, PartialEq)]
pub struct RaceRecords {
    pub session: Session,
    pub car_classes: Vec<CarClass>,
    pub drivers: Vec<SessionDriver>,
    pub projections: Vec<DriverSession>,
}

/// A session read back with its children.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct SessionDetail {
    pub session: Session,
    pub car_classes: Vec<CarClass>,
    pub drivers: Vec<SessionDriver>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DriverNote {
    pub driver_id: i64,
    #[serde(with = "ts_seconds")]
    pub timestamp: DateTime<Utc>,
    pub text: String,
    #[serde(default)]
    pub subsession_id: Option<i64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RaceJournalEntry {
    pub driver_id: i64,
    pub subsession_id: i64,
    #[serde(with = "ts_seconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "ts_seconds")]
    pub updated_at: DateTime<Utc>,
    pub notes: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WebSocketConnection {
    pub connection_id: String,
    pub driver_id: i64,
    #[serde(with = "ts_seconds")]
    pub connected_at: DateTime<Utc>,
    #[serde(with = "ts_seconds")]
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GlobalCounters {
    #[serde(default)]
    pub drivers: i64,
    #[serde(default)]
    pub sessions: i64,
    #[serde(default)]
    pub session_drivers: i64,
    #[serde(default)]
    pub laps: i64,
    #[serde(default)]
    pub notes: i64,
    #[serde(default)]
    pub journal_entries: i64,
}

pub(crate) fn to_attributes<T: Serialize>(what: &str, record: &T) -> Result<Attributes, StoreError> {
    let codec_error = |source| StoreError::Codec {
        key: what.to_string(),
        source,
    };
    match serde_json::to_value(record).map_err(codec_error)? {
        Value::Object(map) => Ok(map),
        _ => Err(codec_error(serde::ser::Error::custom(
            "record did not serialize to an object",
        ))),
    }
}

pub(crate) fn from_attributes<T: DeserializeOwned>(
    what: &str,
    attributes: Attributes,
) -> Result<T, StoreError> {
    serde_json::from_value(Value::Object(attributes)).map_err(|source| StoreError::Codec {
        key: what.to_string(),
        source,
    })
}
