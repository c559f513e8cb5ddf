//! Key layout of the single table.
//!
//! Timestamps in keys are whole-second unix epochs, zero-padded to a fixed
//! width so that string order and time order agree. Sub-second precision is
//! dropped before a key is derived, so a range query built from the same
//! instants always matches the keys that were written.

use chrono::{DateTime, SubsecRound, Utc};

pub const INFO: &str = "info";
pub const GLOBAL_PK: &str = "global";
pub const COUNTERS_SK: &str = "counters";
pub const LOCK_SK: &str = "ingestion_lock";

pub const SESSION_PREFIX: &str = "session#";
pub const NOTE_PREFIX: &str = "note#";
pub const JOURNAL_PREFIX: &str = "journal#";
pub const WS_PREFIX: &str = "ws#";
pub const CAR_CLASS_PREFIX: &str = "car_class#";
pub const DRIVER_PREFIX: &str = "driver#";

pub fn id_from_time(t: DateTime<Utc>) -> i64 {
    t.timestamp()
}

/// Inverse of [`id_from_time`]. None when `id` is outside chrono's range.
pub fn time_from_id(id: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(id, 0)
}

/// Wide enough for every instant chrono can represent. Instants before the
/// epoch share the zero key; range readers filter on the decoded time.
const EPOCH_KEY_WIDTH: usize = 13;

pub fn epoch_key(secs: i64) -> String {
    format!("{:0width$}", secs.max(0), width = EPOCH_KEY_WIDTH)
}

pub fn truncate(t: DateTime<Utc>) -> DateTime<Utc> {
    t.trunc_subsecs(0)
}

pub fn driver_pk(driver_id: i64) -> String {
    format!("driver#{driver_id}")
}

pub fn session_pk(subsession_id: i64) -> String {
    format!("session#{subsession_id}")
}

pub fn track_pk(track_id: i64) -> String {
    format!("track#{track_id}")
}

pub fn websocket_pk(connection_id: &str) -> String {
    format!("websocket#{connection_id}")
}

pub fn driver_session_sk(start: DateTime<Utc>) -> String {
    format!("{SESSION_PREFIX}{}", epoch_key(id_from_time(start)))
}

pub fn note_sk(at: DateTime<Utc>) -> String {
    format!("{NOTE_PREFIX}{}", epoch_key(id_from_time(at)))
}

pub fn journal_sk(subsession_id: i64) -> String {
    format!("{JOURNAL_PREFIX}{subsession_id}")
}

pub fn ws_sk(connection_id: &str) -> String {
    format!("{WS_PREFIX}{connection_id}")
}

pub fn car_class_sk(car_class_id: i64) -> String {
    format!("{CAR_CLASS_PREFIX}{car_class_id}")
}

pub fn session_driver_sk(driver_id: i64) -> String {
    format!("{DRIVER_PREFIX}{driver_id}")
}

pub fn lap_sk(driver_id: i64, lap_number: i64) -> String {
    format!("{}{lap_number:04}", lap_prefix(driver_id))
}

pub fn lap_prefix(driver_id: i64) -> String {
    format!("lap#{driver_id}#")
}

/// Written once every lap of a driver in a session has been stored.
pub fn laps_marker_sk(driver_id: i64) -> String {
    format!("laps#{driver_id}")
}

pub fn track_session_sk(start: DateTime<Utc>, subsession_id: i64) -> String {
    format!("{SESSION_PREFIX}{}#{subsession_id}", epoch_key(id_from_time(start)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_time_id_round_trip() {
        let t = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert_eq!(time_from_id(id_from_time(t)), Some(t));
    }

    #[test]
    fn test_sub_second_precision_is_dropped() {
        let precise = Utc.timestamp_opt(1_700_000_000, 987_654_321).unwrap();
        let id = id_from_time(precise);
        assert_eq!(id, 1_700_000_000);

        let restored = time_from_id(id).unwrap();
        assert_ne!(restored, precise);
        assert_eq!(restored, truncate(precise));
        assert_eq!(driver_session_sk(precise), driver_session_sk(restored));
    }

    #[test]
    fn test_key_formats() {
        let t = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert_eq!(driver_pk(1001), "driver#1001");
        assert_eq!(driver_session_sk(t), "session#0001700000000");
        assert_eq!(track_session_sk(t, 12345), "session#0001700000000#12345");
        assert_eq!(lap_sk(1001, 7), "lap#1001#0007");
        assert_eq!(laps_marker_sk(1001), "laps#1001");
        assert_eq!(websocket_pk("abc="), "websocket#abc=");
        assert_eq!(ws_sk("abc="), "ws#abc=");
        assert_eq!(journal_sk(12345), "journal#12345");
        assert_eq!(note_sk(t), "note#0001700000000");
    }

    #[test]
    fn test_epoch_keys_sort_by_time() {
        let before_2001 = Utc.timestamp_opt(946_684_800, 0).unwrap();
        let after_2001 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let far_future = Utc.timestamp_opt(253_402_300_799, 0).unwrap();
        assert!(driver_session_sk(before_2001) < driver_session_sk(after_2001));
        assert!(note_sk(after_2001) < note_sk(far_future));
        assert_eq!(epoch_key(-86_400), epoch_key(0));
    }
}
