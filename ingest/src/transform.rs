//! Upstream payloads to store records.
//!
//! A result that cannot be represented faithfully is rejected as a whole;
//! nothing is dropped silently.

use crate::errors::IngestError;
use racedata::types::{LapData, SubsessionResult};
use std::collections::{HashMap, HashSet};
use store::keys::truncate;
use store::records::{
    CarClass, DriverSession, RaceRecords, Session, SessionDriver, SessionDriverLap,
};

/// Builds every record of a race. `car_names` denormalizes car names into the
/// driver projections; unknown cars are left unnamed.
pub fn race_records(
    result: &SubsessionResult,
    car_names: &HashMap<i64, String>,
) -> Result<RaceRecords, IngestError> {
    let subsession_id = result.subsession_id;
    let main_event = result
        .main_event()
        .ok_or_else(|| IngestError::malformed(subsession_id, "no main event"))?;
    if main_event.results.is_empty() {
        return Err(IngestError::malformed(subsession_id, "main event has no drivers"));
    }

    let start_time = truncate(result.start_time);
    let end_time = truncate(result.end_time);
    if end_time < start_time {
        return Err(IngestError::malformed(subsession_id, "race ends before it starts"));
    }

    let session = Session {
        subsession_id,
        session_id: result.session_id,
        series_id: result.series_id,
        series_name: result.series_name.clone(),
        start_time,
        end_time,
        track_id: result.track.track_id,
        track_name: result.track.track_name.clone(),
        config_name: result.track.config_name.clone(),
        license_category: result.license_category.clone(),
        official: result.official_session,
        strength_of_field: result.event_strength_of_field,
        num_drivers: main_event.results.len() as i64,
    };

    let mut class_ids = HashSet::new();
    let mut car_classes = Vec::with_capacity(result.car_classes.len());
    for class in &result.car_classes {
        if !class_ids.insert(class.car_class_id) {
            return Err(IngestError::malformed(
                subsession_id,
                format!("car class {} listed twice", class.car_class_id),
            ));
        }
        car_classes.push(CarClass {
            subsession_id,
            car_class_id: class.car_class_id,
            short_name: class.short_name.clone(),
            name: class.name.clone(),
            strength_of_field: class.strength_of_field,
            num_entries: class.num_entries,
            car_ids: class.cars_in_class.iter().map(|c| c.car_id).collect(),
        });
    }

    let mut driver_ids = HashSet::new();
    let mut drivers = Vec::with_capacity(main_event.results.len());
    for row in &main_event.results {
        if !driver_ids.insert(row.cust_id) {
            return Err(IngestError::malformed(
                subsession_id,
                format!("driver {} listed twice", row.cust_id),
            ));
        }
        drivers.push(SessionDriver {
            subsession_id,
            driver_id: row.cust_id,
            display_name: row.display_name.clone(),
            car_id: row.car_id,
            car_class_id: row.car_class_id,
            finish_position: row.finish_position,
            finish_position_in_class: row.finish_position_in_class,
            starting_position: row.starting_position,
            laps_complete: row.laps_complete,
            laps_lead: row.laps_lead,
            incidents: row.incidents,
            best_lap_time: row.best_lap_time,
            average_lap: row.average_lap,
            old_irating: row.oldi_rating,
            new_irating: row.newi_rating,
            old_license_level: row.old_sub_level,
            new_license_level: row.new_sub_level,
            reason_out: row.reason_out.clone(),
        });
    }

    let projections = drivers
        .iter()
        .map(|driver| projection(&session, driver, car_names.get(&driver.car_id).cloned()))
        .collect();

    Ok(RaceRecords {
        session,
        car_classes,
        drivers,
        projections,
    })
}

/// The driver-scoped view of one result.
pub fn projection(
    session: &Session,
    driver: &SessionDriver,
    car_name: Option<String>,
) -> DriverSession {
    DriverSession {
        driver_id: driver.driver_id,
        subsession_id: session.subsession_id,
        start_time: session.start_time,
        end_time: session.end_time,
        series_id: session.series_id,
        series_name: session.series_name.clone(),
        track_id: session.track_id,
        track_name: session.track_name.clone(),
        car_id: driver.car_id,
        car_name,
        car_class_id: driver.car_class_id,
        finish_position: driver.finish_position,
        finish_position_in_class: driver.finish_position_in_class,
        starting_position: driver.starting_position,
        incidents: driver.incidents,
        laps_complete: driver.laps_complete,
        old_irating: driver.old_irating,
        new_irating: driver.new_irating,
        strength_of_field: session.strength_of_field,
    }
}

/// One driver's laps. Every lap must belong to `driver_id` and lap numbers
/// must be unique.
pub fn laps(
    subsession_id: i64,
    driver_id: i64,
    rows: &[LapData],
) -> Result<Vec<SessionDriverLap>, IngestError> {
    let mut seen = HashSet::new();
    let mut laps = Vec::with_capacity(rows.len());
    for row in rows {
        if row.cust_id != driver_id {
            return Err(IngestError::malformed(
                subsession_id,
                format!("lap data for driver {} requested {driver_id}", row.cust_id),
            ));
        }
        if !seen.insert(row.lap_number) {
            return Err(IngestError::malformed(
                subsession_id,
                format!("lap {} listed twice", row.lap_number),
            ));
        }
        laps.push(SessionDriverLap {
            subsession_id,
            driver_id,
            lap_number: row.lap_number,
            flags: row.flags,
            incident: row.incident,
            session_time: row.session_time,
            lap_time: row.lap_time,
            personal_best: row.personal_best_lap,
            lap_events: row.lap_events.clone(),
        });
    }
    laps.sort_by_key(|lap| lap.lap_number);
    Ok(laps)
}
