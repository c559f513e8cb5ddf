//! Race persistence.
//!
//! A race is written as a sequence of transactions. Every child record goes
//! first as a plain attribute upsert, which is safe to replay. The final
//! transaction carries the session's `info` record as a conditional insert
//! together with the counter increments and the ingesting driver's own
//! projection, so a race only "exists" once all of its records do. A retry
//! after a partial failure rewrites the earlier batches harmlessly and then
//! either commits or finds the race already there.

use crate::drivers::driver_key;
use crate::errors::translate;
use crate::keys::{
    self, CAR_CLASS_PREFIX, DRIVER_PREFIX, INFO, SESSION_PREFIX, car_class_sk,
    driver_session_sk, laps_marker_sk, lap_prefix, lap_sk, session_driver_sk, session_pk,
    track_pk, track_session_sk,
};
use crate::records::{
    COUNTED, CarClass, DriverSession, RaceRecords, SESSION_COUNT, Session, SessionDetail,
    SessionDriver, SessionDriverLap, TrackSession, from_attributes, to_attributes,
};
use crate::table::{Attributes, Condition, Key, Order, SortKeyRange, TableError, WriteOp};
use crate::{Store, StoreError, increment_counters, into_batches};
use chrono::{DateTime, Utc};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PersistOutcome {
    /// The race was new and is now stored.
    Created,
    /// The race was already stored by another driver's run; it is now
    /// counted for this driver too.
    Linked,
    /// Nothing to do.
    AlreadyIngested,
}

fn projection_key(projection: &DriverSession) -> Key {
    Key::new(
        keys::driver_pk(projection.driver_id),
        driver_session_sk(projection.start_time),
    )
}

fn counted_projection(projection: &DriverSession) -> Result<Attributes, StoreError> {
    let mut attributes = to_attributes("driver session", projection)?;
    attributes.insert(COUNTED.into(), Value::Bool(true));
    Ok(attributes)
}

impl Store {
    /// Persists one race on behalf of `driver_id`.
    pub async fn persist_race(
        &self,
        driver_id: i64,
        race: &RaceRecords,
    ) -> Result<PersistOutcome, StoreError> {
        let subsession_id = race.session.subsession_id;
        let pk = session_pk(subsession_id);

        let mut children = Vec::new();
        for class in &race.car_classes {
            children.push(WriteOp::upsert(
                Key::new(pk.clone(), car_class_sk(class.car_class_id)),
                to_attributes("car class", class)?,
            ));
        }
        for driver in &race.drivers {
            children.push(WriteOp::upsert(
                Key::new(pk.clone(), session_driver_sk(driver.driver_id)),
                to_attributes("session driver", driver)?,
            ));
        }

        let mut own_projection = None;
        for projection in &race.projections {
            if projection.driver_id == driver_id {
                own_projection = Some(projection);
                continue;
            }
            // Upserts leave another driver's `counted` flag untouched.
            children.push(WriteOp::upsert(
                projection_key(projection),
                to_attributes("driver session", projection)?,
            ));
        }

        let track_session = TrackSession {
            track_id: race.session.track_id,
            subsession_id,
            start_time: race.session.start_time,
            series_name: race.session.series_name.clone(),
        };
        children.push(WriteOp::upsert(
            Key::new(
                track_pk(race.session.track_id),
                track_session_sk(race.session.start_time, subsession_id),
            ),
            to_attributes("track session", &track_session)?,
        ));

        let mut commit = vec![
            WriteOp::insert(Key::new(pk.clone(), INFO), to_attributes("session", &race.session)?),
            increment_counters(&[
                ("sessions", 1),
                ("session_drivers", race.drivers.len() as i64),
            ]),
        ];
        if let Some(projection) = own_projection {
            commit.push(WriteOp::upsert(
                projection_key(projection),
                counted_projection(projection)?,
            ));
            commit.push(
                WriteOp::increment(driver_key(driver_id), vec![(SESSION_COUNT.into(), 1)])
                    .with_condition(Condition::KeyExists),
            );
        }

        match self.transact_batches(into_batches(children, commit)).await {
            Ok(()) => {
                tracing::info!(driver_id, subsession_id, "persisted race");
                Ok(PersistOutcome::Created)
            }
            Err(e) if e.is_already_exists() => {
                let linked = match own_projection {
                    Some(projection) => self.link_driver_session(projection).await?,
                    None => false,
                };
                if linked {
                    tracing::info!(driver_id, subsession_id, "linked existing race");
                    Ok(PersistOutcome::Linked)
                } else {
                    tracing::debug!(driver_id, subsession_id, "race already ingested");
                    Ok(PersistOutcome::AlreadyIngested)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Counts an already stored race for the projection's driver. Returns
    /// false when it was counted before.
    pub async fn link_driver_session(&self, projection: &DriverSession) -> Result<bool, StoreError> {
        let ops = vec![
            WriteOp::upsert(projection_key(projection), counted_projection(projection)?)
                .with_condition(Condition::AttrNotExists(COUNTED.into())),
            WriteOp::increment(
                driver_key(projection.driver_id),
                vec![(SESSION_COUNT.into(), 1)],
            )
            .with_condition(Condition::KeyExists),
        ];

        match self.table.transact(ops).await {
            Ok(()) => Ok(true),
            Err(e @ TableError::TransactionCanceled { .. }) => match e.failed_item() {
                Some(0) => Ok(false),
                Some(_) => Err(StoreError::DriverNotFound(projection.driver_id)),
                None => Err(translate(e)),
            },
            Err(e) => Err(translate(e)),
        }
    }

    /// True once the race's final transaction has committed.
    pub async fn session_exists(&self, subsession_id: i64) -> Result<bool, StoreError> {
        Ok(self
            .table
            .get(&Key::new(session_pk(subsession_id), INFO))
            .await
            .map_err(translate)?
            .is_some())
    }

    /// The driver's races that started in `[from, to)`, newest first.
    pub async fn get_driver_sessions(
        &self,
        driver_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DriverSession>, StoreError> {
        let (from, to) = (keys::truncate(from), keys::truncate(to));
        if from >= to {
            return Ok(Vec::new());
        }

        let range = SortKeyRange::Between(
            driver_session_sk(from),
            format!("{SESSION_PREFIX}{}", keys::epoch_key(keys::id_from_time(to) - 1)),
        );
        let sessions: Vec<DriverSession> = self
            .query_records(&keys::driver_pk(driver_id), range, Order::Descending)
            .await?;

        // Pre-epoch starts share one key; drop anything whose decoded start
        // time falls outside the range.
        Ok(sessions
            .into_iter()
            .filter(|s| s.start_time >= from && s.start_time < to)
            .collect())
    }

    /// Sessions held at a track that started in `[from, to)`, oldest first.
    pub async fn get_track_sessions(
        &self,
        track_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TrackSession>, StoreError> {
        let (from, to) = (keys::truncate(from), keys::truncate(to));
        if from >= to {
            return Ok(Vec::new());
        }

        // "session#<to>" sorts before every "session#<to>#<id>" key.
        let range = SortKeyRange::Between(
            format!("{SESSION_PREFIX}{}", keys::epoch_key(keys::id_from_time(from))),
            format!("{SESSION_PREFIX}{}", keys::epoch_key(keys::id_from_time(to))),
        );
        let sessions: Vec<TrackSession> = self
            .query_records(&track_pk(track_id), range, Order::Ascending)
            .await?;
        Ok(sessions
            .into_iter()
            .filter(|s| s.start_time >= from && s.start_time < to)
            .collect())
    }

    /// A committed session with its car classes and drivers.
    pub async fn get_session(&self, subsession_id: i64) -> Result<Option<SessionDetail>, StoreError> {
        let items = self
            .table
            .query(&session_pk(subsession_id), SortKeyRange::All, Order::Ascending)
            .await
            .map_err(translate)?;

        let mut session: Option<Session> = None;
        let mut car_classes: Vec<CarClass> = Vec::new();
        let mut drivers: Vec<SessionDriver> = Vec::new();
        for item in items {
            let what = format!("{}/{}", item.key.pk, item.key.sk);
            if item.key.sk == INFO {
                session = Some(from_attributes(&what, item.attributes)?);
            } else if item.key.sk.starts_with(CAR_CLASS_PREFIX) {
                car_classes.push(from_attributes(&what, item.attributes)?);
            } else if item.key.sk.starts_with(DRIVER_PREFIX) {
                drivers.push(from_attributes(&what, item.attributes)?);
            }
        }

        drivers.sort_by_key(|d| d.finish_position);
        Ok(session.map(|session| SessionDetail {
            session,
            car_classes,
            drivers,
        }))
    }

    /// Stores one driver's laps of a session. Returns false when they were
    /// already stored.
    pub async fn persist_laps(
        &self,
        subsession_id: i64,
        driver_id: i64,
        laps: &[SessionDriverLap],
    ) -> Result<bool, StoreError> {
        let pk = session_pk(subsession_id);

        let mut children = Vec::with_capacity(laps.len());
        for lap in laps {
            children.push(WriteOp::upsert(
                Key::new(pk.clone(), lap_sk(driver_id, lap.lap_number)),
                to_attributes("lap", lap)?,
            ));
        }

        let mut marker = Attributes::new();
        marker.insert("driver_id".into(), Value::from(driver_id));
        marker.insert("lap_count".into(), Value::from(laps.len()));
        let commit = vec![
            WriteOp::insert(Key::new(pk, laps_marker_sk(driver_id)), marker),
            increment_counters(&[("laps", laps.len() as i64)]),
        ];

        match self.transact_batches(into_batches(children, commit)).await {
            Ok(()) => {
                tracing::info!(driver_id, subsession_id, laps = laps.len(), "persisted laps");
                Ok(true)
            }
            Err(e) if e.is_already_exists() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Laps of one driver in one session, or None when they have not been
    /// loaded yet.
    pub async fn get_laps(
        &self,
        subsession_id: i64,
        driver_id: i64,
    ) -> Result<Option<Vec<SessionDriverLap>>, StoreError> {
        let pk = session_pk(subsession_id);
        let marker = self
            .table
            .get(&Key::new(pk.clone(), laps_marker_sk(driver_id)))
            .await
            .map_err(translate)?;
        if marker.is_none() {
            return Ok(None);
        }

        let laps = self
            .query_records(
                &pk,
                SortKeyRange::BeginsWith(lap_prefix(driver_id)),
                Order::Ascending,
            )
            .await?;
        Ok(Some(laps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryTable;
    use crate::records::NewDriver;
    use crate::table::{Table, TableError};
    use crate::testutils::{FaultyTable, TEST_TRACK_ID, race_records};
    use chrono::TimeZone;
    use std::sync::Arc;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    async fn store_with_drivers(table: Arc<dyn Table>, drivers: &[i64]) -> Store {
        let store = Store::new(table);
        for &driver_id in drivers {
            store
                .record_login(
                    &NewDriver {
                        driver_id,
                        display_name: format!("Driver {driver_id}"),
                        member_since: t(1_600_000_000),
                        entitlements: vec![],
                    },
                    t(1_650_000_000),
                )
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_end_to_end_persist_and_query() {
        let store = store_with_drivers(Arc::new(MemoryTable::new()), &[1001]).await;
        let first = race_records(12345, t(1_700_000_000), &[1001, 2002]);
        let second = race_records(22222, t(1_700_001_000), &[1001]);

        assert_eq!(store.persist_race(1001, &first).await.unwrap(), PersistOutcome::Created);
        assert_eq!(store.persist_race(1001, &second).await.unwrap(), PersistOutcome::Created);

        let sessions = store
            .get_driver_sessions(1001, t(1_700_000_000 - 3600), t(1_700_001_000 + 3600))
            .await
            .unwrap();
        let ids: Vec<i64> = sessions.iter().map(|s| s.subsession_id).collect();
        assert_eq!(ids, vec![22222, 12345]);

        let counters = store.get_counters().await.unwrap();
        let driver = store.get_driver(1001).await.unwrap().unwrap();
        assert_eq!(counters.sessions, 2);
        assert_eq!(counters.session_drivers, 3);
        assert_eq!(driver.session_count, 2);

        // Re-running is a no-op.
        assert_eq!(
            store.persist_race(1001, &first).await.unwrap(),
            PersistOutcome::AlreadyIngested
        );
        assert_eq!(
            store.persist_race(1001, &second).await.unwrap(),
            PersistOutcome::AlreadyIngested
        );
        assert_eq!(store.get_counters().await.unwrap(), counters);
        assert_eq!(
            store.get_driver(1001).await.unwrap().unwrap().session_count,
            2
        );
        assert_eq!(
            store
                .get_driver_sessions(1001, t(1_700_000_000 - 3600), t(1_700_001_000 + 3600))
                .await
                .unwrap(),
            sessions
        );

        let detail = store.get_session(12345).await.unwrap().unwrap();
        assert_eq!(detail.session, first.session);
        assert_eq!(detail.drivers.len(), 2);
        assert_eq!(detail.car_classes, first.car_classes);

        let track = store
            .get_track_sessions(first.session.track_id, t(1_699_000_000), t(1_701_000_000))
            .await
            .unwrap();
        assert_eq!(track.len(), 2);
        assert_eq!(track[0].subsession_id, 12345);
    }

    #[tokio::test]
    async fn test_range_query_is_half_open() {
        let store = store_with_drivers(Arc::new(MemoryTable::new()), &[1001]).await;
        for (i, start) in [1000, 2000, 3000, 4000].into_iter().enumerate() {
            let race = race_records(100 + i as i64, t(start), &[1001]);
            store.persist_race(1001, &race).await.unwrap();
        }

        let sessions = store.get_driver_sessions(1001, t(2000), t(4000)).await.unwrap();
        let starts: Vec<i64> = sessions.iter().map(|s| s.start_time.timestamp()).collect();
        assert_eq!(starts, vec![3000, 2000]);

        assert!(store.get_driver_sessions(1001, t(4000), t(2000)).await.unwrap().is_empty());
        let track = store
            .get_track_sessions(TEST_TRACK_ID, t(2000), t(4000))
            .await
            .unwrap();
        assert_eq!(track.len(), 2);
    }

    #[tokio::test]
    async fn test_range_crossing_digit_count_boundary() {
        let store = store_with_drivers(Arc::new(MemoryTable::new()), &[1001]).await;
        let race = race_records(12345, t(1_700_000_000), &[1001]);
        store.persist_race(1001, &race).await.unwrap();
        let early = race_records(777, t(900_000_000), &[1001]);
        store.persist_race(1001, &early).await.unwrap();

        // 2000-01-01 has nine digits of seconds, 2024-01-01 has ten.
        let sessions = store
            .get_driver_sessions(1001, t(946_684_800), t(1_704_067_200))
            .await
            .unwrap();
        let ids: Vec<i64> = sessions.iter().map(|s| s.subsession_id).collect();
        assert_eq!(ids, vec![12345]);

        let all = store
            .get_driver_sessions(1001, t(-86_400), t(1_704_067_200))
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let track = store
            .get_track_sessions(TEST_TRACK_ID, t(946_684_800), t(1_704_067_200))
            .await
            .unwrap();
        assert_eq!(track.len(), 1);
        assert_eq!(track[0].subsession_id, 12345);
    }

    #[tokio::test]
    async fn test_shared_race_is_counted_once_per_driver() {
        let store = store_with_drivers(Arc::new(MemoryTable::new()), &[1001, 2002]).await;
        let race = race_records(12345, t(1_700_000_000), &[1001, 2002]);

        assert_eq!(store.persist_race(1001, &race).await.unwrap(), PersistOutcome::Created);
        // The other participant's projection exists but is not counted yet.
        let theirs = store
            .get_driver_sessions(2002, t(1_699_999_000), t(1_700_001_000))
            .await
            .unwrap();
        assert_eq!(theirs.len(), 1);
        assert_eq!(store.get_driver(2002).await.unwrap().unwrap().session_count, 0);

        assert_eq!(store.persist_race(2002, &race).await.unwrap(), PersistOutcome::Linked);
        assert_eq!(
            store.persist_race(2002, &race).await.unwrap(),
            PersistOutcome::AlreadyIngested
        );

        assert_eq!(store.get_driver(2002).await.unwrap().unwrap().session_count, 1);
        assert_eq!(store.get_driver(1001).await.unwrap().unwrap().session_count, 1);
        assert_eq!(store.get_counters().await.unwrap().sessions, 1);

        // Replaying the first driver's run does not reset the flag.
        assert_eq!(
            store.persist_race(1001, &race).await.unwrap(),
            PersistOutcome::AlreadyIngested
        );
        assert!(!store.link_driver_session(&race.projections[1]).await.unwrap());
    }

    #[tokio::test]
    async fn test_large_race_is_batched_with_commit_last() {
        let faulty = Arc::new(FaultyTable::new());
        let store = store_with_drivers(faulty.clone(), &[1]).await;
        let drivers: Vec<i64> = (1..=60).collect();
        let race = race_records(777, t(1_700_000_000), &drivers);

        faulty.reset_transactions();
        faulty.fail_transaction(2);
        let err = store.persist_race(1, &race).await.unwrap_err();
        assert!(err.to_string().starts_with("transaction batch 2/2 failed"));
        assert!(!store.session_exists(777).await.unwrap());
        assert_eq!(store.get_counters().await.unwrap().sessions, 0);

        // Replaying after the failure commits the race.
        assert_eq!(store.persist_race(1, &race).await.unwrap(), PersistOutcome::Created);
        assert!(store.session_exists(777).await.unwrap());
        assert_eq!(store.get_session(777).await.unwrap().unwrap().drivers.len(), 60);
    }

    fn laps(driver_id: i64, n: i64) -> Vec<SessionDriverLap> {
        (1..=n)
            .map(|lap_number| SessionDriverLap {
                subsession_id: 12345,
                driver_id,
                lap_number,
                flags: 0,
                incident: false,
                session_time: lap_number * 900_000,
                lap_time: 900_000,
                personal_best: lap_number == 3,
                lap_events: vec![],
            })
            .collect()
    }

    #[tokio::test]
    async fn test_lap_batching() {
        let faulty = Arc::new(FaultyTable::new());
        let store = Store::new(faulty.clone());
        let laps = laps(1001, 250);

        faulty.fail_transaction(2);
        let err = store.persist_laps(12345, 1001, &laps).await.unwrap_err();
        match &err {
            StoreError::BatchFailed { batch, total, source } => {
                assert_eq!((*batch, *total), (2, 3));
                assert!(matches!(
                    **source,
                    StoreError::Table(TableError::Unavailable(_))
                ));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(faulty.transactions(), 2);

        // Batch 1 is intact, nothing after it was written.
        assert_eq!(faulty.inner().partition_len(&session_pk(12345)), 100);
        assert_eq!(store.get_laps(12345, 1001).await.unwrap(), None);

        faulty.reset_transactions();
        assert!(store.persist_laps(12345, 1001, &laps).await.unwrap());
        assert_eq!(faulty.transactions(), 3);

        let stored = store.get_laps(12345, 1001).await.unwrap().unwrap();
        assert_eq!(stored, laps);
        assert_eq!(store.get_counters().await.unwrap().laps, 250);

        assert!(!store.persist_laps(12345, 1001, &laps).await.unwrap());
        assert_eq!(store.get_counters().await.unwrap().laps, 250);
    }

    #[tokio::test]
    async fn test_laps_are_scoped_to_driver() {
        let store = Store::new(Arc::new(MemoryTable::new()));
        store.persist_laps(12345, 1001, &laps(1001, 3)).await.unwrap();
        store.persist_laps(12345, 10011, &laps(10011, 5)).await.unwrap();

        assert_eq!(store.get_laps(12345, 1001).await.unwrap().unwrap().len(), 3);
        assert_eq!(store.get_laps(12345, 10011).await.unwrap().unwrap().len(), 5);
        assert_eq!(store.get_laps(12345, 2002).await.unwrap(), None);
    }
}
