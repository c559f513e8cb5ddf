//! Fixtures shared by the store's tests and by crates built on top of it.

use crate::memory::MemoryTable;
use crate::records::{CarClass, DriverSession, RaceRecords, Session, SessionDriver};
use crate::table::{Attributes, Item, Key, Order, SortKeyRange, Table, TableError, WriteOp};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const TEST_TRACK_ID: i64 = 47;

/// A [`MemoryTable`] that fails a chosen transaction.
#[derive(Default)]
pub struct FaultyTable {
    inner: MemoryTable,
    transactions: AtomicUsize,
    fail_on: Mutex<Option<usize>>,
}

impl FaultyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the `n`th transaction counted from the last reset, once.
    pub fn fail_transaction(&self, n: usize) {
        *self.fail_on.lock() = Some(n);
    }

    pub fn transactions(&self) -> usize {
        self.transactions.load(Ordering::SeqCst)
    }

    pub fn reset_transactions(&self) {
        self.transactions.store(0, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &MemoryTable {
        &self.inner
    }
}

#[async_trait]
impl Table for FaultyTable {
    async fn get(&self, key: &Key) -> Result<Option<Attributes>, TableError> {
        self.inner.get(key).await
    }

    async fn write(&self, op: WriteOp) -> Result<(), TableError> {
        self.inner.write(op).await
    }

    async fn transact(&self, ops: Vec<WriteOp>) -> Result<(), TableError> {
        let n = self.transactions.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut fail_on = self.fail_on.lock();
            if *fail_on == Some(n) {
                *fail_on = None;
                return Err(TableError::Unavailable(format!("injected failure of transaction {n}")));
            }
        }
        self.inner.transact(ops).await
    }

    async fn query(
        &self,
        pk: &str,
        range: SortKeyRange,
        order: Order,
    ) -> Result<Vec<Item>, TableError> {
        self.inner.query(pk, range, order).await
    }

    async fn batch_delete(&self, keys: Vec<Key>) -> Result<(), TableError> {
        self.inner.batch_delete(keys).await
    }
}

/// A single-class race at [`TEST_TRACK_ID`] with one projection per driver,
/// finishing in the order given.
pub fn race_records(subsession_id: i64, start: DateTime<Utc>, drivers: &[i64]) -> RaceRecords {
    let end = start + Duration::minutes(30);
    let session = Session {
        subsession_id,
        session_id: subsession_id * 10,
        series_id: 139,
        series_name: "Global Mazda MX-5 Fanatec Cup".into(),
        start_time: start,
        end_time: end,
        track_id: TEST_TRACK_ID,
        track_name: "Summit Point Raceway".into(),
        config_name: None,
        license_category: Some("road".into()),
        official: true,
        strength_of_field: 1500,
        num_drivers: drivers.len() as i64,
    };

    let session_drivers: Vec<SessionDriver> = drivers
        .iter()
        .enumerate()
        .map(|(i, &driver_id)| SessionDriver {
            subsession_id,
            driver_id,
            display_name: format!("Driver {driver_id}"),
            car_id: 67,
            car_class_id: 74,
            finish_position: i as i64 + 1,
            finish_position_in_class: i as i64 + 1,
            starting_position: i as i64 + 1,
            laps_complete: 12,
            laps_lead: 0,
            incidents: 2,
            best_lap_time: 781_234,
            average_lap: 790_000,
            old_irating: 1500,
            new_irating: 1510,
            old_license_level: 13,
            new_license_level: 14,
            reason_out: "Running".into(),
        })
        .collect();

    let projections = session_drivers
        .iter()
        .map(|d| DriverSession {
            driver_id: d.driver_id,
            subsession_id,
            start_time: start,
            end_time: end,
            series_id: session.series_id,
            series_name: session.series_name.clone(),
            track_id: session.track_id,
            track_name: session.track_name.clone(),
            car_id: d.car_id,
            car_name: Some("Global Mazda MX-5 Cup".into()),
            car_class_id: d.car_class_id,
            finish_position: d.finish_position,
            finish_position_in_class: d.finish_position_in_class,
            starting_position: d.starting_position,
            incidents: d.incidents,
            laps_complete: d.laps_complete,
            old_irating: d.old_irating,
            new_irating: d.new_irating,
            strength_of_field: session.strength_of_field,
        })
        .collect();

    RaceRecords {
        car_classes: vec![CarClass {
            subsession_id,
            car_class_id: 74,
            short_name: "MX-5 Cup".into(),
            name: "Mazda MX-5 Cup".into(),
            strength_of_field: 1500,
            num_entries: drivers.len() as i64,
            car_ids: vec![67],
        }],
        session,
        drivers: session_drivers,
        projections,
    }
}
