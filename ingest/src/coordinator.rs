//! Ingestion runs.
//!
//! A run holds the driver's lock for its whole duration. It searches the
//! upstream for races finishing in `[watermark, now)`, persists each one and
//! then moves the watermark to the finish time of the first race that failed,
//! or to `now` when none did. Races that fail are therefore retried by the
//! next run; races that succeeded before them are replayed harmlessly.

use crate::clock::Clock;
use crate::config::IngestConfig;
use crate::errors::IngestError;
use crate::metrics_defs::{INGEST_LAPS_LOADED, INGEST_RUN_DURATION, INGEST_RUNS, INGEST_SESSIONS};
use crate::notify::Notifier;
use crate::source::RaceSource;
use crate::transform;
use chrono::{DateTime, NaiveTime, Utc};
use racedata::AccessToken;
use racedata::types::SeriesResult;
use serde::Serialize;
use serde_json::json;
use shared::{counter, histogram};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use store::keys::truncate;
use store::races::PersistOutcome;
use store::records::{Driver, NewDriver, SessionDriverLap};
use store::{Store, StoreError};
use tracing::{debug, info, warn};

pub const RACES_INGESTED: &str = "races_ingested";

#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct RunSummary {
    /// Races returned by the search.
    pub found: usize,
    pub created: usize,
    pub linked: usize,
    pub already_ingested: usize,
    pub failed: usize,
    /// The driver's watermark after the run.
    pub watermark: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Another run holds the driver's lock.
    Locked,
    Completed(RunSummary),
}

pub struct Coordinator {
    store: Store,
    source: Arc<dyn RaceSource>,
    notifier: Option<Arc<Notifier>>,
    clock: Arc<dyn Clock>,
    config: IngestConfig,
}

impl Coordinator {
    pub fn new(
        store: Store,
        source: Arc<dyn RaceSource>,
        clock: Arc<dyn Clock>,
        config: IngestConfig,
    ) -> Self {
        Coordinator {
            store,
            source,
            notifier: None,
            clock,
            config,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Looks up the token's owner upstream and records the login, creating
    /// the driver on first login.
    pub async fn login(&self, token: &AccessToken) -> Result<Driver, IngestError> {
        let member = self.source.member_info(token).await?;
        let profile = NewDriver {
            driver_id: member.cust_id,
            display_name: member.display_name,
            member_since: member.member_since.and_time(NaiveTime::MIN).and_utc(),
            entitlements: Vec::new(),
        };
        let driver = self.store.record_login(&profile, self.clock.now()).await?;
        info!(driver_id = driver.driver_id, login_count = driver.login_count, "driver logged in");
        Ok(driver)
    }

    /// Runs ingestion for one driver. Returns [`RunOutcome::Locked`] without
    /// doing anything when another run holds the lock.
    pub async fn ingest(
        &self,
        driver_id: i64,
        token: &AccessToken,
    ) -> Result<RunOutcome, IngestError> {
        let acquired = self
            .store
            .acquire_ingestion_lock(driver_id, self.clock.now(), self.config.lock_duration())
            .await?;
        if !acquired {
            counter!(INGEST_RUNS, "outcome" => "locked").increment(1);
            info!(driver_id, "ingestion already running");
            return Ok(RunOutcome::Locked);
        }

        let started = Instant::now();
        let timeout = self.config.run_timeout();
        let result = match tokio::time::timeout(timeout, self.locked_run(driver_id, token)).await {
            Ok(result) => result,
            Err(_) => Err(IngestError::Timeout(timeout)),
        };

        if let Err(error) = self.store.release_ingestion_lock(driver_id).await {
            // The lock expires on its own.
            warn!(driver_id, error = ?error, "failed to release ingestion lock");
        }
        histogram!(INGEST_RUN_DURATION).record(started.elapsed().as_secs_f64());

        match result {
            Ok(summary) => {
                counter!(INGEST_RUNS, "outcome" => "completed").increment(1);
                info!(
                    driver_id,
                    found = summary.found,
                    created = summary.created,
                    linked = summary.linked,
                    failed = summary.failed,
                    "ingestion finished"
                );
                if summary.created + summary.linked > 0 {
                    self.announce(driver_id, &summary).await;
                }
                Ok(RunOutcome::Completed(summary))
            }
            Err(error) => {
                let outcome = match error {
                    IngestError::Timeout(_) => "timeout",
                    _ => "failed",
                };
                counter!(INGEST_RUNS, "outcome" => outcome).increment(1);
                warn!(driver_id, error = %error, "ingestion failed");
                Err(error)
            }
        }
    }

    /// Reads the driver only once the lock is held, so the watermark includes
    /// every run that finished before this one.
    async fn locked_run(
        &self,
        driver_id: i64,
        token: &AccessToken,
    ) -> Result<RunSummary, IngestError> {
        let Some(driver) = self.store.get_driver(driver_id).await? else {
            return Err(StoreError::DriverNotFound(driver_id).into());
        };
        self.run(&driver, token).await
    }

    async fn run(&self, driver: &Driver, token: &AccessToken) -> Result<RunSummary, IngestError> {
        let driver_id = driver.driver_id;
        let now = truncate(self.clock.now());
        let from = driver.races_ingested_to.unwrap_or(driver.member_since);

        let races = self.search(token, driver_id, from, now).await?;
        let mut summary = RunSummary {
            found: races.len(),
            watermark: driver.races_ingested_to,
            ..Default::default()
        };

        let car_names = if races.is_empty() {
            HashMap::new()
        } else {
            self.car_names(token).await?
        };

        let mut first_failure: Option<DateTime<Utc>> = None;
        let mut fatal: Option<IngestError> = None;
        for race in &races {
            match self.ingest_race(token, driver_id, race, &car_names).await {
                Ok(outcome) => {
                    let label = match outcome {
                        PersistOutcome::Created => {
                            summary.created += 1;
                            "created"
                        }
                        PersistOutcome::Linked => {
                            summary.linked += 1;
                            "linked"
                        }
                        PersistOutcome::AlreadyIngested => {
                            summary.already_ingested += 1;
                            "already_ingested"
                        }
                    };
                    counter!(INGEST_SESSIONS, "outcome" => label).increment(1);
                    debug!(driver_id, subsession_id = race.subsession_id, outcome = label, "race handled");
                }
                Err(error) => {
                    summary.failed += 1;
                    counter!(INGEST_SESSIONS, "outcome" => "failed").increment(1);
                    first_failure.get_or_insert(race.end_time);
                    if error.is_unauthorized() {
                        fatal = Some(error);
                        break;
                    }
                    warn!(
                        driver_id,
                        subsession_id = race.subsession_id,
                        error = %error,
                        "failed to ingest race"
                    );
                }
            }
        }

        let watermark = first_failure.unwrap_or(now);
        if self.store.advance_watermark(driver_id, watermark).await? {
            summary.watermark = Some(truncate(watermark));
        }

        match fatal {
            Some(error) => Err(error),
            None => Ok(summary),
        }
    }

    /// Searches `[from, to)` in consecutive windows, returning each race once in
    /// ascending finish order.
    async fn search(
        &self,
        token: &AccessToken,
        driver_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SeriesResult>, IngestError> {
        let window = self.config.search_window();
        let mut seen = HashSet::new();
        let mut races = Vec::new();
        let mut begin = from;
        while begin < to {
            let end = (begin + window).min(to);
            for race in self.source.search_series(token, driver_id, begin, end).await? {
                if seen.insert(race.subsession_id) {
                    races.push(race);
                }
            }
            begin = end;
        }
        races.sort_by_key(|race| (race.end_time, race.subsession_id));
        Ok(races)
    }

    /// Car names for projections. Missing names only cost presentation, so a
    /// catalog outage is tolerated unless the token itself was rejected.
    async fn car_names(&self, token: &AccessToken) -> Result<HashMap<i64, String>, IngestError> {
        match self.source.cars(token).await {
            Ok(cars) => Ok(cars
                .iter()
                .map(|car| (car.car_id, car.car_name.clone()))
                .collect()),
            Err(error) if error.is_unauthorized() => Err(error.into()),
            Err(error) => {
                warn!(error = %error, "car catalog unavailable, storing races without car names");
                Ok(HashMap::new())
            }
        }
    }

    async fn ingest_race(
        &self,
        token: &AccessToken,
        driver_id: i64,
        race: &SeriesResult,
        car_names: &HashMap<i64, String>,
    ) -> Result<PersistOutcome, IngestError> {
        let subsession_id = race.subsession_id;

        // Stored by someone else's run: link without going upstream.
        if let Some(detail) = self.store.get_session(subsession_id).await? {
            if let Some(row) = detail.drivers.iter().find(|d| d.driver_id == driver_id) {
                let projection = transform::projection(
                    &detail.session,
                    row,
                    car_names.get(&row.car_id).cloned(),
                );
                return Ok(if self.store.link_driver_session(&projection).await? {
                    PersistOutcome::Linked
                } else {
                    PersistOutcome::AlreadyIngested
                });
            }
        }

        let result = self.source.subsession_result(token, subsession_id).await?;
        let records = transform::race_records(&result, car_names)?;
        if !records.drivers.iter().any(|d| d.driver_id == driver_id) {
            return Err(IngestError::malformed(
                subsession_id,
                format!("driver {driver_id} is not in the main event"),
            ));
        }
        Ok(self.store.persist_race(driver_id, &records).await?)
    }

    async fn announce(&self, driver_id: i64, summary: &RunSummary) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let payload = json!({
            "created": summary.created,
            "linked": summary.linked,
            "watermark": summary.watermark,
        });
        if let Err(error) = notifier.broadcast(driver_id, RACES_INGESTED, &payload).await {
            warn!(driver_id, error = %error, "failed to announce ingested races");
        }
    }

    /// One driver's laps of a stored race, fetched from upstream on first use.
    pub async fn load_laps(
        &self,
        driver_id: i64,
        subsession_id: i64,
        token: &AccessToken,
    ) -> Result<Vec<SessionDriverLap>, IngestError> {
        if let Some(laps) = self.store.get_laps(subsession_id, driver_id).await? {
            return Ok(laps);
        }
        if !self.store.session_exists(subsession_id).await? {
            return Err(StoreError::NotFound(format!("session {subsession_id}")).into());
        }

        let rows = self
            .source
            .lap_data(token, subsession_id, driver_id)
            .await?;
        let laps = transform::laps(subsession_id, driver_id, &rows)?;
        self.store
            .persist_laps(subsession_id, driver_id, &laps)
            .await?;
        counter!(INGEST_LAPS_LOADED).increment(1);
        debug!(driver_id, subsession_id, laps = laps.len(), "laps loaded");
        Ok(laps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::testutils::{FakeSource, Failure, lap_rows, member, subsession};
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use parking_lot::Mutex;
    use serde_json::Value;
    use store::MemoryTable;
    use store::keys::{INFO, LOCK_SK, driver_pk};
    use store::records::RACES_INGESTED_TO;
    use store::table::{Attributes, Item, Key, Order, SortKeyRange, Table, TableError, WriteOp};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    struct Harness {
        store: Store,
        source: Arc<FakeSource>,
        clock: Arc<FixedClock>,
        coordinator: Coordinator,
        token: AccessToken,
    }

    async fn harness(drivers: &[i64]) -> Harness {
        let store = Store::new(Arc::new(MemoryTable::new()));
        let source = Arc::new(FakeSource::new());
        let clock = Arc::new(FixedClock::new(t(1_700_100_000)));
        let coordinator = Coordinator::new(
            store.clone(),
            source.clone(),
            clock.clone(),
            IngestConfig::default(),
        );
        for &driver_id in drivers {
            source.add_member(&format!("token-{driver_id}"), member(driver_id));
            coordinator
                .login(&AccessToken::new(format!("token-{driver_id}")))
                .await
                .unwrap();
        }
        Harness {
            store,
            source,
            clock,
            coordinator,
            token: AccessToken::new("token-1001"),
        }
    }

    fn completed(outcome: RunOutcome) -> RunSummary {
        match outcome {
            RunOutcome::Completed(summary) => summary,
            RunOutcome::Locked => panic!("run was locked out"),
        }
    }

    #[tokio::test]
    async fn test_end_to_end() {
        let h = harness(&[1001]).await;
        h.source.add_race(subsession(12345, t(1_700_000_000), &[1001, 2002]));
        h.source.add_race(subsession(22222, t(1_700_001_000), &[3003, 1001]));

        let summary = completed(h.coordinator.ingest(1001, &h.token).await.unwrap());
        assert_eq!(summary.found, 2);
        assert_eq!(summary.created, 2);
        assert_eq!(summary.watermark, Some(t(1_700_100_000)));

        let sessions = h
            .store
            .get_driver_sessions(1001, t(1_700_000_000 - 3600), t(1_700_000_000 + 3600))
            .await
            .unwrap();
        let ids: Vec<i64> = sessions.iter().map(|s| s.subsession_id).collect();
        assert_eq!(ids, vec![22222, 12345]);
        assert_eq!(sessions[0].car_name.as_deref(), Some("Global Mazda MX-5 Cup"));

        let counters = h.store.get_counters().await.unwrap();
        assert_eq!(counters.sessions, 2);
        assert_eq!(counters.session_drivers, 4);
        let driver = h.store.get_driver(1001).await.unwrap().unwrap();
        assert_eq!(driver.session_count, 2);
        assert!(driver.ingestion_blocked_until.is_none());

        // Rerunning with identical upstream data changes nothing.
        let summary = completed(h.coordinator.ingest(1001, &h.token).await.unwrap());
        assert_eq!(summary.found, 0);
        assert_eq!(h.store.get_counters().await.unwrap(), counters);
        assert_eq!(h.store.get_driver(1001).await.unwrap().unwrap().session_count, 2);
    }

    #[tokio::test]
    async fn test_reset_replays_without_duplicates() {
        let h = harness(&[1001]).await;
        h.source.add_race(subsession(12345, t(1_700_000_000), &[1001]));
        h.source.add_race(subsession(22222, t(1_700_001_000), &[1001]));
        completed(h.coordinator.ingest(1001, &h.token).await.unwrap());
        let counters = h.store.get_counters().await.unwrap();
        let calls = h.source.result_calls();

        h.store.reset_driver(1001).await.unwrap();
        let summary = completed(h.coordinator.ingest(1001, &h.token).await.unwrap());
        assert_eq!(summary.found, 2);
        assert_eq!(summary.created, 0);
        assert_eq!(summary.linked, 2);
        // Stored races are relinked without going upstream.
        assert_eq!(h.source.result_calls(), calls);

        assert_eq!(h.store.get_counters().await.unwrap(), counters);
        assert_eq!(h.store.get_driver(1001).await.unwrap().unwrap().session_count, 2);
        let sessions = h
            .store
            .get_driver_sessions(1001, t(1_699_990_000), t(1_700_010_000))
            .await
            .unwrap();
        assert_eq!(sessions.len(), 2);
    }

    #[tokio::test]
    async fn test_shared_race_is_linked() {
        let h = harness(&[1001, 2002]).await;
        h.source.add_race(subsession(12345, t(1_700_000_000), &[1001, 2002]));

        let first = completed(h.coordinator.ingest(1001, &h.token).await.unwrap());
        assert_eq!(first.created, 1);

        let calls = h.source.result_calls();
        let other = AccessToken::new("token-2002");
        let second = completed(h.coordinator.ingest(2002, &other).await.unwrap());
        assert_eq!(second.linked, 1);
        assert_eq!(h.source.result_calls(), calls);

        assert_eq!(h.store.get_driver(2002).await.unwrap().unwrap().session_count, 1);
        assert_eq!(h.store.get_counters().await.unwrap().sessions, 1);
    }

    #[tokio::test]
    async fn test_locked_out() {
        let h = harness(&[1001]).await;
        assert!(
            h.store
                .acquire_ingestion_lock(1001, h.clock.now(), Duration::minutes(15))
                .await
                .unwrap()
        );

        assert_eq!(
            h.coordinator.ingest(1001, &h.token).await.unwrap(),
            RunOutcome::Locked
        );
        assert!(h.source.searches().is_empty());

        // An abandoned lock stops blocking once it has expired.
        h.clock.advance(Duration::minutes(16));
        completed(h.coordinator.ingest(1001, &h.token).await.unwrap());
        assert!(h.store.get_ingestion_lock(1001).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partial_failure_holds_watermark() {
        let h = harness(&[1001]).await;
        h.source.add_race(subsession(1, t(1_700_000_000), &[1001]));
        h.source.add_race(subsession(2, t(1_700_010_000), &[1001]));
        h.source.add_race(subsession(3, t(1_700_020_000), &[1001]));
        h.source.fail_result(2, Failure::Unavailable);

        let summary = completed(h.coordinator.ingest(1001, &h.token).await.unwrap());
        assert_eq!(summary.created, 2);
        assert_eq!(summary.failed, 1);
        // Race 2 finishes 30 minutes after it starts.
        assert_eq!(summary.watermark, Some(t(1_700_011_800)));
        assert!(h.store.get_ingestion_lock(1001).await.unwrap().is_none());

        h.source.clear_failures();
        let summary = completed(h.coordinator.ingest(1001, &h.token).await.unwrap());
        assert_eq!(summary.found, 2);
        assert_eq!(summary.created, 1);
        assert_eq!(summary.already_ingested, 1);
        assert_eq!(summary.watermark, Some(t(1_700_100_000)));
        assert_eq!(h.store.get_driver(1001).await.unwrap().unwrap().session_count, 3);
    }

    #[tokio::test]
    async fn test_unauthorized_stops_the_run() {
        let h = harness(&[1001]).await;
        h.source.add_race(subsession(1, t(1_700_000_000), &[1001]));
        h.source.add_race(subsession(2, t(1_700_010_000), &[1001]));
        h.source.add_race(subsession(3, t(1_700_020_000), &[1001]));
        h.source.fail_result(2, Failure::Unauthorized);

        let error = h.coordinator.ingest(1001, &h.token).await.unwrap_err();
        assert!(error.is_unauthorized());
        assert!(!h.store.session_exists(3).await.unwrap());

        let driver = h.store.get_driver(1001).await.unwrap().unwrap();
        assert_eq!(driver.races_ingested_to, Some(t(1_700_011_800)));
        assert_eq!(driver.session_count, 1);
        assert!(h.store.get_ingestion_lock(1001).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_search_windows() {
        let h = harness(&[1001]).await;
        h.source.fail_search(Failure::Unavailable);
        assert!(h.coordinator.ingest(1001, &h.token).await.is_err());
        h.source.clear_failures();

        // Member since 2023-11-01, now is 2023-11-16: a single window.
        completed(h.coordinator.ingest(1001, &h.token).await.unwrap());
        let searches = h.source.searches();
        let last = searches[searches.len() - 1];
        assert_eq!(last.0, t(1_698_796_800));
        assert_eq!(last.1, t(1_700_100_000));

        h.clock.advance(Duration::days(200));
        completed(h.coordinator.ingest(1001, &h.token).await.unwrap());
        let all = h.source.searches();
        let searches = &all[searches.len()..];
        assert_eq!(searches.len(), 3);
        assert_eq!(searches[0].0, t(1_700_100_000));
        assert_eq!(searches[0].1, t(1_700_100_000) + Duration::days(90));
        assert_eq!(searches[1].0, searches[0].1);
        assert_eq!(searches[2].1, t(1_700_100_000) + Duration::days(200));
    }

    /// Lets another run finish and move the watermark right before the
    /// ingestion lock is taken.
    #[derive(Default)]
    struct RacingTable {
        inner: MemoryTable,
        finished_run: Mutex<Option<(i64, i64)>>,
    }

    #[async_trait]
    impl Table for RacingTable {
        async fn get(&self, key: &Key) -> Result<Option<Attributes>, TableError> {
            self.inner.get(key).await
        }

        async fn write(&self, op: WriteOp) -> Result<(), TableError> {
            self.inner.write(op).await
        }

        async fn transact(&self, ops: Vec<WriteOp>) -> Result<(), TableError> {
            let takes_lock = ops.iter().any(|op| op.key().sk == LOCK_SK);
            let finished = if takes_lock { self.finished_run.lock().take() } else { None };
            if let Some((driver_id, watermark)) = finished {
                let mut set = Attributes::new();
                set.insert(RACES_INGESTED_TO.into(), Value::from(watermark));
                self.inner
                    .write(WriteOp::upsert(Key::new(driver_pk(driver_id), INFO), set))
                    .await?;
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

    #[tokio::test]
    async fn test_watermark_is_read_under_the_lock() {
        let table = Arc::new(RacingTable::default());
        let store = Store::new(table.clone());
        let source = Arc::new(FakeSource::new());
        source.add_member("token-1001", member(1001));
        let coordinator = Coordinator::new(
            store.clone(),
            source.clone(),
            Arc::new(FixedClock::new(t(1_700_100_000))),
            IngestConfig::default(),
        );
        let token = AccessToken::new("token-1001");
        coordinator.login(&token).await.unwrap();

        *table.finished_run.lock() = Some((1001, 1_700_050_000));
        completed(coordinator.ingest(1001, &token).await.unwrap());

        let searches = source.searches();
        assert_eq!(searches, vec![(t(1_700_050_000), t(1_700_100_000))]);
    }

    #[tokio::test]
    async fn test_unknown_driver() {
        let h = harness(&[]).await;
        assert!(matches!(
            h.coordinator.ingest(1001, &h.token).await,
            Err(IngestError::Store(StoreError::DriverNotFound(1001)))
        ));
    }

    #[tokio::test]
    async fn test_load_laps_once() {
        let h = harness(&[1001]).await;
        h.source.add_race(subsession(12345, t(1_700_000_000), &[1001]));
        h.source.add_laps(12345, 1001, lap_rows(1001, 12));

        assert!(matches!(
            h.coordinator.load_laps(1001, 12345, &h.token).await,
            Err(IngestError::Store(StoreError::NotFound(_)))
        ));

        completed(h.coordinator.ingest(1001, &h.token).await.unwrap());
        let laps = h.coordinator.load_laps(1001, 12345, &h.token).await.unwrap();
        assert_eq!(laps.len(), 12);
        let again = h.coordinator.load_laps(1001, 12345, &h.token).await.unwrap();
        assert_eq!(again, laps);
        assert_eq!(h.source.lap_calls(), 1);
    }
}
