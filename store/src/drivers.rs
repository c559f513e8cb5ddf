use crate::errors::{translate, translate_missing};
use crate::keys::{self, INFO, LOCK_SK, driver_pk};
use crate::records::{
    Driver, INGESTION_BLOCKED_UNTIL, IngestionLock, LAST_LOGIN, LOCKED_UNTIL, LOGIN_COUNT,
    NewDriver, RACES_INGESTED_TO, SESSION_COUNT, DISPLAY_NAME, to_attributes,
};
use crate::table::{
    Attributes, BATCH_DELETE_LIMIT, Condition, Key, Order, SortKeyRange, TableError, WriteOp,
};
use crate::{Store, StoreError, increment_counters};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

pub(crate) fn driver_key(driver_id: i64) -> Key {
    Key::new(driver_pk(driver_id), INFO)
}

fn lock_key(driver_id: i64) -> Key {
    Key::new(driver_pk(driver_id), LOCK_SK)
}

impl Store {
    pub async fn get_driver(&self, driver_id: i64) -> Result<Option<Driver>, StoreError> {
        self.get_record(&driver_key(driver_id)).await
    }

    /// Records a login, creating the driver on first login. Returns the
    /// driver as stored afterwards.
    pub async fn record_login(
        &self,
        profile: &NewDriver,
        now: DateTime<Utc>,
    ) -> Result<Driver, StoreError> {
        let now = keys::truncate(now);
        let key = driver_key(profile.driver_id);

        let driver = Driver {
            driver_id: profile.driver_id,
            display_name: profile.display_name.clone(),
            member_since: keys::truncate(profile.member_since),
            first_login: now,
            last_login: None,
            login_count: 0,
            races_ingested_to: None,
            ingestion_blocked_until: None,
            session_count: 0,
            entitlements: profile.entitlements.clone(),
        };
        let created = self
            .transact(vec![
                WriteOp::insert(key.clone(), to_attributes("driver", &driver)?),
                increment_counters(&[("drivers", 1)]),
            ])
            .await;
        match created {
            Ok(()) => tracing::info!(driver_id = profile.driver_id, "created driver"),
            Err(StoreError::AlreadyExists) => {}
            Err(e) => return Err(e),
        }

        let mut set = Attributes::new();
        set.insert(LAST_LOGIN.into(), Value::from(keys::id_from_time(now)));
        set.insert(DISPLAY_NAME.into(), Value::from(profile.display_name.clone()));
        self.table
            .write(WriteOp::Update {
                key: key.clone(),
                set,
                add: vec![(LOGIN_COUNT.into(), 1)],
                remove: Vec::new(),
                condition: Some(Condition::KeyExists),
            })
            .await
            .map_err(|e| translate_missing(e, || StoreError::DriverNotFound(profile.driver_id)))?;

        self.get_driver(profile.driver_id)
            .await?
            .ok_or(StoreError::DriverNotFound(profile.driver_id))
    }

    pub async fn get_ingestion_lock(
        &self,
        driver_id: i64,
    ) -> Result<Option<IngestionLock>, StoreError> {
        self.get_record(&lock_key(driver_id)).await
    }

    /// Takes the driver's ingestion lock until `now + duration`. Succeeds when
    /// no lock exists or the existing one has expired; returns `Ok(false)`
    /// when another run holds it.
    pub async fn acquire_ingestion_lock(
        &self,
        driver_id: i64,
        now: DateTime<Utc>,
        duration: Duration,
    ) -> Result<bool, StoreError> {
        let now = keys::truncate(now);
        let locked_until = now + duration;
        let lock = IngestionLock {
            driver_id,
            locked_until,
        };

        let mut blocked = Attributes::new();
        blocked.insert(
            INGESTION_BLOCKED_UNTIL.into(),
            Value::from(keys::id_from_time(locked_until)),
        );

        let ops = vec![
            WriteOp::put(lock_key(driver_id), to_attributes("ingestion lock", &lock)?).with_condition(
                Condition::KeyNotExists.or(Condition::LessThan(
                    LOCKED_UNTIL.into(),
                    keys::id_from_time(now),
                )),
            ),
            WriteOp::upsert(driver_key(driver_id), blocked).with_condition(Condition::KeyExists),
        ];

        match self.table.transact(ops).await {
            Ok(()) => {
                tracing::debug!(driver_id, %locked_until, "acquired ingestion lock");
                Ok(true)
            }
            Err(e @ TableError::TransactionCanceled { .. }) => match e.failed_item() {
                Some(0) => Ok(false),
                Some(_) => Err(StoreError::DriverNotFound(driver_id)),
                None => Err(translate(e)),
            },
            Err(e) => Err(translate(e)),
        }
    }

    /// Drops the ingestion lock and clears the driver's blocked marker.
    pub async fn release_ingestion_lock(&self, driver_id: i64) -> Result<(), StoreError> {
        let ops = vec![
            WriteOp::delete(lock_key(driver_id)),
            WriteOp::Update {
                key: driver_key(driver_id),
                set: Attributes::new(),
                add: Vec::new(),
                remove: vec![INGESTION_BLOCKED_UNTIL.into()],
                condition: Some(Condition::KeyExists),
            },
        ];
        self.table
            .transact(ops)
            .await
            .map_err(|e| translate_missing(e, || StoreError::DriverNotFound(driver_id)))?;
        tracing::debug!(driver_id, "released ingestion lock");
        Ok(())
    }

    /// Moves the watermark forward to `to`. Returns false, without writing,
    /// when the stored watermark is already at or past `to`.
    pub async fn advance_watermark(
        &self,
        driver_id: i64,
        to: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let to = keys::id_from_time(to);
        let Some(driver) = self.get_driver(driver_id).await? else {
            return Err(StoreError::DriverNotFound(driver_id));
        };

        let mut set = Attributes::new();
        set.insert(RACES_INGESTED_TO.into(), Value::from(to));
        let op = WriteOp::upsert(driver_key(driver.driver_id), set).with_condition(
            Condition::KeyExists.and(
                Condition::AttrNotExists(RACES_INGESTED_TO.into())
                    .or(Condition::LessThan(RACES_INGESTED_TO.into(), to)),
            ),
        );

        match self.table.write(op).await.map_err(translate) {
            Ok(()) => Ok(true),
            Err(StoreError::AlreadyExists) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Deletes every record in the driver's partition except the driver
    /// itself, and clears the watermark and session count so ingestion runs
    /// from scratch. Returns the number of deleted records.
    pub async fn reset_driver(&self, driver_id: i64) -> Result<usize, StoreError> {
        let pk = driver_pk(driver_id);
        if self.get_driver(driver_id).await?.is_none() {
            return Err(StoreError::DriverNotFound(driver_id));
        }

        let keys: Vec<Key> = self
            .table
            .query(&pk, SortKeyRange::All, Order::Ascending)
            .await
            .map_err(translate)?
            .into_iter()
            .map(|item| item.key)
            .filter(|key| key.sk != INFO)
            .collect();

        for chunk in keys.chunks(BATCH_DELETE_LIMIT) {
            self.table
                .batch_delete(chunk.to_vec())
                .await
                .map_err(translate)?;
        }

        let mut set = Attributes::new();
        set.insert(SESSION_COUNT.into(), Value::from(0));
        self.table
            .write(WriteOp::Update {
                key: driver_key(driver_id),
                set,
                add: Vec::new(),
                remove: vec![RACES_INGESTED_TO.into(), INGESTION_BLOCKED_UNTIL.into()],
                condition: Some(Condition::KeyExists),
            })
            .await
            .map_err(|e| translate_missing(e, || StoreError::DriverNotFound(driver_id)))?;

        tracing::info!(driver_id, deleted = keys.len(), "reset driver");
        Ok(keys.len())
    }
}
