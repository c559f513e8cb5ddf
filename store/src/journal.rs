use crate::errors::translate_missing;
use crate::keys::{self, JOURNAL_PREFIX, driver_pk, journal_sk};
use crate::records::{RaceJournalEntry, to_attributes};
use crate::table::{Condition, Key, Order, SortKeyRange, WriteOp};
use crate::{Store, StoreError, increment_counters};

fn journal_key(driver_id: i64, subsession_id: i64) -> Key {
    Key::new(driver_pk(driver_id), journal_sk(subsession_id))
}

impl Store {
    /// Creates the driver's journal entry for a race. One entry per race.
    pub async fn create_journal_entry(
        &self,
        entry: &RaceJournalEntry,
    ) -> Result<RaceJournalEntry, StoreError> {
        let mut entry = entry.clone();
        entry.created_at = keys::truncate(entry.created_at);
        entry.updated_at = keys::truncate(entry.updated_at);
        self.transact(vec![
            WriteOp::insert(
                journal_key(entry.driver_id, entry.subsession_id),
                to_attributes("journal entry", &entry)?,
            ),
            increment_counters(&[("journal_entries", 1)]),
        ])
        .await?;
        Ok(entry)
    }

    pub async fn update_journal_entry(&self, entry: &RaceJournalEntry) -> Result<(), StoreError> {
        let mut entry = entry.clone();
        entry.updated_at = keys::truncate(entry.updated_at);
        let op = WriteOp::put(
            journal_key(entry.driver_id, entry.subsession_id),
            to_attributes("journal entry", &entry)?,
        )
        .with_condition(Condition::KeyExists);
        self.table
            .write(op)
            .await
            .map_err(|e| translate_missing(e, || StoreError::NotFound("journal entry".into())))
    }

    pub async fn get_journal_entry(
        &self,
        driver_id: i64,
        subsession_id: i64,
    ) -> Result<Option<RaceJournalEntry>, StoreError> {
        self.get_record(&journal_key(driver_id, subsession_id)).await
    }

    pub async fn list_journal_entries(
        &self,
        driver_id: i64,
    ) -> Result<Vec<RaceJournalEntry>, StoreError> {
        self.query_records(
            &driver_pk(driver_id),
            SortKeyRange::BeginsWith(JOURNAL_PREFIX.into()),
            Order::Ascending,
        )
        .await
    }

    pub async fn delete_journal_entry(
        &self,
        driver_id: i64,
        subsession_id: i64,
    ) -> Result<(), StoreError> {
        let op = WriteOp::delete(journal_key(driver_id, subsession_id))
            .with_condition(Condition::KeyExists);
        self.table
            .write(op)
            .await
            .map_err(|e| translate_missing(e, || StoreError::NotFound("journal entry".into())))
    }
}
