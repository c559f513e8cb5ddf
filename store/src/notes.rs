use crate::errors::translate_missing;
use crate::keys::{self, NOTE_PREFIX, driver_pk, note_sk};
use crate::records::{DriverNote, to_attributes};
use crate::table::{Condition, Key, Order, SortKeyRange, WriteOp};
use crate::{Store, StoreError, increment_counters};
use chrono::{DateTime, Utc};

fn note_key(driver_id: i64, at: DateTime<Utc>) -> Key {
    Key::new(driver_pk(driver_id), note_sk(at))
}

impl Store {
    /// Creates a note. Fails with `AlreadyExists` when the driver already has
    /// a note at the same second.
    pub async fn create_note(&self, note: &DriverNote) -> Result<DriverNote, StoreError> {
        let mut note = note.clone();
        note.timestamp = keys::truncate(note.timestamp);
        self.transact(vec![
            WriteOp::insert(
                note_key(note.driver_id, note.timestamp),
                to_attributes("note", &note)?,
            ),
            increment_counters(&[("notes", 1)]),
        ])
        .await?;
        Ok(note)
    }

    pub async fn update_note(&self, note: &DriverNote) -> Result<(), StoreError> {
        let op = WriteOp::put(
            note_key(note.driver_id, note.timestamp),
            to_attributes("note", note)?,
        )
        .with_condition(Condition::KeyExists);
        self.table
            .write(op)
            .await
            .map_err(|e| translate_missing(e, || StoreError::NotFound("note".into())))
    }

    pub async fn get_note(
        &self,
        driver_id: i64,
        at: DateTime<Utc>,
    ) -> Result<Option<DriverNote>, StoreError> {
        self.get_record(&note_key(driver_id, at)).await
    }

    /// Notes written in `[from, to)`, oldest first.
    pub async fn list_notes(
        &self,
        driver_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DriverNote>, StoreError> {
        let (from, to) = (keys::truncate(from), keys::truncate(to));
        if from >= to {
            return Ok(Vec::new());
        }

        let range = SortKeyRange::Between(
            note_sk(from),
            format!("{NOTE_PREFIX}{}", keys::epoch_key(keys::id_from_time(to) - 1)),
        );
        let notes: Vec<DriverNote> = self
            .query_records(&driver_pk(driver_id), range, Order::Ascending)
            .await?;
        Ok(notes
            .into_iter()
            .filter(|n| n.timestamp >= from && n.timestamp < to)
            .collect())
    }

    pub async fn delete_note(&self, driver_id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        let op = WriteOp::delete(note_key(driver_id, at)).with_condition(Condition::KeyExists);
        self.table
            .write(op)
            .await
            .map_err(|e| translate_missing(e, || StoreError::NotFound("note".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryTable;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn note(driver_id: i64, secs: i64, nanos: u32, text: &str) -> DriverNote {
        DriverNote {
            driver_id,
            timestamp: Utc.timestamp_opt(secs, nanos).unwrap(),
            text: text.into(),
            subsession_id: None,
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_conditional_insert_idempotence() {
        let store = Store::new(Arc::new(MemoryTable::new()));

        let created = store
            .create_note(&note(1001, 1000, 500_000_000, "brake later into T1"))
            .await
            .unwrap();
        assert_eq!(created.timestamp, t(1000));

        assert!(matches!(
            store.create_note(&note(1001, 1000, 0, "second")).await,
            Err(StoreError::AlreadyExists)
        ));

        assert_eq!(store.get_note(1001, t(1000)).await.unwrap(), Some(created));
        assert_eq!(store.get_counters().await.unwrap().notes, 1);
    }

    #[tokio::test]
    async fn test_update_list_delete() {
        let store = Store::new(Arc::new(MemoryTable::new()));
        for secs in [1000, 2000, 3000, 4000] {
            store.create_note(&note(1001, secs, 0, "n")).await.unwrap();
        }

        let listed = store.list_notes(1001, t(2000), t(4000)).await.unwrap();
        let times: Vec<i64> = listed.iter().map(|n| n.timestamp.timestamp()).collect();
        assert_eq!(times, vec![2000, 3000]);

        let mut edited = listed[0].clone();
        edited.text = "edited".into();
        store.update_note(&edited).await.unwrap();
        assert_eq!(store.get_note(1001, t(2000)).await.unwrap().unwrap().text, "edited");

        assert!(matches!(
            store.update_note(&note(1001, 5000, 0, "missing")).await,
            Err(StoreError::NotFound(_))
        ));

        store.delete_note(1001, t(2000)).await.unwrap();
        assert!(store.get_note(1001, t(2000)).await.unwrap().is_none());
        assert!(matches!(
            store.delete_note(1001, t(2000)).await,
            Err(StoreError::NotFound(_))
        ));
        // Counters only go up.
        assert_eq!(store.get_counters().await.unwrap().notes, 4);
    }

    #[tokio::test]
    async fn test_list_across_digit_count_boundary() {
        let store = Store::new(Arc::new(MemoryTable::new()));
        store.create_note(&note(1001, 999_999_999, 0, "old")).await.unwrap();
        store.create_note(&note(1001, 1_700_000_000, 0, "new")).await.unwrap();

        let listed = store
            .list_notes(1001, t(946_684_800), t(1_704_067_200))
            .await
            .unwrap();
        let texts: Vec<&str> = listed.iter().map(|n| n.text.as_str()).collect();
        assert_eq!(texts, vec!["old", "new"]);
    }
}
