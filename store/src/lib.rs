pub mod config;
pub mod connections;
pub mod drivers;
pub mod errors;
pub mod journal;
pub mod keys;
pub mod memory;
pub mod metrics_defs;
pub mod notes;
pub mod races;
pub mod records;
pub mod sqlite;
pub mod table;
#[cfg(any(test, feature = "testutils"))]
pub mod testutils;

pub use errors::StoreError;
pub use memory::MemoryTable;
pub use sqlite::SqliteTable;
pub use table::Table;

use crate::config::TableType;
use crate::errors::translate;
use crate::metrics_defs::{STORE_BATCH_FAILED, STORE_TRANSACTION_ITEMS, STORE_TRANSACTIONS};
use crate::records::{GlobalCounters, from_attributes};
use crate::table::{Key, Order, SortKeyRange, TRANSACTION_LIMIT, TableError, WriteOp};
use serde::de::DeserializeOwned;
use shared::{counter, histogram};
use std::sync::Arc;

pub fn open_table(table_type: &TableType) -> Result<Arc<dyn Table>, TableError> {
    match table_type {
        TableType::Memory => Ok(Arc::new(MemoryTable::new())),
        TableType::Sqlite { path } => Ok(Arc::new(SqliteTable::open(path)?)),
    }
}

/// Domain operations over a single table. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    table: Arc<dyn Table>,
}

impl Store {
    pub fn new(table: Arc<dyn Table>) -> Self {
        Store { table }
    }

    pub async fn get_counters(&self) -> Result<GlobalCounters, StoreError> {
        Ok(self
            .get_record(&counters_key())
            .await?
            .unwrap_or_default())
    }

    pub(crate) async fn get_record<T: DeserializeOwned>(
        &self,
        key: &Key,
    ) -> Result<Option<T>, StoreError> {
        match self.table.get(key).await.map_err(translate)? {
            Some(attributes) => Ok(Some(from_attributes(&describe(key), attributes)?)),
            None => Ok(None),
        }
    }

    pub(crate) async fn query_records<T: DeserializeOwned>(
        &self,
        pk: &str,
        range: SortKeyRange,
        order: Order,
    ) -> Result<Vec<T>, StoreError> {
        self.table
            .query(pk, range, order)
            .await
            .map_err(translate)?
            .into_iter()
            .map(|item| from_attributes(&describe(&item.key), item.attributes))
            .collect()
    }

    pub(crate) async fn transact(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        counter!(STORE_TRANSACTIONS).increment(1);
        histogram!(STORE_TRANSACTION_ITEMS).record(ops.len() as f64);
        self.table.transact(ops).await.map_err(translate)
    }

    /// Applies batches as consecutive transactions. A failure stops the
    /// sequence and reports its position; earlier batches stay committed.
    pub(crate) async fn transact_batches(
        &self,
        batches: Vec<Vec<WriteOp>>,
    ) -> Result<(), StoreError> {
        let total = batches.len();
        for (index, batch) in batches.into_iter().enumerate() {
            let batch_number = index + 1;
            if let Err(e) = self.transact(batch).await {
                if batch_number > 1 {
                    counter!(STORE_BATCH_FAILED).increment(1);
                }
                tracing::warn!(batch = batch_number, total, error = %e, "transaction batch failed");
                return Err(StoreError::BatchFailed {
                    batch: batch_number,
                    total,
                    source: Box::new(e),
                });
            }
        }
        Ok(())
    }
}

pub(crate) fn counters_key() -> Key {
    Key::new(keys::GLOBAL_PK, keys::COUNTERS_SK)
}

pub(crate) fn increment_counters(adds: &[(&str, i64)]) -> WriteOp {
    WriteOp::increment(
        counters_key(),
        adds.iter()
            .map(|(name, delta)| (name.to_string(), *delta))
            .collect(),
    )
}

/// Splits `children` into transaction-sized batches and places `commit` in
/// the final one, so the commit only lands once every child is written.
pub(crate) fn into_batches(children: Vec<WriteOp>, commit: Vec<WriteOp>) -> Vec<Vec<WriteOp>> {
    let mut batches: Vec<Vec<WriteOp>> = Vec::new();
    let mut children = children.into_iter().peekable();
    while children.peek().is_some() {
        batches.push(children.by_ref().take(TRANSACTION_LIMIT).collect());
    }

    if commit.is_empty() {
        return batches;
    }
    match batches.last_mut() {
        Some(last) if last.len() + commit.len() <= TRANSACTION_LIMIT => last.extend(commit),
        _ => batches.push(commit),
    }
    batches
}

fn describe(key: &Key) -> String {
    format!("{}/{}", key.pk, key.sk)
}
