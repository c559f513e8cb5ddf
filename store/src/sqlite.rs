//! Durable table on a single SQLite file.
//!
//! Every mutation runs in an `IMMEDIATE` transaction, so conditions are
//! evaluated and applied under SQLite's write lock. Several processes sharing
//! the file therefore see the same conditional semantics as one process does,
//! which is what the ingestion lock relies on.

use crate::table::{
    Attributes, BATCH_DELETE_LIMIT, CancelReason, Item, Key, Order, SortKeyRange, Table,
    TableError, WriteOp, validate_transaction,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS items (
    pk TEXT NOT NULL,
    sk TEXT NOT NULL,
    attributes TEXT NOT NULL,
    PRIMARY KEY (pk, sk)
) WITHOUT ROWID;
";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteTable {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTable {
    /// Opens or creates the database at `path`.
    pub fn open(path: &Path) -> Result<Self, TableError> {
        let conn = Connection::open(path).map_err(unavailable)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(unavailable)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(unavailable)?;
        conn.execute_batch(SCHEMA).map_err(unavailable)?;
        tracing::info!(path = %path.display(), "opened sqlite table");

        Ok(SqliteTable {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, f: F) -> Result<T, TableError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, TableError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || f(&mut conn.lock()))
            .await
            .map_err(|e| TableError::Unavailable(format!("sqlite task failed: {e}")))?
    }
}

fn unavailable(e: rusqlite::Error) -> TableError {
    TableError::Unavailable(e.to_string())
}

fn decode(key: &Key, raw: &str) -> Result<Attributes, TableError> {
    serde_json::from_str(raw)
        .map_err(|e| TableError::Unavailable(format!("corrupt item {}/{}: {e}", key.pk, key.sk)))
}

fn load(conn: &Connection, key: &Key) -> Result<Option<Attributes>, TableError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT attributes FROM items WHERE pk = ?1 AND sk = ?2",
            params![key.pk, key.sk],
            |row| row.get(0),
        )
        .optional()
        .map_err(unavailable)?;
    raw.map(|raw| decode(key, &raw)).transpose()
}

fn save(conn: &Connection, key: &Key, next: Option<Attributes>) -> Result<(), TableError> {
    match next {
        Some(attributes) => {
            let raw = serde_json::Value::Object(attributes).to_string();
            conn.execute(
                "INSERT INTO items (pk, sk, attributes) VALUES (?1, ?2, ?3)
                 ON CONFLICT (pk, sk) DO UPDATE SET attributes = excluded.attributes",
                params![key.pk, key.sk, raw],
            )
        }
        None => conn.execute(
            "DELETE FROM items WHERE pk = ?1 AND sk = ?2",
            params![key.pk, key.sk],
        ),
    }
    .map_err(unavailable)?;
    Ok(())
}

fn lower_bound(range: &SortKeyRange) -> &str {
    match range {
        SortKeyRange::All => "",
        SortKeyRange::BeginsWith(prefix) => prefix,
        SortKeyRange::Between(low, _) => low,
    }
}

#[async_trait]
impl Table for SqliteTable {
    async fn get(&self, key: &Key) -> Result<Option<Attributes>, TableError> {
        let key = key.clone();
        self.run(move |conn| load(conn, &key)).await
    }

    async fn write(&self, op: WriteOp) -> Result<(), TableError> {
        self.run(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(unavailable)?;
            let current = load(&tx, op.key())?;
            if op
                .condition()
                .is_some_and(|condition| !condition.evaluate(current.as_ref()))
            {
                return Err(TableError::ConditionalCheckFailed);
            }
            let (key, next) = op.apply(current);
            save(&tx, &key, next)?;
            tx.commit().map_err(unavailable)
        })
        .await
    }

    async fn transact(&self, ops: Vec<WriteOp>) -> Result<(), TableError> {
        validate_transaction(&ops)?;

        self.run(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(unavailable)?;
            let mut current = Vec::with_capacity(ops.len());
            for op in &ops {
                current.push(load(&tx, op.key())?);
            }

            let reasons: Vec<CancelReason> = ops
                .iter()
                .zip(&current)
                .map(|(op, attributes)| match op.condition() {
                    Some(condition) if !condition.evaluate(attributes.as_ref()) => {
                        CancelReason::ConditionalCheckFailed
                    }
                    _ => CancelReason::None,
                })
                .collect();
            if reasons.contains(&CancelReason::ConditionalCheckFailed) {
                return Err(TableError::TransactionCanceled { reasons });
            }

            for (op, attributes) in ops.into_iter().zip(current) {
                let (key, next) = op.apply(attributes);
                save(&tx, &key, next)?;
            }
            tx.commit().map_err(unavailable)
        })
        .await
    }

    async fn query(
        &self,
        pk: &str,
        range: SortKeyRange,
        order: Order,
    ) -> Result<Vec<Item>, TableError> {
        let pk = pk.to_string();
        self.run(move |conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT sk, attributes FROM items WHERE pk = ?1 AND sk >= ?2 ORDER BY sk",
                )
                .map_err(unavailable)?;
            let mut rows = stmt
                .query(params![pk, lower_bound(&range)])
                .map_err(unavailable)?;

            let mut matched = Vec::new();
            while let Some(row) = rows.next().map_err(unavailable)? {
                let sk: String = row.get(0).map_err(unavailable)?;
                // Rows arrive in sort-key order; the first miss ends the range.
                if !range.contains(&sk) {
                    break;
                }
                let raw: String = row.get(1).map_err(unavailable)?;
                let key = Key::new(pk.clone(), sk);
                let attributes = decode(&key, &raw)?;
                matched.push(Item { key, attributes });
            }

            if order == Order::Descending {
                matched.reverse();
            }
            Ok(matched)
        })
        .await
    }

    async fn batch_delete(&self, keys: Vec<Key>) -> Result<(), TableError> {
        if keys.len() > BATCH_DELETE_LIMIT {
            return Err(TableError::TooManyItems {
                operation: "batch delete",
                count: keys.len(),
                limit: BATCH_DELETE_LIMIT,
            });
        }

        self.run(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(unavailable)?;
            for key in &keys {
                save(&tx, key, None)?;
            }
            tx.commit().map_err(unavailable)
        })
        .await
    }
}
