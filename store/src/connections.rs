//! Websocket connection registry. Each connection is written twice: under the
//! driver for fan-out and under the connection id for reverse lookup. Both
//! copies carry `expires_at`. Readers never return expired entries and
//! delete the ones they come across.

use crate::errors::translate;
use crate::keys::{INFO, WS_PREFIX, driver_pk, websocket_pk, ws_sk};
use crate::records::{WebSocketConnection, to_attributes};
use crate::table::{BATCH_DELETE_LIMIT, Key, Order, SortKeyRange, WriteOp};
use crate::{Store, StoreError};
use chrono::{DateTime, Utc};

fn fan_out_key(driver_id: i64, connection_id: &str) -> Key {
    Key::new(driver_pk(driver_id), ws_sk(connection_id))
}

fn reverse_key(connection_id: &str) -> Key {
    Key::new(websocket_pk(connection_id), INFO)
}

impl Store {
    pub async fn save_connection(&self, connection: &WebSocketConnection) -> Result<(), StoreError> {
        let attributes = to_attributes("websocket connection", connection)?;
        self.transact(vec![
            WriteOp::put(
                fan_out_key(connection.driver_id, &connection.connection_id),
                attributes.clone(),
            ),
            WriteOp::put(reverse_key(&connection.connection_id), attributes),
        ])
        .await
    }

    pub async fn get_connection(
        &self,
        connection_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<WebSocketConnection>, StoreError> {
        let connection: Option<WebSocketConnection> =
            self.get_record(&reverse_key(connection_id)).await?;
        match connection {
            Some(c) if c.expires_at <= now => {
                self.prune_expired(&[c]).await;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    /// Live connections of a driver.
    pub async fn list_connections(
        &self,
        driver_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<WebSocketConnection>, StoreError> {
        let connections: Vec<WebSocketConnection> = self
            .query_records(
                &driver_pk(driver_id),
                SortKeyRange::BeginsWith(WS_PREFIX.into()),
                Order::Ascending,
            )
            .await?;
        let (live, expired): (Vec<_>, Vec<_>) =
            connections.into_iter().partition(|c| c.expires_at > now);
        if !expired.is_empty() {
            self.prune_expired(&expired).await;
        }
        Ok(live)
    }

    /// Best effort; a failed delete is retried by the next reader.
    async fn prune_expired(&self, expired: &[WebSocketConnection]) {
        let keys: Vec<Key> = expired
            .iter()
            .flat_map(|c| {
                [
                    fan_out_key(c.driver_id, &c.connection_id),
                    reverse_key(&c.connection_id),
                ]
            })
            .collect();
        for chunk in keys.chunks(BATCH_DELETE_LIMIT) {
            if let Err(e) = self.table.batch_delete(chunk.to_vec()).await {
                tracing::warn!(error = %e, "failed to delete expired websocket connections");
                return;
            }
        }
        tracing::debug!(count = expired.len(), "deleted expired websocket connections");
    }

    /// Removes both copies. Deleting an unknown connection is not an error.
    pub async fn delete_connection(
        &self,
        driver_id: i64,
        connection_id: &str,
    ) -> Result<(), StoreError> {
        self.table
            .transact(vec![
                WriteOp::delete(fan_out_key(driver_id, connection_id)),
                WriteOp::delete(reverse_key(connection_id)),
            ])
            .await
            .map_err(translate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryTable;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn connection(id: &str, driver_id: i64, connected_at: i64) -> WebSocketConnection {
        let connected_at = Utc.timestamp_opt(connected_at, 0).unwrap();
        WebSocketConnection {
            connection_id: id.into(),
            driver_id,
            connected_at,
            expires_at: connected_at + Duration::hours(2),
        }
    }

    #[tokio::test]
    async fn test_registry() {
        let store = Store::new(Arc::new(MemoryTable::new()));
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        store.save_connection(&connection("a=", 1001, 1_700_000_000)).await.unwrap();
        store.save_connection(&connection("b=", 1001, 1_699_993_700)).await.unwrap();
        store.save_connection(&connection("c=", 2002, 1_700_000_000)).await.unwrap();

        let live = store.list_connections(1001, now).await.unwrap();
        assert_eq!(live.len(), 2);

        // b= expires at 1_700_000_900.
        let later = now + Duration::minutes(30);
        let live: Vec<String> = store
            .list_connections(1001, later)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.connection_id)
            .collect();
        assert_eq!(live, vec!["a=".to_string()]);

        assert_eq!(
            store.get_connection("c=", now).await.unwrap().unwrap().driver_id,
            2002
        );
        assert!(store.get_connection("b=", later).await.unwrap().is_none());

        store.delete_connection(1001, "a=").await.unwrap();
        store.delete_connection(1001, "a=").await.unwrap();
        assert!(store.get_connection("a=", now).await.unwrap().is_none());
        // b= was deleted when the later read found it expired.
        assert!(store.list_connections(1001, now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_connections_are_deleted() {
        let table = Arc::new(MemoryTable::new());
        let store = Store::new(table.clone());
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        store.save_connection(&connection("live=", 1001, 1_700_000_000)).await.unwrap();
        store.save_connection(&connection("stale=", 1001, 1_699_990_000)).await.unwrap();
        store.save_connection(&connection("idle=", 2002, 1_699_990_000)).await.unwrap();
        assert_eq!(table.partition_len(&driver_pk(1001)), 2);

        assert_eq!(store.list_connections(1001, now).await.unwrap().len(), 1);
        assert_eq!(table.partition_len(&driver_pk(1001)), 1);
        assert_eq!(table.partition_len(&websocket_pk("stale=")), 0);
        assert_eq!(table.partition_len(&websocket_pk("live=")), 1);

        assert!(store.get_connection("idle=", now).await.unwrap().is_none());
        assert_eq!(table.partition_len(&websocket_pk("idle=")), 0);
        assert_eq!(table.partition_len(&driver_pk(2002)), 0);
    }
}
