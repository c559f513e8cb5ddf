//! Push notifications to a driver's open websocket connections.
//!
//! Connections are registered in the store with a short TTL. The gateway that
//! owns the sockets is reached through a [`Transport`]; a connection the
//! gateway no longer knows is a stale registration, pruned on sight rather
//! than reported.

use crate::clock::Clock;
use crate::config::NotifyConfig;
use crate::metrics_defs::{NOTIFY_PRUNED, NOTIFY_PUSHES};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use shared::counter;
use std::sync::Arc;
use std::time::Duration;
use store::records::WebSocketConnection;
use store::{Store, StoreError};
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum NotifyError {
    #[error("connection {0} is gone")]
    Gone(String),
    #[error("gateway returned {status} for connection {connection_id}")]
    Status {
        status: StatusCode,
        connection_id: String,
    },
    #[error("gateway request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("gateway endpoint {0} cannot take a path")]
    InvalidEndpoint(Url),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, connection_id: &str, body: Vec<u8>) -> Result<(), NotifyError>;

    async fn close(&self, connection_id: &str) -> Result<(), NotifyError>;
}

/// Websocket gateway management API: `POST` sends a message to a connection,
/// `DELETE` closes it, `410 Gone` means the connection no longer exists.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpTransport {
    pub fn new(config: &NotifyConfig) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self::with_client(client, config.endpoint.clone()))
    }

    pub fn with_client(client: reqwest::Client, endpoint: Url) -> Self {
        HttpTransport { client, endpoint }
    }

    fn connection_url(&self, connection_id: &str) -> Result<Url, NotifyError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| NotifyError::InvalidEndpoint(self.endpoint.clone()))?
            .pop_if_empty()
            .push("@connections")
            .push(connection_id);
        Ok(url)
    }

    fn check(status: StatusCode, connection_id: &str) -> Result<(), NotifyError> {
        if status == StatusCode::GONE {
            Err(NotifyError::Gone(connection_id.to_string()))
        } else if !status.is_success() {
            Err(NotifyError::Status {
                status,
                connection_id: connection_id.to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, connection_id: &str, body: Vec<u8>) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(self.connection_url(connection_id)?)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;
        Self::check(response.status(), connection_id)
    }

    async fn close(&self, connection_id: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .delete(self.connection_url(connection_id)?)
            .send()
            .await?;
        Self::check(response.status(), connection_id)
    }
}

#[derive(Serialize)]
struct Message<'a> {
    action: &'a str,
    payload: &'a Value,
}

pub struct Notifier {
    store: Store,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
}

impl Notifier {
    pub fn new(
        store: Store,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        ttl: chrono::Duration,
    ) -> Self {
        Notifier {
            store,
            transport,
            clock,
            ttl,
        }
    }

    /// Registers a freshly opened connection for the driver.
    pub async fn register(
        &self,
        driver_id: i64,
        connection_id: &str,
    ) -> Result<WebSocketConnection, NotifyError> {
        let now = store::keys::truncate(self.clock.now());
        let connection = WebSocketConnection {
            connection_id: connection_id.to_string(),
            driver_id,
            connected_at: now,
            expires_at: now + self.ttl,
        };
        self.store.save_connection(&connection).await?;
        tracing::debug!(driver_id, connection_id, "registered connection");
        Ok(connection)
    }

    /// Sends one message. Returns false when the connection was gone; its
    /// registration is removed.
    pub async fn push(
        &self,
        driver_id: i64,
        connection_id: &str,
        action: &str,
        payload: &Value,
    ) -> Result<bool, NotifyError> {
        let body = serde_json::to_vec(&Message { action, payload })?;
        match self.transport.post(connection_id, body).await {
            Ok(()) => {
                counter!(NOTIFY_PUSHES, "result" => "delivered").increment(1);
                Ok(true)
            }
            Err(NotifyError::Gone(_)) => {
                counter!(NOTIFY_PUSHES, "result" => "gone").increment(1);
                self.prune(driver_id, connection_id).await?;
                Ok(false)
            }
            Err(error) => {
                counter!(NOTIFY_PUSHES, "result" => "error").increment(1);
                Err(error)
            }
        }
    }

    /// Sends a message to every live connection of the driver and returns how
    /// many received it. Every connection is attempted; the first failure
    /// other than a gone connection is returned afterwards.
    pub async fn broadcast(
        &self,
        driver_id: i64,
        action: &str,
        payload: &Value,
    ) -> Result<usize, NotifyError> {
        let connections = self
            .store
            .list_connections(driver_id, self.clock.now())
            .await?;

        let mut delivered = 0;
        let mut first_error = None;
        for connection in &connections {
            match self
                .push(driver_id, &connection.connection_id, action, payload)
                .await
            {
                Ok(true) => delivered += 1,
                Ok(false) => {}
                Err(error) => {
                    tracing::warn!(
                        driver_id,
                        connection_id = %connection.connection_id,
                        error = %error,
                        "push failed"
                    );
                    first_error.get_or_insert(error);
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(delivered),
        }
    }

    /// Closes the connection at the gateway and drops its registration. A
    /// connection that is already gone is not an error.
    pub async fn disconnect(&self, driver_id: i64, connection_id: &str) -> Result<(), NotifyError> {
        match self.transport.close(connection_id).await {
            Ok(()) | Err(NotifyError::Gone(_)) => {}
            Err(error) => return Err(error),
        }
        self.store.delete_connection(driver_id, connection_id).await?;
        Ok(())
    }

    async fn prune(&self, driver_id: i64, connection_id: &str) -> Result<(), NotifyError> {
        self.store.delete_connection(driver_id, connection_id).await?;
        counter!(NOTIFY_PRUNED).increment(1);
        tracing::info!(driver_id, connection_id, "pruned stale connection");
        Ok(())
    }
}
