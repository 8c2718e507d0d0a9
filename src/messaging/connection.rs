use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::broker::{BrokerError, Channel, Connection, Transport};
use crate::utils::{retry_on_transient, RetryConfig, RetryResult};

// ============================================================================
// Connection Manager
// ============================================================================
//
// One logical broker connection per process, shared by every producer and
// consumer role through named channels. The manager is an owned handle:
// binaries build it once and pass `Arc<ConnectionManager>` to the Publisher
// and the Consumer.
//
// - open_channel(name) returns the open channel registered under `name`, or
//   opens a new one (connecting first when needed)
// - connecting retries transient failures with exponential backoff up to
//   the configured budget; permanent failures surface at once
// - a lost connection invalidates every channel; the next open_channel call
//   reconnects
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("broker unreachable after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: BrokerError,
    },

    #[error("connection manager is closed")]
    Closed,

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[derive(Default)]
struct ManagerState {
    connection: Option<Arc<dyn Connection>>,
    channels: HashMap<String, Arc<dyn Channel>>,
}

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    retry: RetryConfig,
    state: Mutex<ManagerState>,
    closed: AtomicBool,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, retry: RetryConfig) -> Self {
        Self {
            transport,
            retry,
            state: Mutex::new(ManagerState::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Connect eagerly so startup fails fast when the broker is unreachable.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        // close() may have run while we waited for the lock
        self.ensure_open()?;
        self.connection(&mut state).await.map(|_| ())
    }

    pub async fn is_connected(&self) -> bool {
        let state = self.state.lock().await;
        state.connection.as_ref().is_some_and(|c| c.is_open())
    }

    pub async fn open_channel(&self, name: &str) -> Result<Arc<dyn Channel>, ConnectionError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        self.ensure_open()?;

        if let Some(channel) = state.channels.get(name) {
            if channel.is_open() {
                return Ok(channel.clone());
            }
        }

        let connection = self.connection(&mut state).await?;
        let channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(e) if e.is_connection_loss() => {
                tracing::warn!(channel = name, error = %e, "Connection lost while opening channel, reconnecting");
                state.connection = None;
                let connection = self.connection(&mut state).await?;
                connection.open_channel().await?
            }
            Err(e) => return Err(e.into()),
        };

        state.channels.insert(name.to_string(), channel.clone());
        tracing::info!(channel = name, transport = self.transport.name(), "Opened broker channel");
        Ok(channel)
    }

    /// Close the channel registered under `name` (its unsettled deliveries
    /// go back to the broker) and open a fresh one.
    pub async fn reopen_channel(&self, name: &str) -> Result<Arc<dyn Channel>, ConnectionError> {
        self.discard_channel(name).await;
        self.open_channel(name).await
    }

    /// Forget a channel that failed. The next `open_channel` replaces it.
    pub async fn discard_channel(&self, name: &str) {
        let removed = self.state.lock().await.channels.remove(name);
        if let Some(channel) = removed {
            channel.close().await;
            tracing::debug!(channel = name, "Discarded broker channel");
        }
    }

    /// Release every channel and the connection. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let (channels, connection) = {
            let mut state = self.state.lock().await;
            let channels: Vec<(String, Arc<dyn Channel>)> = state.channels.drain().collect();
            (channels, state.connection.take())
        };

        for (name, channel) in channels {
            channel.close().await;
            tracing::debug!(channel = %name, "Closed broker channel");
        }
        if let Some(connection) = connection {
            connection.close().await;
        }
        tracing::info!(transport = self.transport.name(), "Broker connection closed");
    }

    /// Drive `work` to completion, then close whatever it returned.
    pub async fn close_after<T>(&self, work: impl Future<Output = T>) -> T {
        let output = work.await;
        self.close().await;
        output
    }

    fn ensure_open(&self) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ConnectionError::Closed)
        } else {
            Ok(())
        }
    }

    async fn connection(&self, state: &mut ManagerState) -> Result<Arc<dyn Connection>, ConnectionError> {
        self.ensure_open()?;
        if let Some(connection) = &state.connection {
            if connection.is_open() {
                return Ok(connection.clone());
            }
            tracing::warn!(transport = self.transport.name(), "Broker connection lost, reconnecting");
        }

        // Channels die with their connection
        state.channels.clear();
        state.connection = None;

        let transport = self.transport.clone();
        let result = retry_on_transient("broker.connect", self.retry.clone(), |attempt| {
            let transport = transport.clone();
            async move {
                tracing::debug!(attempt, transport = transport.name(), "Connecting to broker");
                transport.connect().await
            }
        })
        .await;

        match result {
            RetryResult::Success(connection) => {
                state.connection = Some(connection.clone());
                Ok(connection)
            }
            RetryResult::Failed(source) => Err(ConnectionError::Exhausted {
                attempts: self.retry.max_attempts,
                source,
            }),
            RetryResult::PermanentFailure(source) => Err(ConnectionError::Broker(source)),
        }
    }
}
