//! Logical broker connection with reconnection and a channel factory.
//!
//! The manager owns at most one live [`AmqpConnection`]. Connect attempts are
//! serialized on an async mutex, so callers racing on `get_channel` while a
//! connect is pending wait for it instead of opening a second connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::sleep;
use tracing::{debug, info};

use super::amqp_client::{AmqpChannel, AmqpConnection, AmqpConnector, LapinConnector, LinkEvent};
use super::errors::{RabbitError, Result, RetryExhausted};
use super::events::{ConnectionEvent, Notifier, Severity, TAG_CHANNEL, TAG_CONNECTION};
use crate::config::ConnectionConfig;

const FIRST_RETRY_DELAY: Duration = Duration::from_millis(1000);
const RETRY_BAND: u32 = 5;
const BAND_DELAY_MS: f64 = 60_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Entered by an explicit `close()` and never left.
    Closed,
}

/// Delay before retry number `retry` (zero based).
///
/// Retries come in bands of five: the first band waits one second, band `n`
/// waits `n^2.5` minutes, capped at `max_delay_ms`.
pub fn backoff_delay(retry: u32, max_delay_ms: u64) -> Duration {
    let range = f64::from(retry / RETRY_BAND);
    let delay = (range * range.powf(1.5) * BAND_DELAY_MS).min(max_delay_ms as f64);

    if delay.is_nan() || delay <= 0.0 {
        FIRST_RETRY_DELAY
    } else {
        Duration::from_millis(delay as u64)
    }
}

struct Link {
    connection: Option<Arc<dyn AmqpConnection>>,
    retry: u32,
    /// Successful connects so far.
    connects: u64,
    /// Bumped whenever the current handle is replaced or dropped, so events
    /// from stale handles are ignored.
    generation: u64,
}

struct Inner {
    config: ConnectionConfig,
    connector: Arc<dyn AmqpConnector>,
    notifier: Notifier,
    link: Mutex<Link>,
    reconnect_gate: Mutex<()>,
    closed: AtomicBool,
    state: watch::Sender<ConnectionState>,
    /// Mirrors `Link::connects` for subscribers that must not miss a reconnect.
    connects: watch::Sender<u64>,
}

/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Manager backed by lapin. Validates the configuration.
    pub fn new(config: ConnectionConfig) -> Result<Self> {
        Self::with_connector(config, Arc::new(LapinConnector))
    }

    pub fn with_connector(config: ConnectionConfig, connector: Arc<dyn AmqpConnector>) -> Result<Self> {
        config.validate()?;
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (connects, _) = watch::channel(0);

        Ok(ConnectionManager {
            inner: Arc::new(Inner {
                config,
                connector,
                notifier: Notifier::default(),
                link: Mutex::new(Link {
                    connection: None,
                    retry: 0,
                    connects: 0,
                    generation: 0,
                }),
                reconnect_gate: Mutex::new(()),
                closed: AtomicBool::new(false),
                state,
                connects,
            }),
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watches state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// `Connected`, `Reconnected` and log notifications.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.notifier.subscribe()
    }

    /// Number of successful connects so far. Unlike [`events`](Self::events)
    /// this never lags, so a changed value always means a new connection.
    pub fn connects(&self) -> watch::Receiver<u64> {
        self.inner.connects.subscribe()
    }

    pub(crate) fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub async fn retry_count(&self) -> u32 {
        self.inner.link.lock().await.retry
    }

    /// Opens the broker connection, or returns the live one.
    pub async fn connect(&self) -> Result<Arc<dyn AmqpConnection>> {
        let mut link = self.inner.link.lock().await;
        self.connect_locked(&mut link).await
    }

    async fn connect_locked(&self, link: &mut Link) -> Result<Arc<dyn AmqpConnection>> {
        if self.is_closed() {
            return Err(RabbitError::Closed);
        }
        if let Some(connection) = live(link) {
            return Ok(connection);
        }

        self.set_state(ConnectionState::Connecting);

        let connection = match self.inner.connector.connect(&self.inner.config).await {
            Ok(connection) => connection,
            Err(err) => {
                let message = match err {
                    RabbitError::Connection(message) => message,
                    other => other.to_string(),
                };
                self.inner
                    .notifier
                    .log(Severity::Error, TAG_CONNECTION, message.clone());
                self.set_state(if link.retry > 0 {
                    ConnectionState::Reconnecting
                } else {
                    ConnectionState::Disconnected
                });
                return Err(RabbitError::Connection(message));
            }
        };

        if self.is_closed() {
            // close() ran while the connect was in flight.
            let _ = connection.close().await;
            return Err(RabbitError::Closed);
        }

        link.generation += 1;
        self.watch_link(&connection, link.generation);

        let reconnected = link.retry > 0 || link.connects > 0;
        link.retry = 0;
        link.connects += 1;
        link.connection = Some(connection.clone());
        self.set_state(ConnectionState::Connected);
        self.inner.connects.send_replace(link.connects);

        self.inner.notifier.log(Severity::Info, TAG_CONNECTION, "connected");
        self.inner.notifier.emit(ConnectionEvent::Connected);
        if reconnected {
            self.inner.notifier.emit(ConnectionEvent::Reconnected);
        }

        Ok(connection)
    }

    /// Drops the current connection and retries with backoff until a connect
    /// succeeds, the manager is closed, or (without auto-reconnect) the retry
    /// budget runs out.
    pub async fn reconnect(&self) -> Result<Arc<dyn AmqpConnection>> {
        let _gate = match self.inner.reconnect_gate.try_lock() {
            Ok(gate) => gate,
            Err(_) => {
                // Another reconnect sequence is running; reuse its outcome.
                let gate = self.inner.reconnect_gate.lock().await;
                let link = self.inner.link.lock().await;
                if let Some(connection) = live(&link) {
                    return Ok(connection);
                }
                gate
            }
        };

        let config = &self.inner.config;
        let mut attempt = 0u32;

        loop {
            let delay = {
                let mut link = self.inner.link.lock().await;

                if self.is_closed() {
                    return Err(RabbitError::Closed);
                }
                if attempt > 0 {
                    if let Some(connection) = live(&link) {
                        return Ok(connection);
                    }
                }
                if link.retry >= config.max_retry && !config.auto_reconnect {
                    let details = RetryExhausted::default();
                    self.inner
                        .notifier
                        .log(Severity::Error, TAG_CONNECTION, details.dev_message.clone());
                    return Err(RabbitError::RetryExhausted(details));
                }

                if let Some(stale) = link.connection.take() {
                    link.generation += 1;
                    if stale.is_connected() {
                        if let Err(err) = stale.close().await {
                            debug!(error = %err, "stale connection did not close cleanly");
                        }
                    }
                }

                let delay = backoff_delay(link.retry, config.max_delay_ms);
                link.retry += 1;
                self.set_state(ConnectionState::Reconnecting);
                info!(retry = link.retry, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
                delay
            };

            attempt += 1;
            if !self.sleep_unless_closed(delay).await {
                return Err(RabbitError::Closed);
            }

            let mut link = self.inner.link.lock().await;
            match self.connect_locked(&mut link).await {
                Ok(connection) => return Ok(connection),
                Err(RabbitError::Closed) => return Err(RabbitError::Closed),
                // Already logged by connect_locked.
                Err(_) => continue,
            }
        }
    }

    /// Closes the manager for good. Pending reconnect waits are cancelled.
    pub async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.state.send_replace(ConnectionState::Closed);

        let connection = {
            let mut link = self.inner.link.lock().await;
            link.generation += 1;
            link.connection.take()
        };

        if let Some(connection) = connection {
            if connection.is_connected() {
                connection.close().await?;
            }
            self.inner.notifier.log(Severity::Info, TAG_CONNECTION, "closed");
        }

        Ok(())
    }

    /// Opens a new channel, connecting first if needed.
    pub async fn get_channel(&self) -> Result<Arc<dyn AmqpChannel>> {
        let (channel, _) = self.open_channel().await?;
        Ok(channel)
    }

    /// Like [`get_channel`](Self::get_channel), also returning the connect
    /// count of the connection the channel lives on.
    pub(crate) async fn open_channel(&self) -> Result<(Arc<dyn AmqpChannel>, u64)> {
        let (connection, connects) = {
            let mut link = self.inner.link.lock().await;
            let connection = self.connect_locked(&mut link).await?;
            (connection, link.connects)
        };

        let channel = connection.create_channel().await.map_err(|err| match err {
            RabbitError::Channel(message) => RabbitError::Channel(message),
            other => RabbitError::Channel(other.to_string()),
        })?;

        let notifier = self.inner.notifier.clone();
        channel.on_error(Box::new(move |message| {
            notifier.log(Severity::Error, TAG_CHANNEL, message)
        }));

        debug!(channel_id = channel.id(), "channel created");
        Ok((channel, connects))
    }

    fn set_state(&self, next: ConnectionState) {
        self.inner.state.send_if_modified(|current| {
            if *current == ConnectionState::Closed || *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    async fn sleep_unless_closed(&self, delay: Duration) -> bool {
        let mut state = self.inner.state.subscribe();
        tokio::select! {
            _ = sleep(delay) => !self.is_closed(),
            _ = state.wait_for(|s| *s == ConnectionState::Closed) => false,
        }
    }

    fn watch_link(&self, connection: &Arc<dyn AmqpConnection>, generation: u64) {
        let manager = Arc::downgrade(&self.inner);
        let runtime = tokio::runtime::Handle::current();

        connection.on_event(Box::new(move |event| {
            let Some(inner) = manager.upgrade() else {
                return;
            };
            let manager = ConnectionManager { inner };

            match event {
                LinkEvent::Error(message) => {
                    if !manager.is_closed() {
                        manager
                            .inner
                            .notifier
                            .log(Severity::Error, TAG_CONNECTION, message);
                    }
                }
                LinkEvent::Closed => {
                    if !manager.is_closed() {
                        runtime.spawn(async move { manager.on_link_closed(generation).await });
                    }
                }
            }
        }));
    }

    async fn on_link_closed(&self, generation: u64) {
        {
            let mut link = self.inner.link.lock().await;
            if link.generation != generation || self.is_closed() {
                return;
            }
            link.connection = None;
            link.generation += 1;
            self.set_state(ConnectionState::Disconnected);
        }

        if !self.inner.config.auto_reconnect {
            return;
        }

        self.inner
            .notifier
            .log(Severity::Info, TAG_CONNECTION, "trying to reconnect");
        match self.reconnect().await {
            Ok(_) | Err(RabbitError::Closed) => {}
            Err(err) => self
                .inner
                .notifier
                .log(Severity::Error, TAG_CONNECTION, err.to_string()),
        }
    }
}

fn live(link: &Link) -> Option<Arc<dyn AmqpConnection>> {
    link.connection
        .as_ref()
        .filter(|connection| connection.is_connected())
        .cloned()
}
