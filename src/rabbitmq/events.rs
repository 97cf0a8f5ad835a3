//! Connection notifications and the operational log stream.
//!
//! Every component shares one [`Notifier`]. Sending never blocks: slow
//! receivers lag and lose old records instead of stalling the sender.
//! Anything that must not miss a reconnect watches
//! `ConnectionManager::connects` instead.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

const EVENT_BUFFER: usize = 256;

pub const TAG_AMQP: &str = "AMQP";
pub const TAG_CONNECTION: &str = "connection";
pub const TAG_CHANNEL: &str = "channel";
pub const TAG_CONSUMER: &str = "consumer";
pub const TAG_PUBLISHER: &str = "publisher";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warn,
    Info,
}

impl Severity {
    pub fn as_tag(&self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warn => "warn",
            Severity::Info => "info",
        }
    }
}

/// One `{ tags, message }` record of the log stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogRecord {
    pub tags: Vec<&'static str>,
    pub message: String,
}

impl LogRecord {
    pub fn new(severity: Severity, subsystem: &'static str, message: impl Into<String>) -> Self {
        Self {
            tags: vec![severity.as_tag(), TAG_AMQP, subsystem],
            message: message.into(),
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| *t == tag)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    /// A connect succeeded after a retry or after an earlier connection was lost.
    /// Subscriptions must be re-created.
    Reconnected,
    Log(LogRecord),
}

#[derive(Debug, Clone)]
pub struct Notifier {
    sender: broadcast::Sender<ConnectionEvent>,
}

impl Default for Notifier {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER);
        Self { sender }
    }
}

impl Notifier {
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ConnectionEvent) {
        // No receivers is fine.
        let _ = self.sender.send(event);
    }

    /// Forwards the record to `tracing` and broadcasts it.
    pub fn log(&self, severity: Severity, subsystem: &'static str, message: impl Into<String>) {
        let record = LogRecord::new(severity, subsystem, message);
        match severity {
            Severity::Error => error!(subsystem, "{}", record.message),
            Severity::Warn => warn!(subsystem, "{}", record.message),
            Severity::Info => info!(subsystem, "{}", record.message),
        }
        self.emit(ConnectionEvent::Log(record));
    }
}
