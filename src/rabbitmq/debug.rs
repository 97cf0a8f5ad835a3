//! Diversion of failed messages to a debug queue.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::amqp_client::AmqpChannel;
use super::errors::Result;
use super::publisher::{PublishTarget, Publisher};
use super::topology::QueueSpec;
use crate::message::{normalize, MessageOptions, MessageRecord, ReceivedMessage};

const DEBUG_MARKER: &str = "debug";
const RESERVED_PREFIX: &str = "amq.";

fn default_true() -> bool {
    true
}

fn default_expires() -> u64 {
    86_400_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DebugSpec {
    #[serde(default)]
    pub enabled: bool,
    /// An empty name is derived from the consumed queue.
    #[serde(default)]
    pub queue: QueueSpec,
    #[serde(default = "default_true")]
    pub durable: bool,
    #[serde(default = "default_true")]
    pub persistent: bool,
    /// Expiration of diverted messages, in milliseconds.
    #[serde(default = "default_expires")]
    pub expires: u64,
}

impl Default for DebugSpec {
    fn default() -> Self {
        Self {
            enabled: false,
            queue: QueueSpec::default(),
            durable: true,
            persistent: true,
            expires: default_expires(),
        }
    }
}

impl DebugSpec {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn with_queue(mut self, queue: QueueSpec) -> Self {
        self.queue = queue;
        self
    }

    /// Debug queue declaration for a consumer of `source_queue`.
    pub fn resolve_queue(&self, source_queue: &str) -> QueueSpec {
        let mut queue = self.queue.clone();
        if queue.name.is_empty() {
            queue.name = derive_debug_queue_name(source_queue);
        }
        queue.durable = self.durable;
        queue
    }
}

/// `my_model.my_action` becomes `my_model.debug.my_action`.
///
/// Names without a final segment get a `.debug` suffix. Broker-generated
/// `amq.*` names are prefixed instead, since `amq.` is reserved.
pub fn derive_debug_queue_name(queue: &str) -> String {
    if queue.starts_with(RESERVED_PREFIX) {
        return format!("{}.{}", DEBUG_MARKER, queue);
    }

    match queue.rfind('.') {
        Some(idx) if idx + 1 < queue.len() => {
            format!("{}.{}{}", &queue[..idx], DEBUG_MARKER, &queue[idx..])
        }
        _ => format!("{}.{}", queue, DEBUG_MARKER),
    }
}

/// Publisher bound to a consumer's debug queue.
pub struct DebugPublisher {
    publisher: Publisher,
    options: MessageOptions,
}

impl DebugPublisher {
    pub fn new(channel: Arc<dyn AmqpChannel>, spec: &DebugSpec, source_queue: &str) -> Self {
        let queue = spec.resolve_queue(source_queue);
        let options = MessageOptions {
            persistent: spec.persistent,
            expiration: Some(spec.expires.to_string()),
            ..MessageOptions::default()
        };

        Self {
            publisher: Publisher::new(channel, PublishTarget::queue(queue)),
            options,
        }
    }

    pub fn queue_name(&self) -> &str {
        self.publisher
            .target()
            .queue
            .as_ref()
            .map(|queue| queue.name.as_str())
            .unwrap_or_default()
    }

    /// Publishes `{ error, message, date }` for a failed delivery.
    pub async fn divert(&self, error: &str, message: &ReceivedMessage) -> Result<()> {
        let body = json!({
            "error": error,
            "message": message,
            "date": Utc::now().to_rfc3339(),
        });

        let record = MessageRecord::new(serde_json::to_string(&body)?).with_options(self.options.clone());
        self.publisher.publish_message(&normalize(record)?).await
    }
}
