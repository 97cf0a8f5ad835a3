use std::sync::Arc;

use tracing::{debug, instrument};

use super::amqp_client::AmqpChannel;
use super::errors::{RabbitError, Result};
use super::topology::{ExchangeSpec, QueueSpec};
use crate::message::{normalize, Message, MessageInput};

/// Where a publish goes: an exchange, a queue, or both.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishTarget {
    pub exchange: Option<ExchangeSpec>,
    pub queue: Option<QueueSpec>,
    pub routing_key: Option<String>,
}

impl PublishTarget {
    pub fn queue(queue: QueueSpec) -> Self {
        Self {
            queue: Some(queue),
            ..Self::default()
        }
    }

    pub fn exchange(exchange: ExchangeSpec) -> Self {
        Self {
            exchange: Some(exchange),
            ..Self::default()
        }
    }

    pub fn with_queue(mut self, queue: QueueSpec) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_routing_key(mut self, routing_key: &str) -> Self {
        self.routing_key = Some(routing_key.to_string());
        self
    }
}

/// Publishes on a channel it does not own; closing the channel is up to the caller.
pub struct Publisher {
    channel: Arc<dyn AmqpChannel>,
    target: PublishTarget,
}

impl Publisher {
    pub fn new(channel: Arc<dyn AmqpChannel>, target: PublishTarget) -> Self {
        Self { channel, target }
    }

    pub fn target(&self) -> &PublishTarget {
        &self.target
    }

    pub async fn publish(&self, message: impl Into<MessageInput>) -> Result<()> {
        let message = normalize(message)?;
        self.publish_message(&message).await
    }

    pub async fn publish_message(&self, message: &Message) -> Result<()> {
        publish_normalized(
            self.channel.as_ref(),
            self.target.exchange.as_ref(),
            self.target.queue.as_ref(),
            self.target.routing_key.as_deref(),
            message,
        )
        .await
    }
}

/// Normalizes `message`, asserts the topology and publishes.
///
/// With both an exchange and a queue, the queue is bound under `routing_key`
/// (or the empty key) and the message goes to the exchange under
/// `routing_key`, falling back to the queue name. With only a queue it goes
/// through the default exchange.
pub async fn publish(
    channel: &dyn AmqpChannel,
    exchange: Option<&ExchangeSpec>,
    queue: Option<&QueueSpec>,
    routing_key: Option<&str>,
    message: impl Into<MessageInput>,
) -> Result<()> {
    let message = normalize(message)?;
    publish_normalized(channel, exchange, queue, routing_key, &message).await
}

#[instrument(skip(channel, exchange, queue, message), fields(channel_id = channel.id()))]
async fn publish_normalized(
    channel: &dyn AmqpChannel,
    exchange: Option<&ExchangeSpec>,
    queue: Option<&QueueSpec>,
    routing_key: Option<&str>,
    message: &Message,
) -> Result<()> {
    let exchange = exchange.filter(|e| e.is_named());

    if let Some(exchange) = exchange {
        channel.assert_exchange(exchange).await?;
    }

    let queue_name = match queue {
        Some(queue) => Some(channel.assert_queue(queue).await?),
        None => None,
    };

    let (target, key) = match (exchange, queue_name) {
        (Some(exchange), Some(queue_name)) => {
            channel
                .bind_queue(&queue_name, &exchange.name, routing_key.unwrap_or_default())
                .await?;
            let key = routing_key
                .filter(|key| !key.is_empty())
                .map(str::to_string)
                .unwrap_or(queue_name);
            (exchange.name.clone(), key)
        }
        (Some(exchange), None) => (
            exchange.name.clone(),
            routing_key.unwrap_or_default().to_string(),
        ),
        (None, Some(queue_name)) => (String::new(), queue_name),
        (None, None) => match routing_key.filter(|key| !key.is_empty()) {
            Some(key) => (String::new(), key.to_string()),
            None => {
                return Err(RabbitError::Validation(
                    "publish needs an exchange, a queue or a routing key".to_string(),
                ))
            }
        },
    };

    channel.publish(&target, &key, message).await?;
    debug!(exchange = %target, routing_key = %key, bytes = message.content.len(), "message published");
    Ok(())
}
