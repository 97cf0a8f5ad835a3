// src/client.rs
//
// Host-facing context: one connection manager plus the consumers created
// through it.

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::ConnectionConfig;
use crate::message::MessageInput;
use crate::rabbitmq::amqp_client::AmqpConnector;
use crate::rabbitmq::connection::ConnectionManager;
use crate::rabbitmq::consumer::{Consumer, ConsumerSpec};
use crate::rabbitmq::errors::Result;
use crate::rabbitmq::events::{ConnectionEvent, Severity, TAG_CONSUMER, TAG_PUBLISHER};
use crate::rabbitmq::publisher::{publish, PublishTarget};
use crate::rabbitmq::topology::{ExchangeSpec, QueueSpec};

#[derive(Debug, Clone, PartialEq)]
pub struct PublishRequest {
    pub target: PublishTarget,
    pub message: MessageInput,
}

impl PublishRequest {
    pub fn new(target: PublishTarget, message: impl Into<MessageInput>) -> Self {
        Self {
            target,
            message: message.into(),
        }
    }

    pub fn to_queue(queue: QueueSpec, message: impl Into<MessageInput>) -> Self {
        Self::new(PublishTarget::queue(queue), message)
    }

    pub fn to_exchange(exchange: ExchangeSpec, message: impl Into<MessageInput>) -> Self {
        Self::new(PublishTarget::exchange(exchange), message)
    }

    pub fn routing_key(mut self, routing_key: &str) -> Self {
        self.target.routing_key = Some(routing_key.to_string());
        self
    }

    pub fn queue(mut self, queue: QueueSpec) -> Self {
        self.target.queue = Some(queue);
        self
    }
}

pub struct Rabbit {
    manager: ConnectionManager,
    consumers: Mutex<Vec<Arc<Consumer>>>,
}

impl Rabbit {
    pub fn new(config: ConnectionConfig) -> Result<Self> {
        Ok(Self::from_manager(ConnectionManager::new(config)?))
    }

    pub fn with_connector(config: ConnectionConfig, connector: Arc<dyn AmqpConnector>) -> Result<Self> {
        Ok(Self::from_manager(ConnectionManager::with_connector(config, connector)?))
    }

    fn from_manager(manager: ConnectionManager) -> Self {
        Self {
            manager,
            consumers: Mutex::new(Vec::new()),
        }
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.manager.events()
    }

    /// Publishes on a short-lived channel, closed afterwards even when the
    /// publish fails.
    pub async fn publish(&self, request: PublishRequest) -> Result<()> {
        let channel = self.manager.get_channel().await?;

        let published = publish(
            channel.as_ref(),
            request.target.exchange.as_ref(),
            request.target.queue.as_ref(),
            request.target.routing_key.as_deref(),
            request.message,
        )
        .await;

        if let Err(e) = channel.close().await {
            warn!(channel_id = channel.id(), "publish channel close failed: {}", e);
        }

        if let Err(e) = &published {
            self.manager
                .notifier()
                .log(Severity::Error, TAG_PUBLISHER, format!("publish failed: {}", e));
        }
        published
    }

    /// Subscribes and keeps the consumer until [`Rabbit::shutdown`].
    pub async fn subscribe(&self, spec: ConsumerSpec) -> Result<Arc<Consumer>> {
        let consumer = Consumer::new(self.manager.clone(), spec);
        consumer.subscribe().await?;

        self.lock_consumers().push(consumer.clone());
        Ok(consumer)
    }

    /// Closes every consumer, then the connection.
    pub async fn shutdown(&self) -> Result<()> {
        let consumers: Vec<_> = self.lock_consumers().drain(..).collect();

        for consumer in consumers {
            if let Err(e) = consumer.close().await {
                self.manager.notifier().log(
                    Severity::Warn,
                    TAG_CONSUMER,
                    format!("closing consumer of {} failed: {}", consumer.spec().queue.name, e),
                );
            }
        }

        self.manager.close().await?;
        info!("rabbit context shut down");
        Ok(())
    }

    /// Blocks until Ctrl+C, then shuts down.
    pub async fn run_until_interrupted(&self) -> Result<()> {
        tokio::signal::ctrl_c().await?;
        info!("interrupt received");
        self.shutdown().await
    }

    fn lock_consumers(&self) -> std::sync::MutexGuard<'_, Vec<Arc<Consumer>>> {
        match self.consumers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
