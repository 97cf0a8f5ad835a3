// src/rabbitmq/consumer.rs
//
// Subscriptions: topology setup, delivery dispatch with ack/nack, debug
// diversion of failed messages and resubscription after reconnects.

use async_trait::async_trait;
use futures::future::try_join_all;
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info};
use uuid::Uuid;

use super::amqp_client::{AmqpChannel, Delivery, DeliveryStream};
use super::connection::{backoff_delay, ConnectionManager};
use super::debug::{DebugPublisher, DebugSpec};
use super::errors::{RabbitError, Result};
use super::events::{Notifier, Severity, TAG_CONSUMER};
use super::topology::{Arguments, ExchangeSpec, QueueSpec};
use crate::message::{DeliveryFields, ReceivedMessage};

fn default_requeue() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConsumeOptions {
    /// Generated as `consumer-<uuid>` when absent.
    #[serde(default)]
    pub consumer_tag: Option<String>,
    #[serde(default)]
    pub no_local: bool,
    /// Broker-side auto-ack. No ack or nack is ever sent.
    #[serde(default)]
    pub no_ack: bool,
    #[serde(default)]
    pub exclusive: bool,
    /// Consumer priority, sent as `x-priority`.
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub arguments: Arguments,
    /// Unacknowledged deliveries allowed per consumer. 0 is unlimited.
    #[serde(default)]
    pub prefetch: u16,
    /// Ack and nack also settle every earlier outstanding delivery.
    #[serde(default)]
    pub all_up_to: bool,
    #[serde(default = "default_requeue")]
    pub requeue: bool,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            consumer_tag: None,
            no_local: false,
            no_ack: false,
            exclusive: false,
            priority: None,
            arguments: Arguments::new(),
            prefetch: 0,
            all_up_to: false,
            requeue: true,
        }
    }
}

impl ConsumeOptions {
    pub fn resolve_tag(&self) -> String {
        self.consumer_tag
            .clone()
            .unwrap_or_else(|| format!("consumer-{}", Uuid::new_v4()))
    }

    pub fn prefetch(mut self, count: u16) -> Self {
        self.prefetch = count;
        self
    }

    pub fn requeue(mut self, requeue: bool) -> Self {
        self.requeue = requeue;
        self
    }

    pub fn no_ack(mut self, no_ack: bool) -> Self {
        self.no_ack = no_ack;
        self
    }

    pub fn all_up_to(mut self, all_up_to: bool) -> Self {
        self.all_up_to = all_up_to;
        self
    }
}

/// Processes one delivery. An `Err` nacks the message.
#[async_trait]
pub trait ReceiveHandler: Send + Sync {
    async fn receive(&self, message: ReceivedMessage) -> anyhow::Result<()>;
}

/// [`ReceiveHandler`] built from an async closure. See [`handler_fn`].
pub struct HandlerFn<F> {
    f: F,
}

pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(ReceivedMessage) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> ReceiveHandler for HandlerFn<F>
where
    F: Fn(ReceivedMessage) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn receive(&self, message: ReceivedMessage) -> anyhow::Result<()> {
        (self.f)(message).await
    }
}

pub type ReadyCallback = Arc<dyn Fn() + Send + Sync>;

/// Everything needed to (re)create one subscription.
#[derive(Clone)]
pub struct ConsumerSpec {
    pub queue: QueueSpec,
    pub exchange: Option<ExchangeSpec>,
    pub routing_keys: Vec<String>,
    pub options: ConsumeOptions,
    pub handler: Arc<dyn ReceiveHandler>,
    /// Called each time a subscription becomes active, resubscriptions included.
    pub on_ready: Option<ReadyCallback>,
    pub debug: Option<DebugSpec>,
}

impl ConsumerSpec {
    pub fn new(queue: QueueSpec, handler: impl ReceiveHandler + 'static) -> Self {
        Self {
            queue,
            exchange: None,
            routing_keys: Vec::new(),
            options: ConsumeOptions::default(),
            handler: Arc::new(handler),
            on_ready: None,
            debug: None,
        }
    }

    pub fn exchange(mut self, exchange: ExchangeSpec) -> Self {
        self.exchange = Some(exchange);
        self
    }

    pub fn routing_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.routing_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn options(mut self, options: ConsumeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn on_ready(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_ready = Some(Arc::new(callback));
        self
    }

    pub fn debug(mut self, debug: DebugSpec) -> Self {
        self.debug = Some(debug);
        self
    }
}

impl fmt::Debug for ConsumerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerSpec")
            .field("queue", &self.queue)
            .field("exchange", &self.exchange)
            .field("routing_keys", &self.routing_keys)
            .field("options", &self.options)
            .field("debug", &self.debug)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Unsubscribed,
    Subscribing,
    Active,
    Closed,
}

struct Subscription {
    channel: Arc<dyn AmqpChannel>,
    consumer_tag: String,
    queue: String,
    debug_queue: Option<String>,
    /// Connect count of the connection the channel was opened on.
    connection: u64,
    pump: JoinHandle<()>,
}

/// Shared by the tasks handling deliveries of one subscription.
struct Dispatch {
    channel: Arc<dyn AmqpChannel>,
    handler: Arc<dyn ReceiveHandler>,
    options: ConsumeOptions,
    debug: Option<DebugPublisher>,
    notifier: Notifier,
    consumer_tag: String,
}

impl Dispatch {
    async fn handle(&self, delivery: Delivery) {
        let fields = DeliveryFields {
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            exchange: delivery.exchange,
            routing_key: delivery.routing_key,
            consumer_tag: self.consumer_tag.clone(),
        };
        let message = ReceivedMessage::decode(&delivery.data, fields, delivery.properties);
        let tag = message.fields.delivery_tag;

        let outcome = AssertUnwindSafe(self.handler.receive(message.clone()))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(anyhow::anyhow!("receive handler panicked")));

        match outcome {
            Ok(()) => {
                if self.options.no_ack {
                    return;
                }
                if let Err(e) = self.channel.ack(tag, self.options.all_up_to).await {
                    self.notifier
                        .log(Severity::Error, TAG_CONSUMER, format!("ack of {} failed: {}", tag, e));
                }
            }
            Err(err) => {
                let reason = format!("{:#}", err);
                self.notifier.log(
                    Severity::Error,
                    TAG_CONSUMER,
                    RabbitError::Handler(reason.clone()).to_string(),
                );

                if !self.options.no_ack {
                    if let Err(e) = self
                        .channel
                        .nack(tag, self.options.all_up_to, self.options.requeue)
                        .await
                    {
                        self.notifier
                            .log(Severity::Error, TAG_CONSUMER, format!("nack of {} failed: {}", tag, e));
                    }
                }

                if let Some(diverter) = &self.debug {
                    match diverter.divert(&reason, &message).await {
                        Ok(()) => debug!(queue = diverter.queue_name(), "failed message diverted"),
                        Err(e) => self.notifier.log(
                            Severity::Error,
                            TAG_CONSUMER,
                            format!("debug diversion to {} failed: {}", diverter.queue_name(), e),
                        ),
                    }
                }
            }
        }
    }
}

async fn pump(dispatch: Arc<Dispatch>, mut deliveries: DeliveryStream) {
    while let Some(result) = deliveries.next().await {
        match result {
            Ok(delivery) => {
                let dispatch = dispatch.clone();
                tokio::spawn(async move { dispatch.handle(delivery).await });
            }
            Err(e) => dispatch.notifier.log(
                Severity::Error,
                TAG_CONSUMER,
                format!("delivery stream error: {}", e),
            ),
        }
    }
    debug!(consumer_tag = %dispatch.consumer_tag, "delivery stream ended");
}

/// A live subscription that survives reconnects.
pub struct Consumer {
    manager: ConnectionManager,
    spec: ConsumerSpec,
    state: watch::Sender<ConsumerState>,
    active: Mutex<Option<Subscription>>,
    watcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Consumer {
    pub fn new(manager: ConnectionManager, spec: ConsumerSpec) -> Arc<Self> {
        let (state, _) = watch::channel(ConsumerState::Unsubscribed);
        Arc::new(Self {
            manager,
            spec,
            state,
            active: Mutex::new(None),
            watcher: std::sync::Mutex::new(None),
        })
    }

    pub fn spec(&self) -> &ConsumerSpec {
        &self.spec
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Broker-confirmed name of the consumed queue, once subscribed.
    pub async fn queue_name(&self) -> Option<String> {
        self.active.lock().await.as_ref().map(|sub| sub.queue.clone())
    }

    pub async fn consumer_tag(&self) -> Option<String> {
        self.active.lock().await.as_ref().map(|sub| sub.consumer_tag.clone())
    }

    pub async fn debug_queue_name(&self) -> Option<String> {
        self.active
            .lock()
            .await
            .as_ref()
            .and_then(|sub| sub.debug_queue.clone())
    }

    /// Declares the topology, starts consuming and keeps the subscription
    /// alive across reconnects until [`Consumer::close`].
    pub async fn subscribe(self: &Arc<Self>) -> Result<()> {
        // Registered first so a reconnect racing the initial setup is not missed.
        let connects = self.manager.connects();
        self.subscribe_once().await?;

        let mut watcher = match self.watcher.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if watcher.is_none() && self.state() != ConsumerState::Closed {
            *watcher = Some(tokio::spawn(watch_reconnects(Arc::downgrade(self), connects)));
        }
        Ok(())
    }

    async fn subscribe_once(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        if self.state() == ConsumerState::Closed {
            return Err(RabbitError::Closed);
        }
        self.state.send_replace(ConsumerState::Subscribing);

        if let Some(stale) = active.take() {
            stale.pump.abort();
            // Usually already dead along with its connection.
            let _ = stale.channel.close().await;
        }

        let (channel, connection) = match self.manager.open_channel().await {
            Ok(opened) => opened,
            Err(e) => return Err(self.subscribe_failed(e)),
        };

        match self.establish(channel.clone(), connection).await {
            Ok(subscription) => {
                info!(
                    queue = %subscription.queue,
                    consumer_tag = %subscription.consumer_tag,
                    "consumer subscribed"
                );
                *active = Some(subscription);
                self.state.send_if_modified(|state| {
                    if *state == ConsumerState::Closed {
                        return false;
                    }
                    *state = ConsumerState::Active;
                    true
                });
                drop(active);

                if let Some(ready) = &self.spec.on_ready {
                    ready();
                }
                Ok(())
            }
            Err(e) => {
                let _ = channel.close().await;
                Err(self.subscribe_failed(e))
            }
        }
    }

    fn subscribe_failed(&self, error: RabbitError) -> RabbitError {
        self.state.send_if_modified(|state| {
            if *state == ConsumerState::Closed {
                return false;
            }
            *state = ConsumerState::Unsubscribed;
            true
        });
        self.manager.notifier().log(
            Severity::Error,
            TAG_CONSUMER,
            format!("subscribe to {} failed: {}", self.spec.queue.name, error),
        );
        error
    }

    /// Whether the live subscription was made on connection number `connects`.
    async fn is_current(&self, connects: u64) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .is_some_and(|sub| sub.connection == connects)
    }

    async fn establish(&self, channel: Arc<dyn AmqpChannel>, connection: u64) -> Result<Subscription> {
        let spec = &self.spec;
        let exchange = spec.exchange.as_ref().filter(|e| e.is_named());

        if let Some(exchange) = exchange {
            channel.assert_exchange(exchange).await?;
        }

        let queue = channel.assert_queue(&spec.queue).await?;

        if let Some(exchange) = exchange {
            let keys = if spec.routing_keys.is_empty() {
                vec![String::new()]
            } else {
                spec.routing_keys.clone()
            };
            try_join_all(
                keys.iter()
                    .map(|key| channel.bind_queue(&queue, &exchange.name, key)),
            )
            .await?;
        }

        channel.prefetch(spec.options.prefetch).await?;

        let debug = spec
            .debug
            .as_ref()
            .filter(|spec| spec.enabled)
            .map(|spec| DebugPublisher::new(channel.clone(), spec, &queue));
        let debug_queue = debug.as_ref().map(|d| d.queue_name().to_string());

        let (consumer_tag, deliveries) = channel.consume(&queue, &spec.options).await?;

        let dispatch = Arc::new(Dispatch {
            channel: channel.clone(),
            handler: spec.handler.clone(),
            options: spec.options.clone(),
            debug,
            notifier: self.manager.notifier().clone(),
            consumer_tag: consumer_tag.clone(),
        });

        Ok(Subscription {
            channel,
            consumer_tag,
            queue,
            debug_queue,
            connection,
            pump: tokio::spawn(pump(dispatch, deliveries)),
        })
    }

    /// Cancels the consumer and closes its channel. Deliveries already being
    /// handled run to completion; their acks fail once the channel is gone.
    /// Later calls do nothing.
    pub async fn close(&self) -> Result<()> {
        let previous = self.state.send_replace(ConsumerState::Closed);
        if previous == ConsumerState::Closed {
            return Ok(());
        }

        let watcher = match self.watcher.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(watcher) = watcher {
            watcher.abort();
        }

        let Some(subscription) = self.active.lock().await.take() else {
            return Ok(());
        };

        let cancelled = subscription.channel.cancel(&subscription.consumer_tag).await;
        subscription.pump.abort();
        let closed = subscription.channel.close().await;

        info!(consumer_tag = %subscription.consumer_tag, "consumer closed");
        cancelled.and(closed)
    }
}

async fn watch_reconnects(weak: Weak<Consumer>, mut connects: watch::Receiver<u64>) {
    while connects.changed().await.is_ok() {
        let current = *connects.borrow_and_update();
        let Some(consumer) = weak.upgrade() else {
            break;
        };
        if consumer.state() == ConsumerState::Closed {
            break;
        }
        // The first connect may come from our own subscribe.
        if consumer.is_current(current).await {
            continue;
        }

        consumer.manager.notifier().log(
            Severity::Info,
            TAG_CONSUMER,
            format!("resubscribing to {}", consumer.spec.queue.name),
        );
        drop(consumer);

        if !resubscribe(&weak).await {
            break;
        }
    }
}

/// Retries with backoff until the subscription is back. Returns false once
/// the consumer or its manager is closed.
async fn resubscribe(weak: &Weak<Consumer>) -> bool {
    let mut retry = 0;
    loop {
        let delay = {
            let Some(consumer) = weak.upgrade() else {
                return false;
            };
            match consumer.subscribe_once().await {
                Ok(()) => return true,
                Err(RabbitError::Closed) => return false,
                Err(_) if consumer.state() == ConsumerState::Closed => return false,
                // Already logged by subscribe_failed.
                Err(_) => backoff_delay(retry, consumer.manager.config().max_delay_ms),
            }
        };
        retry += 1;
        debug!(retry, delay_ms = delay.as_millis() as u64, "retrying subscribe");
        sleep(delay).await;
    }
}
