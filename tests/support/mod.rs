// In-process AMQP broker implementing the transport traits, so the
// resilience layer can be exercised without a running RabbitMQ.
#![allow(dead_code)]

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rabbit_resilience::config::ConnectionConfig;
use rabbit_resilience::message::{Message, MessageOptions};
use rabbit_resilience::rabbitmq::amqp_client::{ChannelErrorListener, LinkListener};
use rabbit_resilience::rabbitmq::{
    AmqpChannel, AmqpConnection, AmqpConnector, ConsumeOptions, Delivery, DeliveryStream,
    ExchangeKind, ExchangeSpec, LinkEvent, QueueSpec, RabbitError, Result,
};
use rabbit_resilience::Rabbit;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub exchange: String,
    pub routing_key: String,
    pub data: Vec<u8>,
    pub properties: MessageOptions,
    pub redelivered: bool,
}

impl StoredMessage {
    pub fn body(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.data).expect("message body is not JSON")
    }
}

struct ConsumerEntry {
    tag: String,
    channel_id: u16,
    no_ack: bool,
    sender: mpsc::UnboundedSender<Result<Delivery>>,
}

#[derive(Default)]
struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerEntry>,
    cursor: usize,
}

struct Unacked {
    queue: String,
    consumer_tag: String,
    message: StoredMessage,
}

struct ChannelState {
    connection_id: u64,
    prefetch: u16,
    next_tag: u64,
    open: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

#[derive(Default)]
struct BrokerState {
    refuse: bool,
    failing_channels: usize,
    connect_attempts: u32,
    next_connection_id: u64,
    next_channel_id: u16,
    next_queue_id: u64,
    connections: Vec<Arc<MemoryConnection>>,
    channels: HashMap<u16, ChannelState>,
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    unacked: HashMap<(u16, u64), Unacked>,
    published: Vec<StoredMessage>,
    acks: usize,
    nacks: usize,
}

impl BrokerState {
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect());
        }

        let spec = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| RabbitError::Broker(format!("NOT_FOUND - no exchange '{}'", exchange)))?;

        let mut queues: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange)
            .filter(|b| match spec.kind {
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
                ExchangeKind::Direct => b.routing_key == routing_key,
                ExchangeKind::Topic => topic_matches(&b.routing_key, routing_key),
            })
            .map(|b| b.queue.clone())
            .collect();
        queues.sort();
        queues.dedup();
        Ok(queues)
    }

    fn enqueue(&mut self, queue: &str, message: StoredMessage) {
        if let Some(state) = self.queues.get_mut(queue) {
            state.ready.push_back(message);
        }
        self.dispatch(queue);
    }

    fn dispatch(&mut self, queue: &str) {
        loop {
            let Some(q) = self.queues.get_mut(queue) else {
                return;
            };
            if q.ready.is_empty() || q.consumers.is_empty() {
                return;
            }

            let count = q.consumers.len();
            let mut chosen = None;
            for offset in 0..count {
                let idx = (q.cursor + offset) % count;
                let consumer = &q.consumers[idx];
                let prefetch = self
                    .channels
                    .get(&consumer.channel_id)
                    .map(|c| c.prefetch)
                    .unwrap_or(0);
                let in_flight = self
                    .unacked
                    .values()
                    .filter(|u| u.consumer_tag == consumer.tag)
                    .count();
                if consumer.no_ack || prefetch == 0 || in_flight < prefetch as usize {
                    chosen = Some(idx);
                    break;
                }
            }
            let Some(idx) = chosen else {
                return;
            };
            q.cursor = (idx + 1) % count;

            let Some(message) = q.ready.pop_front() else {
                return;
            };
            let channel_id = q.consumers[idx].channel_id;
            let Some(channel) = self.channels.get_mut(&channel_id) else {
                return;
            };
            channel.next_tag += 1;
            let delivery_tag = channel.next_tag;

            let delivery = Delivery {
                delivery_tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                data: message.data.clone(),
                properties: message.properties.clone(),
            };

            let consumer = &q.consumers[idx];
            if consumer.sender.unbounded_send(Ok(delivery)).is_err() {
                q.consumers.remove(idx);
                q.cursor = 0;
                q.ready.push_front(message);
                continue;
            }
            if !consumer.no_ack {
                let consumer_tag = consumer.tag.clone();
                self.unacked.insert(
                    (channel_id, delivery_tag),
                    Unacked {
                        queue: queue.to_string(),
                        consumer_tag,
                        message,
                    },
                );
            }
        }
    }

    fn settle(&mut self, channel_id: u16, tag: u64, multiple: bool) -> Result<Vec<Unacked>> {
        let mut keys: Vec<(u16, u64)> = self
            .unacked
            .keys()
            .filter(|(c, t)| *c == channel_id && (*t == tag || (multiple && *t <= tag)))
            .copied()
            .collect();
        if keys.is_empty() {
            return Err(RabbitError::Broker(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                tag
            )));
        }
        keys.sort();
        Ok(keys
            .into_iter()
            .filter_map(|key| self.unacked.remove(&key))
            .collect())
    }

    fn requeue(&mut self, settled: Vec<Unacked>) {
        let mut touched = Vec::new();
        for unacked in settled.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                let mut message = unacked.message;
                message.redelivered = true;
                queue.ready.push_front(message);
            }
            touched.push(unacked.queue);
        }
        self.dispatch_all(touched);
    }

    fn dispatch_all(&mut self, mut queues: Vec<String>) {
        queues.sort();
        queues.dedup();
        for queue in queues {
            self.dispatch(&queue);
        }
    }

    fn close_channel(&mut self, id: u16) {
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        if !channel.open {
            return;
        }
        channel.open = false;

        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel_id != id);
            queue.cursor = 0;
        }

        let mut keys: Vec<(u16, u64)> = self
            .unacked
            .keys()
            .filter(|(channel_id, _)| *channel_id == id)
            .copied()
            .collect();
        keys.sort();
        let settled = keys
            .into_iter()
            .filter_map(|key| self.unacked.remove(&key))
            .collect();
        self.requeue(settled);
    }

    fn close_connection_channels(&mut self, connection_id: u64) {
        let ids: Vec<u16> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection_id == connection_id && c.open)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.close_channel(id);
        }
    }
}

fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().expect("broker state poisoned")
    }

    pub fn connector(&self) -> Arc<dyn AmqpConnector> {
        Arc::new(self.clone())
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse = refuse;
    }

    /// The next `count` channel opens fail with a channel error.
    pub fn fail_next_channels(&self, count: usize) {
        self.lock().failing_channels = count;
    }

    pub fn pending_channel_failures(&self) -> usize {
        self.lock().failing_channels
    }

    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    pub fn open_connections(&self) -> usize {
        self.lock()
            .connections
            .iter()
            .filter(|c| c.open.load(Ordering::SeqCst))
            .count()
    }

    pub fn open_channels(&self) -> usize {
        self.lock().channels.values().filter(|c| c.open).count()
    }

    /// Kills every open connection the way a broker restart would.
    pub fn drop_connections(&self) {
        let dropped: Vec<Arc<MemoryConnection>> = {
            let mut state = self.lock();
            let open: Vec<_> = state
                .connections
                .iter()
                .filter(|c| c.open.load(Ordering::SeqCst))
                .cloned()
                .collect();
            for connection in &open {
                connection.open.store(false, Ordering::SeqCst);
                state.close_connection_channels(connection.id);
            }
            open
        };

        for connection in dropped {
            connection.fire(LinkEvent::Error(
                "CONNECTION_FORCED - broker forced connection closure".to_string(),
            ));
            connection.fire(LinkEvent::Closed);
        }
    }

    pub fn queue_spec(&self, name: &str) -> Option<QueueSpec> {
        self.lock().queues.get(name).map(|q| q.spec.clone())
    }

    pub fn exchange_spec(&self, name: &str) -> Option<ExchangeSpec> {
        self.lock().exchanges.get(name).cloned()
    }

    /// `(exchange, routing key)` pairs bound to `queue`.
    pub fn bindings_of(&self, queue: &str) -> Vec<(String, String)> {
        let mut bindings: Vec<_> = self
            .lock()
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .map(|b| (b.exchange.clone(), b.routing_key.clone()))
            .collect();
        bindings.sort();
        bindings
    }

    /// Messages waiting in `queue`.
    pub fn messages(&self, queue: &str) -> Vec<StoredMessage> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map(|q| q.ready.len()).unwrap_or(0)
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock()
            .unacked
            .values()
            .filter(|u| u.queue == queue)
            .count()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }

    /// Every message accepted by an exchange, routed or not.
    pub fn published(&self) -> Vec<StoredMessage> {
        self.lock().published.clone()
    }

    pub fn acks(&self) -> usize {
        self.lock().acks
    }

    pub fn nacks(&self) -> usize {
        self.lock().nacks
    }
}

#[async_trait]
impl AmqpConnector for MemoryBroker {
    async fn connect(&self, _config: &ConnectionConfig) -> Result<Arc<dyn AmqpConnection>> {
        let mut state = self.lock();
        state.connect_attempts += 1;
        if state.refuse {
            return Err(RabbitError::Connection("connect ECONNREFUSED".to_string()));
        }

        state.next_connection_id += 1;
        let connection = Arc::new(MemoryConnection {
            id: state.next_connection_id,
            broker: self.clone(),
            open: AtomicBool::new(true),
            listeners: Mutex::new(Vec::new()),
        });
        state.connections.push(connection.clone());

        let connection: Arc<dyn AmqpConnection> = connection;
        Ok(connection)
    }
}

pub struct MemoryConnection {
    id: u64,
    broker: MemoryBroker,
    open: AtomicBool,
    listeners: Mutex<Vec<LinkListener>>,
}

impl MemoryConnection {
    fn fire(&self, event: LinkEvent) {
        for listener in self.listeners.lock().expect("listeners poisoned").iter() {
            listener(event.clone());
        }
    }
}

#[async_trait]
impl AmqpConnection for MemoryConnection {
    fn on_event(&self, listener: LinkListener) {
        self.listeners.lock().expect("listeners poisoned").push(listener);
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>> {
        if !self.is_connected() {
            return Err(RabbitError::Channel("connection is closed".to_string()));
        }

        let mut state = self.broker.lock();
        if state.failing_channels > 0 {
            state.failing_channels -= 1;
            return Err(RabbitError::Channel("CHANNEL_ERROR - channel open refused".to_string()));
        }
        state.next_channel_id = state.next_channel_id.wrapping_add(1).max(1);
        let id = state.next_channel_id;
        state.channels.insert(
            id,
            ChannelState {
                connection_id: self.id,
                prefetch: 0,
                next_tag: 0,
                open: true,
            },
        );

        let channel: Arc<dyn AmqpChannel> = Arc::new(MemoryChannel {
            id,
            broker: self.broker.clone(),
        });
        Ok(channel)
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        self.broker.lock().close_connection_channels(self.id);
        Ok(())
    }
}

pub struct MemoryChannel {
    id: u16,
    broker: MemoryBroker,
}

impl MemoryChannel {
    fn with_open<T>(&self, f: impl FnOnce(&mut BrokerState) -> Result<T>) -> Result<T> {
        let mut state = self.broker.lock();
        let open = state.channels.get(&self.id).map(|c| c.open).unwrap_or(false);
        if !open {
            return Err(RabbitError::Channel(format!("channel {} is closed", self.id)));
        }
        f(&mut *state)
    }
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    fn id(&self) -> u16 {
        self.id
    }

    fn on_error(&self, _listener: ChannelErrorListener) {}

    async fn assert_exchange(&self, exchange: &ExchangeSpec) -> Result<()> {
        self.with_open(|state| {
            state
                .exchanges
                .entry(exchange.name.clone())
                .or_insert_with(|| exchange.clone());
            Ok(())
        })
    }

    async fn assert_queue(&self, queue: &QueueSpec) -> Result<String> {
        self.with_open(|state| {
            let name = if queue.name.is_empty() {
                state.next_queue_id += 1;
                format!("amq.gen-{}", state.next_queue_id)
            } else {
                queue.name.clone()
            };

            state.queues.entry(name.clone()).or_insert_with(|| QueueState {
                spec: QueueSpec {
                    name: name.clone(),
                    ..queue.clone()
                },
                ..QueueState::default()
            });
            Ok(name)
        })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.with_open(|state| {
            if !state.queues.contains_key(queue) {
                return Err(RabbitError::Broker(format!("NOT_FOUND - no queue '{}'", queue)));
            }
            if !state.exchanges.contains_key(exchange) {
                return Err(RabbitError::Broker(format!("NOT_FOUND - no exchange '{}'", exchange)));
            }

            let binding = Binding {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            };
            if !state.bindings.contains(&binding) {
                state.bindings.push(binding);
            }
            Ok(())
        })
    }

    async fn publish(&self, exchange: &str, routing_key: &str, message: &Message) -> Result<()> {
        self.with_open(|state| {
            let queues = state.route(exchange, routing_key)?;
            let stored = StoredMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                data: message.content.clone(),
                properties: message.options.clone(),
                redelivered: false,
            };
            state.published.push(stored.clone());
            for queue in queues {
                state.enqueue(&queue, stored.clone());
            }
            Ok(())
        })
    }

    async fn prefetch(&self, count: u16) -> Result<()> {
        let id = self.id;
        self.with_open(|state| {
            if let Some(channel) = state.channels.get_mut(&id) {
                channel.prefetch = count;
            }
            Ok(())
        })
    }

    async fn consume(&self, queue: &str, options: &ConsumeOptions) -> Result<(String, DeliveryStream)> {
        let id = self.id;
        self.with_open(|state| {
            let tag = options.resolve_tag();
            let Some(q) = state.queues.get_mut(queue) else {
                return Err(RabbitError::Broker(format!("NOT_FOUND - no queue '{}'", queue)));
            };
            if q.consumers.iter().any(|c| c.tag == tag) {
                return Err(RabbitError::Broker(format!("NOT_ALLOWED - reused consumer tag '{}'", tag)));
            }

            let (sender, receiver) = mpsc::unbounded();
            q.consumers.push(ConsumerEntry {
                tag: tag.clone(),
                channel_id: id,
                no_ack: options.no_ack,
                sender,
            });
            state.dispatch(queue);

            Ok((tag, receiver.boxed()))
        })
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        let id = self.id;
        self.with_open(|state| {
            let settled = state.settle(id, delivery_tag, multiple)?;
            state.acks += settled.len();
            let queues = settled.into_iter().map(|u| u.queue).collect();
            state.dispatch_all(queues);
            Ok(())
        })
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        let id = self.id;
        self.with_open(|state| {
            let settled = state.settle(id, delivery_tag, multiple)?;
            state.nacks += settled.len();
            if requeue {
                state.requeue(settled);
            } else {
                let queues = settled.into_iter().map(|u| u.queue).collect();
                state.dispatch_all(queues);
            }
            Ok(())
        })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let id = self.id;
        self.with_open(|state| {
            for queue in state.queues.values_mut() {
                queue
                    .consumers
                    .retain(|c| !(c.channel_id == id && c.tag == consumer_tag));
                queue.cursor = 0;
            }
            Ok(())
        })
    }

    async fn close(&self) -> Result<()> {
        let id = self.id;
        self.with_open(|state| {
            state.close_channel(id);
            Ok(())
        })
    }
}

pub fn test_config() -> ConnectionConfig {
    ConnectionConfig {
        connection_name: Some("rabbit-resilience-tests".to_string()),
        ..ConnectionConfig::default()
    }
}

pub fn rabbit(broker: &MemoryBroker) -> Rabbit {
    Rabbit::with_connector(test_config(), broker.connector()).expect("valid test config")
}

/// Polls `condition` until it holds, failing the test after a while.
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
