// src/rabbitmq/amqp_client.rs
//
// Transport seam between the resilience core and the AMQP client library.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString},
    BasicProperties, Connection, ConnectionProperties,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::debug;

use super::consumer::ConsumeOptions;
use super::errors::{RabbitError, Result};
use super::topology::{ExchangeKind, ExchangeSpec, QueueSpec};
use crate::config::ConnectionConfig;
use crate::message::{Message, MessageOptions};

const REPLY_SUCCESS: u16 = 200;
const ARG_CONSUMER_PRIORITY: &str = "x-priority";

/// Stream of deliveries for one consumer registration.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

pub type LinkListener = Box<dyn Fn(LinkEvent) + Send + Sync>;
pub type ChannelErrorListener = Box<dyn Fn(String) + Send + Sync>;

/// Something happened to an underlying connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Error(String),
    /// The connection is gone and will not come back.
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub data: Vec<u8>,
    pub properties: MessageOptions,
}

#[async_trait]
pub trait AmqpConnector: Send + Sync {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn AmqpConnection>>;
}

#[async_trait]
pub trait AmqpConnection: Send + Sync {
    /// Registers a listener for errors and closure of this connection.
    fn on_event(&self, listener: LinkListener);

    fn is_connected(&self) -> bool;

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait AmqpChannel: Send + Sync {
    fn id(&self) -> u16;

    fn on_error(&self, listener: ChannelErrorListener);

    async fn assert_exchange(&self, exchange: &ExchangeSpec) -> Result<()>;

    /// Declares the queue and returns the broker-confirmed name.
    async fn assert_queue(&self, queue: &QueueSpec) -> Result<String>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn publish(&self, exchange: &str, routing_key: &str, message: &Message) -> Result<()>;

    async fn prefetch(&self, count: u16) -> Result<()>;

    /// Starts a consumer and returns its tag with the delivery stream.
    async fn consume(&self, queue: &str, options: &ConsumeOptions) -> Result<(String, DeliveryStream)>;

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<()>;

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()>;

    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// [`AmqpConnector`] backed by lapin.
#[derive(Debug, Default, Clone)]
pub struct LapinConnector;

#[async_trait]
impl AmqpConnector for LapinConnector {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn AmqpConnection>> {
        let mut properties = ConnectionProperties {
            locale: config.locale.clone(),
            ..ConnectionProperties::default()
        };
        if let Some(name) = &config.connection_name {
            properties = properties.with_connection_name(LongString::from(name.clone()));
        }

        debug!(uri = %config.redacted_uri(), "opening lapin connection");

        let connection = timeout(
            config.socket_timeout(),
            Connection::connect(&config.amqp_uri(), properties),
        )
        .await
        .map_err(|_| {
            RabbitError::Connection(format!(
                "connection timed out after {}ms",
                config.socket_timeout_ms
            ))
        })?
        .map_err(|e| RabbitError::Connection(e.to_string()))?;

        Ok(Arc::new(LapinConnection { inner: connection }))
    }
}

pub struct LapinConnection {
    inner: Connection,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    fn on_event(&self, listener: LinkListener) {
        // lapin reports every connection-level failure through on_error and
        // never recovers the connection afterwards.
        self.inner.on_error(move |err| {
            listener(LinkEvent::Error(err.to_string()));
            listener(LinkEvent::Closed);
        });
    }

    fn is_connected(&self) -> bool {
        self.inner.status().connected()
    }

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(|e| RabbitError::Channel(e.to_string()))?;
        Ok(Arc::new(LapinChannel { inner: channel }))
    }

    async fn close(&self) -> Result<()> {
        self.inner.close(REPLY_SUCCESS, "Closing connection").await?;
        Ok(())
    }
}

pub struct LapinChannel {
    inner: lapin::Channel,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn id(&self) -> u16 {
        self.inner.id()
    }

    fn on_error(&self, listener: ChannelErrorListener) {
        self.inner.on_error(move |err| listener(err.to_string()));
    }

    async fn assert_exchange(&self, exchange: &ExchangeSpec) -> Result<()> {
        self.inner
            .exchange_declare(
                &exchange.name,
                exchange.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: exchange.durable,
                    auto_delete: exchange.auto_delete,
                    internal: exchange.internal,
                    nowait: false,
                },
                field_table(&exchange.declare_arguments()),
            )
            .await?;
        Ok(())
    }

    async fn assert_queue(&self, queue: &QueueSpec) -> Result<String> {
        let declared = self
            .inner
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: queue.durable,
                    exclusive: queue.exclusive,
                    auto_delete: queue.auto_delete,
                    nowait: false,
                },
                field_table(&queue.declare_arguments()),
            )
            .await?;
        Ok(declared.name().as_str().to_string())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, message: &Message) -> Result<()> {
        self.inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: message.options.mandatory,
                    immediate: false,
                },
                &message.content,
                basic_properties(&message.options),
            )
            .await?;
        Ok(())
    }

    async fn prefetch(&self, count: u16) -> Result<()> {
        self.inner
            .basic_qos(count, BasicQosOptions { global: false })
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, options: &ConsumeOptions) -> Result<(String, DeliveryStream)> {
        let mut arguments = options.arguments.clone();
        if let Some(priority) = options.priority {
            arguments.insert(ARG_CONSUMER_PRIORITY.to_string(), Value::from(priority));
        }

        let consumer = self
            .inner
            .basic_consume(
                queue,
                &options.resolve_tag(),
                BasicConsumeOptions {
                    no_local: options.no_local,
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    nowait: false,
                },
                field_table(&arguments),
            )
            .await?;

        let tag = consumer.tag().as_str().to_string();
        let stream = consumer
            .map(|result| result.map(delivery_from_lapin).map_err(RabbitError::from))
            .boxed();

        Ok((tag, stream))
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        self.inner
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await?;
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.close(REPLY_SUCCESS, "Closing channel").await?;
        Ok(())
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

fn delivery_from_lapin(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        properties: message_options(&delivery.properties),
        data: delivery.data,
    }
}

fn short(value: &Option<ShortString>) -> Option<String> {
    value.as_ref().map(|s| s.as_str().to_string())
}

/// Converts received properties. A missing content type stays empty.
fn message_options(props: &BasicProperties) -> MessageOptions {
    MessageOptions {
        content_type: short(props.content_type()).unwrap_or_default(),
        content_encoding: short(props.content_encoding()),
        persistent: *props.delivery_mode() == Some(2),
        headers: props
            .headers()
            .as_ref()
            .map(|table| json_object(table.inner()))
            .unwrap_or_default(),
        correlation_id: short(props.correlation_id()),
        reply_to: short(props.reply_to()),
        priority: *props.priority(),
        expiration: short(props.expiration()),
        message_id: short(props.message_id()),
        timestamp: *props.timestamp(),
        kind: short(props.kind()),
        app_id: short(props.app_id()),
        user_id: short(props.user_id()),
        mandatory: false,
    }
}

fn basic_properties(options: &MessageOptions) -> BasicProperties {
    let mut props = BasicProperties::default()
        .with_content_type(ShortString::from(options.content_type.clone()))
        .with_delivery_mode(if options.persistent { 2 } else { 1 });

    if let Some(value) = &options.content_encoding {
        props = props.with_content_encoding(ShortString::from(value.clone()));
    }
    if !options.headers.is_empty() {
        props = props.with_headers(field_table(&options.headers));
    }
    if let Some(value) = &options.correlation_id {
        props = props.with_correlation_id(ShortString::from(value.clone()));
    }
    if let Some(value) = &options.reply_to {
        props = props.with_reply_to(ShortString::from(value.clone()));
    }
    if let Some(value) = options.priority {
        props = props.with_priority(value);
    }
    if let Some(value) = &options.expiration {
        props = props.with_expiration(ShortString::from(value.clone()));
    }
    if let Some(value) = &options.message_id {
        props = props.with_message_id(ShortString::from(value.clone()));
    }
    if let Some(value) = options.timestamp {
        props = props.with_timestamp(value);
    }
    if let Some(value) = &options.kind {
        props = props.with_type(ShortString::from(value.clone()));
    }
    if let Some(value) = &options.app_id {
        props = props.with_app_id(ShortString::from(value.clone()));
    }
    if let Some(value) = &options.user_id {
        props = props.with_user_id(ShortString::from(value.clone()));
    }

    props
}

pub(crate) fn field_table(map: &BTreeMap<String, Value>) -> FieldTable {
    let table: BTreeMap<ShortString, AMQPValue> = map
        .iter()
        .map(|(key, value)| (ShortString::from(key.clone()), amqp_value(value)))
        .collect();
    FieldTable::from(table)
}

pub(crate) fn amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => AMQPValue::LongLongInt(i),
            (None, Some(f)) => AMQPValue::Double(f),
            _ => AMQPValue::LongString(LongString::from(n.to_string())),
        },
        Value::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
        Value::Array(items) => {
            AMQPValue::FieldArray(FieldArray::from(items.iter().map(amqp_value).collect::<Vec<_>>()))
        }
        Value::Object(map) => {
            let table: BTreeMap<ShortString, AMQPValue> = map
                .iter()
                .map(|(key, value)| (ShortString::from(key.clone()), amqp_value(value)))
                .collect();
            AMQPValue::FieldTable(FieldTable::from(table))
        }
    }
}

pub(crate) fn json_value(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(b) => Value::Bool(*b),
        AMQPValue::ShortShortInt(v) => Value::from(*v),
        AMQPValue::ShortShortUInt(v) => Value::from(*v),
        AMQPValue::ShortInt(v) => Value::from(*v),
        AMQPValue::ShortUInt(v) => Value::from(*v),
        AMQPValue::LongInt(v) => Value::from(*v),
        AMQPValue::LongUInt(v) => Value::from(*v),
        AMQPValue::LongLongInt(v) => Value::from(*v),
        AMQPValue::Timestamp(v) => Value::from(*v),
        AMQPValue::Float(v) => Value::from(*v),
        AMQPValue::Double(v) => Value::from(*v),
        AMQPValue::ShortString(s) => Value::from(s.as_str()),
        AMQPValue::LongString(s) => Value::from(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::FieldArray(items) => Value::Array(items.as_slice().iter().map(json_value).collect()),
        AMQPValue::FieldTable(table) => Value::Object(
            table
                .inner()
                .iter()
                .map(|(key, value)| (key.as_str().to_string(), json_value(value)))
                .collect(),
        ),
        _ => Value::Null,
    }
}

fn json_object(table: &BTreeMap<ShortString, AMQPValue>) -> BTreeMap<String, Value> {
    table
        .iter()
        .map(|(key, value)| (key.as_str().to_string(), json_value(value)))
        .collect()
}
