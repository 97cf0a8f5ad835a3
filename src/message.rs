use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::rabbitmq::errors::{RabbitError, Result};

pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

fn default_content_type() -> String {
    DEFAULT_CONTENT_TYPE.to_string()
}

fn default_persistent() -> bool {
    true
}

/// Publish properties of a message. Also used to describe the properties of a
/// delivered message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MessageOptions {
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    #[serde(default = "default_persistent")]
    pub persistent: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    /// Per-message TTL in milliseconds, as the decimal string AMQP expects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Seconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Ask the broker to return the message if it cannot be routed.
    #[serde(default)]
    pub mandatory: bool,
}

impl Default for MessageOptions {
    fn default() -> Self {
        Self {
            content_type: default_content_type(),
            content_encoding: None,
            persistent: true,
            headers: BTreeMap::new(),
            correlation_id: None,
            reply_to: None,
            priority: None,
            expiration: None,
            message_id: None,
            timestamp: None,
            kind: None,
            app_id: None,
            user_id: None,
            mandatory: false,
        }
    }
}

/// Caller-facing message: text content plus options.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessageRecord {
    pub content: String,
    #[serde(default)]
    pub options: MessageOptions,
}

impl MessageRecord {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            options: MessageOptions::default(),
        }
    }

    pub fn with_options(mut self, options: MessageOptions) -> Self {
        self.options = options;
        self
    }
}

/// Anything [`normalize`] accepts.
#[derive(Clone, Debug, PartialEq)]
pub enum MessageInput {
    Text(String),
    Record(MessageRecord),
    Json(Value),
}

impl From<&str> for MessageInput {
    fn from(text: &str) -> Self {
        MessageInput::Text(text.to_string())
    }
}

impl From<String> for MessageInput {
    fn from(text: String) -> Self {
        MessageInput::Text(text)
    }
}

impl From<MessageRecord> for MessageInput {
    fn from(record: MessageRecord) -> Self {
        MessageInput::Record(record)
    }
}

impl From<Value> for MessageInput {
    fn from(value: Value) -> Self {
        MessageInput::Json(value)
    }
}

/// A message ready for transmission.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub content: Vec<u8>,
    pub options: MessageOptions,
}

/// Turns text or a structured record into a [`Message`] with defaults applied.
pub fn normalize(input: impl Into<MessageInput>) -> Result<Message> {
    let record = match input.into() {
        MessageInput::Text(text) => MessageRecord::new(text),
        MessageInput::Record(record) => record,
        MessageInput::Json(Value::String(text)) => MessageRecord::new(text),
        MessageInput::Json(value @ Value::Object(_)) => serde_json::from_value(value)
            .map_err(|e| RabbitError::Validation(format!("invalid message: {}", e)))?,
        MessageInput::Json(other) => {
            return Err(RabbitError::Validation(format!(
                "message must be a string or an object, got {}",
                other
            )))
        }
    };

    if record.content.is_empty() {
        return Err(RabbitError::Validation("message content is required".to_string()));
    }

    Ok(Message {
        content: record.content.into_bytes(),
        options: record.options,
    })
}

/// Delivery metadata handed to receive handlers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryFields {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub consumer_tag: String,
}

/// A delivered message with its body decoded to text.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReceivedMessage {
    pub content: String,
    pub fields: DeliveryFields,
    pub properties: MessageOptions,
}

impl ReceivedMessage {
    /// Decodes the body as UTF-8, replacing invalid sequences.
    pub fn decode(data: &[u8], fields: DeliveryFields, properties: MessageOptions) -> Self {
        Self {
            content: String::from_utf8_lossy(data).into_owned(),
            fields,
            properties,
        }
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.content)?)
    }
}
