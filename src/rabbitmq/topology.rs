//! Exchange and queue declarations.
//!
//! Specs are plain data. Broker-specific `x-*` arguments are folded into a
//! single JSON argument map by [`QueueSpec::declare_arguments`] and
//! [`ExchangeSpec::declare_arguments`]; the transport converts that map into
//! its own field table.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const ARG_MESSAGE_TTL: &str = "x-message-ttl";
pub const ARG_EXPIRES: &str = "x-expires";
pub const ARG_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
pub const ARG_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
pub const ARG_MAX_LENGTH: &str = "x-max-length";
pub const ARG_MAX_PRIORITY: &str = "x-max-priority";
pub const ARG_ALTERNATE_EXCHANGE: &str = "alternate-exchange";

pub type Arguments = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    #[default]
    Fanout,
    Topic,
    #[serde(alias = "header")]
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExchangeSpec {
    /// Empty means the default exchange; nothing is declared for it.
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: ExchangeKind,
    #[serde(default = "default_true")]
    pub durable: bool,
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub alternate_exchange: Option<String>,
    #[serde(default)]
    pub arguments: Arguments,
}

impl Default for ExchangeSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: ExchangeKind::default(),
            durable: true,
            internal: false,
            auto_delete: false,
            alternate_exchange: None,
            arguments: Arguments::new(),
        }
    }
}

impl ExchangeSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }

    pub fn alternate_exchange(mut self, name: &str) -> Self {
        self.alternate_exchange = Some(name.to_string());
        self
    }

    /// True when this names a real exchange rather than the default one.
    pub fn is_named(&self) -> bool {
        !self.name.is_empty()
    }

    pub fn declare_arguments(&self) -> Arguments {
        let mut args = self.arguments.clone();
        if let Some(alternate) = &self.alternate_exchange {
            args.insert(ARG_ALTERNATE_EXCHANGE.to_string(), Value::from(alternate.clone()));
        }
        args
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct QueueSpec {
    /// Empty lets the broker assign a name.
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub durable: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub auto_delete: bool,
    /// Per-queue message TTL in milliseconds.
    #[serde(default)]
    pub message_ttl: Option<u32>,
    /// Idle queue expiry in milliseconds.
    #[serde(default)]
    pub expires: Option<u32>,
    #[serde(default)]
    pub dead_letter_exchange: Option<String>,
    #[serde(default)]
    pub dead_letter_routing_key: Option<String>,
    #[serde(default)]
    pub max_length: Option<u32>,
    #[serde(default)]
    pub max_priority: Option<u8>,
    #[serde(default)]
    pub arguments: Arguments,
}

impl Default for QueueSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            message_ttl: None,
            expires: None,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
            max_length: None,
            max_priority: None,
            arguments: Arguments::new(),
        }
    }
}

impl QueueSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn message_ttl(mut self, ttl_ms: u32) -> Self {
        self.message_ttl = Some(ttl_ms);
        self
    }

    pub fn expires(mut self, expires_ms: u32) -> Self {
        self.expires = Some(expires_ms);
        self
    }

    pub fn dead_letter(mut self, exchange: &str, routing_key: Option<&str>) -> Self {
        self.dead_letter_exchange = Some(exchange.to_string());
        self.dead_letter_routing_key = routing_key.map(str::to_string);
        self
    }

    pub fn max_length(mut self, max: u32) -> Self {
        self.max_length = Some(max);
        self
    }

    pub fn max_priority(mut self, max: u8) -> Self {
        self.max_priority = Some(max);
        self
    }

    pub fn declare_arguments(&self) -> Arguments {
        let mut args = self.arguments.clone();

        if let Some(ttl) = self.message_ttl {
            args.insert(ARG_MESSAGE_TTL.to_string(), Value::from(ttl));
        }
        if let Some(expires) = self.expires {
            args.insert(ARG_EXPIRES.to_string(), Value::from(expires));
        }
        if let Some(exchange) = &self.dead_letter_exchange {
            args.insert(ARG_DEAD_LETTER_EXCHANGE.to_string(), Value::from(exchange.clone()));
        }
        if let Some(key) = &self.dead_letter_routing_key {
            args.insert(ARG_DEAD_LETTER_ROUTING_KEY.to_string(), Value::from(key.clone()));
        }
        if let Some(max) = self.max_length {
            args.insert(ARG_MAX_LENGTH.to_string(), Value::from(max));
        }
        if let Some(max) = self.max_priority {
            args.insert(ARG_MAX_PRIORITY.to_string(), Value::from(max));
        }

        args
    }
}
