pub mod client;
pub mod config;
pub mod env;
pub mod message;
pub mod rabbitmq;

pub use client::{PublishRequest, Rabbit};
pub use config::ConnectionConfig;
pub use message::{normalize, Message, MessageInput, MessageOptions, MessageRecord, ReceivedMessage};
pub use rabbitmq::{RabbitError, Result};
