// src/rabbitmq/mod.rs
// Resilient AMQP plumbing: connection lifecycle, publishing and consuming.

pub mod amqp_client;
pub mod connection;
pub mod consumer;
pub mod debug;
pub mod errors;
pub mod events;
pub mod publisher;
pub mod topology;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::{
    AmqpChannel, AmqpConnection, AmqpConnector, Delivery, DeliveryStream, LapinConnector,
    LinkEvent,
};
pub use connection::{backoff_delay, ConnectionManager, ConnectionState};
pub use consumer::{
    handler_fn, ConsumeOptions, Consumer, ConsumerSpec, ConsumerState, ReceiveHandler,
};
pub use debug::{derive_debug_queue_name, DebugPublisher, DebugSpec};
pub use errors::{RabbitError, Result, RetryExhausted, RETRY_EXHAUSTED_CODE};
pub use events::{ConnectionEvent, LogRecord, Severity};
pub use publisher::{publish, PublishTarget, Publisher};
pub use topology::{ExchangeKind, ExchangeSpec, QueueSpec};
