// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::time::error::Elapsed;

/// Error code carried by [`RabbitError::RetryExhausted`].
pub const RETRY_EXHAUSTED_CODE: u16 = 504;

const RETRY_EXHAUSTED_MESSAGE: &str = "[AMQP] cannot reconnect to AMQP server";

/// Details of a consumed reconnect budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryExhausted {
    pub code: u16,
    pub dev_message: String,
    pub user_message: String,
}

impl Default for RetryExhausted {
    fn default() -> Self {
        Self {
            code: RETRY_EXHAUSTED_CODE,
            dev_message: RETRY_EXHAUSTED_MESSAGE.to_string(),
            user_message: RETRY_EXHAUSTED_MESSAGE.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RabbitError {
    /// Malformed configuration or message. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Couldn't connect to Rabbit : {0}")]
    Connection(String),

    #[error("{} (code {})", .0.dev_message, .0.code)]
    RetryExhausted(RetryExhausted),

    #[error("Couldn't create a channel : {0}")]
    Channel(String),

    /// A receive handler failed. Only ever observed inside the consume loop.
    #[error("Handler error: {0}")]
    Handler(String),

    #[error("RabbitMQ broker error: {0}")]
    Broker(String),

    #[error("Connection timeout: {0}")]
    Timeout(String),

    #[error("Connection manager is closed")]
    Closed,

    #[error("Message serialization error: {0}")]
    Serialization(#[from] SerdeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RabbitError {
    /// Error code for errors that carry one.
    pub fn code(&self) -> Option<u16> {
        match self {
            RabbitError::RetryExhausted(details) => Some(details.code),
            _ => None,
        }
    }
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitError>;

impl From<LapinError> for RabbitError {
    fn from(error: LapinError) -> Self {
        RabbitError::Broker(error.to_string())
    }
}

impl From<Elapsed> for RabbitError {
    fn from(_: Elapsed) -> Self {
        RabbitError::Timeout("Connection timed out".to_string())
    }
}
