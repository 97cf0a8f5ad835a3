use dotenv::dotenv;
use std::env;
use std::str::FromStr;

use crate::config::ConnectionConfig;
use crate::rabbitmq::errors::{RabbitError, Result};

pub const ENV_HOST: &str = "RABBITMQ_HOST";
pub const ENV_PORT: &str = "RABBITMQ_PORT";
pub const ENV_VHOST: &str = "RABBITMQ_VHOST";
pub const ENV_USER: &str = "RABBITMQ_USER";
pub const ENV_PASSWORD: &str = "RABBITMQ_PASSWORD";
pub const ENV_HEARTBEAT: &str = "RABBITMQ_HEARTBEAT";
pub const ENV_LOCALE: &str = "RABBITMQ_LOCALE";
pub const ENV_FRAME_MAX: &str = "RABBITMQ_FRAME_MAX";
pub const ENV_MAX_RETRY: &str = "RABBITMQ_MAX_RETRY";
pub const ENV_AUTO_RECONNECT: &str = "RABBITMQ_AUTO_RECONNECT";
pub const ENV_MAX_DELAY_MS: &str = "RABBITMQ_MAX_DELAY_MS";
pub const ENV_SOCKET_TIMEOUT_MS: &str = "RABBITMQ_SOCKET_TIMEOUT_MS";
pub const ENV_CONNECTION_NAME: &str = "RABBITMQ_CONNECTION_NAME";

impl ConnectionConfig {
    /// Reads `RABBITMQ_*` variables (after loading `.env` if present).
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = ConnectionConfig::default();

        if let Some(value) = lookup(ENV_HOST) {
            config.hostname = value;
        }
        if let Some(value) = lookup(ENV_VHOST) {
            config.vhost = value;
        }
        if let Some(value) = lookup(ENV_USER) {
            config.username = value;
        }
        if let Some(value) = lookup(ENV_PASSWORD) {
            config.password = value;
        }
        if let Some(value) = lookup(ENV_LOCALE) {
            config.locale = value;
        }
        config.connection_name = lookup(ENV_CONNECTION_NAME).or(config.connection_name);

        parse_into(&lookup, ENV_PORT, &mut config.port)?;
        parse_into(&lookup, ENV_HEARTBEAT, &mut config.heartbeat)?;
        parse_into(&lookup, ENV_FRAME_MAX, &mut config.frame_max)?;
        parse_into(&lookup, ENV_MAX_RETRY, &mut config.max_retry)?;
        parse_into(&lookup, ENV_AUTO_RECONNECT, &mut config.auto_reconnect)?;
        parse_into(&lookup, ENV_MAX_DELAY_MS, &mut config.max_delay_ms)?;
        parse_into(&lookup, ENV_SOCKET_TIMEOUT_MS, &mut config.socket_timeout_ms)?;

        config.validate()?;
        Ok(config)
    }
}

fn parse_into<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| RabbitError::Validation(format!("{} has an invalid value: {}", key, raw)))?;
    }
    Ok(())
}
