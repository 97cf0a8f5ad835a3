// src/config.rs
use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::rabbitmq::errors::{RabbitError, Result};

pub const CONFIG_FILE_NAME: &str = "rabbit-resilience.json";

/// Broker connection settings. Immutable once handed to a
/// [`ConnectionManager`](crate::rabbitmq::ConnectionManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConnectionConfig {
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_password")]
    pub password: String,
    /// Heartbeat interval in seconds, 0 disables heartbeats.
    #[serde(default = "default_heartbeat")]
    pub heartbeat: u16,
    #[serde(default = "default_locale")]
    pub locale: String,
    /// 0 accepts the broker's frame size.
    #[serde(default = "default_frame_max")]
    pub frame_max: u32,
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,
    #[serde(default)]
    pub connection_name: Option<String>,
}

// Default values
fn default_hostname() -> String { "localhost".to_string() }
fn default_port() -> u16 { 5672 }
fn default_vhost() -> String { "/".to_string() }
fn default_username() -> String { "guest".to_string() }
fn default_password() -> String { "guest".to_string() }
fn default_heartbeat() -> u16 { 60 }
fn default_locale() -> String { "en_US".to_string() }
fn default_frame_max() -> u32 { 4096 }
fn default_max_retry() -> u32 { 5 }
fn default_auto_reconnect() -> bool { true }
fn default_max_delay_ms() -> u64 { 3_600_000 }
fn default_socket_timeout_ms() -> u64 { 3000 }

const MIN_FRAME_MAX: u32 = 4096;

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            port: default_port(),
            vhost: default_vhost(),
            username: default_username(),
            password: default_password(),
            heartbeat: default_heartbeat(),
            locale: default_locale(),
            frame_max: default_frame_max(),
            max_retry: default_max_retry(),
            auto_reconnect: default_auto_reconnect(),
            max_delay_ms: default_max_delay_ms(),
            socket_timeout_ms: default_socket_timeout_ms(),
            connection_name: None,
        }
    }
}

impl ConnectionConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: ConnectionConfig = serde_json::from_str(json)
            .map_err(|e| RabbitError::Validation(format!("invalid connection config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hostname.trim().is_empty() {
            return Err(RabbitError::Validation("hostname cannot be empty".to_string()));
        }
        if self.port == 0 {
            return Err(RabbitError::Validation("port must be between 1 and 65535".to_string()));
        }
        if self.vhost.is_empty() {
            return Err(RabbitError::Validation("vhost cannot be empty".to_string()));
        }
        if self.frame_max != 0 && self.frame_max < MIN_FRAME_MAX {
            return Err(RabbitError::Validation(format!(
                "frameMax must be 0 or at least {}",
                MIN_FRAME_MAX
            )));
        }
        if self.max_delay_ms == 0 {
            return Err(RabbitError::Validation("maxDelay must be positive".to_string()));
        }
        if self.socket_timeout_ms == 0 {
            return Err(RabbitError::Validation("socket timeout must be positive".to_string()));
        }
        Ok(())
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    /// `amqp://` URI with percent-encoded credentials and vhost.
    pub fn amqp_uri(&self) -> String {
        self.build_uri(&urlencoding::encode(&self.password))
    }

    /// Same as [`amqp_uri`](Self::amqp_uri) with the password masked, for logs.
    pub fn redacted_uri(&self) -> String {
        self.build_uri("****")
    }

    fn build_uri(&self, password: &str) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}?heartbeat={}&frame_max={}&connection_timeout={}",
            urlencoding::encode(&self.username),
            password,
            self.hostname,
            self.port,
            urlencoding::encode(&self.vhost),
            self.heartbeat,
            self.frame_max,
            self.socket_timeout_ms,
        )
    }
}

// Configuration file lookup
pub fn find_config_file() -> anyhow::Result<PathBuf> {
    let locations = [
        ("Current directory", PathBuf::from(CONFIG_FILE_NAME)),
        ("Current directory (alternative)", Path::new("config").join(CONFIG_FILE_NAME)),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(path.clone());
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(format!(".{}", CONFIG_FILE_NAME));
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(home_config);
        }
    }

    Err(anyhow!(
        "Could not find {} in the current directory, ./config or your home directory",
        CONFIG_FILE_NAME
    ))
}

pub fn load_config_from(path: &Path) -> anyhow::Result<ConnectionConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;

    let config = ConnectionConfig::from_json_str(&content)
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;

    info!(uri = %config.redacted_uri(), "Loaded connection configuration");
    Ok(config)
}

pub fn load_config() -> anyhow::Result<ConnectionConfig> {
    let path = find_config_file()?;
    load_config_from(&path)
}

pub fn create_default_config_file(path: &Path) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(&ConnectionConfig::default())
        .context("Failed to serialize default configuration")?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory at {}", parent.display()))?;
        }
    }

    fs::write(path, json)
        .with_context(|| format!("Failed to write configuration to {}", path.display()))?;

    info!("Created default configuration file at: {}", path.display());
    Ok(())
}
