//! Configuration file handling for the bosun agent.
//!
//! Configuration is one TOML file, by default `/etc/bosun/bosun.toml`,
//! with every key optional:
//!
//! ```toml
//! storage = "/var/lib/bosun"
//! engine_key = """
//! -----BEGIN PUBLIC KEY-----
//! ...
//! -----END PUBLIC KEY-----
//! """
//! enable_dynamic_result_queue = false
//!
//! [rabbitmq]
//! host = "broker.internal"
//! port = 5671
//! login = "agent"
//! password = "secret"
//! virtual_host = "/"
//! ssl = true
//! ca_certs = "/etc/bosun/ca.pem"
//! input_queue = "agent-input"
//! result_exchange = ""
//! result_routing_key = "agent-results"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default configuration file location.
pub const CONFIG_FILE: &str = "/etc/bosun/bosun.toml";

/// Complete agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Root directory for the plan store and per-plan file caches.
    #[serde(default)]
    storage: Option<PathBuf>,
    /// PEM public key used to verify plan signatures; empty disables
    /// verification (development mode).
    #[serde(default)]
    engine_key: String,
    /// Honour a plan's `ReplyTo` as the result routing key.
    #[serde(default)]
    enable_dynamic_result_queue: bool,
    #[serde(default)]
    rabbitmq: RabbitConfig,
}

/// The `[rabbitmq]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RabbitConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_guest")]
    pub login: String,
    #[serde(default = "default_guest")]
    pub password: String,
    #[serde(default = "default_vhost")]
    pub virtual_host: String,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub ssl_version: String,
    #[serde(default)]
    pub ca_certs: String,
    #[serde(default)]
    pub insecure: bool,
    /// Queue this agent consumes; also mixed into the signed payload.
    #[serde(default)]
    pub input_queue: String,
    #[serde(default)]
    pub result_exchange: String,
    #[serde(default)]
    pub result_routing_key: String,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5672
}

fn default_guest() -> String {
    "guest".to_string()
}

fn default_vhost() -> String {
    "/".to_string()
}

impl Default for RabbitConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            login: default_guest(),
            password: default_guest(),
            virtual_host: default_vhost(),
            ssl: false,
            ssl_version: String::new(),
            ca_certs: String::new(),
            insecure: false,
            input_queue: String::new(),
            result_exchange: String::new(),
            result_routing_key: String::new(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration document.
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("failed to parse configuration")
    }

    /// Storage root for `plans/` and `files/`.
    pub fn storage(&self) -> PathBuf {
        self.storage
            .clone()
            .unwrap_or_else(|| PathBuf::from("/var/lib/bosun"))
    }

    /// Override the storage root (CLI flag).
    pub fn set_storage(&mut self, storage: PathBuf) {
        self.storage = Some(storage);
    }

    /// The engine public key, `None` when verification is disabled.
    pub fn engine_key(&self) -> Option<&str> {
        let key = self.engine_key.trim();
        (!key.is_empty()).then_some(key)
    }

    pub fn dynamic_result_queue(&self) -> bool {
        self.enable_dynamic_result_queue
    }

    pub fn rabbitmq(&self) -> &RabbitConfig {
        &self.rabbitmq
    }
}

impl RabbitConfig {
    /// The CA bundle path, `None` when blank.
    pub fn ca_certs(&self) -> Option<&str> {
        let path = self.ca_certs.trim();
        (!path.is_empty()).then_some(path)
    }

    /// The pinned SSL protocol name, `None` when blank.
    pub fn ssl_version(&self) -> Option<&str> {
        let version = self.ssl_version.trim();
        (!version.is_empty()).then_some(version)
    }
}

/// Load configuration from a file; a missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration {}", path.display()))?;
    Config::from_toml(&contents)
        .with_context(|| format!("invalid configuration in {}", path.display()))
}
