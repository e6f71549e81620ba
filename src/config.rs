// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Factory and Pipeline Configuration
//!
//! Configuration can be built in code, deserialized from JSON or loaded from
//! environment variables through [`FromEnv`]. Every loader ends with
//! `validate`, so a factory never starts from an incomplete configuration.

use crate::errors::BrokerError;
use serde::{Deserialize, Serialize};
use std::{env, str::FromStr, time::Duration};

pub const DEFAULT_AMQP_PORT: u16 = 5672;
pub const DEFAULT_VHOST: &str = "/";
pub const DEFAULT_RECOVERY_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_CONFIRM_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Trait for configuration that can be loaded from environment variables.
pub trait FromEnv: Sized {
    fn from_env() -> Result<Self, BrokerError>;
}

/// Loads an environment variable, falling back to `default`.
pub fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Loads an environment variable or fails with a configuration error.
pub fn env_required(key: &str) -> Result<String, BrokerError> {
    env::var(key).map_err(|_| {
        BrokerError::Configuration(format!(
            "environment variable `{key}` is required but not set"
        ))
    })
}

/// Parses an optional environment variable, falling back to `default` when unset.
pub fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, BrokerError> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().map_err(|_| {
            BrokerError::Configuration(format!(
                "failure to parse environment variable `{key}`: `{raw}`"
            ))
        }),
        Err(_) => Ok(default),
    }
}

/// Where the broker lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConnectionTarget {
    Url {
        url: String,
    },
    Host {
        host: String,
        #[serde(default = "default_port")]
        port: u16,
        #[serde(default = "default_vhost")]
        vhost: String,
        username: String,
        password: String,
    },
}

fn default_port() -> u16 {
    DEFAULT_AMQP_PORT
}

fn default_vhost() -> String {
    DEFAULT_VHOST.to_owned()
}

impl ConnectionTarget {
    pub fn url(url: &str) -> Self {
        ConnectionTarget::Url {
            url: url.to_owned(),
        }
    }

    pub fn host(host: &str, username: &str, password: &str) -> Self {
        ConnectionTarget::Host {
            host: host.to_owned(),
            port: DEFAULT_AMQP_PORT,
            vhost: DEFAULT_VHOST.to_owned(),
            username: username.to_owned(),
            password: password.to_owned(),
        }
    }

    /// The AMQP URI for this target.
    pub fn uri(&self) -> String {
        match self {
            ConnectionTarget::Url { url } => url.clone(),
            ConnectionTarget::Host {
                host,
                port,
                vhost,
                username,
                password,
            } => format!(
                "amqp://{}:{}@{}:{}/{}",
                username,
                password,
                host,
                port,
                vhost.replace('/', "%2f")
            ),
        }
    }

    fn validate(&self) -> Result<(), BrokerError> {
        match self {
            ConnectionTarget::Url { url } => require("url", url),
            ConnectionTarget::Host {
                host,
                port,
                username,
                password,
                ..
            } => {
                require("host", host)?;
                if *port == 0 {
                    return Err(BrokerError::Configuration("port is missing".into()));
                }
                require("username", username)?;
                require("password", password)
            }
        }
    }
}

fn require(field: &str, value: &str) -> Result<(), BrokerError> {
    if value.trim().is_empty() {
        return Err(BrokerError::Configuration(format!("{field} is missing")));
    }
    Ok(())
}

/// Configuration of one broker factory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerFactoryConfig {
    /// Connection name reported to the broker.
    #[serde(default = "default_app_name")]
    pub app_name: String,
    pub target: ConnectionTarget,
    /// 0 disables recovery of a lost connection.
    #[serde(default = "default_recovery_interval")]
    pub recovery_interval_secs: u64,
    pub default_dead_letter_exchange: String,
    pub default_dead_letter_queue: String,
    #[serde(default)]
    pub skip_topology_management: bool,
    #[serde(default = "default_true")]
    pub publisher_confirms: bool,
    #[serde(default = "default_confirm_timeout")]
    pub confirm_timeout_ms: u64,
}

fn default_app_name() -> String {
    env!("CARGO_PKG_NAME").to_owned()
}

fn default_recovery_interval() -> u64 {
    DEFAULT_RECOVERY_INTERVAL_SECS
}

fn default_true() -> bool {
    true
}

fn default_confirm_timeout() -> u64 {
    DEFAULT_CONFIRM_TIMEOUT_MS
}

impl BrokerFactoryConfig {
    pub fn new(
        target: ConnectionTarget,
        dead_letter_exchange: &str,
        dead_letter_queue: &str,
    ) -> Self {
        Self {
            app_name: default_app_name(),
            target,
            recovery_interval_secs: DEFAULT_RECOVERY_INTERVAL_SECS,
            default_dead_letter_exchange: dead_letter_exchange.to_owned(),
            default_dead_letter_queue: dead_letter_queue.to_owned(),
            skip_topology_management: false,
            publisher_confirms: true,
            confirm_timeout_ms: DEFAULT_CONFIRM_TIMEOUT_MS,
        }
    }

    pub fn with_app_name(mut self, name: &str) -> Self {
        self.app_name = name.to_owned();
        self
    }

    pub fn with_recovery_interval_secs(mut self, secs: u64) -> Self {
        self.recovery_interval_secs = secs;
        self
    }

    pub fn with_skip_topology_management(mut self, skip: bool) -> Self {
        self.skip_topology_management = skip;
        self
    }

    pub fn with_publisher_confirms(mut self, enabled: bool) -> Self {
        self.publisher_confirms = enabled;
        self
    }

    /// Saturates at `u64::MAX` milliseconds.
    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Parses and validates a JSON document.
    pub fn from_json(json: &str) -> Result<Self, BrokerError> {
        let cfg: Self = serde_json::from_str(json)
            .map_err(|err| BrokerError::Configuration(err.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), BrokerError> {
        self.target.validate()?;
        require("default_dead_letter_exchange", &self.default_dead_letter_exchange)?;
        require("default_dead_letter_queue", &self.default_dead_letter_queue)
    }

    /// `None` when recovery is disabled.
    pub fn recovery_interval(&self) -> Option<Duration> {
        match self.recovery_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }
}

impl FromEnv for BrokerFactoryConfig {
    /// Requires `BROKER_URL`, or `BROKER_HOST` with `BROKER_USER` and
    /// `BROKER_PASSWORD`, plus both dead-letter names.
    fn from_env() -> Result<Self, BrokerError> {
        let target = match env::var("BROKER_URL") {
            Ok(url) => ConnectionTarget::Url { url },
            Err(_) => ConnectionTarget::Host {
                host: env_required("BROKER_HOST")?,
                port: env_parse("BROKER_PORT", DEFAULT_AMQP_PORT)?,
                vhost: env_or_default("BROKER_VHOST", DEFAULT_VHOST),
                username: env_required("BROKER_USER")?,
                password: env_required("BROKER_PASSWORD")?,
            },
        };

        let cfg = Self {
            app_name: env_or_default("BROKER_APP_NAME", env!("CARGO_PKG_NAME")),
            target,
            recovery_interval_secs: env_parse(
                "BROKER_RECOVERY_INTERVAL_SECS",
                DEFAULT_RECOVERY_INTERVAL_SECS,
            )?,
            default_dead_letter_exchange: env_required("BROKER_DEAD_LETTER_EXCHANGE")?,
            default_dead_letter_queue: env_required("BROKER_DEAD_LETTER_QUEUE")?,
            skip_topology_management: env_parse("BROKER_SKIP_TOPOLOGY", false)?,
            publisher_confirms: env_parse("BROKER_PUBLISHER_CONFIRMS", true)?,
            confirm_timeout_ms: env_parse("BROKER_CONFIRM_TIMEOUT_MS", DEFAULT_CONFIRM_TIMEOUT_MS)?,
        };

        cfg.validate()?;
        Ok(cfg)
    }
}

/// Configuration of one consumption pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Maximum concurrent handler invocations
    pub parallelism: usize,
    /// Upper bound on the drain during stop; `None` waits indefinitely
    pub shutdown_timeout: Option<Duration>,
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            parallelism: available_parallelism(),
            shutdown_timeout: Some(Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS)),
        }
    }
}

fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl FromEnv for PipelineConfig {
    /// `PIPELINE_SHUTDOWN_TIMEOUT_SECS=0` waits indefinitely.
    fn from_env() -> Result<Self, BrokerError> {
        let parallelism = env_parse("PIPELINE_PARALLELISM", available_parallelism())?;
        let timeout_secs = env_parse(
            "PIPELINE_SHUTDOWN_TIMEOUT_SECS",
            DEFAULT_SHUTDOWN_TIMEOUT_SECS,
        )?;

        Ok(Self::new()
            .with_parallelism(parallelism)
            .with_shutdown_timeout(match timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            }))
    }
}
