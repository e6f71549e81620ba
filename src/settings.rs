// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Settings Registry
//!
//! Maps a message type to the topology it travels through: exchange, route
//! key, queue, dead-letter queue and prefetch bound. Settings are declared at
//! startup (in code or from a JSON document) and validated once, on first
//! resolution, after which the cached value is returned as is.

use crate::{errors::BrokerError, exchange::ExchangeKind};
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, warn};

pub const DEFAULT_PREFETCH_COUNT: u16 = 5;

/// A message type that can be bound to a channel.
///
/// `MESSAGE_TYPE` is the key under which the channel settings and the handler
/// of the type are registered; it is also sent as the message type property.
pub trait QueueMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    const MESSAGE_TYPE: &'static str;
}

/// Whether the broker should persist a published message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    Transient,
    #[default]
    Persistent,
}

/// Topology description of one message type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSettings {
    pub exchange_name: String,
    #[serde(default)]
    pub exchange_kind: ExchangeKind,
    /// Required unless the exchange is a fanout.
    #[serde(default)]
    pub route_key: Option<String>,
    /// Required on the consumer side.
    #[serde(default)]
    pub queue_name: Option<String>,
    /// Falls back to the factory default when absent.
    #[serde(default)]
    pub dead_letter_queue: Option<String>,
    #[serde(default = "default_prefetch")]
    pub prefetch_count: u16,
    #[serde(default = "default_durable")]
    pub durable: bool,
    #[serde(default)]
    pub delivery_mode: DeliveryMode,
}

fn default_prefetch() -> u16 {
    DEFAULT_PREFETCH_COUNT
}

fn default_durable() -> bool {
    true
}

impl ChannelSettings {
    pub fn new(exchange_name: &str, exchange_kind: ExchangeKind) -> Self {
        Self {
            exchange_name: exchange_name.to_owned(),
            exchange_kind,
            route_key: None,
            queue_name: None,
            dead_letter_queue: None,
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            durable: true,
            delivery_mode: DeliveryMode::Persistent,
        }
    }

    pub fn route_key(mut self, key: &str) -> Self {
        self.route_key = Some(key.to_owned());
        self
    }

    pub fn queue(mut self, name: &str) -> Self {
        self.queue_name = Some(name.to_owned());
        self
    }

    pub fn dead_letter_queue(mut self, name: &str) -> Self {
        self.dead_letter_queue = Some(name.to_owned());
        self
    }

    pub fn prefetch(mut self, count: u16) -> Self {
        self.prefetch_count = count;
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    /// The route key, or an empty key for fanout exchanges.
    pub fn effective_route_key(&self) -> &str {
        self.route_key.as_deref().unwrap_or_default()
    }

    /// The queue name, which only consumers require.
    pub fn require_queue(&self, message_type: &str) -> Result<&str, BrokerError> {
        match self.queue_name.as_deref() {
            Some(name) if !name.trim().is_empty() => Ok(name),
            _ => Err(BrokerError::Configuration(format!(
                "queue_name is missing for `{message_type}`"
            ))),
        }
    }

    /// Checks the fields shared by producers and consumers.
    ///
    /// The prefetch bound is unsigned, so its lower bound holds by construction.
    pub fn validate(&self, message_type: &str) -> Result<(), BrokerError> {
        if self.exchange_name.trim().is_empty() {
            return Err(BrokerError::Configuration(format!(
                "exchange_name is missing for `{message_type}`"
            )));
        }

        let has_route_key = self
            .route_key
            .as_deref()
            .is_some_and(|key| !key.trim().is_empty());
        if self.exchange_kind.requires_route_key() && !has_route_key {
            return Err(BrokerError::Configuration(format!(
                "route_key is missing for `{message_type}` on a {} exchange",
                self.exchange_kind
            )));
        }

        if let Some(queue) = &self.queue_name {
            if queue.trim().is_empty() {
                return Err(BrokerError::Configuration(format!(
                    "queue_name is blank for `{message_type}`"
                )));
            }
        }

        Ok(())
    }
}

/// Registry of declared and validated channel settings.
///
/// Instance-scoped: two factories holding two registries never share state.
#[derive(Debug, Default)]
pub struct SettingsRegistry {
    declared: RwLock<HashMap<String, ChannelSettings>>,
    resolved: RwLock<HashMap<String, Arc<ChannelSettings>>>,
}

impl SettingsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`SettingsRegistry::declare`].
    pub fn with<T: QueueMessage>(self, settings: ChannelSettings) -> Self {
        self.declare::<T>(settings);
        self
    }

    pub fn declare<T: QueueMessage>(&self, settings: ChannelSettings) {
        self.declare_named(T::MESSAGE_TYPE, settings);
    }

    /// Declares the settings of a message type by name.
    ///
    /// Settings of a type that was already resolved are immutable; a late
    /// declaration is ignored.
    pub fn declare_named(&self, message_type: &str, settings: ChannelSettings) {
        if self.resolved.read().contains_key(message_type) {
            warn!(
                message_type,
                "settings already resolved, ignoring the new declaration"
            );
            return;
        }

        self.declared
            .write()
            .insert(message_type.to_owned(), settings);
    }

    /// Builds a registry from a JSON object keyed by message type.
    pub fn from_json(json: &str) -> Result<Self, BrokerError> {
        let declared: HashMap<String, ChannelSettings> = serde_json::from_str(json)
            .map_err(|err| BrokerError::Configuration(err.to_string()))?;

        Ok(Self {
            declared: RwLock::new(declared),
            resolved: RwLock::default(),
        })
    }

    pub fn resolve<T: QueueMessage>(&self) -> Result<Arc<ChannelSettings>, BrokerError> {
        self.resolve_named(T::MESSAGE_TYPE)
    }

    /// Returns the validated settings of a message type.
    ///
    /// The first call validates and caches; later calls return the cache.
    pub fn resolve_named(&self, message_type: &str) -> Result<Arc<ChannelSettings>, BrokerError> {
        if let Some(settings) = self.resolved.read().get(message_type) {
            return Ok(settings.clone());
        }

        let mut resolved = self.resolved.write();
        if let Some(settings) = resolved.get(message_type) {
            return Ok(settings.clone());
        }

        let settings = self
            .declared
            .read()
            .get(message_type)
            .cloned()
            .ok_or_else(|| {
                BrokerError::Configuration(format!(
                    "channel settings are not declared for `{message_type}`"
                ))
            })?;

        settings.validate(message_type)?;
        debug!(
            message_type,
            exchange = settings.exchange_name,
            "channel settings validated"
        );

        let settings = Arc::new(settings);
        resolved.insert(message_type.to_owned(), settings.clone());
        Ok(settings)
    }

    pub fn is_declared(&self, message_type: &str) -> bool {
        self.declared.read().contains_key(message_type)
    }
}
