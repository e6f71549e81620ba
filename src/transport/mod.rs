// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Seam
//!
//! The factory, producers and consumers only talk to a broker through the
//! traits in this module. A transport owns the wire protocol; everything above
//! it (topology idempotency, envelopes, the consumption pipeline) is shared.
//!
//! Three transports ship with the crate:
//! - [`amqp::AmqpTransport`]: RabbitMQ through `lapin`
//! - [`memory::MemoryBroker`]: an in-process broker with the same contract
//! - [`filesystem::FileSystemBroker`]: one file per message under a root
//!   directory; durable across restarts, without prefetch or redelivery flags

pub mod amqp;
pub mod filesystem;
pub mod memory;

use crate::{
    config::BrokerFactoryConfig,
    errors::BrokerError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::BTreeMap, fmt, sync::Arc};

/// Stream of deliveries for one subscription.
pub type DeliveryStream = BoxStream<'static, Result<RawDelivery, BrokerError>>;

/// Opens connections to a broker.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establishes a new connection described by `config`.
    async fn connect(
        &self,
        config: &BrokerFactoryConfig,
    ) -> Result<Arc<dyn TransportConnection>, BrokerError>;
}

/// A long-lived connection shared by every channel of one factory.
#[async_trait]
pub trait TransportConnection: Send + Sync {
    /// Opens a new channel multiplexed over this connection.
    async fn open_channel(&self) -> Result<Arc<dyn TransportChannel>, BrokerError>;

    /// Whether the connection is still usable.
    fn is_connected(&self) -> bool;

    /// Closes the connection and every channel opened on it.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// One channel: topology declaration, publishing and subscriptions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransportChannel: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), BrokerError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), BrokerError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), BrokerError>;

    /// Limits the unacknowledged deliveries handed to each consumer of this channel.
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    /// Sends a message, waiting for the broker confirmation when confirms are enabled.
    async fn publish(&self, message: OutboundMessage) -> Result<PublishConfirmation, BrokerError>;

    async fn subscribe(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, BrokerError>;

    /// Cancels a subscription; unacknowledged deliveries return to the queue.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Settles one delivery at the transport.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;

    /// `requeue = false` routes the message to its dead-letter target.
    async fn reject(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// Result of a publish as reported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishConfirmation {
    Confirmed,
    Rejected,
    /// The channel does not run in confirm mode.
    NotRequested,
}

/// A message ready to be sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub content_type: String,
    pub message_type: String,
    pub message_id: String,
    pub persistent: bool,
    pub headers: BTreeMap<String, String>,
}

/// A message delivered to a subscription, still unsettled.
pub struct RawDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub message_type: Option<String>,
    pub message_id: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub payload: Vec<u8>,
    pub acker: Arc<dyn DeliveryAcker>,
}

impl fmt::Debug for RawDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawDelivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("message_type", &self.message_type)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}
