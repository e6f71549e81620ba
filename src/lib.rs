// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker
//!
//! Typed messaging over a pluggable broker transport: a factory binding message
//! types to exchanges and queues, producers and consumers created from it, and
//! a consumption pipeline that dispatches deliveries to handlers under bounded
//! concurrency, settles each one exactly once and drains on shutdown.

mod otel;

pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod envelope;
pub mod errors;
pub mod exchange;
pub mod factory;
pub mod handler;
pub mod host;
pub mod pipeline;
pub mod producer;
pub mod queue;
pub mod settings;
pub mod topology;
pub mod transport;
pub mod worker;

pub use codec::{Codec, JsonCodec};
pub use config::{BrokerFactoryConfig, ConnectionTarget, FromEnv, PipelineConfig};
pub use consumer::Consumer;
pub use envelope::{EnvelopeState, MessageEnvelope};
pub use errors::BrokerError;
pub use exchange::ExchangeKind;
pub use factory::BrokerFactory;
pub use handler::{HandlerError, HandlerRegistry, MessageHandler};
pub use host::{HostedPipeline, PipelineHost};
pub use pipeline::ConsumptionPipeline;
pub use producer::Producer;
pub use settings::{ChannelSettings, DeliveryMode, QueueMessage, SettingsRegistry};
pub use worker::{Outcome, StatsSnapshot};
