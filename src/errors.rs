// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Broker Abstraction
//!
//! This module provides the error taxonomy shared by every layer of the crate.
//! Setup-time variants (`Configuration`, `BrokerUnavailable`) are fatal for the
//! caller that requested a channel. Per-message variants (`Decode`,
//! `HandlerFailure`, `ShutdownSignal`, `AckProtocol`, `AlreadySettled`) never
//! leave the consumption pipeline: they are resolved into an ack or a reject.

use thiserror::Error;

/// Represents errors that can occur while declaring, publishing or consuming messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Missing or invalid channel settings or factory configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Connecting to the broker or declaring topology failed
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// The payload could not be decoded into the requested type
    #[error("failure to decode payload: {0}")]
    Decode(String),

    /// Serializing, sending or confirming a message failed
    #[error("failure to publish: {0}")]
    Publish(String),

    /// The ack/reject call itself failed at the transport
    #[error("failure to settle message: {0}")]
    AckProtocol(String),

    /// A second ack/reject was attempted on an envelope
    #[error("message already {0}")]
    AlreadySettled(String),

    /// No handler is registered for the message type
    #[error("no handler registered for message type `{0}`")]
    HandlerNotFound(String),

    /// Business logic failed while handling a message
    #[error("handler failure: {0}")]
    HandlerFailure(String),

    /// Cooperative cancellation was observed during handling
    #[error("shutdown signal observed")]
    ShutdownSignal,

    /// The factory, producer or consumer was already disposed
    #[error("`{0}` is already disposed")]
    Disposed(String),
}

impl BrokerError {
    /// Whether the error is fatal at setup time.
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            BrokerError::Configuration(_) | BrokerError::BrokerUnavailable(_)
        )
    }
}
