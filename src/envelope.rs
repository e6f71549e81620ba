// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! Wraps one delivery: the raw payload, its lazily decoded value and the
//! capability to settle the delivery at the transport. An envelope leaves the
//! `Delivered` state exactly once; later settle attempts fail with
//! [`BrokerError::AlreadySettled`] and never reach the transport.

use crate::{
    errors::BrokerError,
    transport::{DeliveryAcker, RawDelivery},
};
use once_cell::sync::OnceCell;
use std::{
    borrow::Cow,
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};

/// Decodes a payload into the message type of a consumer.
pub type Decoder<T> = Arc<dyn Fn(&[u8]) -> Result<T, BrokerError> + Send + Sync>;

const PAYLOAD_PREVIEW_LEN: usize = 256;

/// Lifecycle of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EnvelopeState {
    Delivered = 0,
    Acknowledged = 1,
    Rejected = 2,
}

impl EnvelopeState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => EnvelopeState::Acknowledged,
            2 => EnvelopeState::Rejected,
            _ => EnvelopeState::Delivered,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeState::Delivered => "delivered",
            EnvelopeState::Acknowledged => "acknowledged",
            EnvelopeState::Rejected => "rejected",
        }
    }
}

/// One delivery of a `T`, wrapping the raw payload and the means to settle it.
///
/// The payload is decoded on first access and cached. The envelope is settled
/// at most once: after an acknowledge or a reject, further attempts fail with
/// [`BrokerError::AlreadySettled`].
pub struct MessageEnvelope<T> {
    delivery_tag: u64,
    routing_key: String,
    redelivered: bool,
    message_id: Option<String>,
    headers: BTreeMap<String, String>,
    payload: Vec<u8>,
    acker: Arc<dyn DeliveryAcker>,
    decoder: Decoder<T>,
    decoded: OnceCell<Result<T, BrokerError>>,
    state: AtomicU8,
}

impl<T> MessageEnvelope<T> {
    /// Wraps a transport delivery; `decoder` runs on the first [`decode`](Self::decode).
    pub fn new(delivery: RawDelivery, decoder: Decoder<T>) -> Self {
        Self {
            delivery_tag: delivery.delivery_tag,
            routing_key: delivery.routing_key,
            redelivered: delivery.redelivered,
            message_id: delivery.message_id,
            headers: delivery.headers,
            payload: delivery.payload,
            acker: delivery.acker,
            decoder,
            decoded: OnceCell::new(),
            state: AtomicU8::new(EnvelopeState::Delivered as u8),
        }
    }

    /// The decoded value, computed on first access and cached.
    ///
    /// A malformed payload yields the same [`BrokerError::Decode`] on every call.
    pub fn decode(&self) -> Result<&T, BrokerError> {
        match self
            .decoded
            .get_or_init(|| (self.decoder)(&self.payload))
        {
            Ok(value) => Ok(value),
            Err(err) => Err(err.clone()),
        }
    }

    /// Tells the transport the message is fully processed.
    pub async fn acknowledge(&self) -> Result<(), BrokerError> {
        self.transition(EnvelopeState::Acknowledged)?;
        self.acker.ack().await
    }

    /// Rejects the message: `requeue = true` redelivers it, `false` routes it
    /// to the dead-letter target.
    pub async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.transition(EnvelopeState::Rejected)?;
        self.acker.reject(requeue).await
    }

    fn transition(&self, next: EnvelopeState) -> Result<(), BrokerError> {
        self.state
            .compare_exchange(
                EnvelopeState::Delivered as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|current| {
                BrokerError::AlreadySettled(EnvelopeState::from_u8(current).as_str().to_owned())
            })
    }

    /// Whether the envelope is still unsettled.
    pub fn state(&self) -> EnvelopeState {
        EnvelopeState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The payload bytes as delivered.
    pub fn raw_payload(&self) -> &[u8] {
        &self.payload
    }

    /// The payload as text, for logs.
    pub fn raw_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// A bounded prefix of the payload text, for logs.
    pub fn payload_preview(&self) -> String {
        let text = self.raw_text();
        match text.char_indices().nth(PAYLOAD_PREVIEW_LEN) {
            Some((idx, _)) => format!("{}...", &text[..idx]),
            None => text.into_owned(),
        }
    }

    /// Transport-assigned tag, unique within the delivering channel.
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Routing key the message was published with.
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Whether the transport delivered this message before.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Publisher-assigned id, when the transport carried one.
    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    /// Message headers, trace context included.
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }
}

impl<T> fmt::Debug for MessageEnvelope<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageEnvelope")
            .field("delivery_tag", &self.delivery_tag)
            .field("routing_key", &self.routing_key)
            .field("state", &self.state())
            .finish()
    }
}
