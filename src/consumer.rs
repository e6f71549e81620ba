// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! A consumer owns one channel bound to one queue. Subscribing yields a stream
//! of [`MessageEnvelope`]s; the transport never hands out more unsettled
//! deliveries than the prefetch bound of the channel settings.

use crate::{
    channel::OwnedChannel,
    envelope::{Decoder, MessageEnvelope},
    errors::BrokerError,
};
use futures_util::{stream::BoxStream, StreamExt};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{debug, warn};
use uuid::Uuid;

pub type EnvelopeStream<T> = BoxStream<'static, Result<MessageEnvelope<T>, BrokerError>>;

/// Reads messages of type `T` from one queue over a channel of its own.
///
/// Created by [`BrokerFactory::create_consumer`](crate::factory::BrokerFactory::create_consumer)
/// once the queue topology is in place.
pub struct Consumer<T> {
    channel: Arc<OwnedChannel>,
    queue: String,
    consumer_tag: String,
    prefetch: u16,
    decoder: Decoder<T>,
    subscribed: AtomicBool,
}

impl<T: Send + Sync + 'static> Consumer<T> {
    pub(crate) fn new(
        channel: Arc<OwnedChannel>,
        queue: &str,
        prefetch: u16,
        decoder: Decoder<T>,
    ) -> Self {
        Self {
            channel,
            queue: queue.to_owned(),
            consumer_tag: format!("{queue}-{}", Uuid::new_v4()),
            prefetch,
            decoder,
            subscribed: AtomicBool::new(false),
        }
    }

    /// Starts the subscription. A consumer subscribes at most once.
    pub async fn subscribe(&self) -> Result<EnvelopeStream<T>, BrokerError> {
        self.channel.ensure_open()?;
        if self.subscribed.swap(true, Ordering::AcqRel) {
            return Err(BrokerError::Configuration(format!(
                "consumer of `{}` is already subscribed",
                self.queue
            )));
        }

        let deliveries = match self
            .channel
            .transport()
            .subscribe(&self.queue, &self.consumer_tag)
            .await
        {
            Ok(deliveries) => deliveries,
            Err(err) => {
                self.subscribed.store(false, Ordering::Release);
                return Err(err);
            }
        };
        debug!(queue = self.queue, tag = self.consumer_tag, "subscribed");

        let decoder = self.decoder.clone();
        Ok(deliveries
            .map(move |delivery| {
                delivery.map(|delivery| MessageEnvelope::new(delivery, decoder.clone()))
            })
            .boxed())
    }

    /// Cancels the subscription and closes the channel. Unsettled deliveries
    /// return to the queue.
    pub async fn close(&self) {
        if self.channel.is_closed() {
            return;
        }

        if self.subscribed.load(Ordering::Acquire) {
            if let Err(err) = self.channel.transport().cancel(&self.consumer_tag).await {
                warn!(error = %err, queue = self.queue, "failure to cancel the subscription");
            }
        }
        self.channel.close().await;
    }

    /// Name of the queue this consumer reads.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Tag identifying the subscription at the broker, unique per consumer.
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Upper bound on unsettled deliveries handed to this consumer.
    pub fn prefetch(&self) -> u16 {
        self.prefetch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockDeliveryAcker, MockTransportChannel, RawDelivery};
    use futures_util::stream;
    use std::collections::BTreeMap;

    fn delivery(tag: u64, payload: &str) -> RawDelivery {
        RawDelivery {
            delivery_tag: tag,
            exchange: "shop".into(),
            routing_key: "purchase".into(),
            redelivered: false,
            message_type: Some("purchase".into()),
            message_id: None,
            headers: BTreeMap::new(),
            payload: payload.as_bytes().to_vec(),
            acker: Arc::new(MockDeliveryAcker::new()),
        }
    }

    fn consumer(channel: MockTransportChannel) -> Consumer<String> {
        Consumer::new(
            Arc::new(OwnedChannel::new(Arc::new(channel), "consumer:purchase")),
            "purchases",
            5,
            Arc::new(|bytes: &[u8]| Ok(String::from_utf8_lossy(bytes).into_owned())),
        )
    }

    #[tokio::test]
    async fn wraps_deliveries_in_envelopes() {
        let mut channel = MockTransportChannel::new();
        channel
            .expect_subscribe()
            .withf(|queue, tag| queue.to_string() == "purchases" && tag.starts_with("purchases-"))
            .times(1)
            .returning(|_, _| {
                Ok(stream::iter(vec![Ok(delivery(1, "a")), Ok(delivery(2, "b"))]).boxed())
            });

        let consumer = consumer(channel);
        let envelopes: Vec<_> = consumer.subscribe().await.unwrap().collect().await;

        assert_eq!(envelopes.len(), 2);
        let second = envelopes[1].as_ref().unwrap();
        assert_eq!(second.delivery_tag(), 2);
        assert_eq!(second.decode().unwrap(), "b");
    }

    #[tokio::test]
    async fn subscribes_once() {
        let mut channel = MockTransportChannel::new();
        channel
            .expect_subscribe()
            .times(1)
            .returning(|_, _| Ok(stream::empty().boxed()));

        let consumer = consumer(channel);
        assert!(consumer.subscribe().await.is_ok());
        assert!(matches!(
            consumer.subscribe().await,
            Err(BrokerError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn close_cancels_then_closes_once() {
        let mut channel = MockTransportChannel::new();
        channel
            .expect_subscribe()
            .returning(|_, _| Ok(stream::empty().boxed()));
        channel.expect_cancel().times(1).returning(|_| Ok(()));
        channel.expect_close().times(1).returning(|| Ok(()));

        let consumer = consumer(channel);
        let _stream = consumer.subscribe().await.unwrap();

        consumer.close().await;
        consumer.close().await;
        assert!(matches!(
            consumer.subscribe().await,
            Err(BrokerError::Disposed(_))
        ));
    }
}
