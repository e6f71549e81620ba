// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Producer
//!
//! Publishes typed messages to the exchange of their channel settings. Each
//! message carries the codec content type, the message type name, a fresh
//! message id, the configured delivery mode and the current trace context.
//!
//! When the factory enables publisher confirms, `publish` returns only after
//! the broker confirmed the message, or fails once the confirm timeout
//! elapses. There is no retry.

use crate::{
    channel::OwnedChannel,
    codec::{Codec, JsonCodec},
    errors::BrokerError,
    otel,
    settings::{ChannelSettings, DeliveryMode, QueueMessage},
    transport::{OutboundMessage, PublishConfirmation},
};
use std::{collections::BTreeMap, marker::PhantomData, sync::Arc, time::Duration};
use tracing::{debug, error};
use uuid::Uuid;

/// Publishes messages of type `T` to the exchange and routing key their
/// [`ChannelSettings`] name, over a channel of its own.
pub struct Producer<T, C = JsonCodec> {
    channel: Arc<OwnedChannel>,
    settings: Arc<ChannelSettings>,
    codec: C,
    confirm_timeout: Duration,
    _message: PhantomData<fn(T)>,
}

impl<T: QueueMessage, C: Codec> Producer<T, C> {
    pub(crate) fn new(
        channel: Arc<OwnedChannel>,
        settings: Arc<ChannelSettings>,
        codec: C,
        confirm_timeout: Duration,
    ) -> Self {
        Self {
            channel,
            settings,
            codec,
            confirm_timeout,
            _message: PhantomData,
        }
    }

    /// Publishes one message.
    pub async fn publish(&self, message: &T) -> Result<(), BrokerError> {
        self.channel.ensure_open()?;

        let payload = self.codec.encode(message)?;
        let mut headers = BTreeMap::new();
        otel::inject_current_context(&mut headers);

        let outbound = OutboundMessage {
            exchange: self.settings.exchange_name.clone(),
            routing_key: self.settings.effective_route_key().to_owned(),
            payload,
            content_type: self.codec.content_type().to_owned(),
            message_type: T::MESSAGE_TYPE.to_owned(),
            message_id: Uuid::new_v4().to_string(),
            persistent: self.settings.delivery_mode == DeliveryMode::Persistent,
            headers,
        };
        let message_id = outbound.message_id.clone();

        let sent =
            tokio::time::timeout(self.confirm_timeout, self.channel.transport().publish(outbound))
                .await;

        match sent {
            Err(_) => {
                error!(
                    message_type = T::MESSAGE_TYPE,
                    message_id, "publish confirmation timed out"
                );
                Err(BrokerError::Publish(format!(
                    "confirmation of `{message_id}` timed out after {:?}",
                    self.confirm_timeout
                )))
            }
            Ok(Err(err)) => {
                error!(error = %err, message_type = T::MESSAGE_TYPE, "error publishing message");
                Err(match err {
                    BrokerError::Publish(_) => err,
                    other => BrokerError::Publish(other.to_string()),
                })
            }
            Ok(Ok(PublishConfirmation::Rejected)) => {
                error!(
                    message_type = T::MESSAGE_TYPE,
                    message_id, "broker rejected the message"
                );
                Err(BrokerError::Publish(format!(
                    "broker rejected `{message_id}`"
                )))
            }
            Ok(Ok(_)) => {
                debug!(message_type = T::MESSAGE_TYPE, message_id, "message published");
                Ok(())
            }
        }
    }

    /// Releases the channel of this producer.
    pub async fn close(&self) {
        self.channel.close().await;
    }

    /// The settings `T` resolved to when the producer was created.
    pub fn settings(&self) -> &ChannelSettings {
        &self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{exchange::ExchangeKind, transport::MockTransportChannel};
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Purchase {
        id: u32,
    }

    impl QueueMessage for Purchase {
        const MESSAGE_TYPE: &'static str = "purchase";
    }

    fn producer(channel: MockTransportChannel, mode: DeliveryMode) -> Producer<Purchase> {
        let settings = ChannelSettings::new("shop", ExchangeKind::Topic)
            .route_key("shop.purchase")
            .delivery_mode(mode);
        Producer::new(
            Arc::new(OwnedChannel::new(Arc::new(channel), "producer:purchase")),
            Arc::new(settings),
            JsonCodec,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn publishes_with_properties() {
        let mut channel = MockTransportChannel::new();
        channel
            .expect_publish()
            .withf(|msg| {
                msg.exchange == "shop"
                    && msg.routing_key == "shop.purchase"
                    && msg.payload == br#"{"id":7}"#
                    && msg.content_type == "application/json"
                    && msg.message_type == "purchase"
                    && !msg.message_id.is_empty()
                    && msg.persistent
            })
            .times(1)
            .returning(|_| Ok(PublishConfirmation::Confirmed));

        producer(channel, DeliveryMode::Persistent)
            .publish(&Purchase { id: 7 })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn transient_delivery_mode() {
        let mut channel = MockTransportChannel::new();
        channel
            .expect_publish()
            .withf(|msg| !msg.persistent)
            .times(1)
            .returning(|_| Ok(PublishConfirmation::NotRequested));

        producer(channel, DeliveryMode::Transient)
            .publish(&Purchase { id: 1 })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rejected_confirmation_is_publish_error() {
        let mut channel = MockTransportChannel::new();
        channel
            .expect_publish()
            .returning(|_| Ok(PublishConfirmation::Rejected));

        let result = producer(channel, DeliveryMode::Persistent)
            .publish(&Purchase { id: 1 })
            .await;
        assert!(matches!(result, Err(BrokerError::Publish(_))));
    }

    #[tokio::test]
    async fn transport_failure_is_publish_error() {
        let mut channel = MockTransportChannel::new();
        channel
            .expect_publish()
            .returning(|_| Err(BrokerError::BrokerUnavailable("closed".into())));

        let result = producer(channel, DeliveryMode::Persistent)
            .publish(&Purchase { id: 1 })
            .await;
        assert!(matches!(result, Err(BrokerError::Publish(_))));
    }

    #[tokio::test]
    async fn closed_producer_does_not_publish() {
        let mut channel = MockTransportChannel::new();
        channel.expect_close().times(1).returning(|| Ok(()));
        channel.expect_publish().never();

        let producer = producer(channel, DeliveryMode::Persistent);
        producer.close().await;
        producer.close().await;

        assert_eq!(
            producer.publish(&Purchase { id: 1 }).await,
            Err(BrokerError::Disposed("producer:purchase".into()))
        );
    }
}
