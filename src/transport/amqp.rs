// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Transport
//!
//! RabbitMQ implementation of the transport seam on top of `lapin`.
//! Connections are named after the application, channels enable publisher
//! confirms when configured, and queues carry their dead-letter routing as
//! `x-dead-letter-*` arguments.

use super::{
    DeliveryAcker, DeliveryStream, OutboundMessage, PublishConfirmation, RawDelivery, Transport,
    TransportChannel, TransportConnection,
};
use crate::{
    config::BrokerFactoryConfig,
    errors::BrokerError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";

const DELIVERY_MODE_TRANSIENT: u8 = 1;
const DELIVERY_MODE_PERSISTENT: u8 = 2;

const REPLY_SUCCESS: u16 = 200;

#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpTransport;

impl AmqpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(
        &self,
        config: &BrokerFactoryConfig,
    ) -> Result<Arc<dyn TransportConnection>, BrokerError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(config.app_name.clone()));

        let conn = Connection::connect(&config.target.uri(), options)
            .await
            .map_err(|err| {
                error!(error = %err, "failure to connect");
                BrokerError::BrokerUnavailable(err.to_string())
            })?;

        conn.on_error(|err| {
            error!(error = %err, "amqp connection failure");
        });
        debug!("amqp connected");

        Ok(Arc::new(AmqpConnection {
            conn,
            confirms: config.publisher_confirms,
        }))
    }
}

struct AmqpConnection {
    conn: Connection,
    confirms: bool,
}

#[async_trait]
impl TransportConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn TransportChannel>, BrokerError> {
        debug!("creating amqp channel...");
        let channel = self.conn.create_channel().await.map_err(|err| {
            error!(error = %err, "error to create the channel");
            BrokerError::BrokerUnavailable(err.to_string())
        })?;

        if self.confirms {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|err| {
                    error!(error = %err, "error to enable publisher confirms");
                    BrokerError::BrokerUnavailable(err.to_string())
                })?;
        }

        debug!("channel created");
        Ok(Arc::new(AmqpChannel { channel }))
    }

    fn is_connected(&self) -> bool {
        self.conn.status().connected()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.conn
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| BrokerError::BrokerUnavailable(err.to_string()))
    }
}

struct AmqpChannel {
    channel: Channel,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

#[async_trait]
impl TransportChannel for AmqpChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), BrokerError> {
        debug!("creating exchange: {}", def.name);

        self.channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    durable: def.durable,
                    auto_delete: def.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = %err, name = def.name, "error to declare the exchange");
                BrokerError::BrokerUnavailable(err.to_string())
            })
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), BrokerError> {
        debug!("creating queue: {}", def.name);

        let mut args = BTreeMap::new();
        if let Some(exchange) = &def.dead_letter_exchange {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(exchange.clone())),
            );
        }
        if let Some(key) = &def.dead_letter_routing_key {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(key.clone())),
            );
        }

        self.channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.auto_delete,
                    ..Default::default()
                },
                FieldTable::from(args),
            )
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = %err, name = def.name, "error to declare the queue");
                BrokerError::BrokerUnavailable(err.to_string())
            })
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), BrokerError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = %err, "error to bind queue to exchange");
                BrokerError::BrokerUnavailable(err.to_string())
            })
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(count, BasicQosOptions { global: false })
            .await
            .map_err(|err| BrokerError::BrokerUnavailable(err.to_string()))
    }

    async fn publish(&self, message: OutboundMessage) -> Result<PublishConfirmation, BrokerError> {
        let headers: BTreeMap<ShortString, AMQPValue> = message
            .headers
            .into_iter()
            .map(|(key, value)| {
                (
                    ShortString::from(key),
                    AMQPValue::LongString(LongString::from(value)),
                )
            })
            .collect();

        let delivery_mode = if message.persistent {
            DELIVERY_MODE_PERSISTENT
        } else {
            DELIVERY_MODE_TRANSIENT
        };

        let confirm = self
            .channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &message.payload,
                BasicProperties::default()
                    .with_content_type(ShortString::from(message.content_type))
                    .with_type(ShortString::from(message.message_type))
                    .with_message_id(ShortString::from(message.message_id))
                    .with_delivery_mode(delivery_mode)
                    .with_headers(FieldTable::from(headers)),
            )
            .await
            .map_err(|err| {
                error!(error = %err, "error publishing message");
                BrokerError::Publish(err.to_string())
            })?;

        let confirmation = confirm.await.map_err(|err| {
            error!(error = %err, "error awaiting the publish confirmation");
            BrokerError::Publish(err.to_string())
        })?;

        Ok(match confirmation {
            Confirmation::NotRequested => PublishConfirmation::NotRequested,
            Confirmation::Nack(_) => PublishConfirmation::Rejected,
            Confirmation::Ack(_) => PublishConfirmation::Confirmed,
        })
    }

    async fn subscribe(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = %err, queue, "failure to start consuming");
                BrokerError::BrokerUnavailable(err.to_string())
            })?;

        Ok(consumer
            .map(|result| {
                result
                    .map(|delivery| RawDelivery {
                        delivery_tag: delivery.delivery_tag,
                        exchange: delivery.exchange.to_string(),
                        routing_key: delivery.routing_key.to_string(),
                        redelivered: delivery.redelivered,
                        message_type: delivery.properties.kind().as_ref().map(|k| k.to_string()),
                        message_id: delivery
                            .properties
                            .message_id()
                            .as_ref()
                            .map(|id| id.to_string()),
                        headers: string_headers(delivery.properties.headers()),
                        payload: delivery.data,
                        acker: Arc::new(AmqpAcker {
                            acker: delivery.acker,
                        }),
                    })
                    .map_err(|err| BrokerError::BrokerUnavailable(err.to_string()))
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| BrokerError::BrokerUnavailable(err.to_string()))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.channel.status().connected() {
            return Ok(());
        }

        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| BrokerError::BrokerUnavailable(err.to_string()))
    }
}

struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl DeliveryAcker for AmqpAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| BrokerError::AckProtocol(err.to_string()))
    }

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| BrokerError::AckProtocol(err.to_string()))
    }
}

/// Keeps the textual headers of a delivery; other header types are dropped.
fn string_headers(headers: &Option<FieldTable>) -> BTreeMap<String, String> {
    let Some(table) = headers else {
        return BTreeMap::new();
    };

    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(v) => String::from_utf8_lossy(v.as_bytes()).into_owned(),
                AMQPValue::ShortString(v) => v.to_string(),
                AMQPValue::LongLongInt(v) => v.to_string(),
                AMQPValue::LongInt(v) => v.to_string(),
                AMQPValue::Boolean(v) => v.to_string(),
                _ => return None,
            };
            Some((key.to_string(), value))
        })
        .collect()
}
