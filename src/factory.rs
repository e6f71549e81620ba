// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Factory
//!
//! Creates producers and consumers for message types whose channel settings
//! are declared in a [`SettingsRegistry`]. All channels of a factory share one
//! connection. Topology is declared before the first producer or consumer of a
//! name is handed out, at most once per name, unless the configuration asks to
//! skip topology management.
//!
//! Consumer topology, in order:
//! 1. the dead-letter queue (durable)
//! 2. the dead-letter exchange (direct, durable)
//! 3. the binding of the dead-letter queue, keyed by the consumer queue name
//! 4. the consumer queue, dead-lettering to the exchange above
//! 5. the message exchange
//! 6. the binding of the consumer queue with the route key

use crate::{
    channel::OwnedChannel,
    codec::{Codec, JsonCodec},
    config::BrokerFactoryConfig,
    connection::SharedConnection,
    consumer::Consumer,
    errors::BrokerError,
    exchange::ExchangeDefinition,
    producer::Producer,
    queue::{QueueBinding, QueueDefinition},
    settings::{ChannelSettings, QueueMessage, SettingsRegistry},
    topology::{Topology, TopologyLocks},
    transport::{amqp::AmqpTransport, Transport},
};
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{debug, error, info};

/// Entry point of the crate: owns the shared connection and creates
/// producers and consumers for registered message types.
///
/// Each topology is declared once per factory, however many producers and
/// consumers ask for it concurrently. [`dispose`](Self::dispose) closes every
/// channel handed out and the connection.
pub struct BrokerFactory<C: Codec = JsonCodec> {
    config: BrokerFactoryConfig,
    registry: Arc<SettingsRegistry>,
    connection: SharedConnection,
    locks: TopologyLocks,
    channels: Mutex<Vec<Arc<OwnedChannel>>>,
    codec: C,
    disposed: AtomicBool,
}

impl BrokerFactory<JsonCodec> {
    /// A JSON factory over `transport`. Fails when `config` is invalid.
    pub fn new(
        config: BrokerFactoryConfig,
        registry: Arc<SettingsRegistry>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, BrokerError> {
        Self::with_codec(config, registry, transport, JsonCodec)
    }

    /// A factory talking to RabbitMQ.
    pub fn amqp(
        config: BrokerFactoryConfig,
        registry: Arc<SettingsRegistry>,
    ) -> Result<Self, BrokerError> {
        Self::new(config, registry, Arc::new(AmqpTransport::new()))
    }
}

impl<C: Codec> BrokerFactory<C> {
    /// A factory encoding payloads with `codec`.
    pub fn with_codec(
        config: BrokerFactoryConfig,
        registry: Arc<SettingsRegistry>,
        transport: Arc<dyn Transport>,
        codec: C,
    ) -> Result<Self, BrokerError> {
        config.validate()?;

        Ok(Self {
            connection: SharedConnection::new(transport, config.clone()),
            config,
            registry,
            locks: TopologyLocks::new(),
            channels: Mutex::new(Vec::new()),
            codec,
            disposed: AtomicBool::new(false),
        })
    }

    /// Creates a producer for `T`, declaring its exchange first.
    pub async fn create_producer<T: QueueMessage>(&self) -> Result<Producer<T, C>, BrokerError> {
        self.ensure_open()?;
        let settings = self.registry.resolve::<T>()?;
        let channel = self
            .open_channel(&format!("producer:{}", T::MESSAGE_TYPE))
            .await?;

        if !self.config.skip_topology_management {
            let name = exchange_lock_name(&settings);
            let topology = Topology::new().exchange(exchange_definition(&settings));

            if let Err(err) = self
                .locks
                .ensure(&name, || topology.install(channel.transport()))
                .await
            {
                error!(error = %err, message_type = T::MESSAGE_TYPE, "failure to declare producer topology");
                channel.close().await;
                return Err(err);
            }
        }

        debug!(message_type = T::MESSAGE_TYPE, "producer created");
        Ok(Producer::new(
            channel,
            settings,
            self.codec.clone(),
            self.config.confirm_timeout(),
        ))
    }

    /// Creates a consumer for `T`, declaring its queue, the dead-letter
    /// wiring and the exchange binding first.
    pub async fn create_consumer<T: QueueMessage>(&self) -> Result<Consumer<T>, BrokerError> {
        self.ensure_open()?;
        let settings = self.registry.resolve::<T>()?;
        let queue = settings.require_queue(T::MESSAGE_TYPE)?.to_owned();
        let channel = self
            .open_channel(&format!("consumer:{}", T::MESSAGE_TYPE))
            .await?;

        let prepared = async {
            if !self.config.skip_topology_management {
                let exchange_lock = exchange_lock_name(&settings);
                let topology = self.consumer_topology(
                    &settings,
                    &queue,
                    !self.locks.is_installed(&exchange_lock),
                );
                self.locks
                    .ensure(&format!("queue:{queue}"), || {
                        topology.install(channel.transport())
                    })
                    .await?;
                // The exchange is in place now, producers skip declaring it.
                self.locks.mark_installed(&exchange_lock).await;
            }
            channel.transport().set_prefetch(settings.prefetch_count).await
        };

        if let Err(err) = prepared.await {
            error!(error = %err, message_type = T::MESSAGE_TYPE, "failure to prepare consumer");
            channel.close().await;
            return Err(err);
        }

        debug!(message_type = T::MESSAGE_TYPE, queue, "consumer created");
        let codec = self.codec.clone();
        Ok(Consumer::new(
            channel,
            &queue,
            settings.prefetch_count,
            Arc::new(move |bytes: &[u8]| codec.decode::<T>(bytes)),
        ))
    }

    /// Closes every channel handed out, then the shared connection.
    /// Later calls are no-ops.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let channels: Vec<_> = self.channels.lock().drain(..).collect();
        join_all(channels.iter().map(|channel| channel.close())).await;
        self.connection.close().await;
        info!(app = self.config.app_name, "broker factory disposed");
    }

    /// Whether [`dispose`](Self::dispose) was called.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// The validated configuration the factory was built with.
    pub fn config(&self) -> &BrokerFactoryConfig {
        &self.config
    }

    /// Channel settings by message type.
    pub fn registry(&self) -> &Arc<SettingsRegistry> {
        &self.registry
    }

    /// How many times the shared connection was re-established.
    pub fn connection_recoveries(&self) -> usize {
        self.connection.recoveries()
    }

    /// Dead-letter queue, dead-letter exchange and their binding, then the
    /// queue, the message exchange unless a producer declared it, and the
    /// binding.
    fn consumer_topology(
        &self,
        settings: &ChannelSettings,
        queue: &str,
        declare_exchange: bool,
    ) -> Topology {
        let dlx = self.config.default_dead_letter_exchange.as_str();
        let dlq = settings
            .dead_letter_queue
            .as_deref()
            .unwrap_or(&self.config.default_dead_letter_queue);

        let mut topology = Topology::new()
            .queue(QueueDefinition::new(dlq).durable(true))
            .exchange(ExchangeDefinition::new(dlx).direct().durable(true))
            .queue_binding(QueueBinding::new(dlq).exchange(dlx).routing_key(queue))
            .queue(
                QueueDefinition::new(queue)
                    .durable(settings.durable)
                    .dead_letter(dlx, queue),
            );
        if declare_exchange {
            topology = topology.exchange(exchange_definition(settings));
        }
        topology.queue_binding(
            QueueBinding::new(queue)
                .exchange(&settings.exchange_name)
                .routing_key(settings.effective_route_key()),
        )
    }

    async fn open_channel(&self, label: &str) -> Result<Arc<OwnedChannel>, BrokerError> {
        let channel = Arc::new(OwnedChannel::new(
            self.connection.open_channel().await?,
            label,
        ));

        let mut channels = self.channels.lock();
        channels.retain(|c| !c.is_closed());
        channels.push(channel.clone());
        Ok(channel)
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.is_disposed() {
            return Err(BrokerError::Disposed("broker factory".into()));
        }
        Ok(())
    }
}

fn exchange_lock_name(settings: &ChannelSettings) -> String {
    format!(
        "exchange:{}:{}",
        settings.exchange_name,
        settings.effective_route_key()
    )
}

fn exchange_definition(settings: &ChannelSettings) -> ExchangeDefinition {
    ExchangeDefinition::new(&settings.exchange_name)
        .kind(settings.exchange_kind)
        .durable(settings.durable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ConnectionTarget, exchange::ExchangeKind, transport::memory::MemoryBroker,
    };
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Purchase {
        id: u32,
    }

    impl QueueMessage for Purchase {
        const MESSAGE_TYPE: &'static str = "purchase";
    }

    fn factory(broker: &MemoryBroker, skip_topology: bool) -> BrokerFactory {
        let registry = SettingsRegistry::new().with::<Purchase>(
            ChannelSettings::new("shop", ExchangeKind::Topic)
                .route_key("shop.purchase")
                .queue("purchases")
                .prefetch(3),
        );
        BrokerFactory::new(
            BrokerFactoryConfig::new(ConnectionTarget::url("memory://"), "dlx", "dlq")
                .with_skip_topology_management(skip_topology),
            Arc::new(registry),
            Arc::new(broker.clone()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn consumer_declares_dead_letter_wiring() {
        let broker = MemoryBroker::new();
        let factory = factory(&broker, false);
        let consumer = factory.create_consumer::<Purchase>().await.unwrap();

        assert!(broker.has_queue("purchases"));
        assert!(broker.has_queue("dlq"));
        assert!(broker.has_exchange("dlx"));
        assert!(broker.has_exchange("shop"));
        assert_eq!(consumer.prefetch(), 3);

        broker.publish_raw("dlx", "purchases", b"dead").unwrap();
        assert_eq!(broker.queue_payloads("dlq"), vec![b"dead".to_vec()]);
        broker.publish_raw("shop", "shop.purchase", b"live").unwrap();
        assert_eq!(broker.queue_payloads("purchases"), vec![b"live".to_vec()]);
    }

    #[tokio::test]
    async fn topology_is_declared_once() {
        let broker = MemoryBroker::new();
        let factory = factory(&broker, false);

        for _ in 0..3 {
            factory.create_consumer::<Purchase>().await.unwrap();
            factory.create_producer::<Purchase>().await.unwrap();
        }

        let stats = broker.stats();
        // dlx + shop, both from the consumer
        assert_eq!(stats.exchange_declares, 2);
        assert_eq!(stats.queue_declares, 2);
        assert_eq!(stats.queue_binds, 2);
        assert_eq!(stats.channels_opened, 6);
    }

    #[tokio::test]
    async fn message_exchange_is_declared_once_whoever_comes_first() {
        let broker = MemoryBroker::new();
        let factory = factory(&broker, false);

        factory.create_producer::<Purchase>().await.unwrap();
        factory.create_consumer::<Purchase>().await.unwrap();
        factory.create_producer::<Purchase>().await.unwrap();

        // shop from the producer, dlx from the consumer
        assert_eq!(broker.stats().exchange_declares, 2);
        broker.publish_raw("shop", "shop.purchase", b"live").unwrap();
        assert_eq!(broker.queue_payloads("purchases"), vec![b"live".to_vec()]);
    }

    #[tokio::test]
    async fn skipping_topology_declares_nothing() {
        let broker = MemoryBroker::new();
        let factory = factory(&broker, true);
        factory.create_producer::<Purchase>().await.unwrap();

        assert_eq!(broker.stats().exchange_declares, 0);
        assert!(!broker.has_exchange("shop"));
    }

    #[tokio::test]
    async fn missing_queue_fails_consumer_only() {
        #[derive(Serialize, Deserialize)]
        struct Audit;
        impl QueueMessage for Audit {
            const MESSAGE_TYPE: &'static str = "audit";
        }

        let broker = MemoryBroker::new();
        let factory = factory(&broker, false);
        factory
            .registry()
            .declare::<Audit>(ChannelSettings::new("audit", ExchangeKind::Fanout));

        assert!(factory.create_producer::<Audit>().await.is_ok());
        assert!(matches!(
            factory.create_consumer::<Audit>().await,
            Err(BrokerError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_broker_is_unavailable() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let factory = factory(&broker, false);

        assert!(matches!(
            factory.create_consumer::<Purchase>().await,
            Err(BrokerError::BrokerUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn dispose_closes_everything_once() {
        let broker = MemoryBroker::new();
        let factory = factory(&broker, false);
        let producer = factory.create_producer::<Purchase>().await.unwrap();
        let _consumer = factory.create_consumer::<Purchase>().await.unwrap();

        producer.close().await;
        factory.dispose().await;
        factory.dispose().await;

        let stats = broker.stats();
        assert_eq!(stats.channels_closed, 2);
        assert_eq!(stats.connections_closed, 1);
        assert!(matches!(
            factory.create_producer::<Purchase>().await,
            Err(BrokerError::Disposed(_))
        ));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let result = BrokerFactory::new(
            BrokerFactoryConfig::new(ConnectionTarget::url(""), "dlx", "dlq"),
            Arc::new(SettingsRegistry::new()),
            Arc::new(MemoryBroker::new()),
        );
        assert!(matches!(result, Err(BrokerError::Configuration(_))));
    }
}
