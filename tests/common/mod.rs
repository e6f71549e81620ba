// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

#![allow(dead_code)]

use async_trait::async_trait;
use broker::{
    transport::memory::MemoryBroker, BrokerFactory, BrokerFactoryConfig, ChannelSettings,
    ConnectionTarget, ExchangeKind, HandlerError, MessageHandler, QueueMessage, SettingsRegistry,
};
use serde::{Deserialize, Serialize};
use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;

pub const PURCHASE_QUEUE: &str = "purchases";
pub const LOGIN_QUEUE: &str = "logins";
pub const DEAD_LETTER_QUEUE: &str = "dead-letters";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Purchase {
    pub id: String,
}

impl QueueMessage for Purchase {
    const MESSAGE_TYPE: &'static str = "purchase";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Login {
    pub user: String,
}

impl QueueMessage for Login {
    const MESSAGE_TYPE: &'static str = "login";
}

pub fn purchase(id: impl ToString) -> Purchase {
    Purchase { id: id.to_string() }
}

pub fn registry(purchase_prefetch: u16) -> SettingsRegistry {
    SettingsRegistry::new()
        .with::<Purchase>(
            ChannelSettings::new("shop", ExchangeKind::Topic)
                .route_key("shop.purchase")
                .queue(PURCHASE_QUEUE)
                .prefetch(purchase_prefetch),
        )
        .with::<Login>(ChannelSettings::new("auth", ExchangeKind::Fanout).queue(LOGIN_QUEUE))
}

pub fn config() -> BrokerFactoryConfig {
    BrokerFactoryConfig::new(
        ConnectionTarget::url("memory://"),
        "dead-letter-exchange",
        DEAD_LETTER_QUEUE,
    )
}

pub fn factory(broker: &MemoryBroker, purchase_prefetch: u16) -> Arc<BrokerFactory> {
    factory_with(broker, config(), purchase_prefetch)
}

pub fn factory_with(
    broker: &MemoryBroker,
    config: BrokerFactoryConfig,
    purchase_prefetch: u16,
) -> Arc<BrokerFactory> {
    Arc::new(
        BrokerFactory::new(
            config,
            Arc::new(registry(purchase_prefetch)),
            Arc::new(broker.clone()),
        )
        .unwrap(),
    )
}

/// Adapts an async closure over an owned message into a handler.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<T, F, Fut> MessageHandler<T> for FnHandler<F>
where
    T: QueueMessage + Clone,
    F: Fn(T, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, message: &T, cancel: CancellationToken) -> Result<(), HandlerError> {
        (self.0)(message.clone(), cancel).await
    }
}

pub fn handler<T, F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(T, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler(f)
}

/// Polls `condition` until it holds, panicking after five seconds.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
