// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! Business logic plugs into the consumption pipeline through
//! [`MessageHandler`]. Handlers are registered per message type in a
//! [`HandlerRegistry`], either as a factory building a fresh instance for
//! every message (for handlers carrying per-message state) or as one shared
//! instance.

use crate::{errors::BrokerError, settings::QueueMessage};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::{any::Any, collections::HashMap, fmt::Display, sync::Arc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// How a handler invocation ended, when it did not succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The shutdown signal was observed before the work completed.
    #[error("handling was cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(err: impl Display) -> Self {
        HandlerError::Failed(err.to_string())
    }
}

impl From<HandlerError> for BrokerError {
    fn from(err: HandlerError) -> Self {
        match err {
            HandlerError::Cancelled => BrokerError::ShutdownSignal,
            HandlerError::Failed(reason) => BrokerError::HandlerFailure(reason),
        }
    }
}

/// Processes decoded messages of type `T`.
///
/// `cancel` fires when the pipeline shuts down; a handler that observes it
/// should stop and return [`HandlerError::Cancelled`] so the message is
/// requeued.
#[async_trait]
pub trait MessageHandler<T>: Send + Sync {
    async fn handle(&self, message: &T, cancel: CancellationToken) -> Result<(), HandlerError>;
}

type HandlerFactory<T> = Arc<dyn Fn() -> Arc<dyn MessageHandler<T>> + Send + Sync>;

/// Resolves the handler of a message type.
#[derive(Default)]
pub struct HandlerRegistry {
    factories: RwLock<HashMap<&'static str, Box<dyn Any + Send + Sync>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory invoked once per message of type `T`.
    pub fn register<T, H, F>(&self, factory: F)
    where
        T: QueueMessage,
        H: MessageHandler<T> + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let factory: HandlerFactory<T> =
            Arc::new(move || Arc::new(factory()) as Arc<dyn MessageHandler<T>>);
        self.factories
            .write()
            .insert(T::MESSAGE_TYPE, Box::new(factory));
    }

    /// Registers one instance serving every message of type `T`.
    pub fn register_shared<T, H>(&self, handler: H)
    where
        T: QueueMessage,
        H: MessageHandler<T> + 'static,
    {
        let shared: Arc<dyn MessageHandler<T>> = Arc::new(handler);
        let factory: HandlerFactory<T> = Arc::new(move || shared.clone());
        self.factories
            .write()
            .insert(T::MESSAGE_TYPE, Box::new(factory));
    }

    /// Builder form of [`HandlerRegistry::register`].
    pub fn with<T, H, F>(self, factory: F) -> Self
    where
        T: QueueMessage,
        H: MessageHandler<T> + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.register::<T, H, F>(factory);
        self
    }

    pub fn resolve<T: QueueMessage>(&self) -> Result<Arc<dyn MessageHandler<T>>, BrokerError> {
        let factory = self
            .factories
            .read()
            .get(T::MESSAGE_TYPE)
            .and_then(|factory| factory.downcast_ref::<HandlerFactory<T>>())
            .cloned()
            .ok_or_else(|| BrokerError::HandlerNotFound(T::MESSAGE_TYPE.to_owned()))?;

        Ok(factory())
    }

    pub fn contains(&self, message_type: &str) -> bool {
        self.factories.read().contains_key(message_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Serialize, Deserialize)]
    struct Purchase;

    impl QueueMessage for Purchase {
        const MESSAGE_TYPE: &'static str = "purchase";
    }

    #[derive(Serialize, Deserialize)]
    struct Refund;

    impl QueueMessage for Refund {
        const MESSAGE_TYPE: &'static str = "refund";
    }

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl MessageHandler<Purchase> for Counting {
        async fn handle(&self, _: &Purchase, _: CancellationToken) -> Result<(), HandlerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn factory_builds_fresh_instances() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = built.clone();
        let registry = HandlerRegistry::new().with::<Purchase, _, _>(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Counting(Arc::new(AtomicUsize::new(0)))
        });

        let first = registry.resolve::<Purchase>().unwrap();
        let second = registry.resolve::<Purchase>().unwrap();

        assert_eq!(built.load(Ordering::SeqCst), 2);
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn shared_instance_is_reused() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = HandlerRegistry::new();
        registry.register_shared::<Purchase, _>(Counting(calls.clone()));

        for _ in 0..3 {
            let handler = registry.resolve::<Purchase>().unwrap();
            handler
                .handle(&Purchase, CancellationToken::new())
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn missing_handler_is_reported() {
        let registry = HandlerRegistry::new();
        registry.register_shared::<Purchase, _>(Counting(Arc::default()));

        assert!(registry.contains("purchase"));
        assert_eq!(
            registry.resolve::<Refund>().err(),
            Some(BrokerError::HandlerNotFound("refund".into()))
        );
    }

    #[test]
    fn handler_errors_map_to_taxonomy() {
        assert_eq!(
            BrokerError::from(HandlerError::Cancelled),
            BrokerError::ShutdownSignal
        );
        assert_eq!(
            BrokerError::from(HandlerError::failed("boom")),
            BrokerError::HandlerFailure("boom".into())
        );
    }
}
