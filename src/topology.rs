// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! A [`Topology`] is an ordered list of declarations (exchanges, queues and
//! the bindings between them) installed on a channel in the order they were
//! added. Dead-letter wiring is expressed as ordinary steps: the dead-letter
//! queue, its exchange and their binding come before the queue that points at
//! them.
//!
//! [`TopologyLocks`] makes installation idempotent per name within one
//! factory: the first caller for a name installs while concurrent callers
//! wait, and later callers skip the work entirely.

use crate::{
    errors::BrokerError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::TransportChannel,
};
use parking_lot::Mutex;
use std::{collections::HashMap, future::Future, sync::Arc};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyStep {
    Exchange(ExchangeDefinition),
    Queue(QueueDefinition),
    Binding(QueueBinding),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    steps: Vec<TopologyStep>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.steps.push(TopologyStep::Exchange(def));
        self
    }

    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.steps.push(TopologyStep::Queue(def));
        self
    }

    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.steps.push(TopologyStep::Binding(binding));
        self
    }

    pub fn steps(&self) -> &[TopologyStep] {
        &self.steps
    }

    /// Declares every step on `channel`, stopping at the first failure.
    pub async fn install(&self, channel: &dyn TransportChannel) -> Result<(), BrokerError> {
        for step in &self.steps {
            match step {
                TopologyStep::Exchange(def) => {
                    channel.declare_exchange(def).await?;
                    debug!("exchange: {} was created", def.name);
                }
                TopologyStep::Queue(def) => {
                    channel.declare_queue(def).await?;
                    debug!("queue: {} was created", def.name);
                }
                TopologyStep::Binding(binding) => {
                    channel.bind_queue(binding).await?;
                    debug!(
                        "queue: {} was bound to the exchange: {}",
                        binding.queue_name, binding.exchange_name
                    );
                }
            }
        }

        Ok(())
    }
}

/// Per-name locks guarding topology installation.
#[derive(Debug, Default)]
pub struct TopologyLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<bool>>>>,
}

impl TopologyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `install` once for `name`.
    ///
    /// Callers for the same name are serialized; callers for different names
    /// run concurrently. A failed install leaves the name uninstalled so the
    /// next caller retries.
    pub async fn ensure<F, Fut>(&self, name: &str, install: F) -> Result<(), BrokerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), BrokerError>>,
    {
        let lock = self.lock_for(name);
        let mut installed = lock.lock().await;
        if *installed {
            debug!(name, "topology already installed");
            return Ok(());
        }

        install().await?;
        *installed = true;
        Ok(())
    }

    /// Records `name` as installed by a topology that also covered it.
    pub async fn mark_installed(&self, name: &str) {
        *self.lock_for(name).lock().await = true;
    }

    pub fn is_installed(&self, name: &str) -> bool {
        self.locks
            .lock()
            .get(name)
            .and_then(|lock| lock.try_lock().ok().map(|installed| *installed))
            .unwrap_or(false)
    }

    fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<bool>> {
        self.locks
            .lock()
            .entry(name.to_owned())
            .or_default()
            .clone()
    }
}
