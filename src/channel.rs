// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Owned Channels
//!
//! Every producer and consumer gets its own channel over the shared
//! connection. The factory keeps a handle to each one so that disposing the
//! factory closes them all; closing is idempotent, so a producer closed by its
//! owner and again by the factory only reaches the transport once.

use crate::{errors::BrokerError, transport::TransportChannel};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{debug, warn};

pub struct OwnedChannel {
    inner: Arc<dyn TransportChannel>,
    label: String,
    closed: AtomicBool,
}

impl OwnedChannel {
    pub fn new(inner: Arc<dyn TransportChannel>, label: &str) -> Self {
        Self {
            inner,
            label: label.to_owned(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn transport(&self) -> &dyn TransportChannel {
        self.inner.as_ref()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Disposed(self.label.clone()));
        }
        Ok(())
    }

    /// Closes the channel once; failures are logged, not returned.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        match self.inner.close().await {
            Ok(()) => debug!(channel = self.label, "channel closed"),
            Err(err) => warn!(error = %err, channel = self.label, "failure to close the channel"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransportChannel;

    #[tokio::test]
    async fn closes_once() {
        let mut inner = MockTransportChannel::new();
        inner.expect_close().times(1).returning(|| Ok(()));

        let channel = OwnedChannel::new(Arc::new(inner), "producer:purchase");
        assert!(channel.ensure_open().is_ok());

        channel.close().await;
        channel.close().await;

        assert!(channel.is_closed());
        assert_eq!(
            channel.ensure_open(),
            Err(BrokerError::Disposed("producer:purchase".into()))
        );
    }

    #[tokio::test]
    async fn close_failure_is_swallowed() {
        let mut inner = MockTransportChannel::new();
        inner
            .expect_close()
            .times(1)
            .returning(|| Err(BrokerError::BrokerUnavailable("gone".into())));

        let channel = OwnedChannel::new(Arc::new(inner), "consumer:purchase");
        channel.close().await;
        assert!(channel.is_closed());
    }
}
