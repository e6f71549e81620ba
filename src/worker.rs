// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Per-Message Dispatch
//!
//! Takes one envelope from `Received` to `Completed`:
//! 1. resolves the handler of the message type
//! 2. decodes the payload
//! 3. invokes the handler with the shutdown signal
//! 4. resolves exactly one outcome and settles the envelope with it
//!
//! | result                     | outcome                |
//! |----------------------------|------------------------|
//! | handler returned `Ok`      | acknowledge            |
//! | handler observed shutdown  | reject, requeue        |
//! | no handler registered      | reject, dead-letter    |
//! | malformed payload          | reject, dead-letter    |
//! | handler failed or panicked | reject, dead-letter    |
//!
//! Failures of the settle call itself are logged and swallowed.

use crate::{
    envelope::MessageEnvelope, errors::BrokerError, handler::HandlerRegistry, otel,
    settings::QueueMessage,
};
use futures_util::FutureExt;
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{
    any::Any,
    borrow::Cow,
    panic::AssertUnwindSafe,
    sync::atomic::{AtomicUsize, Ordering},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// The terminal action resolved for one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acknowledged,
    RejectedRequeue,
    RejectedDeadLetter,
}

impl Outcome {
    pub fn resolve(result: &Result<(), BrokerError>) -> Self {
        match result {
            Ok(()) => Outcome::Acknowledged,
            Err(BrokerError::ShutdownSignal) => Outcome::RejectedRequeue,
            Err(_) => Outcome::RejectedDeadLetter,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Acknowledged => "acknowledged",
            Outcome::RejectedRequeue => "rejected-requeue",
            Outcome::RejectedDeadLetter => "rejected-dead-letter",
        }
    }
}

/// Counters of one pipeline.
#[derive(Debug, Default)]
pub struct PipelineStats {
    received: AtomicUsize,
    dispatched: AtomicUsize,
    acknowledged: AtomicUsize,
    requeued: AtomicUsize,
    dead_lettered: AtomicUsize,
    settle_failures: AtomicUsize,
    completed: AtomicUsize,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: usize,
    pub dispatched: usize,
    pub acknowledged: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
    /// Settle calls that failed at the transport; the outcome was still resolved.
    pub settle_failures: usize,
    pub completed: usize,
    pub in_flight: usize,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let dispatched = self.dispatched.load(Ordering::Acquire);
        let completed = self.completed.load(Ordering::Acquire);

        StatsSnapshot {
            received: self.received.load(Ordering::Acquire),
            dispatched,
            acknowledged: self.acknowledged.load(Ordering::Acquire),
            requeued: self.requeued.load(Ordering::Acquire),
            dead_lettered: self.dead_lettered.load(Ordering::Acquire),
            settle_failures: self.settle_failures.load(Ordering::Acquire),
            completed,
            in_flight: dispatched.saturating_sub(completed),
        }
    }

    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::AcqRel);
    }

    fn record_outcome(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Acknowledged => &self.acknowledged,
            Outcome::RejectedRequeue => &self.requeued,
            Outcome::RejectedDeadLetter => &self.dead_lettered,
        };
        counter.fetch_add(1, Ordering::AcqRel);
    }
}

/// Runs one envelope to completion and returns the outcome it was settled with.
pub async fn dispatch<T: QueueMessage>(
    envelope: MessageEnvelope<T>,
    handlers: &HandlerRegistry,
    cancel: CancellationToken,
    stats: &PipelineStats,
) -> Outcome {
    stats.dispatched.fetch_add(1, Ordering::AcqRel);

    let tracer = global::tracer("broker consumer");
    let (_ctx, mut span) = otel::new_span(envelope.headers(), &tracer, T::MESSAGE_TYPE);

    debug!(
        message_type = T::MESSAGE_TYPE,
        delivery_tag = envelope.delivery_tag(),
        redelivered = envelope.redelivered(),
        "received"
    );

    let result = process(&envelope, handlers, cancel).await;
    let outcome = Outcome::resolve(&result);

    match &result {
        Ok(()) => {
            debug!(delivery_tag = envelope.delivery_tag(), "message successfully processed");
            span.set_status(Status::Ok);
        }
        Err(BrokerError::ShutdownSignal) => {
            warn!(
                message_type = T::MESSAGE_TYPE,
                delivery_tag = envelope.delivery_tag(),
                "shutdown observed while handling, requeuing"
            );
        }
        Err(err) => {
            error!(
                error = %err,
                message_type = T::MESSAGE_TYPE,
                delivery_tag = envelope.delivery_tag(),
                payload = %envelope.payload_preview(),
                "removing message from queue, sending to dead-letter"
            );
            span.record_error(err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });
        }
    }

    let settled = match outcome {
        Outcome::Acknowledged => envelope.acknowledge().await,
        Outcome::RejectedRequeue => envelope.reject(true).await,
        Outcome::RejectedDeadLetter => envelope.reject(false).await,
    };

    // The outcome counts even when the transport call failed.
    stats.record_outcome(outcome);
    if let Err(err) = settled {
        stats.settle_failures.fetch_add(1, Ordering::AcqRel);
        error!(
            error = %err,
            outcome = outcome.as_str(),
            delivery_tag = envelope.delivery_tag(),
            payload = %envelope.payload_preview(),
            "failure to settle message"
        );
        span.record_error(&err);
    }

    span.end();
    stats.completed.fetch_add(1, Ordering::AcqRel);
    outcome
}

async fn process<T: QueueMessage>(
    envelope: &MessageEnvelope<T>,
    handlers: &HandlerRegistry,
    cancel: CancellationToken,
) -> Result<(), BrokerError> {
    let handler = handlers.resolve::<T>()?;
    let message = envelope.decode()?;

    match AssertUnwindSafe(handler.handle(message, cancel))
        .catch_unwind()
        .await
    {
        Ok(result) => result.map_err(BrokerError::from),
        Err(panic) => Err(BrokerError::HandlerFailure(format!(
            "handler panicked: {}",
            panic_message(panic.as_ref())
        ))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::{Codec, JsonCodec},
        handler::{HandlerError, MessageHandler},
        transport::{MockDeliveryAcker, RawDelivery},
    };
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::{collections::BTreeMap, sync::Arc};

    #[derive(Serialize, Deserialize)]
    struct Purchase {
        id: String,
    }

    impl QueueMessage for Purchase {
        const MESSAGE_TYPE: &'static str = "purchase";
    }

    enum Behaviour {
        Succeed,
        Fail,
        Cancel,
        Panic,
    }

    struct Scripted(Behaviour);

    #[async_trait]
    impl MessageHandler<Purchase> for Scripted {
        async fn handle(&self, msg: &Purchase, _: CancellationToken) -> Result<(), HandlerError> {
            assert_eq!(msg.id, "abc");
            match self.0 {
                Behaviour::Succeed => Ok(()),
                Behaviour::Fail => Err(HandlerError::failed("boom")),
                Behaviour::Cancel => Err(HandlerError::Cancelled),
                Behaviour::Panic => panic!("handler exploded"),
            }
        }
    }

    fn envelope(payload: &[u8], acker: MockDeliveryAcker) -> MessageEnvelope<Purchase> {
        MessageEnvelope::new(
            RawDelivery {
                delivery_tag: 1,
                exchange: "shop".into(),
                routing_key: "purchase".into(),
                redelivered: false,
                message_type: Some("purchase".into()),
                message_id: None,
                headers: BTreeMap::new(),
                payload: payload.to_vec(),
                acker: Arc::new(acker),
            },
            Arc::new(|bytes: &[u8]| JsonCodec.decode(bytes)),
        )
    }

    fn expect_ack() -> MockDeliveryAcker {
        let mut acker = MockDeliveryAcker::new();
        acker.expect_ack().times(1).returning(|| Ok(()));
        acker.expect_reject().never();
        acker
    }

    fn expect_reject(requeue: bool) -> MockDeliveryAcker {
        let mut acker = MockDeliveryAcker::new();
        acker.expect_ack().never();
        acker
            .expect_reject()
            .withf(move |r| *r == requeue)
            .times(1)
            .returning(|_| Ok(()));
        acker
    }

    async fn run(behaviour: Behaviour, acker: MockDeliveryAcker) -> (Outcome, StatsSnapshot) {
        let handlers = HandlerRegistry::new();
        handlers.register_shared::<Purchase, _>(Scripted(behaviour));
        let stats = PipelineStats::default();
        let outcome = dispatch(
            envelope(br#"{"id":"abc"}"#, acker),
            &handlers,
            CancellationToken::new(),
            &stats,
        )
        .await;
        (outcome, stats.snapshot())
    }

    #[tokio::test]
    async fn success_acknowledges() {
        let (outcome, stats) = run(Behaviour::Succeed, expect_ack()).await;
        assert_eq!(outcome, Outcome::Acknowledged);
        assert_eq!(stats.acknowledged, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn failure_dead_letters() {
        let (outcome, stats) = run(Behaviour::Fail, expect_reject(false)).await;
        assert_eq!(outcome, Outcome::RejectedDeadLetter);
        assert_eq!(stats.dead_lettered, 1);
    }

    #[tokio::test]
    async fn cancellation_requeues() {
        let (outcome, stats) = run(Behaviour::Cancel, expect_reject(true)).await;
        assert_eq!(outcome, Outcome::RejectedRequeue);
        assert_eq!(stats.requeued, 1);
    }

    #[tokio::test]
    async fn panic_dead_letters() {
        let (outcome, _) = run(Behaviour::Panic, expect_reject(false)).await;
        assert_eq!(outcome, Outcome::RejectedDeadLetter);
    }

    #[tokio::test]
    async fn missing_handler_dead_letters() {
        let stats = PipelineStats::default();
        let outcome = dispatch(
            envelope(br#"{"id":"abc"}"#, expect_reject(false)),
            &HandlerRegistry::new(),
            CancellationToken::new(),
            &stats,
        )
        .await;
        assert_eq!(outcome, Outcome::RejectedDeadLetter);
    }

    #[tokio::test]
    async fn malformed_payload_dead_letters_without_calling_handler() {
        let handlers = HandlerRegistry::new();
        handlers.register_shared::<Purchase, _>(Scripted(Behaviour::Panic));
        let stats = PipelineStats::default();

        let outcome = dispatch(
            envelope(b"{not json", expect_reject(false)),
            &handlers,
            CancellationToken::new(),
            &stats,
        )
        .await;
        assert_eq!(outcome, Outcome::RejectedDeadLetter);
    }

    #[tokio::test]
    async fn settle_failure_is_contained() {
        let mut acker = MockDeliveryAcker::new();
        acker
            .expect_ack()
            .times(1)
            .returning(|| Err(BrokerError::AckProtocol("channel closed".into())));

        let (outcome, stats) = run(Behaviour::Succeed, acker).await;
        assert_eq!(outcome, Outcome::Acknowledged);
        assert_eq!(stats.settle_failures, 1);
        assert_eq!(stats.completed, 1);
    }

    #[test]
    fn outcome_resolution() {
        assert_eq!(Outcome::resolve(&Ok(())), Outcome::Acknowledged);
        assert_eq!(
            Outcome::resolve(&Err(BrokerError::ShutdownSignal)),
            Outcome::RejectedRequeue
        );
        assert_eq!(
            Outcome::resolve(&Err(BrokerError::Decode("eof".into()))),
            Outcome::RejectedDeadLetter
        );
    }
}
