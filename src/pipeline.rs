// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumption Pipeline
//!
//! Pulls envelopes of one message type from a consumer and dispatches them to
//! their handler on a bounded pool of tasks.
//!
//! - A semaphore with `parallelism` permits bounds concurrent handler
//!   invocations. The reader takes a permit before it asks the subscription
//!   for the next envelope, so a saturated pool stops reading and the
//!   transport prefetch window provides backpressure.
//! - One cancellation token is handed to every invocation. Stopping the
//!   pipeline cancels it, stops reading, and waits for in-flight work, bounded
//!   by the shutdown timeout, before the consumer is closed.
//! - When the subscription ends underneath a running pipeline (lost
//!   connection, closed channel) the reader closes the dead consumer and
//!   subscribes again through the factory, paced by the recovery interval.
//!   With recovery disabled it stops reading, and the next [`start`] builds a
//!   fresh subscription.
//! - A failed start leaves the pipeline idle and is reported to the caller;
//!   other pipelines are not affected.
//!
//! [`start`]: ConsumptionPipeline::start

use crate::{
    codec::{Codec, JsonCodec},
    config::PipelineConfig,
    consumer::{Consumer, EnvelopeStream},
    errors::BrokerError,
    factory::BrokerFactory,
    handler::HandlerRegistry,
    settings::QueueMessage,
    worker::{self, PipelineStats, StatsSnapshot},
};
use futures_util::StreamExt;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{Mutex, Semaphore},
    task::JoinHandle,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

/// The consumer currently read by a run; replaced when the reader resubscribes.
type ConsumerSlot<T> = Arc<parking_lot::Mutex<Arc<Consumer<T>>>>;

enum PipelineState<T> {
    Idle,
    Running(ActiveRun<T>),
    Stopped,
}

struct ActiveRun<T> {
    consumer: ConsumerSlot<T>,
    stop: CancellationToken,
    reader: JoinHandle<()>,
    tracker: TaskTracker,
}

/// Consumes one message type and dispatches every envelope to the handler
/// registered for it.
///
/// The pipeline moves from idle to running on [`start`](Self::start) and to
/// stopped on [`stop`](Self::stop); a stopped pipeline is never restarted.
pub struct ConsumptionPipeline<T, C: Codec = JsonCodec> {
    name: String,
    factory: Arc<BrokerFactory<C>>,
    handlers: Arc<HandlerRegistry>,
    config: PipelineConfig,
    shutdown: CancellationToken,
    state: Mutex<PipelineState<T>>,
    running: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
}

impl<T: QueueMessage, C: Codec> ConsumptionPipeline<T, C> {
    pub fn new(
        factory: Arc<BrokerFactory<C>>,
        handlers: Arc<HandlerRegistry>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            name: format!("pipeline:{}", T::MESSAGE_TYPE),
            factory,
            handlers,
            config,
            shutdown: CancellationToken::new(),
            state: Mutex::new(PipelineState::Idle),
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(PipelineStats::default()),
        }
    }

    /// Ties the pipeline to an outer shutdown signal, e.g. the one of a
    /// [`PipelineHost`](crate::host::PipelineHost).
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// `pipeline:<message type>`, used in logs and errors.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creates the consumer, subscribes and starts dispatching.
    ///
    /// Starting a pipeline that is reading deliveries does nothing. A running
    /// pipeline whose subscription was lost is torn down and subscribed
    /// again. A stopped pipeline cannot be started again.
    pub async fn start(&self) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        match *state {
            PipelineState::Running(_) if self.is_running() => return Ok(()),
            PipelineState::Running(_) => {
                if let PipelineState::Running(run) =
                    std::mem::replace(&mut *state, PipelineState::Idle)
                {
                    warn!(pipeline = self.name, "pipeline lost its subscription, restarting");
                    self.teardown(run, self.config.shutdown_timeout).await;
                }
            }
            PipelineState::Stopped => return Err(BrokerError::Disposed(self.name.clone())),
            PipelineState::Idle => {}
        }
        if self.shutdown.is_cancelled() {
            return Err(BrokerError::ShutdownSignal);
        }

        let (consumer, stream) = match subscribe::<T, C>(&self.factory).await {
            Ok(subscription) => subscription,
            Err(err) => {
                error!(error = %err, pipeline = self.name, "failure to subscribe, pipeline stays idle");
                return Err(err);
            }
        };

        let queue = consumer.queue().to_owned();
        let consumer = Arc::new(parking_lot::Mutex::new(consumer));
        let stop = self.shutdown.child_token();
        let tracker = TaskTracker::new();
        self.running.store(true, Ordering::Release);

        let reader = tokio::spawn(read_loop(
            stream,
            ReaderContext {
                factory: self.factory.clone(),
                consumer: consumer.clone(),
                handlers: self.handlers.clone(),
                stop: stop.clone(),
                tracker: tracker.clone(),
                permits: Arc::new(Semaphore::new(self.config.parallelism.max(1))),
                stats: self.stats.clone(),
                running: self.running.clone(),
            },
        ));

        info!(
            pipeline = self.name,
            queue,
            parallelism = self.config.parallelism,
            "pipeline started"
        );

        *state = PipelineState::Running(ActiveRun {
            consumer,
            stop,
            reader,
            tracker,
        });
        Ok(())
    }

    /// Stops reading, drains in-flight handlers, then closes the consumer.
    ///
    /// Handlers are never aborted: when `timeout` elapses first, a warning is
    /// logged and the consumer is closed anyway, returning unsettled
    /// deliveries to the queue. `None` waits for every handler.
    pub async fn stop(&self, timeout: Option<Duration>) {
        let mut state = self.state.lock().await;
        let PipelineState::Running(run) = std::mem::replace(&mut *state, PipelineState::Stopped)
        else {
            return;
        };

        info!(pipeline = self.name, "stopping pipeline...");
        self.teardown(run, timeout).await;
        info!(pipeline = self.name, stats = ?self.stats.snapshot(), "pipeline stopped");
    }

    /// [`ConsumptionPipeline::stop`] with the configured shutdown timeout.
    pub async fn shutdown(&self) {
        self.stop(self.config.shutdown_timeout).await;
    }

    /// Whether the pipeline is reading deliveries.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Counters accumulated over every run of the pipeline.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    async fn teardown(&self, run: ActiveRun<T>, timeout: Option<Duration>) {
        run.stop.cancel();
        if let Err(err) = run.reader.await {
            error!(error = %err, pipeline = self.name, "reader task failed");
        }

        run.tracker.close();
        let drained = match timeout {
            Some(limit) => tokio::time::timeout(limit, run.tracker.wait())
                .await
                .is_ok(),
            None => {
                run.tracker.wait().await;
                true
            }
        };
        if !drained {
            warn!(
                pipeline = self.name,
                in_flight = run.tracker.len(),
                "shutdown timeout elapsed with handlers still running, closing the consumer"
            );
        }

        let consumer = run.consumer.lock().clone();
        consumer.close().await;
        self.running.store(false, Ordering::Release);
    }
}

async fn subscribe<T: QueueMessage, C: Codec>(
    factory: &BrokerFactory<C>,
) -> Result<(Arc<Consumer<T>>, EnvelopeStream<T>), BrokerError> {
    let consumer = Arc::new(factory.create_consumer::<T>().await?);
    match consumer.subscribe().await {
        Ok(stream) => Ok((consumer, stream)),
        Err(err) => {
            consumer.close().await;
            Err(err)
        }
    }
}

struct ReaderContext<T, C: Codec> {
    factory: Arc<BrokerFactory<C>>,
    consumer: ConsumerSlot<T>,
    handlers: Arc<HandlerRegistry>,
    stop: CancellationToken,
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
    stats: Arc<PipelineStats>,
    running: Arc<AtomicBool>,
}

async fn read_loop<T: QueueMessage, C: Codec>(
    mut stream: EnvelopeStream<T>,
    ctx: ReaderContext<T, C>,
) {
    while read_deliveries(&mut stream, &ctx).await {
        warn!(message_type = T::MESSAGE_TYPE, "subscription ended");
        ctx.running.store(false, Ordering::Release);

        let dead = ctx.consumer.lock().clone();
        dead.close().await;

        let Some((consumer, fresh)) = resubscribe(&ctx).await else {
            break;
        };
        info!(
            message_type = T::MESSAGE_TYPE,
            queue = consumer.queue(),
            "subscription restored"
        );
        *ctx.consumer.lock() = consumer;
        stream = fresh;
        ctx.running.store(true, Ordering::Release);
    }

    ctx.running.store(false, Ordering::Release);
    debug!(message_type = T::MESSAGE_TYPE, "stopped reading deliveries");
}

/// Reads until stopped (`false`) or until the subscription ends (`true`).
async fn read_deliveries<T: QueueMessage, C: Codec>(
    stream: &mut EnvelopeStream<T>,
    ctx: &ReaderContext<T, C>,
) -> bool {
    loop {
        let permit = tokio::select! {
            biased;
            _ = ctx.stop.cancelled() => return false,
            permit = ctx.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return false,
            },
        };

        let next = tokio::select! {
            biased;
            _ = ctx.stop.cancelled() => return false,
            next = stream.next() => next,
        };

        let envelope = match next {
            Some(Ok(envelope)) => envelope,
            Some(Err(err)) => {
                error!(error = %err, message_type = T::MESSAGE_TYPE, "failure receiving delivery");
                continue;
            }
            None => return !ctx.stop.is_cancelled(),
        };

        ctx.stats.record_received();
        let handlers = ctx.handlers.clone();
        let cancel = ctx.stop.clone();
        let stats = ctx.stats.clone();
        ctx.tracker.spawn(async move {
            worker::dispatch(envelope, &handlers, cancel, &stats).await;
            drop(permit);
        });
    }
}

/// Subscribes again, retrying every recovery interval until it succeeds or
/// the pipeline stops. Gives up when recovery is disabled or the factory is
/// disposed.
async fn resubscribe<T: QueueMessage, C: Codec>(
    ctx: &ReaderContext<T, C>,
) -> Option<(Arc<Consumer<T>>, EnvelopeStream<T>)> {
    loop {
        let attempt = tokio::select! {
            biased;
            _ = ctx.stop.cancelled() => return None,
            attempt = subscribe::<T, C>(&ctx.factory) => attempt,
        };

        let err = match attempt {
            Ok(subscription) => return Some(subscription),
            Err(err) => err,
        };
        let interval = match (&err, ctx.factory.config().recovery_interval()) {
            (BrokerError::Disposed(_), _) | (_, None) => {
                error!(error = %err, message_type = T::MESSAGE_TYPE, "failure to subscribe again, pipeline stops reading");
                return None;
            }
            (_, Some(interval)) => interval,
        };
        warn!(error = %err, message_type = T::MESSAGE_TYPE, retry_in = ?interval, "failure to subscribe again");

        tokio::select! {
            biased;
            _ = ctx.stop.cancelled() => return None,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{BrokerFactoryConfig, ConnectionTarget},
        exchange::ExchangeKind,
        handler::{HandlerError, MessageHandler},
        settings::{ChannelSettings, SettingsRegistry},
        transport::memory::MemoryBroker,
    };
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    impl QueueMessage for Ping {
        const MESSAGE_TYPE: &'static str = "ping";
    }

    struct Accept;

    #[async_trait]
    impl MessageHandler<Ping> for Accept {
        async fn handle(&self, _: &Ping, _: CancellationToken) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    fn pipeline(broker: &MemoryBroker) -> ConsumptionPipeline<Ping> {
        let registry = SettingsRegistry::new().with::<Ping>(
            ChannelSettings::new("pings", ExchangeKind::Fanout).queue("ping-queue"),
        );
        let factory = BrokerFactory::new(
            BrokerFactoryConfig::new(ConnectionTarget::url("memory://"), "dlx", "dlq"),
            Arc::new(registry),
            Arc::new(broker.clone()),
        )
        .unwrap();
        let handlers = HandlerRegistry::new();
        handlers.register_shared::<Ping, _>(Accept);

        ConsumptionPipeline::new(
            Arc::new(factory),
            Arc::new(handlers),
            PipelineConfig::new().with_parallelism(2),
        )
    }

    #[tokio::test]
    async fn lifecycle() {
        let broker = MemoryBroker::new();
        let pipeline = pipeline(&broker);
        assert!(!pipeline.is_running());

        pipeline.start().await.unwrap();
        pipeline.start().await.unwrap();
        assert!(pipeline.is_running());
        assert_eq!(broker.consumer_count("ping-queue"), 1);

        pipeline.stop(Some(Duration::from_secs(1))).await;
        assert!(!pipeline.is_running());
        assert_eq!(broker.consumer_count("ping-queue"), 0);
        assert!(matches!(
            pipeline.start().await,
            Err(BrokerError::Disposed(_))
        ));
    }

    #[tokio::test]
    async fn failed_start_stays_idle_and_can_retry() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let pipeline = pipeline(&broker);

        assert!(matches!(
            pipeline.start().await,
            Err(BrokerError::BrokerUnavailable(_))
        ));
        assert!(!pipeline.is_running());

        broker.set_available(true);
        pipeline.start().await.unwrap();
        assert!(pipeline.is_running());
        pipeline.stop(None).await;
    }

    #[tokio::test]
    async fn cancelled_shutdown_signal_prevents_start() {
        let broker = MemoryBroker::new();
        let token = CancellationToken::new();
        token.cancel();
        let pipeline = pipeline(&broker).with_shutdown_token(token);

        assert_eq!(pipeline.start().await, Err(BrokerError::ShutdownSignal));
    }
}
