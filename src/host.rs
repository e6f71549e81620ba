// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Pipeline Host
//!
//! Supervises the pipelines of a process. A pipeline that fails to start is
//! logged and reported while the others keep running; stopping the host
//! cancels the shared shutdown signal and stops every pipeline concurrently.

use crate::{
    codec::Codec, errors::BrokerError, pipeline::ConsumptionPipeline, settings::QueueMessage,
};
use async_trait::async_trait;
use futures_util::future::join_all;
use std::{future::Future, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Lifecycle hooks of a pipeline, as seen by its host.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HostedPipeline: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> Result<(), BrokerError>;

    async fn stop(&self, timeout: Option<Duration>);

    fn is_running(&self) -> bool;
}

#[async_trait]
impl<T: QueueMessage, C: Codec> HostedPipeline for ConsumptionPipeline<T, C> {
    fn name(&self) -> &str {
        ConsumptionPipeline::name(self)
    }

    async fn start(&self) -> Result<(), BrokerError> {
        ConsumptionPipeline::start(self).await
    }

    async fn stop(&self, timeout: Option<Duration>) {
        ConsumptionPipeline::stop(self, timeout).await
    }

    fn is_running(&self) -> bool {
        ConsumptionPipeline::is_running(self)
    }
}

pub struct PipelineHost {
    pipelines: Vec<Arc<dyn HostedPipeline>>,
    shutdown: CancellationToken,
    shutdown_timeout: Option<Duration>,
}

impl PipelineHost {
    pub fn new(shutdown_timeout: Option<Duration>) -> Self {
        Self {
            pipelines: Vec::new(),
            shutdown: CancellationToken::new(),
            shutdown_timeout,
        }
    }

    /// A child of the host shutdown signal, to hand to a pipeline.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    pub fn add(&mut self, pipeline: Arc<dyn HostedPipeline>) -> &mut Self {
        self.pipelines.push(pipeline);
        self
    }

    /// Starts every pipeline and returns the ones that failed with their error.
    pub async fn start_all(&self) -> Vec<(String, BrokerError)> {
        let results = join_all(self.pipelines.iter().map(|pipeline| pipeline.start())).await;

        let failures: Vec<_> = self
            .pipelines
            .iter()
            .zip(results)
            .filter_map(|(pipeline, result)| {
                result.err().map(|err| {
                    error!(error = %err, pipeline = pipeline.name(), "pipeline failed to start");
                    (pipeline.name().to_owned(), err)
                })
            })
            .collect();

        info!(
            started = self.pipelines.len() - failures.len(),
            failed = failures.len(),
            "pipelines started"
        );
        failures
    }

    /// Signals shutdown and stops every pipeline concurrently.
    pub async fn stop_all(&self) {
        self.shutdown.cancel();
        join_all(
            self.pipelines
                .iter()
                .map(|pipeline| pipeline.stop(self.shutdown_timeout)),
        )
        .await;
        info!("pipelines stopped");
    }

    /// Starts every pipeline, waits for `signal`, then stops them all.
    pub async fn run_until<F: Future<Output = ()>>(&self, signal: F) -> Vec<(String, BrokerError)> {
        let failures = self.start_all().await;
        signal.await;
        self.stop_all().await;
        failures
    }

    pub fn running(&self) -> usize {
        self.pipelines.iter().filter(|p| p.is_running()).count()
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}
