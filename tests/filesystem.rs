// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod common;

use broker::{
    transport::filesystem::FileSystemBroker, BrokerFactory, ConsumptionPipeline, HandlerError,
    HandlerRegistry, PipelineConfig,
};
use common::{config, handler, purchase, registry, wait_until, Purchase, DEAD_LETTER_QUEUE, PURCHASE_QUEUE};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;

fn file_factory(broker: &FileSystemBroker) -> Arc<BrokerFactory> {
    Arc::new(
        BrokerFactory::new(config(), Arc::new(registry(5)), Arc::new(broker.clone())).unwrap(),
    )
}

fn file_broker(dir: &tempfile::TempDir) -> FileSystemBroker {
    FileSystemBroker::new(dir.path()).with_rescan_interval(Duration::from_millis(20))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pipeline_consumes_from_directories() {
    let dir = tempfile::tempdir().unwrap();
    let broker = file_broker(&dir);
    let factory = file_factory(&broker);

    let handlers = HandlerRegistry::new();
    handlers.register_shared::<Purchase, _>(handler(|msg: Purchase, _: CancellationToken| async move {
        if msg.id == "bad" {
            return Err(HandlerError::failed("refused"));
        }
        Ok(())
    }));
    let pipeline = ConsumptionPipeline::<Purchase>::new(
        factory.clone(),
        Arc::new(handlers),
        PipelineConfig::new().with_parallelism(2),
    );
    pipeline.start().await.unwrap();

    let producer = factory.create_producer::<Purchase>().await.unwrap();
    for id in ["a", "bad", "b"] {
        producer.publish(&purchase(id)).await.unwrap();
    }

    wait_until("all messages completed", || pipeline.stats().completed == 3).await;
    pipeline.stop(Some(Duration::from_secs(1))).await;

    let stats = pipeline.stats();
    assert_eq!(stats.acknowledged, 2);
    assert_eq!(stats.dead_lettered, 1);
    assert!(broker.pending(PURCHASE_QUEUE).await.unwrap().is_empty());

    let dead = broker.pending_payloads(DEAD_LETTER_QUEUE).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].contains("bad"));
    factory.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn messages_outlive_the_factory_that_published_them() {
    let dir = tempfile::tempdir().unwrap();
    let broker = file_broker(&dir);

    let first = file_factory(&broker);
    first.create_consumer::<Purchase>().await.unwrap().close().await;
    let producer = first.create_producer::<Purchase>().await.unwrap();
    for id in 0..3 {
        producer.publish(&purchase(id)).await.unwrap();
    }
    first.dispose().await;
    assert_eq!(broker.pending(PURCHASE_QUEUE).await.unwrap().len(), 3);

    // A new broker handle over the same directory, as after a restart.
    let restarted = file_broker(&dir);
    let handled = Arc::new(AtomicUsize::new(0));
    let counter = handled.clone();
    let handlers = HandlerRegistry::new();
    handlers.register_shared::<Purchase, _>(handler(move |_: Purchase, _: CancellationToken| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }));
    let pipeline = ConsumptionPipeline::<Purchase>::new(
        file_factory(&restarted),
        Arc::new(handlers),
        PipelineConfig::new(),
    );
    pipeline.start().await.unwrap();

    wait_until("left-over messages handled", || handled.load(Ordering::SeqCst) == 3).await;
    pipeline.stop(None).await;
    assert!(restarted.pending(PURCHASE_QUEUE).await.unwrap().is_empty());
}
