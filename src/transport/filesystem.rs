// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # File System Transport
//!
//! A broker kept in a directory tree, for development machines and tests that
//! must survive a restart without a RabbitMQ server:
//!
//! ```text
//! <root>/exchanges/<exchange>/kind.json
//! <root>/exchanges/<exchange>/bindings/<queue>.json   routing keys
//! <root>/queues/<queue>/queue.json                     dead-letter target
//! <root>/queues/<queue>/messages/<seq>-<uuid>.json     one message per file
//! <root>/queues/<queue>/sink/                          dead letters without a target
//! ```
//!
//! A message is written to a hidden temporary file and renamed into place, so
//! a consumer never reads a partial message. Subscriptions pick up files
//! through a `notify` watcher and a periodic rescan of the queue directory.
//!
//! Settlement maps to file operations: acknowledge deletes the file, a
//! requeue leaves it where it is, and a dead-letter routes it through the
//! queue's dead-letter exchange or, without one, moves it to `sink/`.
//!
//! Guarantees this transport does not give:
//! - no prefetch window: `set_prefetch` is accepted and ignored, the consumer
//!   alone bounds the unsettled deliveries
//! - no redelivered flag: every delivery reports `redelivered = false`
//! - no exclusive delivery across processes: two processes consuming the same
//!   queue may both receive a file, and the second settle fails
//! - payloads must be UTF-8
//! - routing reads the bindings on every publish; it is meant for low volume

use super::{
    memory::{topic_matches, HEADER_FIRST_DEATH_QUEUE, HEADER_FIRST_DEATH_REASON},
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
use futures_util::{stream, StreamExt};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::{fs, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_RESCAN_INTERVAL: Duration = Duration::from_secs(1);

const MESSAGE_EXTENSION: &str = "json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExchangeFile {
    kind: ExchangeKind,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct QueueFile {
    dead_letter_exchange: Option<String>,
    dead_letter_routing_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MessageFile {
    exchange: String,
    routing_key: String,
    #[serde(default)]
    message_type: Option<String>,
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    payload: String,
}

/// Broker rooted at a directory. Clones share the same root.
#[derive(Debug, Clone)]
pub struct FileSystemBroker {
    root: Arc<PathBuf>,
    rescan_interval: Duration,
}

impl FileSystemBroker {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Arc::new(root.into()),
            rescan_interval: DEFAULT_RESCAN_INTERVAL,
        }
    }

    /// How often subscriptions rescan their queue for files the watcher missed
    /// and for requeued messages.
    pub fn with_rescan_interval(mut self, interval: Duration) -> Self {
        self.rescan_interval = interval;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the pending messages of `queue`.
    pub fn messages_dir(&self, queue: &str) -> PathBuf {
        self.queue_dir(queue).join("messages")
    }

    /// Directory holding the dead letters of a queue without a dead-letter exchange.
    pub fn sink_dir(&self, queue: &str) -> PathBuf {
        self.queue_dir(queue).join("sink")
    }

    /// Pending message files of `queue`, oldest first.
    pub async fn pending(&self, queue: &str) -> Result<Vec<PathBuf>, BrokerError> {
        list_messages(&self.messages_dir(queue))
            .await
            .map_err(|err| BrokerError::BrokerUnavailable(io_message("list", queue, &err)))
    }

    /// Payloads of the pending messages of `queue`, oldest first.
    pub async fn pending_payloads(&self, queue: &str) -> Result<Vec<String>, BrokerError> {
        let mut payloads = Vec::new();
        for path in self.pending(queue).await? {
            if let Some(message) = read_json::<MessageFile>(&path)
                .await
                .map_err(|err| BrokerError::BrokerUnavailable(err.to_string()))?
            {
                payloads.push(message.payload);
            }
        }
        Ok(payloads)
    }

    fn exchange_dir(&self, exchange: &str) -> PathBuf {
        self.root.join("exchanges").join(exchange)
    }

    fn queue_dir(&self, queue: &str) -> PathBuf {
        self.root.join("queues").join(queue)
    }

    async fn queue_exists(&self, queue: &str) -> bool {
        fs::try_exists(self.messages_dir(queue))
            .await
            .unwrap_or(false)
    }

    /// Writes `message` into every queue the exchange routes `routing_key` to.
    async fn route(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &MessageFile,
    ) -> Result<usize, BrokerError> {
        let targets = if exchange.is_empty() {
            if checked_name(routing_key).is_ok() && self.queue_exists(routing_key).await {
                vec![routing_key.to_owned()]
            } else {
                vec![]
            }
        } else {
            self.bound_queues(exchange, routing_key).await?
        };

        if targets.is_empty() {
            debug!(exchange, routing_key, "message is unroutable, dropping");
            return Ok(0);
        }

        for queue in &targets {
            write_message(&self.messages_dir(queue), message)
                .await
                .map_err(|err| BrokerError::Publish(io_message("write to", queue, &err)))?;
        }
        Ok(targets.len())
    }

    async fn bound_queues(
        &self,
        exchange: &str,
        routing_key: &str,
    ) -> Result<Vec<String>, BrokerError> {
        let dir = self.exchange_dir(checked_name(exchange)?);
        let kind = read_json::<ExchangeFile>(&dir.join("kind.json"))
            .await
            .map_err(|err| BrokerError::Publish(err.to_string()))?
            .ok_or_else(|| BrokerError::Publish(format!("no exchange `{exchange}`")))?
            .kind;

        let mut targets = Vec::new();
        let mut entries = match fs::read_dir(dir.join("bindings")).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(targets),
            Err(err) => return Err(BrokerError::Publish(io_message("read", exchange, &err))),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| BrokerError::Publish(io_message("read", exchange, &err)))?
        {
            let path = entry.path();
            let Some(queue) = json_stem(&path) else {
                continue;
            };
            let keys = read_json::<Vec<String>>(&path)
                .await
                .map_err(|err| BrokerError::Publish(err.to_string()))?
                .unwrap_or_default();

            let routed = keys.iter().any(|key| match kind {
                ExchangeKind::Direct => key == routing_key,
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(key, routing_key),
            });
            if routed {
                targets.push(queue.to_owned());
            }
        }

        targets.sort();
        Ok(targets)
    }

    /// Sends a rejected message to the dead-letter target of `queue` and
    /// removes it from the queue.
    async fn dead_letter(&self, queue: &str, path: &Path) -> Result<(), BrokerError> {
        let meta = read_json::<QueueFile>(&self.queue_dir(queue).join("queue.json"))
            .await
            .map_err(|err| BrokerError::AckProtocol(err.to_string()))?
            .unwrap_or_default();

        let Some(exchange) = meta.dead_letter_exchange else {
            let sink = self.sink_dir(queue);
            let name = path
                .file_name()
                .ok_or_else(|| BrokerError::AckProtocol("message file has no name".into()))?;
            return fs::rename(path, sink.join(name))
                .await
                .map_err(|err| BrokerError::AckProtocol(io_message("move", queue, &err)));
        };

        let mut message = read_json::<MessageFile>(path)
            .await
            .map_err(|err| BrokerError::AckProtocol(err.to_string()))?
            .ok_or_else(|| BrokerError::AckProtocol(format!("message in `{queue}` is gone")))?;
        message
            .headers
            .entry(HEADER_FIRST_DEATH_QUEUE.to_owned())
            .or_insert_with(|| queue.to_owned());
        message
            .headers
            .entry(HEADER_FIRST_DEATH_REASON.to_owned())
            .or_insert_with(|| "rejected".to_owned());

        let routing_key = meta
            .dead_letter_routing_key
            .unwrap_or_else(|| message.routing_key.clone());
        if let Err(err) = self.route(&exchange, &routing_key, &message).await {
            debug!(error = %err, queue, "dead-letter routing failed");
        }

        fs::remove_file(path)
            .await
            .map_err(|err| BrokerError::AckProtocol(io_message("remove", queue, &err)))
    }
}

#[async_trait]
impl Transport for FileSystemBroker {
    async fn connect(
        &self,
        config: &BrokerFactoryConfig,
    ) -> Result<Arc<dyn TransportConnection>, BrokerError> {
        for dir in ["exchanges", "queues"] {
            fs::create_dir_all(self.root.join(dir)).await.map_err(|err| {
                BrokerError::BrokerUnavailable(format!(
                    "failure to prepare `{}`: {err}",
                    self.root.display()
                ))
            })?;
        }

        debug!(root = %self.root.display(), "file system broker opened");
        Ok(Arc::new(FileSystemConnection {
            broker: self.clone(),
            confirms: config.publisher_confirms,
            closed: CancellationToken::new(),
        }))
    }
}

struct FileSystemConnection {
    broker: FileSystemBroker,
    confirms: bool,
    closed: CancellationToken,
}

#[async_trait]
impl TransportConnection for FileSystemConnection {
    async fn open_channel(&self) -> Result<Arc<dyn TransportChannel>, BrokerError> {
        if self.closed.is_cancelled() {
            return Err(BrokerError::BrokerUnavailable("connection is closed".into()));
        }

        Ok(Arc::new(FileSystemChannel {
            broker: self.broker.clone(),
            confirms: self.confirms,
            closed: self.closed.child_token(),
            subscriptions: Mutex::new(HashMap::new()),
        }))
    }

    fn is_connected(&self) -> bool {
        !self.closed.is_cancelled()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.cancel();
        Ok(())
    }
}

struct FileSystemChannel {
    broker: FileSystemBroker,
    confirms: bool,
    closed: CancellationToken,
    subscriptions: Mutex<HashMap<String, CancellationToken>>,
}

impl FileSystemChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.is_cancelled() {
            return Err(BrokerError::BrokerUnavailable("channel is closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl TransportChannel for FileSystemChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let name = checked_name(&def.name)?;
        let dir = self.broker.exchange_dir(name);
        let kind_file = dir.join("kind.json");
        let unavailable =
            |err: io::Error| BrokerError::BrokerUnavailable(io_message("declare", name, &err));

        match read_json::<ExchangeFile>(&kind_file)
            .await
            .map_err(|err| BrokerError::BrokerUnavailable(err.to_string()))?
        {
            Some(existing) if existing.kind != def.kind => Err(BrokerError::BrokerUnavailable(
                format!("exchange `{name}` exists as {}", existing.kind),
            )),
            Some(_) => Ok(()),
            None => {
                fs::create_dir_all(dir.join("bindings"))
                    .await
                    .map_err(unavailable)?;
                write_json(&kind_file, &ExchangeFile { kind: def.kind })
                    .await
                    .map_err(unavailable)
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let name = checked_name(&def.name)?;
        let unavailable =
            |err: io::Error| BrokerError::BrokerUnavailable(io_message("declare", name, &err));

        fs::create_dir_all(self.broker.messages_dir(name))
            .await
            .map_err(unavailable)?;
        fs::create_dir_all(self.broker.sink_dir(name))
            .await
            .map_err(unavailable)?;

        let meta_file = self.broker.queue_dir(name).join("queue.json");
        if fs::try_exists(&meta_file).await.map_err(unavailable)? {
            return Ok(());
        }
        write_json(
            &meta_file,
            &QueueFile {
                dead_letter_exchange: def.dead_letter_exchange.clone(),
                dead_letter_routing_key: def.dead_letter_routing_key.clone(),
            },
        )
        .await
        .map_err(unavailable)
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let queue = checked_name(&binding.queue_name)?;
        let exchange = checked_name(&binding.exchange_name)?;

        if !self.broker.queue_exists(queue).await {
            return Err(BrokerError::BrokerUnavailable(format!("no queue `{queue}`")));
        }
        let bindings_dir = self.broker.exchange_dir(exchange).join("bindings");
        if !fs::try_exists(&bindings_dir).await.unwrap_or(false) {
            return Err(BrokerError::BrokerUnavailable(format!(
                "no exchange `{exchange}`"
            )));
        }

        let file = bindings_dir.join(format!("{queue}.{MESSAGE_EXTENSION}"));
        let mut keys = read_json::<Vec<String>>(&file)
            .await
            .map_err(|err| BrokerError::BrokerUnavailable(err.to_string()))?
            .unwrap_or_default();
        if keys.contains(&binding.routing_key) {
            return Ok(());
        }
        keys.push(binding.routing_key.clone());
        write_json(&file, &keys)
            .await
            .map_err(|err| BrokerError::BrokerUnavailable(io_message("bind", queue, &err)))
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.ensure_open()?;
        debug!(count, "prefetch is not supported by the file system broker, ignoring");
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> Result<PublishConfirmation, BrokerError> {
        self.ensure_open()?;
        let payload = String::from_utf8(message.payload).map_err(|_| {
            BrokerError::Publish("the file system broker only carries UTF-8 payloads".into())
        })?;

        let file = MessageFile {
            exchange: message.exchange,
            routing_key: message.routing_key,
            message_type: Some(message.message_type),
            message_id: Some(message.message_id),
            headers: message.headers,
            payload,
        };
        self.broker
            .route(&file.exchange, &file.routing_key, &file)
            .await?;

        Ok(if self.confirms {
            PublishConfirmation::Confirmed
        } else {
            PublishConfirmation::NotRequested
        })
    }

    async fn subscribe(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open()?;
        let queue = checked_name(queue)?.to_owned();
        let dir = self.broker.messages_dir(&queue);
        if !self.broker.queue_exists(&queue).await {
            return Err(BrokerError::BrokerUnavailable(format!("no queue `{queue}`")));
        }

        let (candidates_tx, candidates_rx) = mpsc::unbounded_channel::<PathBuf>();
        let events = candidates_tx.clone();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
            if let Ok(event) = event {
                for path in event.paths {
                    let _ = events.send(path);
                }
            }
        })
        .map_err(|err| watch_failure(&queue, err))?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|err| watch_failure(&queue, err))?;

        let token = self.closed.child_token();
        self.subscriptions
            .lock()
            .insert(consumer_tag.to_owned(), token.clone());

        // Capacity 1: files are read only as fast as the consumer pulls them.
        let (tx, mut rx) = mpsc::channel(1);
        let subscription = Subscription {
            broker: self.broker.clone(),
            queue,
            dir,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            next_tag: AtomicU64::new(0),
            requeue: candidates_tx,
            token,
        };
        tokio::spawn(subscription.run(watcher, candidates_rx, tx));

        Ok(stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let token = self
            .subscriptions
            .lock()
            .remove(consumer_tag)
            .ok_or_else(|| {
                BrokerError::BrokerUnavailable(format!("unknown consumer `{consumer_tag}`"))
            })?;
        token.cancel();
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.cancel();
        self.subscriptions.lock().clear();
        Ok(())
    }
}

struct Subscription {
    broker: FileSystemBroker,
    queue: String,
    dir: PathBuf,
    in_flight: Arc<Mutex<HashSet<PathBuf>>>,
    next_tag: AtomicU64,
    requeue: mpsc::UnboundedSender<PathBuf>,
    token: CancellationToken,
}

impl Subscription {
    async fn run(
        self,
        // Dropping the watcher stops the events.
        _watcher: RecommendedWatcher,
        mut candidates: mpsc::UnboundedReceiver<PathBuf>,
        tx: mpsc::Sender<Result<RawDelivery, BrokerError>>,
    ) {
        let mut rescan = tokio::time::interval(self.broker.rescan_interval);

        loop {
            let paths = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = rescan.tick() => match list_messages(&self.dir).await {
                    Ok(paths) => paths,
                    Err(err) => {
                        warn!(error = %err, queue = self.queue, "failure to scan queue directory");
                        continue;
                    }
                },
                Some(path) = candidates.recv() => vec![path],
            };

            for path in paths {
                if !is_message_file(&path) || !self.in_flight.lock().insert(path.clone()) {
                    continue;
                }

                let Some(delivery) = self.load(&path).await else {
                    self.in_flight.lock().remove(&path);
                    continue;
                };

                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => return,
                    sent = tx.send(Ok(delivery)) => if sent.is_err() {
                        debug!(queue = self.queue, "subscription receiver dropped");
                        return;
                    },
                }
            }
        }

        debug!(queue = self.queue, "subscription stopped");
    }

    async fn load(&self, path: &Path) -> Option<RawDelivery> {
        let message = match read_json::<MessageFile>(path).await {
            Ok(Some(message)) => message,
            // Settled or taken by another consumer in the meantime.
            Ok(None) => return None,
            Err(err) => {
                warn!(error = %err, queue = self.queue, "unreadable message file, moving to sink");
                if let Some(name) = path.file_name() {
                    let _ = fs::rename(path, self.broker.sink_dir(&self.queue).join(name)).await;
                }
                return None;
            }
        };

        let delivery_tag = self.next_tag.fetch_add(1, Ordering::Relaxed) + 1;
        Some(RawDelivery {
            delivery_tag,
            exchange: message.exchange,
            routing_key: message.routing_key,
            redelivered: false,
            message_type: message.message_type,
            message_id: message.message_id,
            headers: message.headers,
            payload: message.payload.into_bytes(),
            acker: Arc::new(FileAcker {
                broker: self.broker.clone(),
                queue: self.queue.clone(),
                path: path.to_path_buf(),
                in_flight: self.in_flight.clone(),
                requeue: self.requeue.clone(),
            }),
        })
    }
}

struct FileAcker {
    broker: FileSystemBroker,
    queue: String,
    path: PathBuf,
    in_flight: Arc<Mutex<HashSet<PathBuf>>>,
    requeue: mpsc::UnboundedSender<PathBuf>,
}

impl FileAcker {
    fn ensure_unsettled(&self) -> Result<(), BrokerError> {
        if !self.in_flight.lock().contains(&self.path) {
            return Err(BrokerError::AckProtocol(format!(
                "`{}` is not an unsettled delivery",
                self.path.display()
            )));
        }
        Ok(())
    }

    /// Lets the subscription pick the file up again if it is still there.
    fn release(&self) {
        self.in_flight.lock().remove(&self.path);
    }
}

#[async_trait]
impl DeliveryAcker for FileAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.ensure_unsettled()?;
        let removed = fs::remove_file(&self.path)
            .await
            .map_err(|err| BrokerError::AckProtocol(io_message("remove", &self.queue, &err)));
        self.release();
        removed
    }

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.ensure_unsettled()?;
        if requeue {
            // The file stays; hand it back to the subscription.
            self.release();
            let _ = self.requeue.send(self.path.clone());
            return Ok(());
        }
        let settled = self.broker.dead_letter(&self.queue, &self.path).await;
        self.release();
        settled
    }
}

fn checked_name(name: &str) -> Result<&str, BrokerError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.starts_with('.');
    if invalid {
        return Err(BrokerError::Configuration(format!(
            "`{name}` cannot be used as a file system broker name"
        )));
    }
    Ok(name)
}

fn watch_failure(queue: &str, err: notify::Error) -> BrokerError {
    BrokerError::BrokerUnavailable(format!("failure to watch `{queue}`: {err}"))
}

fn io_message(action: &str, subject: &str, err: &io::Error) -> String {
    format!("failure to {action} `{subject}`: {err}")
}

fn is_message_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == MESSAGE_EXTENSION)
        && path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| !name.starts_with('.'))
}

fn json_stem(path: &Path) -> Option<&str> {
    if !is_message_file(path) {
        return None;
    }
    path.file_stem().and_then(|stem| stem.to_str())
}

async fn list_messages(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir).await?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if is_message_file(&path) {
            paths.push(path);
        }
    }
    // Names start with a zero-padded timestamp.
    paths.sort();
    Ok(paths)
}

/// `Ok(None)` when the file does not exist.
async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, BrokerError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(BrokerError::BrokerUnavailable(format!(
                "failure to read `{}`: {err}",
                path.display()
            )))
        }
    };
    serde_json::from_slice(&bytes).map(Some).map_err(|err| {
        BrokerError::Decode(format!("malformed file `{}`: {err}", path.display()))
    })
}

/// Writes through a hidden temporary file renamed into place.
async fn write_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let bytes = serde_json::to_vec(value)?;
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp = path.with_file_name(format!(".{name}.{}.tmp", Uuid::new_v4().simple()));

    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await
}

async fn write_message(dir: &Path, message: &MessageFile) -> io::Result<()> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    let name = format!(
        "{nanos:020}-{}.{MESSAGE_EXTENSION}",
        Uuid::new_v4().simple()
    );
    write_json(&dir.join(name), message).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionTarget;

    fn config() -> BrokerFactoryConfig {
        BrokerFactoryConfig::new(ConnectionTarget::url("file://"), "dlx", "dlq")
    }

    fn broker(dir: &tempfile::TempDir) -> FileSystemBroker {
        FileSystemBroker::new(dir.path()).with_rescan_interval(Duration::from_millis(20))
    }

    async fn channel(broker: &FileSystemBroker) -> Arc<dyn TransportChannel> {
        broker
            .connect(&config())
            .await
            .unwrap()
            .open_channel()
            .await
            .unwrap()
    }

    fn message(exchange: &str, key: &str, payload: &str) -> OutboundMessage {
        OutboundMessage {
            exchange: exchange.into(),
            routing_key: key.into(),
            payload: payload.as_bytes().to_vec(),
            message_type: "purchase".into(),
            message_id: "m-1".into(),
            ..Default::default()
        }
    }

    async fn next(stream: &mut DeliveryStream) -> RawDelivery {
        tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("no delivery within five seconds")
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn routes_into_bound_queue_directories() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker(&dir);
        let ch = channel(&broker).await;

        ch.declare_exchange(&ExchangeDefinition::new("shop").topic())
            .await
            .unwrap();
        for q in ["purchases", "audit"] {
            ch.declare_queue(&QueueDefinition::new(q)).await.unwrap();
        }
        ch.bind_queue(&QueueBinding::new("purchases").exchange("shop").routing_key("shop.*"))
            .await
            .unwrap();
        ch.bind_queue(&QueueBinding::new("audit").exchange("shop").routing_key("#"))
            .await
            .unwrap();

        ch.publish(message("shop", "shop.purchase", "1")).await.unwrap();
        ch.publish(message("shop", "other.login", "2")).await.unwrap();
        ch.publish(message("", "purchases", "3")).await.unwrap();

        assert_eq!(broker.pending_payloads("purchases").await.unwrap(), vec!["1", "3"]);
        assert_eq!(broker.pending_payloads("audit").await.unwrap(), vec!["1", "2"]);
    }

    #[tokio::test]
    async fn declarations_are_checked() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker(&dir);
        let ch = channel(&broker).await;

        ch.declare_exchange(&ExchangeDefinition::new("ex").topic()).await.unwrap();
        ch.declare_exchange(&ExchangeDefinition::new("ex").topic()).await.unwrap();
        assert!(ch
            .declare_exchange(&ExchangeDefinition::new("ex").fanout())
            .await
            .is_err());
        assert!(matches!(
            ch.declare_queue(&QueueDefinition::new("../escape")).await,
            Err(BrokerError::Configuration(_))
        ));
        assert!(ch
            .bind_queue(&QueueBinding::new("missing").exchange("ex"))
            .await
            .is_err());
        assert!(matches!(
            ch.publish(message("nope", "k", "x")).await,
            Err(BrokerError::Publish(_))
        ));
    }

    #[tokio::test]
    async fn non_utf8_payload_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker(&dir);
        let ch = channel(&broker).await;
        ch.declare_queue(&QueueDefinition::new("q")).await.unwrap();

        let mut outbound = message("", "q", "");
        outbound.payload = vec![0xff, 0xfe];
        assert!(matches!(
            ch.publish(outbound).await,
            Err(BrokerError::Publish(_))
        ));
        assert!(broker.pending("q").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delivers_existing_and_new_files_then_ack_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker(&dir);
        let ch = channel(&broker).await;
        ch.declare_queue(&QueueDefinition::new("q")).await.unwrap();
        ch.publish(message("", "q", "before")).await.unwrap();

        let mut stream = ch.subscribe("q", "c1").await.unwrap();
        let first = next(&mut stream).await;
        assert_eq!(first.payload, b"before");
        assert_eq!(first.message_type.as_deref(), Some("purchase"));
        assert!(!first.redelivered);

        ch.publish(message("", "q", "after")).await.unwrap();
        let second = next(&mut stream).await;
        assert_eq!(second.payload, b"after");

        first.acker.ack().await.unwrap();
        second.acker.ack().await.unwrap();
        assert!(broker.pending("q").await.unwrap().is_empty());
        assert!(matches!(
            first.acker.ack().await,
            Err(BrokerError::AckProtocol(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn requeue_keeps_the_file_and_redelivers() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker(&dir);
        let ch = channel(&broker).await;
        ch.declare_queue(&QueueDefinition::new("q")).await.unwrap();
        ch.publish(message("", "q", "again")).await.unwrap();

        let mut stream = ch.subscribe("q", "c1").await.unwrap();
        let first = next(&mut stream).await;
        first.acker.reject(true).await.unwrap();
        assert_eq!(broker.pending("q").await.unwrap().len(), 1);

        let second = next(&mut stream).await;
        assert_eq!(second.payload, b"again");
        assert!(!second.redelivered);
        second.acker.ack().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dead_letter_routes_through_exchange_or_sink() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker(&dir);
        let ch = channel(&broker).await;

        ch.declare_queue(&QueueDefinition::new("dlq")).await.unwrap();
        ch.declare_exchange(&ExchangeDefinition::new("dlx").direct())
            .await
            .unwrap();
        ch.bind_queue(&QueueBinding::new("dlq").exchange("dlx").routing_key("work"))
            .await
            .unwrap();
        ch.declare_queue(&QueueDefinition::new("work").dead_letter("dlx", "work"))
            .await
            .unwrap();
        ch.declare_queue(&QueueDefinition::new("plain")).await.unwrap();
        ch.publish(message("", "work", "poison")).await.unwrap();
        ch.publish(message("", "plain", "lost")).await.unwrap();

        let mut work = ch.subscribe("work", "c1").await.unwrap();
        next(&mut work).await.acker.reject(false).await.unwrap();
        let mut plain = ch.subscribe("plain", "c2").await.unwrap();
        next(&mut plain).await.acker.reject(false).await.unwrap();

        assert!(broker.pending("work").await.unwrap().is_empty());
        let dead = broker.pending("dlq").await.unwrap();
        assert_eq!(dead.len(), 1);
        let stored = read_json::<MessageFile>(&dead[0]).await.unwrap().unwrap();
        assert_eq!(stored.payload, "poison");
        assert_eq!(
            stored.headers.get(HEADER_FIRST_DEATH_QUEUE),
            Some(&"work".to_owned())
        );

        assert!(broker.pending("plain").await.unwrap().is_empty());
        assert_eq!(list_messages(&broker.sink_dir("plain")).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unsettled_file_is_delivered_to_the_next_subscription() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker(&dir);
        let ch = channel(&broker).await;
        ch.declare_queue(&QueueDefinition::new("q")).await.unwrap();
        ch.publish(message("", "q", "x")).await.unwrap();

        let mut stream = ch.subscribe("q", "c1").await.unwrap();
        let _unsettled = next(&mut stream).await;
        ch.close().await.unwrap();

        let ch = channel(&broker).await;
        let mut stream = ch.subscribe("q", "c2").await.unwrap();
        let again = next(&mut stream).await;
        assert_eq!(again.payload, b"x");
        again.acker.ack().await.unwrap();
    }

    #[tokio::test]
    async fn confirms_follow_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker(&dir);
        let conn = broker
            .connect(&config().with_publisher_confirms(false))
            .await
            .unwrap();
        let ch = conn.open_channel().await.unwrap();
        ch.declare_queue(&QueueDefinition::new("q")).await.unwrap();
        assert_eq!(
            ch.publish(message("", "q", "x")).await.unwrap(),
            PublishConfirmation::NotRequested
        );

        conn.close().await.unwrap();
        assert!(!conn.is_connected());
        assert!(ch.publish(message("", "q", "x")).await.is_err());
    }
}
