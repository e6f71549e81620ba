// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Process Broker
//!
//! A broker living in the current process that honours the same contract as
//! the AMQP transport: exchange routing (direct, fanout, topic), per-consumer
//! prefetch windows, requeue with the redelivered flag, dead-lettering through
//! the queue's dead-letter exchange, and return of unacknowledged deliveries
//! when their channel closes.
//!
//! Nothing survives the process: there is no durability, `durable` flags are
//! accepted and ignored.
//!
//! The broker also counts declarations and connections and records the peak
//! number of unacknowledged deliveries per queue, which makes it the fake
//! transport of the test suites.

use super::{
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
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::debug;

pub const HEADER_FIRST_DEATH_QUEUE: &str = "x-first-death-queue";
pub const HEADER_FIRST_DEATH_REASON: &str = "x-first-death-reason";

/// Counters exposed for inspection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub connections: usize,
    pub connections_closed: usize,
    pub channels_opened: usize,
    pub channels_closed: usize,
    pub exchange_declares: usize,
    pub queue_declares: usize,
    pub queue_binds: usize,
    pub published: usize,
    pub acked: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
    pub unroutable: usize,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    payload: Vec<u8>,
    message_type: Option<String>,
    message_id: Option<String>,
    headers: BTreeMap<String, String>,
    redelivered: bool,
}

#[derive(Default)]
struct MemoryQueue {
    messages: VecDeque<StoredMessage>,
    dead_letter_exchange: Option<String>,
    dead_letter_routing_key: Option<String>,
    consumers: Vec<u64>,
    cursor: usize,
    peak_unacked: usize,
}

struct ConsumerSlot {
    queue: String,
    channel: u64,
    tag: String,
    prefetch: u16,
    sender: Option<mpsc::UnboundedSender<Result<RawDelivery, BrokerError>>>,
    unacked: HashMap<u64, StoredMessage>,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.sender.is_some()
            && (self.prefetch == 0 || self.unacked.len() < self.prefetch as usize)
    }
}

struct ChannelState {
    connection: u64,
    prefetch: u16,
}

struct ConnectionState {
    open: bool,
    confirms: bool,
}

struct BrokerState {
    available: bool,
    confirm_delay: Option<Duration>,
    nack_publishes: bool,
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<QueueBinding>,
    connections: HashMap<u64, ConnectionState>,
    channels: HashMap<u64, ChannelState>,
    consumers: HashMap<u64, ConsumerSlot>,
    next_id: u64,
    stats: MemoryStats,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            available: true,
            confirm_delay: None,
            nack_publishes: false,
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            bindings: Vec::new(),
            connections: HashMap::new(),
            channels: HashMap::new(),
            consumers: HashMap::new(),
            next_id: 0,
            stats: MemoryStats::default(),
        }
    }
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_open(&self, channel: u64) -> Result<&ChannelState, BrokerError> {
        self.channels
            .get(&channel)
            .ok_or_else(|| BrokerError::BrokerUnavailable("channel is closed".into()))
    }
}

/// Handle to an in-process broker. Clones share the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> MemoryStats {
        self.state.lock().stats
    }

    /// While unavailable, new connections are refused.
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    /// Delays every publish confirmation.
    pub fn set_confirm_delay(&self, delay: Option<Duration>) {
        self.state.lock().confirm_delay = delay;
    }

    /// Negatively confirms every publish on confirm-mode channels.
    pub fn set_nack_publishes(&self, nack: bool) {
        self.state.lock().nack_publishes = nack;
    }

    /// Severs every open connection, as a network failure would.
    pub fn drop_connections(&self) {
        let mut state = self.state.lock();
        let open: Vec<u64> = state
            .connections
            .iter()
            .filter(|(_, conn)| conn.open)
            .map(|(id, _)| *id)
            .collect();

        for id in open {
            self.close_connection(&mut state, id);
        }
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.state.lock().exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state.lock().queues.contains_key(name)
    }

    /// Messages ready for delivery in `queue`.
    pub fn queue_len(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.messages.len())
    }

    /// Payloads of the messages ready for delivery in `queue`.
    pub fn queue_payloads(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.messages.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }

    /// Headers of the messages ready for delivery in `queue`.
    pub fn queue_headers(&self, queue: &str) -> Vec<BTreeMap<String, String>> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.messages.iter().map(|m| m.headers.clone()).collect())
            .unwrap_or_default()
    }

    /// Deliveries of `queue` handed out and not yet settled.
    pub fn unacked(&self, queue: &str) -> usize {
        self.state
            .lock()
            .consumers
            .values()
            .filter(|c| c.queue == queue)
            .map(|c| c.unacked.len())
            .sum()
    }

    /// Highest number of unsettled deliveries any one consumer of `queue` held.
    pub fn peak_unacked(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.peak_unacked)
    }

    /// Active subscriptions on `queue`.
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    /// Publishes without a channel, e.g. to inject a malformed payload.
    pub fn publish_raw(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<usize, BrokerError> {
        let mut state = self.state.lock();
        state.stats.published += 1;
        self.route(
            &mut state,
            exchange,
            routing_key,
            StoredMessage {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                payload: payload.to_vec(),
                message_type: None,
                message_id: None,
                headers: BTreeMap::new(),
                redelivered: false,
            },
        )
    }

    fn route(
        &self,
        state: &mut BrokerState,
        exchange: &str,
        routing_key: &str,
        message: StoredMessage,
    ) -> Result<usize, BrokerError> {
        let targets: Vec<String> = if exchange.is_empty() {
            if state.queues.contains_key(routing_key) {
                vec![routing_key.to_owned()]
            } else {
                vec![]
            }
        } else {
            let kind = *state.exchanges.get(exchange).ok_or_else(|| {
                BrokerError::Publish(format!("no exchange `{exchange}`"))
            })?;

            let mut targets: Vec<String> = state
                .bindings
                .iter()
                .filter(|b| b.exchange_name == exchange)
                .filter(|b| match kind {
                    ExchangeKind::Direct => b.routing_key == routing_key,
                    ExchangeKind::Fanout => true,
                    ExchangeKind::Topic => topic_matches(&b.routing_key, routing_key),
                })
                .map(|b| b.queue_name.clone())
                .collect();
            targets.sort();
            targets.dedup();
            targets
        };

        if targets.is_empty() {
            debug!(exchange, routing_key, "message is unroutable, dropping");
            state.stats.unroutable += 1;
            return Ok(0);
        }

        for name in &targets {
            if let Some(queue) = state.queues.get_mut(name) {
                queue.messages.push_back(message.clone());
            }
        }
        for name in &targets {
            self.try_deliver(state, name);
        }

        Ok(targets.len())
    }

    fn try_deliver(&self, state: &mut BrokerState, queue_name: &str) {
        loop {
            let Some(queue) = state.queues.get_mut(queue_name) else {
                return;
            };
            if queue.messages.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let chosen = (0..count)
                .map(|offset| (queue.cursor + offset) % count)
                .find(|idx| {
                    state
                        .consumers
                        .get(&queue.consumers[*idx])
                        .is_some_and(ConsumerSlot::has_capacity)
                });
            let Some(idx) = chosen else {
                return;
            };

            let consumer_id = queue.consumers[idx];
            queue.cursor = idx + 1;
            let Some(message) = queue.messages.pop_front() else {
                return;
            };

            state.next_id += 1;
            let tag = state.next_id;
            let delivery = RawDelivery {
                delivery_tag: tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                message_type: message.message_type.clone(),
                message_id: message.message_id.clone(),
                headers: message.headers.clone(),
                payload: message.payload.clone(),
                acker: Arc::new(MemoryAcker {
                    state: Arc::downgrade(&self.state),
                    consumer: consumer_id,
                    tag,
                }),
            };

            let Some(slot) = state.consumers.get_mut(&consumer_id) else {
                return;
            };
            let sent = slot
                .sender
                .as_ref()
                .is_some_and(|sender| sender.send(Ok(delivery)).is_ok());

            if sent {
                slot.unacked.insert(tag, message);
                let outstanding = slot.unacked.len();
                if let Some(queue) = state.queues.get_mut(queue_name) {
                    queue.peak_unacked = queue.peak_unacked.max(outstanding);
                }
            } else {
                // Receiver is gone: stop delivering to this subscription.
                slot.sender = None;
                if let Some(queue) = state.queues.get_mut(queue_name) {
                    queue.messages.push_front(message);
                    queue.consumers.retain(|id| *id != consumer_id);
                }
            }
        }
    }

    fn settle(
        &self,
        state: &mut BrokerState,
        consumer: u64,
        tag: u64,
        outcome: Settle,
    ) -> Result<(), BrokerError> {
        let slot = state.consumers.get_mut(&consumer).ok_or_else(|| {
            BrokerError::AckProtocol(format!("delivery {tag} belongs to a closed channel"))
        })?;
        let mut message = slot
            .unacked
            .remove(&tag)
            .ok_or_else(|| BrokerError::AckProtocol(format!("unknown delivery tag {tag}")))?;
        let queue_name = slot.queue.clone();

        match outcome {
            Settle::Ack => state.stats.acked += 1,
            Settle::Requeue => {
                state.stats.requeued += 1;
                message.redelivered = true;
                if let Some(queue) = state.queues.get_mut(&queue_name) {
                    queue.messages.push_front(message);
                }
            }
            Settle::DeadLetter => {
                state.stats.dead_lettered += 1;
                self.dead_letter(state, &queue_name, message);
            }
        }

        self.try_deliver(state, &queue_name);
        Ok(())
    }

    fn dead_letter(&self, state: &mut BrokerState, queue_name: &str, mut message: StoredMessage) {
        let Some(queue) = state.queues.get(queue_name) else {
            return;
        };
        let Some(exchange) = queue.dead_letter_exchange.clone() else {
            debug!(queue = queue_name, "no dead-letter exchange, dropping message");
            return;
        };
        let routing_key = queue
            .dead_letter_routing_key
            .clone()
            .unwrap_or_else(|| message.routing_key.clone());

        message
            .headers
            .entry(HEADER_FIRST_DEATH_QUEUE.to_owned())
            .or_insert_with(|| queue_name.to_owned());
        message
            .headers
            .entry(HEADER_FIRST_DEATH_REASON.to_owned())
            .or_insert_with(|| "rejected".to_owned());
        message.redelivered = false;

        if let Err(err) = self.route(state, &exchange, &routing_key, message) {
            debug!(error = %err, queue = queue_name, "dead-letter routing failed");
        }
    }

    fn remove_consumer(&self, state: &mut BrokerState, consumer: u64) {
        let Some(mut slot) = state.consumers.remove(&consumer) else {
            return;
        };

        let mut returned: Vec<(u64, StoredMessage)> = slot.unacked.drain().collect();
        returned.sort_by_key(|(tag, _)| *tag);

        if let Some(queue) = state.queues.get_mut(&slot.queue) {
            queue.consumers.retain(|id| *id != consumer);
            for (_, mut message) in returned.into_iter().rev() {
                message.redelivered = true;
                queue.messages.push_front(message);
            }
        }

        self.try_deliver(state, &slot.queue);
    }

    fn close_channel(&self, state: &mut BrokerState, channel: u64) {
        if state.channels.remove(&channel).is_none() {
            return;
        }
        state.stats.channels_closed += 1;

        let owned: Vec<u64> = state
            .consumers
            .iter()
            .filter(|(_, slot)| slot.channel == channel)
            .map(|(id, _)| *id)
            .collect();
        for id in owned {
            self.remove_consumer(state, id);
        }
    }

    fn close_connection(&self, state: &mut BrokerState, connection: u64) {
        match state.connections.get_mut(&connection) {
            Some(conn) if conn.open => conn.open = false,
            _ => return,
        }
        state.stats.connections_closed += 1;

        let channels: Vec<u64> = state
            .channels
            .iter()
            .filter(|(_, ch)| ch.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        for id in channels {
            self.close_channel(state, id);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Settle {
    Ack,
    Requeue,
    DeadLetter,
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(
        &self,
        config: &BrokerFactoryConfig,
    ) -> Result<Arc<dyn TransportConnection>, BrokerError> {
        let mut state = self.state.lock();
        if !state.available {
            return Err(BrokerError::BrokerUnavailable(
                "in-memory broker is unreachable".into(),
            ));
        }

        let id = state.next_id();
        state.connections.insert(
            id,
            ConnectionState {
                open: true,
                confirms: config.publisher_confirms,
            },
        );
        state.stats.connections += 1;

        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            id,
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl TransportConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn TransportChannel>, BrokerError> {
        let mut state = self.broker.state.lock();
        if !state.connections.get(&self.id).is_some_and(|c| c.open) {
            return Err(BrokerError::BrokerUnavailable("connection is closed".into()));
        }

        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                prefetch: 0,
            },
        );
        state.stats.channels_opened += 1;

        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
        }))
    }

    fn is_connected(&self) -> bool {
        self.broker
            .state
            .lock()
            .connections
            .get(&self.id)
            .is_some_and(|c| c.open)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        self.broker.close_connection(&mut state, self.id);
        Ok(())
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl TransportChannel for MemoryChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        state.channel_open(self.id)?;
        state.stats.exchange_declares += 1;

        match state.exchanges.get(&def.name) {
            Some(kind) if *kind != def.kind => Err(BrokerError::BrokerUnavailable(format!(
                "exchange `{}` exists as {kind}",
                def.name
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(def.name.clone(), def.kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        state.channel_open(self.id)?;
        state.stats.queue_declares += 1;

        state
            .queues
            .entry(def.name.clone())
            .or_insert_with(|| MemoryQueue {
                dead_letter_exchange: def.dead_letter_exchange.clone(),
                dead_letter_routing_key: def.dead_letter_routing_key.clone(),
                ..Default::default()
            });
        Ok(())
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        state.channel_open(self.id)?;
        state.stats.queue_binds += 1;

        if !state.queues.contains_key(&binding.queue_name) {
            return Err(BrokerError::BrokerUnavailable(format!(
                "no queue `{}`",
                binding.queue_name
            )));
        }
        if !state.exchanges.contains_key(&binding.exchange_name) {
            return Err(BrokerError::BrokerUnavailable(format!(
                "no exchange `{}`",
                binding.exchange_name
            )));
        }
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        let channel = state
            .channels
            .get_mut(&self.id)
            .ok_or_else(|| BrokerError::BrokerUnavailable("channel is closed".into()))?;
        channel.prefetch = count;
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> Result<PublishConfirmation, BrokerError> {
        let (confirmation, delay) = {
            let mut state = self.broker.state.lock();
            let connection = state.channel_open(self.id)?.connection;
            let confirms = state
                .connections
                .get(&connection)
                .is_some_and(|c| c.confirms);
            state.stats.published += 1;

            self.broker.route(
                &mut state,
                &message.exchange,
                &message.routing_key,
                StoredMessage {
                    exchange: message.exchange.clone(),
                    routing_key: message.routing_key.clone(),
                    payload: message.payload,
                    message_type: Some(message.message_type),
                    message_id: Some(message.message_id),
                    headers: message.headers,
                    redelivered: false,
                },
            )?;

            let confirmation = match (confirms, state.nack_publishes) {
                (false, _) => PublishConfirmation::NotRequested,
                (true, true) => PublishConfirmation::Rejected,
                (true, false) => PublishConfirmation::Confirmed,
            };
            (confirmation, state.confirm_delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(confirmation)
    }

    async fn subscribe(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let mut state = self.broker.state.lock();
            let prefetch = state.channel_open(self.id)?.prefetch;
            if !state.queues.contains_key(queue) {
                return Err(BrokerError::BrokerUnavailable(format!("no queue `{queue}`")));
            }

            let id = state.next_id();
            state.consumers.insert(
                id,
                ConsumerSlot {
                    queue: queue.to_owned(),
                    channel: self.id,
                    tag: consumer_tag.to_owned(),
                    prefetch,
                    sender: Some(tx),
                    unacked: HashMap::new(),
                },
            );
            if let Some(q) = state.queues.get_mut(queue) {
                q.consumers.push(id);
            }
            self.broker.try_deliver(&mut state, queue);
        }

        Ok(stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        state.channel_open(self.id)?;

        let found = state
            .consumers
            .iter_mut()
            .find(|(_, slot)| slot.channel == self.id && slot.tag == consumer_tag);
        let Some((id, slot)) = found else {
            return Err(BrokerError::BrokerUnavailable(format!(
                "unknown consumer `{consumer_tag}`"
            )));
        };

        // Unsettled deliveries stay with the channel until it closes.
        let id = *id;
        slot.sender = None;
        let queue = slot.queue.clone();
        if let Some(q) = state.queues.get_mut(&queue) {
            q.consumers.retain(|c| *c != id);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        self.broker.close_channel(&mut state, self.id);
        Ok(())
    }
}

struct MemoryAcker {
    state: Weak<Mutex<BrokerState>>,
    consumer: u64,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self, outcome: Settle) -> Result<(), BrokerError> {
        let state = self
            .state
            .upgrade()
            .ok_or_else(|| BrokerError::AckProtocol("broker is gone".into()))?;
        let broker = MemoryBroker {
            state: state.clone(),
        };
        let mut guard = state.lock();
        broker.settle(&mut guard, self.consumer, self.tag, outcome)
    }
}

#[async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle(Settle::Ack)
    }

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.settle(if requeue {
            Settle::Requeue
        } else {
            Settle::DeadLetter
        })
    }
}

/// AMQP topic matching: `*` matches one word, `#` zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}
