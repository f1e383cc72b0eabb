//! In-memory broker for testing and single-process use.
//!
//! Models the parts of AMQP 0-9-1 the client relies on:
//! - direct, fanout and topic exchanges plus the default exchange (`""`)
//! - FIFO queues with round-robin delivery to consumers
//! - per-channel delivery tags and unacked tracking; closing a channel or
//!   connection requeues its unacked messages flagged as redelivered
//! - auto-delete queues removed when their last consumer goes away
//! - exclusive queues removed with the connection that declared them
//! - passive declaration of a missing resource closes the channel with
//!   [`TransportError::NotFound`]
//!
//! Queue expiry (`x-expires`) is recorded but not enforced.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use super::{
    wait_with_timeout, Broker, BrokerChannel, ChannelRef, Declare, Delivery, ExchangeKind,
    ExchangeParams, PublishProperties, QueueParams, Result, TransportError, Wait,
};

/// Name of the AMQP default exchange, which routes by queue name.
const DEFAULT_EXCHANGE: &str = "";

/// A message as recorded in the broker's publish log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: PublishProperties,
}

impl PublishedMessage {
    /// Decode the body as JSON.
    pub fn json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_slice(&self.body)
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    redelivered: bool,
}

struct ExchangeState {
    kind: ExchangeKind,
    params: ExchangeParams,
    /// (queue, binding key)
    bindings: Vec<(String, String)>,
}

struct QueueState {
    params: QueueParams,
    owner: Option<u64>,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<u64>,
    next_consumer: usize,
    had_consumer: bool,
}

struct ConsumerState {
    queue: String,
    no_ack: bool,
    sender: mpsc::UnboundedSender<Delivery>,
}

struct ChannelState {
    connection: u64,
    next_tag: u64,
    consumer: Option<ConsumerState>,
    /// delivery tag -> (queue, message)
    unacked: BTreeMap<u64, (String, StoredMessage)>,
}

#[derive(Default)]
struct BrokerState {
    next_id: u64,
    connections: HashSet<u64>,
    channels: HashMap<u64, ChannelState>,
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    published: Vec<PublishedMessage>,
}

impl BrokerState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn ensure_open(&self, channel: u64) -> Result<()> {
        if self.channels.contains_key(&channel) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    /// Fail the channel: the broker closes it, as AMQP does on channel errors.
    fn fail_channel(&mut self, channel: u64, err: TransportError) -> TransportError {
        self.close_channel(channel);
        err
    }

    fn close_channel(&mut self, channel: u64) {
        let Some(state) = self.channels.remove(&channel) else {
            return;
        };

        let mut touched: Vec<String> = Vec::new();
        if let Some(consumer) = &state.consumer {
            if let Some(queue) = self.queues.get_mut(&consumer.queue) {
                queue.consumers.retain(|c| *c != channel);
            }
            touched.push(consumer.queue.clone());
        }

        // Requeue unacked messages at the head, preserving delivery order.
        for (_, (queue_name, mut message)) in state.unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&queue_name) {
                message.redelivered = true;
                queue.messages.push_front(message);
                if !touched.contains(&queue_name) {
                    touched.push(queue_name);
                }
            }
        }

        for queue_name in touched {
            let remove = self.queues.get(&queue_name).is_some_and(|q| {
                q.params.auto_delete && q.had_consumer && q.consumers.is_empty()
            });
            if remove {
                debug!(queue = %queue_name, "Auto-deleting queue after last consumer");
                self.remove_queue(&queue_name);
            } else {
                self.dispatch(&queue_name);
            }
        }
    }

    fn close_connection(&mut self, connection: u64) {
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            self.close_channel(channel);
        }

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(connection))
            .map(|(name, _)| name.clone())
            .collect();
        for name in exclusive {
            self.remove_queue(&name);
        }

        self.connections.remove(&connection);
    }

    fn remove_queue(&mut self, name: &str) {
        let Some(queue) = self.queues.remove(name) else {
            return;
        };
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|(q, _)| q != name);
        }
        for consumer_channel in queue.consumers {
            if let Some(channel) = self.channels.get_mut(&consumer_channel) {
                channel.consumer = None;
                channel.unacked.retain(|_, (q, _)| q != name);
            }
        }
    }

    fn route(&mut self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        let targets: Vec<String> = if exchange == DEFAULT_EXCHANGE {
            if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            }
        } else {
            let state = self.exchanges.get(exchange).ok_or_else(|| {
                TransportError::NotFound(format!("no exchange '{}'", exchange))
            })?;
            let mut targets: Vec<String> = Vec::new();
            for (queue, key) in &state.bindings {
                let matched = match state.kind {
                    ExchangeKind::Direct => key == routing_key,
                    ExchangeKind::Fanout => true,
                    ExchangeKind::Topic => topic_matches(key, routing_key),
                };
                if matched && !targets.contains(queue) {
                    targets.push(queue.clone());
                }
            }
            targets
        };

        if targets.is_empty() {
            debug!(exchange = %exchange, routing_key = %routing_key, "Message unroutable, dropped");
        }

        for queue_name in targets {
            if let Some(queue) = self.queues.get_mut(&queue_name) {
                queue.messages.push_back(StoredMessage {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    body: body.to_vec(),
                    redelivered: false,
                });
            }
            self.dispatch(&queue_name);
        }
        Ok(())
    }

    /// Push ready messages of `queue_name` to its consumers, round-robin.
    fn dispatch(&mut self, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if queue.consumers.is_empty() || queue.messages.is_empty() {
                return;
            }
            let index = queue.next_consumer % queue.consumers.len();
            queue.next_consumer = index + 1;
            let channel_id = queue.consumers[index];
            let Some(message) = queue.messages.pop_front() else {
                return;
            };

            let Some(channel) = self.channels.get_mut(&channel_id) else {
                self.requeue_without_consumer(queue_name, channel_id, message);
                continue;
            };
            let Some(no_ack) = channel.consumer.as_ref().map(|c| c.no_ack) else {
                self.requeue_without_consumer(queue_name, channel_id, message);
                continue;
            };

            channel.next_tag += 1;
            let delivery_tag = channel.next_tag;
            let delivery = Delivery {
                delivery_tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                body: message.body.clone(),
            };

            let sent = channel
                .consumer
                .as_ref()
                .is_some_and(|c| c.sender.send(delivery).is_ok());
            if !sent {
                // Receiver dropped without closing the channel.
                channel.consumer = None;
                self.requeue_without_consumer(queue_name, channel_id, message);
                continue;
            }
            if !no_ack {
                channel
                    .unacked
                    .insert(delivery_tag, (queue_name.to_string(), message));
            }
        }
    }

    fn requeue_without_consumer(&mut self, queue_name: &str, channel: u64, message: StoredMessage) {
        if let Some(queue) = self.queues.get_mut(queue_name) {
            queue.consumers.retain(|c| *c != channel);
            queue.messages.push_front(message);
        }
    }
}

/// AMQP topic matching: `*` matches one word, `#` matches zero or more.
fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}

/// An in-process broker.
///
/// Cloning shares the same broker; each [`MemoryBroker::connect`] yields an
/// independent connection, so two clients on one broker behave like two
/// processes on one RabbitMQ server.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connection to this broker.
    pub async fn connect(&self) -> MemoryConnection {
        let mut state = self.state.lock().await;
        let id = state.allocate_id();
        state.connections.insert(id);
        MemoryConnection {
            id,
            state: self.state.clone(),
        }
    }

    /// Publish as an external party (e.g. a worker posting a reply).
    pub async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        let mut state = self.state.lock().await;
        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            properties: PublishProperties::default(),
        });
        state.route(exchange, routing_key, body)
    }

    /// Every message published so far, in order.
    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().await.published.clone()
    }

    /// Messages published to `exchange`, in order.
    pub async fn published_to(&self, exchange: &str) -> Vec<PublishedMessage> {
        self.state
            .lock()
            .await
            .published
            .iter()
            .filter(|m| m.exchange == exchange)
            .cloned()
            .collect()
    }

    pub async fn queue_exists(&self, name: &str) -> bool {
        self.state.lock().await.queues.contains_key(name)
    }

    pub async fn queue_params(&self, name: &str) -> Option<QueueParams> {
        self.state
            .lock()
            .await
            .queues
            .get(name)
            .map(|q| q.params.clone())
    }

    pub async fn exchange_params(&self, name: &str) -> Option<(ExchangeKind, ExchangeParams)> {
        self.state
            .lock()
            .await
            .exchanges
            .get(name)
            .map(|e| (e.kind, e.params.clone()))
    }

    /// Binding keys from `exchange` to `queue`.
    pub async fn bindings(&self, exchange: &str, queue: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .exchanges
            .get(exchange)
            .map(|e| {
                e.bindings
                    .iter()
                    .filter(|(q, _)| q == queue)
                    .map(|(_, key)| key.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Messages waiting in `queue` (not yet delivered).
    pub async fn ready_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    /// Messages from `queue` delivered but not yet acknowledged.
    pub async fn unacked_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .channels
            .values()
            .flat_map(|c| c.unacked.values())
            .filter(|(q, _)| q == queue)
            .count()
    }

    pub async fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }

    pub async fn open_channel_count(&self) -> usize {
        self.state.lock().await.channels.len()
    }
}

/// A connection to a [`MemoryBroker`].
pub struct MemoryConnection {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl Broker for MemoryConnection {
    async fn open_channel(&self) -> Result<ChannelRef> {
        let mut state = self.state.lock().await;
        if !state.connections.contains(&self.id) {
            return Err(TransportError::Connection("connection closed".to_string()));
        }
        let id = state.allocate_id();
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                next_tag: 0,
                consumer: None,
                unacked: BTreeMap::new(),
            },
        );
        Ok(Arc::new(MemoryChannel {
            id,
            connection: self.id,
            state: self.state.clone(),
            receiver: Mutex::new(None),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().await.close_connection(self.id);
        Ok(())
    }
}

/// A channel on a [`MemoryConnection`].
pub struct MemoryChannel {
    id: u64,
    connection: u64,
    state: Arc<Mutex<BrokerState>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, name: &str, declare: Declare<QueueParams>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_open(self.id)?;

        if let Some(existing) = state.queues.get(name) {
            if existing.owner.is_some_and(|owner| owner != self.connection) {
                let err = TransportError::Channel(format!(
                    "RESOURCE_LOCKED - queue '{}' is exclusive to another connection",
                    name
                ));
                return Err(state.fail_channel(self.id, err));
            }
            return Ok(());
        }

        match declare {
            Declare::Passive => {
                let err = TransportError::NotFound(format!("no queue '{}'", name));
                Err(state.fail_channel(self.id, err))
            }
            Declare::Create(params) => {
                let owner = params.exclusive.then_some(self.connection);
                state.queues.insert(
                    name.to_string(),
                    QueueState {
                        params,
                        owner,
                        messages: VecDeque::new(),
                        consumers: Vec::new(),
                        next_consumer: 0,
                        had_consumer: false,
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        declare: Declare<ExchangeParams>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_open(self.id)?;

        if name == DEFAULT_EXCHANGE || state.exchanges.contains_key(name) {
            return Ok(());
        }

        match declare {
            Declare::Passive => {
                let err = TransportError::NotFound(format!("no exchange '{}'", name));
                Err(state.fail_channel(self.id, err))
            }
            Declare::Create(params) => {
                state.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        kind,
                        params,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_open(self.id)?;

        if !state.queues.contains_key(queue) {
            let err = TransportError::NotFound(format!("no queue '{}'", queue));
            return Err(state.fail_channel(self.id, err));
        }
        let Some(exchange_state) = state.exchanges.get_mut(exchange) else {
            let err = TransportError::NotFound(format!("no exchange '{}'", exchange));
            return Err(state.fail_channel(self.id, err));
        };

        let binding = (queue.to_string(), routing_key.to_string());
        if !exchange_state.bindings.contains(&binding) {
            exchange_state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &PublishProperties,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_open(self.id)?;

        if let Err(err) = state.route(exchange, routing_key, body) {
            return Err(state.fail_channel(self.id, err));
        }
        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            properties: properties.clone(),
        });
        Ok(())
    }

    async fn consume(&self, queue: &str, no_ack: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_open(self.id)?;

        if !state.queues.contains_key(queue) {
            let err = TransportError::NotFound(format!("no queue '{}'", queue));
            return Err(state.fail_channel(self.id, err));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        if let Some(channel) = state.channels.get_mut(&self.id) {
            if channel.consumer.is_some() {
                return Err(TransportError::Channel(
                    "channel already has a consumer".to_string(),
                ));
            }
            channel.consumer = Some(ConsumerState {
                queue: queue.to_string(),
                no_ack,
                sender,
            });
        }
        if let Some(queue_state) = state.queues.get_mut(queue) {
            queue_state.consumers.push(self.id);
            queue_state.had_consumer = true;
        }
        *self.receiver.lock().await = Some(receiver);

        state.dispatch(queue);
        Ok(())
    }

    async fn next_delivery(&self, timeout: Option<Duration>) -> Result<Wait<Delivery>> {
        let mut guard = self.receiver.lock().await;
        let receiver = guard
            .as_mut()
            .ok_or_else(|| TransportError::Channel("No consumer on channel".to_string()))?;

        match wait_with_timeout(timeout, receiver.recv()).await {
            Wait::TimedOut => Ok(Wait::TimedOut),
            Wait::Delivered(Some(delivery)) => Ok(Wait::Delivered(delivery)),
            Wait::Delivered(None) => Err(TransportError::Closed),
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_open(self.id)?;

        let removed = state
            .channels
            .get_mut(&self.id)
            .and_then(|c| c.unacked.remove(&delivery_tag));
        if removed.is_none() {
            let err = TransportError::Channel(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                delivery_tag
            ));
            return Err(state.fail_channel(self.id, err));
        }
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_open(self.id)?;

        let removed = state
            .channels
            .get_mut(&self.id)
            .and_then(|c| c.unacked.remove(&delivery_tag));
        let Some((queue_name, mut message)) = removed else {
            let err = TransportError::Channel(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                delivery_tag
            ));
            return Err(state.fail_channel(self.id, err));
        };

        if requeue {
            if let Some(queue) = state.queues.get_mut(&queue_name) {
                message.redelivered = true;
                queue.messages.push_front(message);
            }
            state.dispatch(&queue_name);
        }
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_open(self.id)?;
        state.remove_queue(name);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_open(self.id)?;
        state.close_channel(self.id);
        Ok(())
    }
}
