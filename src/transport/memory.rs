//! An in-process broker that behaves like a single RabbitMq node.
//!
//! It supports the default, direct, topic, fanout and headers exchanges (headers exchanges
//! route like fanout), prefetch limits, manual acknowledgements, requeues, dead-lettering via
//! `x-dead-letter-exchange`, per-message TTLs, exclusive queues and mandatory returns.
//!
//! On top of that it can inject faults (unreachable endpoints, connections reset mid-publish,
//! dropped connections) and exposes counters so that the resilience policy can be observed.
use crate::configuration::{
    ConnectionSettings, Endpoint, ExchangeKind, ExchangeSettings, QueueSettings,
};
use crate::error::ErrorCode;
use crate::message::{HeaderValue, Headers, ReturnedMessage};
use crate::transport::{
    Acknowledge, ChannelMode, Delivery, Publication, PublishOutcome, Transport, TransportChannel,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio::time::Instant;

const NO_ROUTE: u16 = 312;

/// Errors raised by [`MemoryBroker`], mirroring the broker conditions they stand for.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Connection refused by {0}")]
    ConnectionRefused(String),
    #[error("The connection is closed")]
    ConnectionClosed,
    #[error("The channel is closed")]
    ChannelClosed,
    #[error("The connection was reset by the peer")]
    ConnectionReset,
    #[error("Queue `{0}` is exclusive to another connection")]
    ResourceLocked(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("Unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),
}

/// Counters describing what clients did to the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Every dial, successful or not.
    pub connect_attempts: usize,
    pub connections_opened: usize,
    pub channels_opened: usize,
    /// Channels closed by their owner.
    pub channels_closed: usize,
    /// Every publish that reached an open channel, including injected failures.
    pub publish_attempts: usize,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    message_id: Option<String>,
    correlation_id: Option<String>,
    content_type: Option<String>,
    headers: Headers,
    data: Vec<u8>,
    redelivered: bool,
    expires_at: Option<Instant>,
}

#[derive(Debug)]
struct Queue {
    durable: bool,
    owner: Option<u64>,
    arguments: Headers,
    messages: VecDeque<StoredMessage>,
}

#[derive(Debug)]
struct Exchange {
    kind: ExchangeKind,
    bindings: Vec<(String, String)>,
}

#[derive(Debug)]
struct Unacked {
    channel: u64,
    queue: String,
    message: StoredMessage,
}

#[derive(Debug)]
struct ChannelState {
    connection: u64,
    open: bool,
    prefetch: u16,
    consuming: Option<String>,
}

#[derive(Debug)]
struct State {
    next_id: u64,
    connections: HashMap<u64, bool>,
    channels: HashMap<u64, ChannelState>,
    queues: HashMap<String, Queue>,
    exchanges: HashMap<String, Exchange>,
    unacked: HashMap<u64, Unacked>,
    unreachable: HashSet<String>,
    failing_publishes: usize,
    reject_supported: bool,
    stats: BrokerStats,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn is_connected(&self, connection: u64) -> bool {
        self.connections.get(&connection).copied().unwrap_or(false)
    }

    fn open_channel(&self, channel: u64) -> Result<&ChannelState, MemoryError> {
        match self.channels.get(&channel) {
            Some(state) if !self.is_connected(state.connection) => {
                Err(MemoryError::ConnectionClosed)
            }
            Some(state) if state.open => Ok(state),
            _ => Err(MemoryError::ChannelClosed),
        }
    }

    /// Put every unacknowledged delivery of `channel` back at the head of its queue.
    fn requeue_channel(&mut self, channel: u64) {
        let mut tags = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel == channel)
            .map(|(tag, _)| *tag)
            .collect::<Vec<_>>();
        tags.sort_unstable();
        for tag in tags.into_iter().rev() {
            if let Some(unacked) = self.unacked.remove(&tag) {
                self.requeue(unacked);
            }
        }
    }

    fn requeue(&mut self, unacked: Unacked) {
        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            let mut message = unacked.message;
            message.redelivered = true;
            queue.messages.push_front(message);
        }
    }

    fn close_channel(&mut self, channel: u64) {
        if let Some(state) = self.channels.get_mut(&channel) {
            state.open = false;
            state.consuming = None;
        }
        self.requeue_channel(channel);
    }

    fn kill_connection(&mut self, connection: u64) {
        if let Some(alive) = self.connections.get_mut(&connection) {
            *alive = false;
        }
        let channels = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection == connection)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        for channel in channels {
            self.close_channel(channel);
        }
        self.queues.retain(|_, q| q.owner != Some(connection));
    }

    fn check_exclusive(&self, queue: &str, connection: u64) -> Result<(), MemoryError> {
        match self.queues.get(queue) {
            Some(q) if q.owner.is_some() && q.owner != Some(connection) => {
                Err(MemoryError::ResourceLocked(queue.to_owned()))
            }
            _ => Ok(()),
        }
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, MemoryError> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_owned()])
                .unwrap_or_default());
        }
        let exchange = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| MemoryError::NotFound(format!("Exchange `{exchange}`")))?;
        let mut queues = exchange
            .bindings
            .iter()
            .filter(|(_, key)| match exchange.kind {
                ExchangeKind::Direct => key == routing_key,
                ExchangeKind::Topic => topic_matches(key, routing_key),
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
            })
            .map(|(queue, _)| queue.clone())
            .collect::<Vec<_>>();
        queues.dedup();
        Ok(queues)
    }

    fn enqueue(&mut self, queues: &[String], message: &StoredMessage) {
        for queue in queues {
            if let Some(queue) = self.queues.get_mut(queue) {
                queue.messages.push_back(message.clone());
            }
        }
    }

    /// Route a rejected or expired message to the queue's dead letter exchange, if any.
    fn dead_letter(&mut self, queue: &str, mut message: StoredMessage) {
        let Some(arguments) = self.queues.get(queue).map(|q| q.arguments.clone()) else {
            return;
        };
        let Some(HeaderValue::String(exchange)) = arguments.get("x-dead-letter-exchange") else {
            return;
        };
        let routing_key = match arguments.get("x-dead-letter-routing-key") {
            Some(HeaderValue::String(key)) => key.clone(),
            _ => message.routing_key.clone(),
        };
        message
            .headers
            .insert("x-first-death-queue".into(), queue.into());
        message.redelivered = false;
        message.expires_at = None;
        message.exchange = exchange.clone();
        message.routing_key = routing_key.clone();
        match self.route(exchange, &routing_key) {
            Ok(targets) => self.enqueue(&targets, &message),
            Err(e) => tracing::warn!(queue, "Dropping a dead-lettered message: {e}"),
        }
    }

    fn take_delivery(&mut self, channel: u64) -> Option<(u64, StoredMessage)> {
        let state = self.channels.get(&channel)?;
        let queue_name = state.consuming.clone()?;
        let prefetch = usize::from(state.prefetch);
        if prefetch > 0
            && self.unacked.values().filter(|u| u.channel == channel).count() >= prefetch
        {
            return None;
        }
        let now = Instant::now();
        loop {
            let message = self.queues.get_mut(&queue_name)?.messages.pop_front()?;
            if message.expires_at.is_some_and(|at| at <= now) {
                self.dead_letter(&queue_name, message);
                continue;
            }
            let tag = self.next_id();
            self.unacked.insert(
                tag,
                Unacked {
                    channel,
                    queue: queue_name.clone(),
                    message: message.clone(),
                },
            );
            return Some((tag, message));
        }
    }
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

/// A cheaply cloneable handle to an in-process broker.
///
/// Every clone talks to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("stats", &self.stats())
            .finish()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    next_id: 0,
                    connections: HashMap::new(),
                    channels: HashMap::new(),
                    queues: HashMap::new(),
                    exchanges: HashMap::new(),
                    unacked: HashMap::new(),
                    unreachable: HashSet::new(),
                    failing_publishes: 0,
                    reject_supported: true,
                    stats: BrokerStats::default(),
                }),
                notify: Notify::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn wake_consumers(&self) {
        self.inner.notify.notify_waiters();
    }

    /// Refuse (or accept again) dials to `authority`, e.g. `rmq-1:5672`.
    pub fn set_unreachable(&self, authority: impl Into<String>, unreachable: bool) {
        let authority = authority.into();
        let mut state = self.state();
        if unreachable {
            state.unreachable.insert(authority);
        } else {
            state.unreachable.remove(&authority);
        }
    }

    /// The next `count` publishes reset the connection they are sent on.
    pub fn fail_next_publishes(&self, count: usize) {
        self.state().failing_publishes = count;
    }

    /// Kill every open connection, as a broker restart would. Returns how many were open.
    pub fn drop_connections(&self) -> usize {
        let killed = {
            let mut state = self.state();
            let alive = state
                .connections
                .iter()
                .filter(|(_, alive)| **alive)
                .map(|(id, _)| *id)
                .collect::<Vec<_>>();
            for connection in &alive {
                state.kill_connection(*connection);
            }
            alive.len()
        };
        self.wake_consumers();
        killed
    }

    /// Emulate a transport without negative acknowledgements.
    pub fn set_reject_supported(&self, supported: bool) {
        self.state().reject_supported = supported;
    }

    pub fn stats(&self) -> BrokerStats {
        self.state().stats
    }

    /// Messages ready for delivery in `queue`.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map_or(0, |q| q.messages.len())
    }

    /// Messages delivered from `queue` and not settled yet.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state()
            .unacked
            .values()
            .filter(|u| u.queue == queue)
            .count()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.state().queues.contains_key(queue)
    }

    pub fn open_connections(&self) -> usize {
        self.state().connections.values().filter(|alive| **alive).count()
    }
}

/// A connection to a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
}

/// A channel on a [`MemoryBroker`] connection.
pub struct MemoryChannel {
    id: u64,
    connection: u64,
    broker: MemoryBroker,
}

#[async_trait::async_trait]
impl Transport for MemoryBroker {
    type Connection = MemoryConnection;
    type Channel = MemoryChannel;

    async fn connect(
        &self,
        endpoint: &Endpoint,
        _settings: &ConnectionSettings,
    ) -> Result<MemoryConnection, anyhow::Error> {
        let mut state = self.state();
        state.stats.connect_attempts += 1;
        let authority = endpoint.authority();
        if state.unreachable.contains(&authority) {
            return Err(MemoryError::ConnectionRefused(authority).into());
        }
        let id = state.next_id();
        state.connections.insert(id, true);
        state.stats.connections_opened += 1;
        Ok(MemoryConnection { id })
    }

    fn is_connected(&self, connection: &MemoryConnection) -> bool {
        self.state().is_connected(connection.id)
    }

    async fn close_connection(&self, connection: &MemoryConnection) -> Result<(), anyhow::Error> {
        self.state().kill_connection(connection.id);
        self.wake_consumers();
        Ok(())
    }

    async fn create_channel(
        &self,
        connection: &MemoryConnection,
        mode: ChannelMode,
    ) -> Result<MemoryChannel, anyhow::Error> {
        let mut state = self.state();
        if !state.is_connected(connection.id) {
            return Err(MemoryError::ConnectionClosed.into());
        }
        let id = state.next_id();
        let prefetch = match mode {
            ChannelMode::Consume { prefetch_count } => prefetch_count,
            ChannelMode::Publish { .. } => 0,
        };
        state.channels.insert(
            id,
            ChannelState {
                connection: connection.id,
                open: true,
                prefetch,
                consuming: None,
            },
        );
        state.stats.channels_opened += 1;
        Ok(MemoryChannel {
            id,
            connection: connection.id,
            broker: self.clone(),
        })
    }

    fn classify(
        &self,
        connection: Option<&MemoryConnection>,
        error: &anyhow::Error,
    ) -> Option<ErrorCode> {
        match error.downcast_ref::<MemoryError>() {
            Some(
                MemoryError::ConnectionRefused(_)
                | MemoryError::ConnectionClosed
                | MemoryError::ChannelClosed
                | MemoryError::ConnectionReset,
            ) => Some(ErrorCode::LostConnection),
            Some(MemoryError::ResourceLocked(_)) => Some(ErrorCode::ExclusiveLock),
            Some(
                MemoryError::NotFound(_)
                | MemoryError::PreconditionFailed(_)
                | MemoryError::UnknownDeliveryTag(_),
            ) => Some(ErrorCode::UnhandledError),
            None => match connection {
                Some(connection) if self.is_connected(connection) => None,
                _ => Some(ErrorCode::LostConnection),
            },
        }
    }
}

#[async_trait::async_trait]
impl TransportChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.broker.state().open_channel(self.id).is_ok()
    }

    async fn close(&mut self) -> Result<(), anyhow::Error> {
        {
            let mut state = self.broker.state();
            if state.channels.get(&self.id).is_some_and(|c| c.open) {
                state.close_channel(self.id);
                state.stats.channels_closed += 1;
            }
            state.channels.remove(&self.id);
        }
        self.broker.wake_consumers();
        Ok(())
    }

    async fn declare_queue(&mut self, queue: &QueueSettings) -> Result<String, anyhow::Error> {
        let mut state = self.broker.state();
        state.open_channel(self.id)?;
        let name = match queue.physical_name() {
            "" => format!("amq.gen-{}", uuid::Uuid::new_v4()),
            name => name.to_owned(),
        };
        state.check_exclusive(&name, self.connection)?;
        if let Some(existing) = state.queues.get(&name) {
            if existing.durable != queue.durable {
                return Err(MemoryError::PreconditionFailed(format!(
                    "inequivalent arg 'durable' for queue `{name}`"
                ))
                .into());
            }
            return Ok(name);
        }
        let owner = queue.exclusive.then_some(self.connection);
        state.queues.insert(
            name.clone(),
            Queue {
                durable: queue.durable,
                owner,
                arguments: queue.arguments.clone(),
                messages: VecDeque::new(),
            },
        );
        Ok(name)
    }

    async fn declare_exchange(&mut self, exchange: &ExchangeSettings) -> Result<(), anyhow::Error> {
        let mut state = self.broker.state();
        state.open_channel(self.id)?;
        let name = exchange.physical_name();
        match state.exchanges.get(name) {
            Some(existing) if existing.kind != exchange.kind => {
                Err(MemoryError::PreconditionFailed(format!(
                    "inequivalent arg 'type' for exchange `{name}`"
                ))
                .into())
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_owned(),
                    Exchange {
                        kind: exchange.kind,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), anyhow::Error> {
        let mut state = self.broker.state();
        state.open_channel(self.id)?;
        if !state.queues.contains_key(queue) {
            return Err(MemoryError::NotFound(format!("Queue `{queue}`")).into());
        }
        let exchange = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| MemoryError::NotFound(format!("Exchange `{exchange}`")))?;
        let binding = (queue.to_owned(), routing_key.to_owned());
        if !exchange.bindings.contains(&binding) {
            exchange.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &mut self,
        publication: Publication<'_>,
    ) -> Result<PublishOutcome, anyhow::Error> {
        let outcome = {
            let mut state = self.broker.state();
            state.open_channel(self.id)?;
            state.stats.publish_attempts += 1;
            if state.failing_publishes > 0 {
                state.failing_publishes -= 1;
                state.kill_connection(self.connection);
                drop(state);
                self.broker.wake_consumers();
                return Err(MemoryError::ConnectionReset.into());
            }
            let properties = publication.properties;
            let message = StoredMessage {
                exchange: publication.exchange.to_owned(),
                routing_key: publication.routing_key.to_owned(),
                message_id: properties.message_id.clone(),
                correlation_id: properties.correlation_id.clone(),
                content_type: properties.content_type.clone(),
                headers: properties.headers.clone(),
                data: publication.payload.to_vec(),
                redelivered: false,
                expires_at: properties.time_to_live.map(|ttl| Instant::now() + ttl),
            };
            let targets = state.route(publication.exchange, publication.routing_key)?;
            if targets.is_empty() && publication.mandatory {
                PublishOutcome::Returned(ReturnedMessage {
                    reply_code: NO_ROUTE,
                    reply_text: "NO_ROUTE".into(),
                    exchange: message.exchange,
                    routing_key: message.routing_key,
                    message_id: message.message_id,
                    headers: message.headers,
                    data: message.data,
                })
            } else {
                state.enqueue(&targets, &message);
                PublishOutcome::Delivered
            }
        };
        self.broker.wake_consumers();
        Ok(outcome)
    }

    async fn start_consuming(&mut self, queue: &str) -> Result<(), anyhow::Error> {
        let mut state = self.broker.state();
        state.open_channel(self.id)?;
        if !state.queues.contains_key(queue) {
            return Err(MemoryError::NotFound(format!("Queue `{queue}`")).into());
        }
        state.check_exclusive(queue, self.connection)?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.consuming = Some(queue.to_owned());
        }
        Ok(())
    }

    fn is_consuming(&self) -> bool {
        self.broker
            .state()
            .open_channel(self.id)
            .is_ok_and(|c| c.consuming.is_some())
    }

    async fn next_delivery(&mut self) -> Result<Delivery, anyhow::Error> {
        let inner = Arc::clone(&self.broker.inner);
        loop {
            // Registered before looking at the queue so that a publish in between is not missed.
            let notified = inner.notify.notified();
            {
                let mut state = self.broker.state();
                state.open_channel(self.id)?;
                if let Some((tag, message)) = state.take_delivery(self.id) {
                    let reject_supported = state.reject_supported;
                    return Ok(Delivery {
                        message_id: message.message_id,
                        correlation_id: message.correlation_id,
                        content_type: message.content_type,
                        exchange: message.exchange,
                        routing_key: message.routing_key,
                        redelivered: message.redelivered,
                        headers: message.headers,
                        data: message.data,
                        acker: Box::new(MemoryAcker {
                            broker: self.broker.clone(),
                            tag,
                            reject_supported,
                        }),
                    });
                }
            }
            notified.await;
        }
    }

    async fn clear_buffer(&mut self) -> Result<(), anyhow::Error> {
        {
            let mut state = self.broker.state();
            state.open_channel(self.id)?;
            state.requeue_channel(self.id);
            if let Some(channel) = state.channels.get_mut(&self.id) {
                channel.consuming = None;
            }
        }
        self.broker.wake_consumers();
        Ok(())
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    tag: u64,
    reject_supported: bool,
}

impl MemoryAcker {
    fn settle(&self, state: &mut State) -> Result<Unacked, MemoryError> {
        let channel = state
            .unacked
            .get(&self.tag)
            .map(|u| u.channel)
            .ok_or(MemoryError::UnknownDeliveryTag(self.tag))?;
        state.open_channel(channel)?;
        state
            .unacked
            .remove(&self.tag)
            .ok_or(MemoryError::UnknownDeliveryTag(self.tag))
    }
}

#[async_trait::async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self) -> Result<(), anyhow::Error> {
        {
            let mut state = self.broker.state();
            if state.unacked.get(&self.tag).is_none() {
                // Requeued when its channel went away.
                return Err(MemoryError::ChannelClosed.into());
            }
            self.settle(&mut state)?;
        }
        self.broker.wake_consumers();
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), anyhow::Error> {
        if !self.reject_supported {
            return Err(MemoryError::PreconditionFailed("reject is disabled".into()).into());
        }
        {
            let mut state = self.broker.state();
            if state.unacked.get(&self.tag).is_none() {
                return Err(MemoryError::ChannelClosed.into());
            }
            let unacked = self.settle(&mut state)?;
            if requeue {
                state.requeue(unacked);
            } else {
                state.dead_letter(&unacked.queue, unacked.message);
            }
        }
        self.broker.wake_consumers();
        Ok(())
    }

    fn can_reject(&self) -> bool {
        self.reject_supported
    }
}

/// AMQP topic matching: `*` matches one word, `#` matches zero or more words.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
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
    let pattern = pattern.split('.').collect::<Vec<_>>();
    let key = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect::<Vec<_>>()
    };
    matches(&pattern, &key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SendProperties;
    use std::time::Duration;

    async fn channel(broker: &MemoryBroker, mode: ChannelMode) -> MemoryChannel {
        let endpoint = Endpoint::parse("localhost", false).unwrap();
        let connection = broker
            .connect(&endpoint, &ConnectionSettings::default())
            .await
            .unwrap();
        broker.create_channel(&connection, mode).await.unwrap()
    }

    async fn publish(
        channel: &mut MemoryChannel,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> PublishOutcome {
        channel
            .publish(Publication {
                exchange,
                routing_key,
                payload: body,
                properties: &SendProperties::default(),
                mandatory: true,
            })
            .await
            .unwrap()
    }

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("orders.*", "orders.created"));
        assert!(!topic_matches("orders.*", "orders.created.eu"));
        assert!(topic_matches("orders.#", "orders"));
        assert!(topic_matches("orders.#", "orders.created.eu"));
        assert!(topic_matches("#", ""));
        assert!(topic_matches("*.created.#", "orders.created"));
        assert!(!topic_matches("payments.#", "orders.created"));
    }

    #[tokio::test]
    async fn unroutable_mandatory_messages_are_returned() {
        // Arrange
        let broker = MemoryBroker::new();
        let mut channel = channel(&broker, ChannelMode::Publish { confirms: true }).await;
        channel
            .declare_exchange(&ExchangeSettings::new("events", ExchangeKind::Topic))
            .await
            .unwrap();

        // Act
        let outcome = publish(&mut channel, "events", "orders.created", b"{}").await;

        // Assert
        match outcome {
            PublishOutcome::Returned(returned) => assert_eq!(NO_ROUTE, returned.reply_code),
            PublishOutcome::Delivered => panic!("Expected the message to be returned"),
        }
    }

    #[tokio::test]
    async fn prefetch_limits_unacknowledged_deliveries() {
        // Arrange
        let broker = MemoryBroker::new();
        let mut publisher = channel(&broker, ChannelMode::Publish { confirms: true }).await;
        let mut consumer = channel(&broker, ChannelMode::Consume { prefetch_count: 1 }).await;
        consumer.declare_queue(&QueueSettings::new("jobs")).await.unwrap();
        publish(&mut publisher, "", "jobs", b"1").await;
        publish(&mut publisher, "", "jobs", b"2").await;
        consumer.start_consuming("jobs").await.unwrap();

        // Act
        let first = consumer.next_delivery().await.unwrap();
        let window = Duration::from_millis(20);
        let blocked = tokio::time::timeout(window, consumer.next_delivery()).await;
        first.acker.ack().await.unwrap();
        let second = consumer.next_delivery().await.unwrap();

        // Assert
        assert!(blocked.is_err());
        assert_eq!(b"2".to_vec(), second.data);
        assert_eq!(1, broker.unacked_count("jobs"));
    }

    #[tokio::test]
    async fn closing_a_channel_requeues_its_deliveries() {
        let broker = MemoryBroker::new();
        let mut publisher = channel(&broker, ChannelMode::Publish { confirms: true }).await;
        let mut consumer = channel(&broker, ChannelMode::Consume { prefetch_count: 10 }).await;
        consumer.declare_queue(&QueueSettings::new("jobs")).await.unwrap();
        publish(&mut publisher, "", "jobs", b"1").await;
        consumer.start_consuming("jobs").await.unwrap();
        let delivery = consumer.next_delivery().await.unwrap();
        assert!(!delivery.redelivered);

        consumer.close().await.unwrap();

        assert_eq!(1, broker.queue_depth("jobs"));
        assert!(delivery.acker.ack().await.is_err());
    }

    #[tokio::test]
    async fn rejected_messages_are_dead_lettered() {
        // Arrange
        let broker = MemoryBroker::new();
        let mut publisher = channel(&broker, ChannelMode::Publish { confirms: true }).await;
        let mut consumer = channel(&broker, ChannelMode::Consume { prefetch_count: 10 }).await;
        consumer
            .declare_exchange(&ExchangeSettings::new("dlx", ExchangeKind::Fanout))
            .await
            .unwrap();
        consumer.declare_queue(&QueueSettings::new("dead")).await.unwrap();
        consumer.bind_queue("dead", "dlx", "").await.unwrap();
        let jobs = QueueSettings::new("jobs")
            .with_argument("x-dead-letter-exchange", "dlx");
        consumer.declare_queue(&jobs).await.unwrap();
        publish(&mut publisher, "", "jobs", b"poison").await;
        consumer.start_consuming("jobs").await.unwrap();

        // Act
        let delivery = consumer.next_delivery().await.unwrap();
        delivery.acker.reject(false).await.unwrap();

        // Assert
        assert_eq!(0, broker.queue_depth("jobs"));
        assert_eq!(1, broker.queue_depth("dead"));
    }

    #[tokio::test]
    async fn exclusive_queues_are_locked_to_their_connection() {
        let broker = MemoryBroker::new();
        let mut owner = channel(&broker, ChannelMode::Consume { prefetch_count: 1 }).await;
        let mut other = channel(&broker, ChannelMode::Consume { prefetch_count: 1 }).await;
        owner
            .declare_queue(&QueueSettings::new("mine").exclusive(true))
            .await
            .unwrap();

        let error = other.start_consuming("mine").await.unwrap_err();

        assert_eq!(Some(ErrorCode::ExclusiveLock), broker.classify(None, &error));
    }

    #[tokio::test]
    async fn dropped_connections_wake_up_waiting_consumers() {
        let broker = MemoryBroker::new();
        let mut consumer = channel(&broker, ChannelMode::Consume { prefetch_count: 1 }).await;
        consumer.declare_queue(&QueueSettings::new("jobs")).await.unwrap();
        consumer.start_consuming("jobs").await.unwrap();

        let waiting = tokio::spawn(async move { consumer.next_delivery().await.map(|_| ()) });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(1, broker.drop_connections());
        let error = waiting.await.unwrap().unwrap_err();

        assert_eq!(Some(ErrorCode::LostConnection), broker.classify(None, &error));
    }
}
