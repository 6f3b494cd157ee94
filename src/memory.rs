// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Process Broker
//!
//! [`MemoryBroker`] implements the broker transport without a network. It
//! follows the AMQP rules the service bus relies on:
//!
//! - the default exchange (`""`) routes to the queue named by the routing key
//! - fanout and headers exchanges copy to every bound queue, direct exchanges
//!   match the routing key and topic exchanges match `*`/`#` patterns
//! - publishing to an undeclared exchange fails, publishing to a missing queue
//!   drops the message
//! - deliveries are pushed round-robin to the consumers of a queue, never
//!   exceeding the channel prefetch in unacknowledged deliveries
//! - closing a channel requeues its unacknowledged deliveries
//! - re-declaring with different settings fails
//!
//! It also records what happened (publishes, acks, channels) so tests can
//! inspect the traffic.

use crate::{
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::QueueDeclaration,
    transport::{
        BrokerChannel, BrokerConnection, BrokerConnector, Delivery, DeliveryStream,
        PublishProperties,
    },
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU16, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use tokio::sync::mpsc;
use tracing::debug;

/// A message accepted by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: PublishProperties,
}

struct ConsumerSlot {
    tag: String,
    channel_id: u64,
    prefetch: u16,
    in_flight: usize,
    sender: mpsc::UnboundedSender<Delivery>,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.in_flight < self.prefetch as usize
    }
}

struct Unacked {
    queue: String,
    consumer_tag: String,
    channel_id: u64,
    delivery: Delivery,
}

#[derive(Default)]
struct QueueState {
    declaration: Option<QueueDeclaration>,
    ready: VecDeque<Delivery>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

#[derive(Default)]
struct BrokerState {
    available: bool,
    generation: u64,
    next_channel_id: u64,
    next_delivery_tag: u64,
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueState>,
    bindings: BTreeSet<(String, String, String)>,
    unacked: HashMap<u64, Unacked>,
    published: Vec<PublishedMessage>,
    acked: Vec<Delivery>,
    connections_opened: usize,
    channels_opened: usize,
    channels_closed: usize,
}

impl BrokerState {
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, AmqpError> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .get(routing_key)
                .filter(|queue| queue.declaration.is_some())
                .map(|_| vec![routing_key.to_owned()])
                .unwrap_or_default());
        }

        let Some(def) = self.exchanges.get(exchange) else {
            return Err(AmqpError::PublishingError);
        };

        Ok(self
            .bindings
            .iter()
            .filter(|(bound, _, key)| {
                bound == exchange
                    && match def.kind {
                        ExchangeKind::Fanout | ExchangeKind::Headers => true,
                        ExchangeKind::Direct => key == routing_key,
                        ExchangeKind::Topic => topic_matches(key, routing_key),
                    }
            })
            .map(|(_, queue, _)| queue.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect())
    }

    fn next_tag(&mut self) -> u64 {
        self.next_delivery_tag += 1;
        self.next_delivery_tag
    }

    /// Pushes ready deliveries of `queue` to consumers with free capacity.
    fn dispatch(&mut self, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };

            if queue.ready.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let Some(slot) = (0..count)
                .map(|offset| (queue.next_consumer + offset) % count)
                .find(|idx| queue.consumers[*idx].has_capacity())
            else {
                return;
            };
            queue.next_consumer = (slot + 1) % count;

            let Some(mut delivery) = queue.ready.pop_front() else {
                return;
            };
            delivery.delivery_tag = self.next_tag();

            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            let consumer = &mut queue.consumers[slot];

            if consumer.sender.send(delivery.clone()).is_err() {
                // the consumer stream was dropped
                queue.consumers.remove(slot);
                queue.ready.push_front(delivery);
                continue;
            }

            consumer.in_flight += 1;
            let unacked = Unacked {
                queue: queue_name.to_owned(),
                consumer_tag: consumer.tag.clone(),
                channel_id: consumer.channel_id,
                delivery,
            };
            self.unacked.insert(unacked.delivery.delivery_tag, unacked);
        }
    }

    fn release_in_flight(&mut self, unacked: &Unacked) {
        if let Some(slot) = self.queues.get_mut(&unacked.queue).and_then(|queue| {
            queue
                .consumers
                .iter_mut()
                .find(|slot| slot.tag == unacked.consumer_tag)
        }) {
            slot.in_flight = slot.in_flight.saturating_sub(1);
        }
    }

    fn close_channel(&mut self, channel_id: u64) {
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|slot| slot.channel_id != channel_id);
            queue.next_consumer = 0;
        }

        let mut requeued: Vec<Unacked> = vec![];
        self.unacked.retain(|_, unacked| {
            if unacked.channel_id == channel_id {
                requeued.push(Unacked {
                    queue: unacked.queue.clone(),
                    consumer_tag: unacked.consumer_tag.clone(),
                    channel_id,
                    delivery: unacked.delivery.clone(),
                });
                false
            } else {
                true
            }
        });

        requeued.sort_by_key(|unacked| std::cmp::Reverse(unacked.delivery.delivery_tag));
        let mut touched = BTreeSet::new();
        for unacked in requeued {
            if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                queue.ready.push_front(unacked.delivery);
                touched.insert(unacked.queue);
            }
        }

        for queue in touched {
            self.dispatch(&queue);
        }

        self.channels_closed += 1;
    }
}

/// AMQP topic matching: `*` matches one word, `#` zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(word), Some(part)) if word == part => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

/// In-process broker. Cloning shares the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        MemoryBroker::new()
    }
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker {
            state: Arc::new(Mutex::new(BrokerState {
                available: true,
                ..Default::default()
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        lock(&self.state)
    }

    /// Makes new connections fail (`false`) or succeed again (`true`).
    pub fn set_available(&self, available: bool) {
        self.state().available = available;
    }

    /// Kills every open connection and channel, as a broker restart would.
    /// Declared queues, exchanges and ready messages survive.
    pub fn drop_connections(&self) {
        let mut state = self.state();
        let channels: BTreeSet<u64> = state
            .queues
            .values()
            .flat_map(|queue| queue.consumers.iter().map(|slot| slot.channel_id))
            .chain(state.unacked.values().map(|unacked| unacked.channel_id))
            .collect();

        for channel_id in channels {
            state.close_channel(channel_id);
        }

        state.generation += 1;
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.state()
            .queues
            .get(queue)
            .is_some_and(|queue| queue.declaration.is_some())
    }

    pub fn queue_declaration(&self, queue: &str) -> Option<QueueDeclaration> {
        self.state()
            .queues
            .get(queue)
            .and_then(|queue| queue.declaration.clone())
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeDefinition> {
        self.state().exchanges.get(name).cloned()
    }

    /// `(exchange, routing key)` pairs bound to `queue`.
    pub fn bindings(&self, queue: &str) -> Vec<(String, String)> {
        self.state()
            .bindings
            .iter()
            .filter(|(_, bound, _)| bound == queue)
            .map(|(exchange, _, key)| (exchange.clone(), key.clone()))
            .collect()
    }

    pub fn ready_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map_or(0, |queue| queue.ready.len())
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state()
            .unacked
            .values()
            .filter(|unacked| unacked.queue == queue)
            .count()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map_or(0, |queue| queue.consumers.len())
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }

    /// Deliveries acknowledged so far, in ack order.
    pub fn acked(&self) -> Vec<Delivery> {
        self.state().acked.clone()
    }

    pub fn connections_opened(&self) -> usize {
        self.state().connections_opened
    }

    pub fn channels_opened(&self) -> usize {
        self.state().channels_opened
    }

    pub fn channels_closed(&self) -> usize {
        self.state().channels_closed
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut state = self.state();

        if !state.available {
            return Err(AmqpError::ConnectionError);
        }

        state.connections_opened += 1;
        debug!("memory broker connection opened");

        Ok(Arc::new(MemoryConnection {
            state: self.state.clone(),
            generation: state.generation,
            open: AtomicBool::new(true),
        }))
    }
}

struct MemoryConnection {
    state: Arc<Mutex<BrokerState>>,
    generation: u64,
    open: AtomicBool,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && lock(&self.state).generation == self.generation
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::ChannelError);
        }

        let mut state = lock(&self.state);
        state.next_channel_id += 1;
        state.channels_opened += 1;

        Ok(Arc::new(MemoryChannel {
            id: state.next_channel_id,
            generation: self.generation,
            state: self.state.clone(),
            open: AtomicBool::new(true),
            prefetch: AtomicU16::new(0),
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryChannel {
    id: u64,
    generation: u64,
    state: Arc<Mutex<BrokerState>>,
    open: AtomicBool,
    prefetch: AtomicU16,
}

impl MemoryChannel {
    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>, AmqpError> {
        let state = lock(&self.state);

        if !self.open.load(Ordering::SeqCst) || state.generation != self.generation {
            return Err(AmqpError::ChannelError);
        }

        Ok(state)
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && lock(&self.state).generation == self.generation
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;

        match state.exchanges.get(&def.name) {
            Some(existing) if existing != def => {
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(def.name.clone(), def.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDeclaration) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;
        let queue = state.queues.entry(def.name.clone()).or_default();

        match &queue.declaration {
            Some(existing) if existing != def => Err(AmqpError::DeclareQueueError(def.name.clone())),
            Some(_) => Ok(()),
            None => {
                queue.declaration = Some(def.clone());
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;

        if !state.exchanges.contains_key(exchange)
            || !state
                .queues
                .get(queue)
                .is_some_and(|queue| queue.declaration.is_some())
        {
            return Err(AmqpError::BindingExchangeToQueueError(
                exchange.to_owned(),
                queue.to_owned(),
            ));
        }

        state.bindings.insert((
            exchange.to_owned(),
            queue.to_owned(),
            routing_key.to_owned(),
        ));

        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;
        let targets = state.route(exchange, routing_key)?;

        state.published.push(PublishedMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            body: body.to_vec(),
            properties: properties.clone(),
        });

        for target in targets {
            let delivery = Delivery {
                delivery_tag: 0,
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                headers: properties.headers.clone(),
                expiration: properties.expiration,
                data: body.to_vec(),
            };

            if let Some(queue) = state.queues.get_mut(&target) {
                queue.ready.push_back(delivery);
            }
            state.dispatch(&target);
        }

        Ok(())
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        drop(self.open_state()?);
        self.prefetch.store(prefetch_count, Ordering::SeqCst);
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.open_state()?;

        let Some(queue_state) = state
            .queues
            .get_mut(queue)
            .filter(|queue| queue.declaration.is_some())
        else {
            return Err(AmqpError::ConsumerDeclarationError);
        };

        if queue_state
            .consumers
            .iter()
            .any(|slot| slot.tag == consumer_tag)
        {
            return Err(AmqpError::ConsumerDeclarationError);
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        queue_state.consumers.push(ConsumerSlot {
            tag: consumer_tag.to_owned(),
            channel_id: self.id,
            prefetch: self.prefetch.load(Ordering::SeqCst),
            in_flight: 0,
            sender,
        });
        state.dispatch(queue);

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver
                .recv()
                .await
                .map(|delivery| (Ok(delivery), receiver))
        })
        .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;

        let Some(unacked) = state.unacked.remove(&delivery_tag) else {
            return Err(AmqpError::AckMessageError);
        };

        state.release_in_flight(&unacked);
        state.acked.push(unacked.delivery.clone());
        state.dispatch(&unacked.queue);

        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;
        let mut found = false;

        for queue in state.queues.values_mut() {
            let before = queue.consumers.len();
            queue
                .consumers
                .retain(|slot| !(slot.tag == consumer_tag && slot.channel_id == self.id));
            if queue.consumers.len() != before {
                found = true;
                queue.next_consumer = 0;
            }
        }

        if !found {
            return Err(AmqpError::CancelConsumerError(consumer_tag.to_owned()));
        }

        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if self.open.swap(false, Ordering::SeqCst) {
            lock(&self.state).close_channel(self.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn channel(broker: &MemoryBroker) -> Arc<dyn BrokerChannel> {
        broker
            .connect()
            .await
            .unwrap()
            .create_channel()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn default_exchange_routes_by_queue_name() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        channel
            .declare_queue(&QueueDeclaration::durable("orders"))
            .await
            .unwrap();

        channel
            .publish("", "orders", b"one", &PublishProperties::default())
            .await
            .unwrap();
        channel
            .publish("", "missing", b"two", &PublishProperties::default())
            .await
            .unwrap();

        assert_eq!(broker.ready_count("orders"), 1);
        assert_eq!(broker.published().len(), 2);
    }

    #[tokio::test]
    async fn exchanges_route_according_to_their_kind() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;

        for queue in ["a", "b"] {
            channel
                .declare_queue(&QueueDeclaration::durable(queue))
                .await
                .unwrap();
        }
        channel
            .declare_exchange(&ExchangeDefinition::new("fan"))
            .await
            .unwrap();
        channel
            .declare_exchange(&ExchangeDefinition::new("topic").topic())
            .await
            .unwrap();
        channel.bind_queue("a", "fan", "").await.unwrap();
        channel.bind_queue("b", "fan", "").await.unwrap();
        channel.bind_queue("a", "topic", "orders.*").await.unwrap();
        channel.bind_queue("b", "topic", "orders.#").await.unwrap();

        let props = PublishProperties::default();
        channel.publish("fan", "", b"x", &props).await.unwrap();
        channel
            .publish("topic", "orders.eu.paid", b"y", &props)
            .await
            .unwrap();

        assert_eq!(broker.ready_count("a"), 1);
        assert_eq!(broker.ready_count("b"), 2);
        assert_eq!(
            channel.publish("nowhere", "", b"z", &props).await,
            Err(AmqpError::PublishingError)
        );
    }

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("orders.*", "orders.paid"));
        assert!(!topic_matches("orders.*", "orders.eu.paid"));
        assert!(topic_matches("orders.#", "orders"));
        assert!(topic_matches("#", "a.b.c"));
        assert!(topic_matches("*.paid", "orders.paid"));
        assert!(!topic_matches("orders.paid", "orders.sent"));
    }

    #[tokio::test]
    async fn redeclaring_with_other_settings_fails() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        let queue = QueueDeclaration::durable("q");

        channel.declare_queue(&queue).await.unwrap();
        channel.declare_queue(&queue).await.unwrap();
        assert!(channel
            .declare_queue(&QueueDeclaration {
                durable: false,
                ..queue
            })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn prefetch_bounds_unacked_deliveries() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        channel
            .declare_queue(&QueueDeclaration::durable("q"))
            .await
            .unwrap();
        for _ in 0..3 {
            channel
                .publish("", "q", b"m", &PublishProperties::default())
                .await
                .unwrap();
        }

        channel.qos(2).await.unwrap();
        let mut deliveries = channel.consume("q", "c1").await.unwrap();

        let first = deliveries.next().await.unwrap().unwrap();
        deliveries.next().await.unwrap().unwrap();
        assert_eq!(broker.unacked_count("q"), 2);
        assert_eq!(broker.ready_count("q"), 1);

        channel.ack(first.delivery_tag).await.unwrap();
        deliveries.next().await.unwrap().unwrap();

        assert_eq!(broker.ready_count("q"), 0);
        assert_eq!(broker.acked().len(), 1);
        assert!(channel.ack(first.delivery_tag).await.is_err());
    }

    #[tokio::test]
    async fn closing_a_channel_requeues_unacked_deliveries() {
        let broker = MemoryBroker::new();
        let consumer = channel(&broker).await;
        consumer
            .declare_queue(&QueueDeclaration::durable("q"))
            .await
            .unwrap();
        let mut deliveries = consumer.consume("q", "c1").await.unwrap();

        let publisher = channel(&broker).await;
        publisher
            .publish("", "q", b"m", &PublishProperties::default())
            .await
            .unwrap();
        deliveries.next().await.unwrap().unwrap();

        consumer.close().await.unwrap();

        assert_eq!(broker.ready_count("q"), 1);
        assert_eq!(broker.consumer_count("q"), 0);
        assert!(deliveries.next().await.is_none());
    }

    #[tokio::test]
    async fn dropped_connections_invalidate_channels() {
        let broker = MemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        let channel = conn.create_channel().await.unwrap();

        broker.drop_connections();

        assert!(!conn.is_open());
        assert!(!channel.is_open());
        assert!(broker.connect().await.unwrap().is_open());

        broker.set_available(false);
        assert!(broker.connect().await.is_err());
    }
}
