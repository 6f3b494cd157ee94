// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Interface
//!
//! The service bus only needs a handful of broker primitives: connect, open a
//! channel, declare fanout exchanges and durable queues, bind, publish,
//! consume with a prefetch limit, ack and cancel. They are modelled here as
//! three object-safe traits so that the runtime can run against RabbitMQ
//! (see [`crate::amqp`]) or the in-process broker (see [`crate::memory`]).

use crate::{errors::AmqpError, exchange::ExchangeDefinition, queue::QueueDeclaration};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::BTreeMap, sync::Arc, time::Duration};

/// Message headers, used to carry trace context.
pub type Headers = BTreeMap<String, String>;

/// Push-style stream of deliveries produced by [`BrokerChannel::consume`].
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// A message handed over by the broker, not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub headers: Headers,
    /// Per-message TTL the message was published with.
    pub expiration: Option<Duration>,
    pub data: Vec<u8>,
}

/// Per-publish properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishProperties {
    pub message_id: Option<String>,
    pub kind: Option<String>,
    pub expiration: Option<Duration>,
    pub headers: Headers,
}

/// Opens broker connections.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_open(&self) -> bool;

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A broker channel. Implementations are not required to support
/// concurrent publishers; callers serialize publishes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn declare_exchange(&self, definition: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<(), AmqpError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), AmqpError>;

    /// Limits the unacknowledged deliveries the broker pushes on this channel.
    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}
