// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # servicebus
//!
//! A service bus on top of AMQP: typed messages published to per-type fanout
//! exchanges or sent to queues, concurrency-limited consumers with retries,
//! and request/response over a per-client reply queue.
//!
//! Start with [`ServiceBusConfiguration`] and [`ServiceBus`].

mod consumer;
mod dispatcher;
mod otel;
mod pipeline;

pub mod amqp;
pub mod channel;
pub mod client;
pub mod configs;
pub mod connection;
pub mod envelope;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod memory;
pub mod naming;
pub mod publisher;
pub mod queue;
pub mod rpc;
pub mod topology;
pub mod transport;

pub use client::ServiceBus;
pub use configs::{ConnectionConfiguration, OnException, ServiceBusConfiguration};
pub use envelope::{AnyMessage, BusMessage, Envelope, RpcResult};
pub use errors::{AmqpError, BusError, BusException};
pub use exchange::{ExchangeDefinition, ExchangeKind};
pub use handler::{HandlerError, HandlerRegistry, HandlerResult, OnQueueException};
pub use memory::MemoryBroker;
pub use queue::QueueConfiguration;
