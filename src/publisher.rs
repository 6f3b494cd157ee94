// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Envelope Publisher
//!
//! All publishes of a client go through one [`BusPublisher`]. Broker channels
//! do not support concurrent writers, so a single async lock guards the
//! publish channel; whichever task publishes waits for its turn. The trace
//! context of the caller is propagated in the message headers.
//!
//! An envelope is published to the exchange and routing key recorded in its
//! own properties, so re-publishing a received envelope sends it back where
//! it came from.

use crate::{
    connection::ConnectionManager,
    envelope::Envelope,
    errors::{AmqpError, BusError},
    exchange::ExchangeDefinition,
    otel,
    transport::{BrokerChannel, PublishProperties},
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{collections::HashSet, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, error};

/// Puts envelopes on the wire.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EnvelopePublisher: Send + Sync {
    /// Publishes `envelope` to its `exchange_name` with its `queue_name` as
    /// routing key. `ttl` bounds how long the broker keeps it undelivered.
    async fn publish(&self, envelope: &Envelope, ttl: Option<Duration>) -> Result<(), BusError>;
}

#[derive(Default)]
struct PublishChannel {
    channel: Option<Arc<dyn BrokerChannel>>,
    declared: HashSet<ExchangeDefinition>,
}

/// The publisher of a client, serializing every publish.
pub struct BusPublisher {
    connection: Arc<ConnectionManager>,
    state: Mutex<PublishChannel>,
}

impl BusPublisher {
    pub fn new(connection: Arc<ConnectionManager>) -> Arc<BusPublisher> {
        Arc::new(BusPublisher {
            connection,
            state: Mutex::new(PublishChannel::default()),
        })
    }

    /// Declares `def` once per publish channel.
    pub async fn ensure_exchange(&self, def: &ExchangeDefinition) -> Result<(), BusError> {
        let mut state = self.state.lock().await;
        let channel = self.channel(&mut state).await?;

        if state.declared.contains(def) {
            return Ok(());
        }

        debug!("creating exchange: {}", def.name());

        if let Err(err) = channel.declare_exchange(def).await {
            error!(
                error = err.to_string(),
                name = def.name(),
                "error to declare the exchange"
            );
            return Err(err.into());
        }

        state.declared.insert(def.clone());
        Ok(())
    }

    /// Binds `queue` to `exchange` with `routing_key` over the publish
    /// channel.
    pub async fn bind(&self, exchange: &str, queue: &str, routing_key: &str) -> Result<(), BusError> {
        let mut state = self.state.lock().await;
        let channel = self.channel(&mut state).await?;

        channel
            .bind_queue(queue, exchange, routing_key)
            .await
            .map_err(BusError::from)
    }

    /// Closes the publish channel. The next publish opens a new one.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.declared.clear();

        if let Some(channel) = state.channel.take() {
            if channel.is_open() {
                if let Err(err) = channel.close().await {
                    error!(error = err.to_string(), "error to close the publish channel");
                }
            }
        }
    }

    async fn channel(
        &self,
        state: &mut PublishChannel,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if let Some(channel) = state.channel.as_ref().filter(|c| c.is_open()) {
            return Ok(channel.clone());
        }

        state.declared.clear();
        let channel = self.connection.create_channel().await?;
        state.channel = Some(channel.clone());

        Ok(channel)
    }
}

#[async_trait]
impl EnvelopePublisher for BusPublisher {
    async fn publish(&self, envelope: &Envelope, ttl: Option<Duration>) -> Result<(), BusError> {
        let body = envelope.to_bytes()?;
        let properties = PublishProperties {
            message_id: Some(envelope.message_id.to_string()),
            kind: Some(envelope.message_type.clone()),
            expiration: ttl,
            headers: otel::inject(&Context::current()),
        };

        let mut state = self.state.lock().await;
        let channel = self.channel(&mut state).await?;

        let exchange = envelope.properties.exchange_name.as_str();
        let routing_key = envelope.properties.queue_name.as_str();

        match channel
            .publish(exchange, routing_key, &body, &properties)
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange, routing_key, "error publishing message"
                );
                // a failed publish may have killed the channel
                state.channel = None;
                Err(err.into())
            }
            _ => {
                debug!(
                    exchange,
                    routing_key,
                    message_type = envelope.message_type.as_str(),
                    "message published"
                );
                Ok(())
            }
        }
    }
}
