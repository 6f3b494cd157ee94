// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! A topology is the set of queues, exchanges and queue-to-exchange bindings
//! a pipeline needs on the broker. Installing it is idempotent: declaring an
//! existing queue or exchange with the same arguments, or binding an already
//! bound pair, leaves the broker unchanged.
//!
//! Installation order:
//! 1. Queues (a failure here usually means the queue already exists with
//!    different arguments)
//! 2. Exchanges
//! 3. Queue-to-exchange bindings

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    handler::HandlerRegistry,
    naming,
    queue::{QueueDeclaration, QueueSettings},
    transport::BrokerChannel,
};
use tracing::{debug, error};

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a binding of `queue` with an empty exchange and routing key.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}

/// The broker objects a pipeline declares before consuming.
#[derive(Debug, Clone, Default)]
pub struct AmqpTopology {
    pub(crate) queues: Vec<QueueDeclaration>,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl AmqpTopology {
    pub fn new() -> AmqpTopology {
        AmqpTopology::default()
    }

    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        if !self.exchanges.contains(&def) {
            self.exchanges.push(def);
        }
        self
    }

    pub fn queue(mut self, def: QueueDeclaration) -> Self {
        self.queues.push(def);
        self
    }

    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        if !self.queues_binding.contains(&binding) {
            self.queues_binding.push(binding);
        }
        self
    }

    /// Topology of a consumed queue: the durable queue, one fanout exchange
    /// per handled message type bound to it, and the custom exchange bindings.
    pub(crate) fn for_queue(settings: &QueueSettings, handlers: &HandlerRegistry) -> AmqpTopology {
        let mut topology = AmqpTopology::new().queue(settings.declaration.clone());

        let mut message_types: Vec<&str> = handlers.message_types().collect();
        message_types.sort_unstable();

        for message_type in message_types {
            let exchange_name = naming::exchange_name(message_type);
            topology = topology
                .queue_binding(QueueBinding::new(&settings.name).exchange(&exchange_name))
                .exchange(ExchangeDefinition::for_message_type(exchange_name));
        }

        for exchange in &settings.custom_exchange_bindings {
            topology = topology.queue_binding(
                QueueBinding::new(&settings.name)
                    .exchange(exchange)
                    .routing_key(&settings.routing_key),
            );
        }

        topology
    }

    /// Installs the topology on the broker.
    pub async fn install(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        self.install_queue(channel).await?;
        self.install_exchange(channel).await?;
        self.binding_queues(channel).await
    }

    async fn install_queue(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name);

            if let Err(err) = channel.declare_queue(def).await {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the queue"
                );
                return Err(err);
            }

            debug!("queue: {} was created", def.name);
        }

        Ok(())
    }

    async fn install_exchange(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);

            if let Err(err) = channel.declare_exchange(exch).await {
                error!(
                    error = err.to_string(),
                    name = exch.name.as_str(),
                    "error to declare the exchange"
                );
                return Err(err);
            }

            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    async fn binding_queues(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );

            if let Err(err) = channel
                .bind_queue(
                    &binding.queue_name,
                    &binding.exchange_name,
                    &binding.routing_key,
                )
                .await
            {
                error!(error = err.to_string(), "error to bind queue to exchange");
                return Err(err);
            }
        }

        debug!("queue was bounded");

        Ok(())
    }
}
