// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Exchanges are the routing mechanism of the broker. The service bus declares
//! one durable fanout exchange per handled message type (see
//! [`crate::naming::exchange_name`]); applications may also declare custom
//! exchanges of any kind and bind queues to them.

use crate::errors::BusError;

/// Represents the types of exchanges available in RabbitMQ.
///
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    Direct,
    #[default]
    Fanout,
    Topic,
    Headers,
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// Definition of an exchange with its declaration flags.
///
/// Built with chained calls:
///
/// ```
/// use servicebus::exchange::ExchangeDefinition;
///
/// let audit = ExchangeDefinition::new("audit").topic().durable();
/// assert_eq!(audit.name(), "audit");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
}

impl ExchangeDefinition {
    /// Creates a non-durable fanout exchange definition.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Fanout,
            durable: false,
            delete: false,
        }
    }

    /// The exchange used to broadcast messages of one type.
    pub(crate) fn for_message_type(name: String) -> ExchangeDefinition {
        ExchangeDefinition {
            name,
            kind: ExchangeKind::Fanout,
            durable: true,
            delete: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn direct(self) -> Self {
        self.kind(ExchangeKind::Direct)
    }

    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    pub fn topic(self) -> Self {
        self.kind(ExchangeKind::Topic)
    }

    pub fn headers(self) -> Self {
        self.kind(ExchangeKind::Headers)
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), BusError> {
        if self.name.trim().is_empty() {
            return Err(BusError::Configuration(
                "the exchange name cannot be empty".to_owned(),
            ));
        }

        Ok(())
    }
}
