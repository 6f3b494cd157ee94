// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Configuration
//!
//! A [`QueueConfiguration`] describes one consumed queue: its name, the
//! handlers registered for it, how many deliveries may be in flight, how many
//! times a failing message is retried and the optional broker-side expiry
//! settings. It is built once while configuring the client and never changes
//! afterwards.

use crate::{
    errors::BusError,
    handler::{HandlerRegistry, OnQueueException},
};
use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

/// Queue argument carrying the per-message time to live
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Queue argument carrying the idle time before the queue is deleted
pub const AMQP_HEADERS_EXPIRES: &str = "x-expires";

/// Largest duration the broker accepts for `x-message-ttl` / `x-expires`.
const MAX_ARGUMENT_MILLIS: u128 = i32::MAX as u128;

/// What gets declared on the broker for a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclaration {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub message_ttl: Option<Duration>,
    pub expires: Option<Duration>,
}

impl QueueDeclaration {
    pub fn durable(name: &str) -> QueueDeclaration {
        QueueDeclaration {
            name: name.to_owned(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            message_ttl: None,
            expires: None,
        }
    }

    /// Declaration arguments in milliseconds, keyed by their AMQP name.
    pub fn arguments(&self) -> BTreeMap<&'static str, i32> {
        let mut args = BTreeMap::new();

        if let Some(ttl) = self.message_ttl {
            args.insert(AMQP_HEADERS_MESSAGE_TTL, ttl.as_millis() as i32);
        }

        if let Some(expires) = self.expires {
            args.insert(AMQP_HEADERS_EXPIRES, expires.as_millis() as i32);
        }

        args
    }
}

/// Settings of one consumed queue.
///
/// ```
/// use servicebus::queue::QueueConfiguration;
/// use std::time::Duration;
///
/// let queue = QueueConfiguration::new()
///     .with_queue_name("calc")
///     .unwrap()
///     .with_concurrency_limit(3)
///     .with_retry_limit(5)
///     .with_idle_timeout(Duration::from_secs(600))
///     .unwrap();
///
/// assert_eq!(queue.queue_name(), Some("calc"));
/// ```
#[derive(Clone, Default)]
pub struct QueueConfiguration {
    pub(crate) queue_name: Option<String>,
    pub(crate) concurrency_limit: Option<u16>,
    pub(crate) retry_limit: u32,
    pub(crate) exception_handler: Option<OnQueueException>,
    pub(crate) handlers: HandlerRegistry,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) default_message_expiration: Option<Duration>,
    pub(crate) custom_exchange_bindings: Vec<String>,
    pub(crate) routing_key: String,
}

impl QueueConfiguration {
    /// A queue without name; the client assigns its default request queue.
    pub fn new() -> QueueConfiguration {
        QueueConfiguration::default()
    }

    pub fn queue_name(&self) -> Option<&str> {
        self.queue_name.as_deref()
    }

    pub fn with_queue_name(mut self, name: &str) -> Result<Self, BusError> {
        if name.trim().is_empty() {
            return Err(BusError::Configuration(
                "the queue name cannot be empty".to_owned(),
            ));
        }

        self.queue_name = Some(name.to_owned());
        Ok(self)
    }

    /// Maximum number of unacknowledged deliveries processed at once.
    pub fn with_concurrency_limit(mut self, limit: u16) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    /// A failing message is re-published while its retry count stays below
    /// `limit`, then dropped.
    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit;
        self
    }

    pub fn with_error_handling(mut self, handler: OnQueueException) -> Self {
        self.exception_handler = Some(handler);
        self
    }

    /// Registers the queue handlers. Duplicate registrations fail here.
    pub fn with_handlers<F>(mut self, register: F) -> Result<Self, BusError>
    where
        F: FnOnce(&mut HandlerRegistry) -> Result<(), BusError>,
    {
        let mut handlers = HandlerRegistry::default();
        register(&mut handlers)?;
        self.handlers = handlers;
        Ok(self)
    }

    /// How long the queue may stay unused before the broker deletes it.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Result<Self, BusError> {
        if timeout < Duration::from_secs(1) {
            return Err(BusError::Configuration(
                "the idle timeout must be at least one second".to_owned(),
            ));
        }

        if timeout.as_millis() > MAX_ARGUMENT_MILLIS {
            return Err(BusError::Configuration(format!(
                "the idle timeout cannot be greater than {MAX_ARGUMENT_MILLIS} ms"
            )));
        }

        self.idle_timeout = Some(timeout);
        Ok(self)
    }

    /// How long a message may wait in the queue before it is dead.
    pub fn with_default_message_expiration(
        mut self,
        expiration: Duration,
    ) -> Result<Self, BusError> {
        if expiration.is_zero() {
            return Err(BusError::Configuration(
                "the default message expiration must be greater than 0".to_owned(),
            ));
        }

        if expiration.as_millis() > MAX_ARGUMENT_MILLIS {
            return Err(BusError::Configuration(format!(
                "the default message expiration cannot be greater than {MAX_ARGUMENT_MILLIS} ms"
            )));
        }

        self.default_message_expiration = Some(expiration);
        Ok(self)
    }

    pub fn with_custom_exchange_bindings(mut self, exchanges: &[&str]) -> Self {
        for exchange in exchanges {
            if !self.custom_exchange_bindings.iter().any(|e| e == *exchange) {
                self.custom_exchange_bindings.push((*exchange).to_owned());
            }
        }
        self
    }

    /// Routing key used when binding the custom exchanges.
    pub fn with_routing_key(mut self, routing_key: &str) -> Self {
        self.routing_key = routing_key.to_owned();
        self
    }

    pub(crate) fn declaration(&self, name: &str) -> QueueDeclaration {
        QueueDeclaration {
            message_ttl: self.default_message_expiration,
            expires: self.idle_timeout,
            ..QueueDeclaration::durable(name)
        }
    }
}

impl fmt::Debug for QueueConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueConfiguration")
            .field("queue_name", &self.queue_name)
            .field("concurrency_limit", &self.concurrency_limit)
            .field("retry_limit", &self.retry_limit)
            .field("handlers", &self.handlers)
            .field("idle_timeout", &self.idle_timeout)
            .field("default_message_expiration", &self.default_message_expiration)
            .field("custom_exchange_bindings", &self.custom_exchange_bindings)
            .field("routing_key", &self.routing_key)
            .finish()
    }
}

/// A fully resolved queue configuration, shared by a pipeline and its
/// consumer.
#[derive(Clone)]
pub(crate) struct QueueSettings {
    pub name: String,
    pub concurrency_limit: u16,
    pub retry_limit: u32,
    pub exception_handler: Option<OnQueueException>,
    pub declaration: QueueDeclaration,
    pub custom_exchange_bindings: Vec<String>,
    pub routing_key: String,
}

impl QueueSettings {
    pub fn resolve(
        config: &QueueConfiguration,
        default_name: &str,
        default_concurrency: u16,
    ) -> Arc<QueueSettings> {
        let name = config
            .queue_name
            .clone()
            .unwrap_or_else(|| default_name.to_owned());

        Arc::new(QueueSettings {
            concurrency_limit: config.concurrency_limit.unwrap_or(default_concurrency),
            retry_limit: config.retry_limit,
            exception_handler: config.exception_handler.clone(),
            declaration: config.declaration(&name),
            custom_exchange_bindings: config.custom_exchange_bindings.clone(),
            routing_key: config.routing_key.clone(),
            name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_queue_names_are_rejected() {
        assert!(QueueConfiguration::new().with_queue_name("").is_err());
        assert!(QueueConfiguration::new().with_queue_name("  ").is_err());
    }

    #[test]
    fn expiry_settings_are_validated() {
        assert!(QueueConfiguration::new()
            .with_idle_timeout(Duration::from_millis(999))
            .is_err());
        assert!(QueueConfiguration::new()
            .with_idle_timeout(Duration::from_millis(i32::MAX as u64 + 1))
            .is_err());
        assert!(QueueConfiguration::new()
            .with_default_message_expiration(Duration::ZERO)
            .is_err());
        assert!(QueueConfiguration::new()
            .with_default_message_expiration(Duration::from_secs(5))
            .is_ok());
    }

    #[test]
    fn declaration_carries_the_expiry_arguments() {
        let config = QueueConfiguration::new()
            .with_idle_timeout(Duration::from_secs(360))
            .unwrap()
            .with_default_message_expiration(Duration::from_secs(2))
            .unwrap();

        let declaration = config.declaration("orders");
        let args = declaration.arguments();

        assert!(declaration.durable);
        assert_eq!(args.get(AMQP_HEADERS_EXPIRES), Some(&360_000));
        assert_eq!(args.get(AMQP_HEADERS_MESSAGE_TTL), Some(&2_000));
        assert!(QueueDeclaration::durable("q").arguments().is_empty());
    }

    #[test]
    fn settings_fall_back_to_client_defaults() {
        let settings = QueueSettings::resolve(&QueueConfiguration::new(), "me||Requests", 5);
        assert_eq!(settings.name, "me||Requests");
        assert_eq!(settings.concurrency_limit, 5);

        let config = QueueConfiguration::new()
            .with_queue_name("calc")
            .unwrap()
            .with_concurrency_limit(2)
            .with_custom_exchange_bindings(&["audit", "audit", "ops"])
            .with_routing_key("calc.#");
        let settings = QueueSettings::resolve(&config, "me||Requests", 5);

        assert_eq!(settings.name, "calc");
        assert_eq!(settings.concurrency_limit, 2);
        assert_eq!(settings.custom_exchange_bindings, vec!["audit", "ops"]);
        assert_eq!(settings.routing_key, "calc.#");
    }
}
