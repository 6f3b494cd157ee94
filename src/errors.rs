// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Service Bus
//!
//! Two layers of errors live here. `AmqpError` describes what went wrong while
//! talking to the broker (connection, channel, declaration, publish, ack...).
//! `BusError` is the service bus taxonomy surfaced to applications: envelope,
//! routing, handler, RPC and configuration failures, with transport failures
//! wrapped as `BusError::Transport`.
//!
//! Per-message failures that do not reach a caller are reported as a
//! [`BusException`] through the client exception callback.

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error closing a channel or a connection
    #[error("failure to close `{0}`")]
    CloseError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("consumer declaration error")]
    ConsumerDeclarationError,

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

/// Errors surfaced by the service bus runtime.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The broker transport failed and could not recover.
    #[error(transparent)]
    Transport(#[from] AmqpError),

    /// The delivery body is not a valid envelope.
    #[error("malformed envelope: {0}")]
    Envelope(String),

    /// There is no handler able to act on the payload type.
    #[error("no handler registered for message type `{0}`")]
    Routing(String),

    /// A user handler failed.
    #[error("handler failure: {0}")]
    Handler(String),

    /// No correlated reply arrived before the caller gave up.
    #[error("rpc request `{request_id}` timed out after {timeout:?}")]
    RpcTimeout { request_id: Uuid, timeout: Duration },

    /// The remote side answered with an error.
    #[error("rpc request failed remotely: {0}")]
    Rpc(String),

    /// The reply carried a different result type than the caller expected.
    #[error("unexpected rpc response type: expected `{expected}`, received `{received}`")]
    ResponseType { expected: String, received: String },

    /// A request id is already awaiting a reply.
    #[error("a reply is already registered for request `{0}`")]
    DuplicateRequest(Uuid),

    /// A reply arrived for a request nobody is waiting for.
    #[error("no pending request for rpc reply `{0}`")]
    OrphanedReply(Uuid),

    /// The pending request was dropped before any reply arrived.
    #[error("rpc request `{0}` was cancelled")]
    Cancelled(Uuid),

    /// Invalid setup, rejected before anything runs.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Payload (de)serialization failure.
    #[error("serialization failure: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::Serialization(err.to_string())
    }
}

/// A failure that happened away from any caller, with enough context to
/// reproduce it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (exchange: `{exchange}`, queue: `{queue}`)")]
pub struct BusException {
    pub message: String,
    pub raw_message: Option<String>,
    pub exchange: String,
    pub queue: String,
    #[source]
    pub source: BusError,
}

impl BusException {
    pub fn new(message: &str, exchange: &str, queue: &str, source: BusError) -> Self {
        BusException {
            message: message.to_owned(),
            raw_message: None,
            exchange: exchange.to_owned(),
            queue: queue.to_owned(),
            source,
        }
    }

    pub fn with_raw_message(mut self, raw: impl Into<String>) -> Self {
        self.raw_message = Some(raw.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_convert_into_bus_errors() {
        let err: BusError = AmqpError::PublishingError.into();
        assert_eq!(err, BusError::Transport(AmqpError::PublishingError));
        assert_eq!(err.to_string(), "failure to publish");
    }

    #[test]
    fn exception_keeps_the_failure_context() {
        let exc = BusException::new(
            "cannot parse",
            "orders",
            "billing",
            BusError::Envelope("eof".to_owned()),
        )
        .with_raw_message("{");

        assert_eq!(exc.raw_message.as_deref(), Some("{"));
        assert!(exc.to_string().contains("billing"));
        assert_eq!(
            std::error::Error::source(&exc).map(|s| s.to_string()),
            Some("malformed envelope: eof".to_owned())
        );
    }
}
