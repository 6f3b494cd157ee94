// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Request / Response over the Bus
//!
//! A request travels as an [`RpcRequest`] envelope sent straight to the
//! target queue. Every consumed queue carries an implicit handler for that
//! type which looks up the RPC handler of the inner payload, runs it and
//! answers the requesting client on its reply queue with an [`RpcResponse`]
//! or an [`RpcError`].
//!
//! The requesting side keeps its outstanding requests in an
//! [`RpcCorrelator`]. Each pending entry is resolved exactly once, by the
//! first of reply, error or timeout. The entry is gone afterwards, so a reply
//! arriving late is reported as orphaned.

use crate::{
    configs::OnException,
    envelope::{AnyMessage, BusMessage, Envelope, RpcResult},
    errors::{BusError, BusException},
    handler::{HandlerError, HandlerRegistry, HandlerResult, MessageHandler},
    naming,
    publisher::EnvelopePublisher,
};
use chrono::{DateTime, Utc};
use futures_util::future::{self, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::{
    borrow::Cow,
    collections::HashMap,
    fmt,
    future::Future,
    marker::PhantomData,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};
use uuid::Uuid;

pub const RPC_REQUEST_TAG: &str = "ServiceBus.Rpc.RpcRequest";
pub const RPC_RESPONSE_TAG: &str = "ServiceBus.Rpc.RpcResponse";
pub const RPC_ERROR_TAG: &str = "ServiceBus.Rpc.RpcError";

/// How long an unclaimed reply stays in the requester's reply queue.
pub const RPC_REPLY_EXPIRATION: Duration = Duration::from_secs(600);

/// Correlation data copied from a request into its reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcProperties {
    pub request_id: Uuid,
    pub client_name: String,
    pub request_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest {
    /// The request id, taken from the wrapped message.
    pub message_id: Uuid,
    /// Type tag of the wrapped message.
    pub message_type: String,
    pub json_message: String,
    pub client_name: String,
    pub request_date: DateTime<Utc>,
}

impl RpcRequest {
    pub fn new<T: BusMessage>(message: &T, client_name: &str) -> Result<RpcRequest, BusError> {
        Ok(RpcRequest {
            message_id: message.message_id(),
            message_type: T::type_tag().into_owned(),
            json_message: serde_json::to_string(message)?,
            client_name: client_name.to_owned(),
            request_date: Utc::now(),
        })
    }

    fn properties(&self) -> RpcProperties {
        RpcProperties {
            request_id: self.message_id,
            client_name: self.client_name.clone(),
            request_date: self.request_date,
        }
    }
}

impl BusMessage for RpcRequest {
    fn message_id(&self) -> Uuid {
        self.message_id
    }

    fn type_tag() -> Cow<'static, str> {
        Cow::Borrowed(RPC_REQUEST_TAG)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResponse {
    pub message_id: Uuid,
    /// Type tag of the result.
    pub message_type: String,
    pub json_message: String,
    pub request: RpcProperties,
}

impl BusMessage for RpcResponse {
    fn message_id(&self) -> Uuid {
        self.message_id
    }

    fn type_tag() -> Cow<'static, str> {
        Cow::Borrowed(RPC_RESPONSE_TAG)
    }
}

/// Why a request could not be answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcFault {
    pub message: String,
    pub kind: String,
}

impl RpcFault {
    pub const ROUTING: &'static str = "Routing";
    pub const SERIALIZATION: &'static str = "Serialization";
    pub const HANDLER: &'static str = "Handler";

    pub fn new(kind: &str, message: impl Into<String>) -> RpcFault {
        RpcFault {
            message: message.into(),
            kind: kind.to_owned(),
        }
    }
}

impl fmt::Display for RpcFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcError {
    pub message_id: Uuid,
    pub error: RpcFault,
    pub request: RpcProperties,
}

impl BusMessage for RpcError {
    fn message_id(&self) -> Uuid {
        self.message_id
    }

    fn type_tag() -> Cow<'static, str> {
        Cow::Borrowed(RPC_ERROR_TAG)
    }
}

/// What a pending request is resolved with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcReply {
    Response(RpcResponse),
    Error(RpcError),
}

impl RpcReply {
    pub fn request_id(&self) -> Uuid {
        match self {
            RpcReply::Response(response) => response.request.request_id,
            RpcReply::Error(error) => error.request.request_id,
        }
    }

    /// Decodes the result as `T`, failing on remote errors and on result
    /// type mismatches.
    pub fn into_result<T: RpcResult>(self) -> Result<T, BusError> {
        match self {
            RpcReply::Error(error) => Err(BusError::Rpc(error.error.to_string())),
            RpcReply::Response(response) => {
                let expected = T::type_tag();
                if response.message_type != expected {
                    return Err(BusError::ResponseType {
                        expected: expected.into_owned(),
                        received: response.message_type,
                    });
                }

                Ok(serde_json::from_str(&response.json_message)?)
            }
        }
    }
}

type PendingTable = HashMap<Uuid, oneshot::Sender<RpcReply>>;

/// Outstanding requests of a client, keyed by request id.
#[derive(Default)]
pub struct RpcCorrelator {
    pending: Mutex<PendingTable>,
}

/// Removes the pending entry when the waiting caller goes away.
struct PendingGuard<'a> {
    correlator: &'a RpcCorrelator,
    request_id: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.lock().remove(&self.request_id);
    }
}

impl RpcCorrelator {
    pub fn new() -> Arc<RpcCorrelator> {
        Arc::new(RpcCorrelator::default())
    }

    fn lock(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `request_id`, runs `publish` and waits for the correlated
    /// reply for at most `timeout`.
    pub async fn issue_request<T, F>(
        &self,
        request_id: Uuid,
        timeout: Duration,
        publish: F,
    ) -> Result<T, BusError>
    where
        T: RpcResult,
        F: Future<Output = Result<(), BusError>>,
    {
        if timeout.is_zero() {
            return Err(BusError::Configuration(
                "the rpc timeout must be greater than 0".to_owned(),
            ));
        }

        let receiver = {
            let mut pending = self.lock();
            if pending.contains_key(&request_id) {
                return Err(BusError::DuplicateRequest(request_id));
            }

            let (sender, receiver) = oneshot::channel();
            pending.insert(request_id, sender);
            receiver
        };
        let _guard = PendingGuard {
            correlator: self,
            request_id,
        };

        if let Err(err) = publish.await {
            error!(
                error = err.to_string(),
                request_id = request_id.to_string(),
                "error to publish the rpc request"
            );
            return Err(err);
        }

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(reply)) => reply.into_result(),
            Ok(Err(_)) => Err(BusError::Cancelled(request_id)),
            Err(_) => {
                warn!(request_id = request_id.to_string(), "rpc request timed out");
                Err(BusError::RpcTimeout {
                    request_id,
                    timeout,
                })
            }
        }
    }

    /// Resolves the pending request `reply` belongs to.
    pub fn complete_reply(&self, reply: RpcReply) -> Result<(), BusError> {
        let request_id = reply.request_id();

        let Some(sender) = self.lock().remove(&request_id) else {
            return Err(BusError::OrphanedReply(request_id));
        };

        sender
            .send(reply)
            .map_err(|_| BusError::OrphanedReply(request_id))
    }

    /// Number of requests waiting for a reply.
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Drops every pending request; their callers get
    /// [`BusError::Cancelled`].
    pub fn shutdown(&self) {
        let dropped = std::mem::take(&mut *self.lock());
        if !dropped.is_empty() {
            debug!(pending = dropped.len(), "dropping pending rpc requests");
        }
    }
}

/// Implicit handler answering [`RpcRequest`]s with the queue's RPC handlers.
pub(crate) struct RpcRequestHandler {
    handlers: HandlerRegistry,
    publisher: Arc<dyn EnvelopePublisher>,
    client_name: String,
}

impl RpcRequestHandler {
    pub fn new(
        handlers: HandlerRegistry,
        publisher: Arc<dyn EnvelopePublisher>,
        client_name: &str,
    ) -> Arc<RpcRequestHandler> {
        Arc::new(RpcRequestHandler {
            handlers,
            publisher,
            client_name: client_name.to_owned(),
        })
    }
}

impl MessageHandler for RpcRequestHandler {
    fn decode(&self, json_message: &str) -> Result<Box<dyn AnyMessage>, BusError> {
        let request: RpcRequest = serde_json::from_str(json_message)?;
        Ok(Box::new(request))
    }

    fn handle(&self, message: &dyn AnyMessage) -> BoxFuture<'static, HandlerResult> {
        let Some(request) = message.as_any().downcast_ref::<RpcRequest>().cloned() else {
            let err = format!("message `{}` is not a rpc request", message.tag());
            return future::ready(Err(err.into())).boxed();
        };

        let call = match self.handlers.rpc_handler(&request.message_type) {
            None => Err(RpcFault::new(
                RpcFault::ROUTING,
                format!("no rpc handler registered for `{}`", request.message_type),
            )),
            Some(handler) => handler
                .call(&request.json_message)
                .map_err(|err| RpcFault::new(RpcFault::SERIALIZATION, err.to_string())),
        };

        let publisher = self.publisher.clone();
        let client_name = self.client_name.clone();

        async move {
            let result = match call {
                Ok(fut) => fut
                    .await
                    .map_err(|err| RpcFault::new(RpcFault::HANDLER, err.to_string())),
                Err(fault) => Err(fault),
            };

            let reply_queue = naming::rpc_reply_queue(&request.client_name);
            let envelope = match result {
                Ok(output) => Envelope::wrap(
                    &RpcResponse {
                        message_id: Uuid::new_v4(),
                        message_type: output.message_type,
                        json_message: output.json_message,
                        request: request.properties(),
                    },
                    "",
                    &reply_queue,
                    &client_name,
                )?,
                Err(fault) => {
                    warn!(
                        error = fault.to_string(),
                        request_id = request.message_id.to_string(),
                        "rpc request failed"
                    );
                    Envelope::wrap(
                        &RpcError {
                            message_id: Uuid::new_v4(),
                            error: fault,
                            request: request.properties(),
                        },
                        "",
                        &reply_queue,
                        &client_name,
                    )?
                }
            };

            publisher
                .publish(&envelope, Some(RPC_REPLY_EXPIRATION))
                .await
                .map_err(HandlerError::from)
        }
        .boxed()
    }
}

/// Handler of the reply queue, completing pending requests with the
/// [`RpcResponse`]s or [`RpcError`]s it receives.
pub(crate) struct RpcReplyHandler<T> {
    correlator: Arc<RpcCorrelator>,
    on_exception: OnException,
    reply_queue: String,
    _reply: PhantomData<fn() -> T>,
}

impl<T> RpcReplyHandler<T> {
    pub fn new(
        correlator: Arc<RpcCorrelator>,
        on_exception: OnException,
        reply_queue: &str,
    ) -> Arc<RpcReplyHandler<T>> {
        Arc::new(RpcReplyHandler {
            correlator,
            on_exception,
            reply_queue: reply_queue.to_owned(),
            _reply: PhantomData,
        })
    }
}

impl<T> MessageHandler for RpcReplyHandler<T>
where
    T: BusMessage + Into<RpcReply>,
{
    fn decode(&self, json_message: &str) -> Result<Box<dyn AnyMessage>, BusError> {
        let reply: T = serde_json::from_str(json_message)?;
        Ok(Box::new(reply))
    }

    fn handle(&self, message: &dyn AnyMessage) -> BoxFuture<'static, HandlerResult> {
        let Some(reply) = message.as_any().downcast_ref::<T>().cloned() else {
            let err = format!("message `{}` is not a rpc reply", message.tag());
            return future::ready(Err(err.into())).boxed();
        };

        if let Err(err) = self.correlator.complete_reply(reply.into()) {
            warn!(error = err.to_string(), "rpc reply without pending request");
            (self.on_exception)(&BusException::new(
                "rpc reply without pending request",
                "",
                &self.reply_queue,
                err,
            ));
        }

        future::ready(Ok(())).boxed()
    }
}

impl From<RpcResponse> for RpcReply {
    fn from(response: RpcResponse) -> Self {
        RpcReply::Response(response)
    }
}

impl From<RpcError> for RpcReply {
    fn from(error: RpcError) -> Self {
        RpcReply::Error(error)
    }
}
