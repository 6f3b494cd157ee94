// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Handler Table
//!
//! Applications register typed closures per message type. Registration erases
//! them into a table keyed by the message type tag, so that the dispatcher can
//! decode and invoke a handler knowing only the tag found in the envelope.
//!
//! A queue holds two tables: one-way handlers and RPC handlers. Each tag can
//! be registered at most once per table; a second registration is rejected
//! immediately with [`BusError::Configuration`].
//!
//! ```
//! use servicebus::{envelope::BusMessage, handler::HandlerRegistry};
//! use serde::{Deserialize, Serialize};
//! use uuid::Uuid;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Multiply { id: Uuid, number: i64 }
//!
//! impl BusMessage for Multiply {
//!     fn message_id(&self) -> Uuid { self.id }
//! }
//!
//! let mut handlers = HandlerRegistry::default();
//! handlers
//!     .register(|msg: Multiply| async move {
//!         println!("{}", msg.number);
//!         Ok(())
//!     })
//!     .unwrap()
//!     .register_rpc(|msg: Multiply| async move { Ok(msg.number * 4) })
//!     .unwrap();
//!
//! assert!(handlers.register(|_: Multiply| async { Ok(()) }).is_err());
//! ```

use crate::{
    envelope::{AnyMessage, BusMessage, RpcResult},
    errors::BusError,
};
use futures_util::future::{self, BoxFuture, FutureExt};
use std::{
    collections::HashMap,
    fmt::{self, Debug},
    future::Future,
    marker::PhantomData,
    sync::Arc,
};

/// Error returned by user handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerResult<T = ()> = Result<T, HandlerError>;

/// Per-queue callback invoked with the typed message whose handler failed.
pub type OnQueueException = Arc<dyn Fn(&dyn AnyMessage, &HandlerError) + Send + Sync>;

/// Decode + invoke for one message type.
pub(crate) trait MessageHandler: Send + Sync {
    fn decode(&self, json_message: &str) -> Result<Box<dyn AnyMessage>, BusError>;

    fn handle(&self, message: &dyn AnyMessage) -> BoxFuture<'static, HandlerResult>;
}

/// Serialized result of an RPC handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RpcOutput {
    pub message_type: String,
    pub json_message: String,
}

/// Decode + invoke for one RPC request type. Decoding fails synchronously so
/// the caller can tell a bad payload from a failing handler.
pub(crate) trait RpcHandler: Send + Sync {
    fn call(&self, json_message: &str)
        -> Result<BoxFuture<'static, HandlerResult<RpcOutput>>, BusError>;
}

struct TypedHandler<T, F> {
    handler: F,
    _message: PhantomData<fn() -> T>,
}

impl<T, F, Fut> MessageHandler for TypedHandler<T, F>
where
    T: BusMessage,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn decode(&self, json_message: &str) -> Result<Box<dyn AnyMessage>, BusError> {
        let message: T = serde_json::from_str(json_message)?;
        Ok(Box::new(message))
    }

    fn handle(&self, message: &dyn AnyMessage) -> BoxFuture<'static, HandlerResult> {
        match message.as_any().downcast_ref::<T>() {
            Some(message) => (self.handler)(message.clone()).boxed(),
            None => future::ready(Err(format!(
                "message `{}` is not a `{}`",
                message.tag(),
                T::type_tag()
            )
            .into()))
            .boxed(),
        }
    }
}

struct TypedRpcHandler<T, R, F> {
    handler: F,
    _message: PhantomData<fn(T) -> R>,
}

impl<T, R, F, Fut> RpcHandler for TypedRpcHandler<T, R, F>
where
    T: BusMessage,
    R: RpcResult,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<R>> + Send + 'static,
{
    fn call(
        &self,
        json_message: &str,
    ) -> Result<BoxFuture<'static, HandlerResult<RpcOutput>>, BusError> {
        let message: T = serde_json::from_str(json_message)?;
        let fut = (self.handler)(message);

        Ok(async move {
            let result = fut.await?;
            Ok::<_, HandlerError>(RpcOutput {
                message_type: R::type_tag().into_owned(),
                json_message: serde_json::to_string(&result)?,
            })
        }
        .boxed())
    }
}

/// One-way and RPC handler tables of a queue.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
    rpc_handlers: HashMap<String, Arc<dyn RpcHandler>>,
}

impl HandlerRegistry {
    /// Registers the one-way handler for messages of type `T`.
    pub fn register<T, F, Fut>(&mut self, handler: F) -> Result<&mut Self, BusError>
    where
        T: BusMessage,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.insert(
            T::type_tag().into_owned(),
            Arc::new(TypedHandler {
                handler,
                _message: PhantomData,
            }),
        )?;
        Ok(self)
    }

    /// Registers the RPC handler answering requests of type `T` with an `R`.
    pub fn register_rpc<T, R, F, Fut>(&mut self, handler: F) -> Result<&mut Self, BusError>
    where
        T: BusMessage,
        R: RpcResult,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<R>> + Send + 'static,
    {
        let tag = T::type_tag().into_owned();
        if self.rpc_handlers.contains_key(&tag) {
            return Err(BusError::Configuration(format!(
                "there is already a rpc handler for message type `{tag}`"
            )));
        }

        self.rpc_handlers.insert(
            tag,
            Arc::new(TypedRpcHandler {
                handler,
                _message: PhantomData,
            }),
        );
        Ok(self)
    }

    pub(crate) fn insert(
        &mut self,
        tag: String,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BusError> {
        if self.handlers.contains_key(&tag) {
            return Err(BusError::Configuration(format!(
                "there is already a handler for message type `{tag}`"
            )));
        }

        self.handlers.insert(tag, handler);
        Ok(())
    }

    pub(crate) fn handler(&self, tag: &str) -> Option<&Arc<dyn MessageHandler>> {
        self.handlers.get(tag)
    }

    pub(crate) fn rpc_handler(&self, tag: &str) -> Option<&Arc<dyn RpcHandler>> {
        self.rpc_handlers.get(tag)
    }

    /// Tags of the registered one-way handlers.
    pub fn message_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Tags of the registered RPC handlers.
    pub fn rpc_message_types(&self) -> impl Iterator<Item = &str> {
        self.rpc_handlers.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty() && self.rpc_handlers.is_empty()
    }
}

impl Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("rpc_handlers", &self.rpc_handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
