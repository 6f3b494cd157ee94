// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! Every message travels wrapped in an [`Envelope`]: the payload serialized as
//! JSON next to its type tag, routing properties recorded at publish time and
//! a retry counter. The envelope itself is JSON-encoded on the wire.

use crate::errors::BusError;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{any::Any, borrow::Cow, fmt::Debug};
use uuid::Uuid;

/// A message that can travel on the bus.
///
/// The type tag identifies the payload on the wire and names the message's
/// fanout exchange. It defaults to the fully qualified Rust type name; both
/// ends of a deployment must agree on it.
pub trait BusMessage: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static {
    fn message_id(&self) -> Uuid;

    fn type_tag() -> Cow<'static, str> {
        Cow::Borrowed(std::any::type_name::<Self>())
    }
}

/// A value an RPC handler answers with.
///
/// The requesting side checks the result tag before decoding. Like
/// [`BusMessage::type_tag`] it defaults to the Rust type name, so services
/// answering with their own copy of a result type must agree on an override.
pub trait RpcResult: Serialize + DeserializeOwned + Send + 'static {
    fn type_tag() -> Cow<'static, str> {
        Cow::Borrowed(std::any::type_name::<Self>())
    }
}

macro_rules! rpc_results {
    ($($ty:ty),* $(,)?) => {
        $(impl RpcResult for $ty {})*
    };
}

rpc_results!(
    (), bool, char, String, i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32,
    f64, Uuid,
);

impl<T: RpcResult> RpcResult for Vec<T> {
    fn type_tag() -> Cow<'static, str> {
        Cow::Owned(format!("Vec<{}>", T::type_tag()))
    }
}

impl<T: RpcResult> RpcResult for Option<T> {
    fn type_tag() -> Cow<'static, str> {
        Cow::Owned(format!("Option<{}>", T::type_tag()))
    }
}

/// Object-safe view of a decoded [`BusMessage`], handed to exception
/// callbacks. Use [`AnyMessage::as_any`] to get the concrete type back.
pub trait AnyMessage: Debug + Send + Sync {
    fn id(&self) -> Uuid;
    fn tag(&self) -> Cow<'static, str>;
    fn as_any(&self) -> &dyn Any;
}

impl<T: BusMessage> AnyMessage for T {
    fn id(&self) -> Uuid {
        self.message_id()
    }

    fn tag(&self) -> Cow<'static, str> {
        T::type_tag()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Routing properties stamped when an envelope is published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeProperties {
    pub exchange_name: String,
    /// Target queue for direct sends, routing key for exchange publishes.
    pub queue_name: String,
    pub date_published: DateTime<Utc>,
    pub client_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub message_id: Uuid,
    pub message_type: String,
    pub json_message: String,
    pub properties: EnvelopeProperties,
    #[serde(default)]
    pub retry_count: u32,
}

impl Envelope {
    /// Wraps `message` for a publish to `exchange_name` with `queue_name` as
    /// queue or routing key.
    pub fn wrap<T: BusMessage>(
        message: &T,
        exchange_name: &str,
        queue_name: &str,
        client_name: &str,
    ) -> Result<Envelope, BusError> {
        Ok(Envelope {
            message_id: Uuid::new_v4(),
            message_type: T::type_tag().into_owned(),
            json_message: serde_json::to_string(message)?,
            properties: EnvelopeProperties {
                exchange_name: exchange_name.to_owned(),
                queue_name: queue_name.to_owned(),
                date_published: Utc::now(),
                client_name: client_name.to_owned(),
            },
            retry_count: 0,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, BusError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Envelope, BusError> {
        serde_json::from_slice(data).map_err(|err| BusError::Envelope(err.to_string()))
    }

    /// Decodes the payload as `T`, checking the type tag first.
    pub fn open<T: BusMessage>(&self) -> Result<T, BusError> {
        if self.message_type != T::type_tag() {
            return Err(BusError::Routing(self.message_type.clone()));
        }

        Ok(serde_json::from_str(&self.json_message)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Ping {
        id: Uuid,
        text: String,
    }

    impl BusMessage for Ping {
        fn message_id(&self) -> Uuid {
            self.id
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Tagged {
        id: Uuid,
    }

    impl BusMessage for Tagged {
        fn message_id(&self) -> Uuid {
            self.id
        }

        fn type_tag() -> Cow<'static, str> {
            Cow::Borrowed("Shared.Tagged")
        }
    }

    fn ping() -> Ping {
        Ping {
            id: Uuid::new_v4(),
            text: "hello".to_owned(),
        }
    }

    #[test]
    fn envelope_survives_the_wire() {
        let mut envelope = Envelope::wrap(&ping(), "exch", "key", "client-a").unwrap();
        envelope.retry_count = 3;

        let decoded = Envelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();

        assert_eq!(decoded, envelope);
        assert_eq!(decoded.retry_count, 3);
        assert_eq!(decoded.properties.client_name, "client-a");
    }

    #[test]
    fn wire_format_uses_camel_case_fields() {
        let envelope = Envelope::wrap(&ping(), "", "calc", "client-a").unwrap();
        let value: serde_json::Value =
            serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();

        assert!(value.get("messageType").is_some());
        assert!(value.get("jsonMessage").is_some());
        assert_eq!(value["retryCount"], 0);
        assert_eq!(value["properties"]["queueName"], "calc");
        assert!(value["properties"].get("datePublished").is_some());
    }

    #[test]
    fn malformed_bytes_are_envelope_errors() {
        let err = Envelope::from_bytes(b"not json").unwrap_err();
        assert!(matches!(err, BusError::Envelope(_)));
    }

    #[test]
    fn open_checks_the_type_tag() {
        let message = ping();
        let envelope = Envelope::wrap(&message, "", "q", "c").unwrap();

        assert_eq!(envelope.open::<Ping>().unwrap(), message);
        assert!(matches!(
            envelope.open::<Tagged>(),
            Err(BusError::Routing(tag)) if tag.ends_with("Ping")
        ));
    }

    #[test]
    fn type_tags_can_be_overridden() {
        let envelope = Envelope::wrap(&Tagged { id: Uuid::new_v4() }, "", "q", "c").unwrap();
        assert_eq!(envelope.message_type, "Shared.Tagged");
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Receipt {
        total: i64,
    }

    impl RpcResult for Receipt {
        fn type_tag() -> Cow<'static, str> {
            Cow::Borrowed("Shared.Receipt")
        }
    }

    #[test]
    fn result_tags_compose_for_collections() {
        assert_eq!(<i64 as RpcResult>::type_tag(), "i64");
        assert_eq!(<Vec<Receipt> as RpcResult>::type_tag(), "Vec<Shared.Receipt>");
        assert_eq!(<Option<u8> as RpcResult>::type_tag(), "Option<u8>");
    }

    #[test]
    fn any_message_downcasts_to_the_concrete_type() {
        let message = ping();
        let erased: &dyn AnyMessage = &message;

        assert_eq!(erased.id(), message.id);
        assert_eq!(erased.as_any().downcast_ref::<Ping>(), Some(&message));
    }
}
