// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Transport
//!
//! [`LapinConnector`] implements the broker transport on top of `lapin`.
//! Every broker call is logged on failure and mapped to an [`AmqpError`].

use crate::{
    configs::ConnectionConfiguration,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::QueueDeclaration,
    transport::{
        BrokerChannel, BrokerConnection, BrokerConnector, Delivery, DeliveryStream, Headers,
        PublishProperties,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::{debug, error};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

const REPLY_SUCCESS: u16 = 200;

/// Opens RabbitMQ connections.
pub struct LapinConnector {
    uri: String,
    connection_name: String,
}

impl LapinConnector {
    pub fn new(cfg: &ConnectionConfiguration, connection_name: &str) -> Arc<LapinConnector> {
        Arc::new(LapinConnector {
            uri: cfg.uri(),
            connection_name: connection_name.to_owned(),
        })
    }
}

#[async_trait]
impl BrokerConnector for LapinConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        match Connection::connect(&self.uri, options).await {
            Ok(conn) => Ok(Arc::new(LapinConnection { conn })),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError)
            }
        }
    }
}

struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    fn is_open(&self) -> bool {
        self.conn.status().connected()
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        match self.conn.create_channel().await {
            Ok(channel) => Ok(Arc::new(LapinChannel { channel })),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to close the connection");
                AmqpError::CloseError("connection".to_owned())
            })
    }
}

struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                &def.name,
                (&def.kind).into(),
                ExchangeDeclareOptions {
                    auto_delete: def.delete,
                    durable: def.durable,
                    internal: false,
                    nowait: false,
                    passive: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to declare the exchange");
                AmqpError::DeclareExchangeError(def.name.clone())
            })
    }

    async fn declare_queue(&self, def: &QueueDeclaration) -> Result<(), AmqpError> {
        let mut args = FieldTable::default();
        for (key, value) in def.arguments() {
            args.insert(ShortString::from(key), AMQPValue::LongInt(value));
        }

        self.channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.auto_delete,
                    nowait: false,
                },
                args,
            )
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "error to declare the queue");
                AmqpError::DeclareQueueError(def.name.clone())
            })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), AmqpError> {
        let mut props = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_delivery_mode(2)
            .with_headers(field_table(&properties.headers));

        if let Some(id) = &properties.message_id {
            props = props.with_message_id(ShortString::from(id.clone()));
        }

        if let Some(kind) = &properties.kind {
            props = props.with_type(ShortString::from(kind.clone()));
        }

        if let Some(expiration) = properties.expiration {
            props = props.with_expiration(ShortString::from(expiration.as_millis().to_string()));
        }

        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                body,
                props,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(prefetch_count.to_string())
            })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError)
            }
            Ok(c) => Ok(c),
        }?;

        debug!(queue, consumer_tag, "consumer created");

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(Delivery {
                    delivery_tag: delivery.delivery_tag,
                    exchange: delivery.exchange.as_str().to_owned(),
                    routing_key: delivery.routing_key.as_str().to_owned(),
                    headers: headers(delivery.properties.headers()),
                    expiration: expiration(delivery.properties.expiration()),
                    data: delivery.data,
                }),
                Err(err) => {
                    error!(error = err.to_string(), "errors consume msg");
                    Err(AmqpError::ConsumerError(err.to_string()))
                }
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to cancel the consumer");
                AmqpError::CancelConsumerError(consumer_tag.to_owned())
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to close the channel");
                AmqpError::CloseError("channel".to_owned())
            })
    }
}

fn field_table(headers: &Headers) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

    for (key, value) in headers {
        btree.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }

    FieldTable::from(btree)
}

/// String-valued headers of a delivery; other header types are skipped.
fn headers(table: &Option<FieldTable>) -> Headers {
    let Some(table) = table else {
        return Headers::default();
    };

    table
        .inner()
        .iter()
        .filter_map(|(key, value)| match value {
            AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes())
                .ok()
                .map(|value| (key.as_str().to_owned(), value.to_owned())),
            AMQPValue::ShortString(value) => {
                Some((key.as_str().to_owned(), value.as_str().to_owned()))
            }
            _ => None,
        })
        .collect()
}

/// The `expiration` property holds the TTL in milliseconds.
fn expiration(value: &Option<ShortString>) -> Option<Duration> {
    value
        .as_ref()
        .and_then(|millis| millis.as_str().parse().ok())
        .map(Duration::from_millis)
}
