// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Service Bus Client
//!
//! [`ServiceBus`] owns everything a client needs at runtime: the broker
//! connection, the channel pool, the publisher, one pipeline per configured
//! queue plus the pipeline of its RPC reply queue, and the table of pending
//! requests.
//!
//! ```rust,no_run
//! use serde::{Deserialize, Serialize};
//! use servicebus::{BusMessage, QueueConfiguration, ServiceBus, ServiceBusConfiguration};
//! use uuid::Uuid;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Multiply {
//!     id: Uuid,
//!     a: i64,
//!     b: i64,
//! }
//!
//! impl BusMessage for Multiply {
//!     fn message_id(&self) -> Uuid {
//!         self.id
//!     }
//! }
//!
//! # async fn run() -> Result<(), servicebus::BusError> {
//! let calculator = QueueConfiguration::new()
//!     .with_queue_name("calculator")?
//!     .with_handlers(|h| {
//!         h.register_rpc(|m: Multiply| async move { Ok(m.a * m.b) })?;
//!         Ok(())
//!     })?;
//!
//! let bus = ServiceBus::connect(
//!     ServiceBusConfiguration::new()
//!         .with_client_name("calc")
//!         .with_queue_subscription(calculator),
//! )
//! .await?;
//!
//! let product: i64 = bus
//!     .request("calculator", &Multiply { id: Uuid::new_v4(), a: 4, b: 4 })
//!     .await?;
//! assert_eq!(product, 16);
//!
//! bus.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::{
    amqp::LapinConnector,
    channel::ChannelPool,
    configs::{OnException, ServiceBusConfiguration},
    connection::ConnectionManager,
    envelope::{BusMessage, Envelope, RpcResult},
    errors::{BusError, BusException},
    exchange::ExchangeDefinition,
    handler::HandlerRegistry,
    naming,
    pipeline::QueuePipeline,
    publisher::{BusPublisher, EnvelopePublisher},
    queue::{QueueConfiguration, QueueSettings},
    rpc::{
        RpcCorrelator, RpcError, RpcReplyHandler, RpcRequest, RpcRequestHandler, RpcResponse,
        RPC_ERROR_TAG, RPC_REQUEST_TAG, RPC_RESPONSE_TAG,
    },
    topology::AmqpTopology,
    transport::BrokerConnector,
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, error};

/// The reply queue outlives a client restart by this long.
const RPC_REPLY_QUEUE_IDLE_TIMEOUT: Duration = Duration::from_secs(360);

const RPC_REPLY_RETRY_LIMIT: u32 = 3;

pub struct ServiceBus {
    client_name: String,
    default_rpc_timeout: Duration,
    connection: Arc<ConnectionManager>,
    pool: Arc<ChannelPool>,
    publisher: Arc<BusPublisher>,
    correlator: Arc<RpcCorrelator>,
    pipelines: Vec<Arc<QueuePipeline>>,
    on_exception: OnException,
}

impl ServiceBus {
    /// Starts a client on RabbitMQ.
    pub async fn connect(config: ServiceBusConfiguration) -> Result<ServiceBus, BusError> {
        let connector = LapinConnector::new(&config.connection, &config.client_name);
        ServiceBus::start(config, connector).await
    }

    /// Starts a client on the broker reached through `connector`.
    ///
    /// Configuration errors fail here. Broker failures while declaring the
    /// custom exchanges or starting a pipeline are reported through the
    /// exception callback and do not stop the other pipelines; call
    /// [`ServiceBus::resume`] to retry them.
    pub async fn start(
        config: ServiceBusConfiguration,
        connector: Arc<dyn BrokerConnector>,
    ) -> Result<ServiceBus, BusError> {
        config.validate()?;

        let on_exception: OnException = match config.exception_handler.clone() {
            Some(handler) => handler,
            None => Arc::new(log_exception),
        };

        let connection = Arc::new(ConnectionManager::new(connector, &config.connection));
        let pool = Arc::new(ChannelPool::new(connection.clone()));
        let publisher = BusPublisher::new(connection.clone());
        let correlator = RpcCorrelator::new();

        let mut pipelines = Vec::with_capacity(config.queues.len() + 1);
        let default_queue = naming::default_request_queue(&config.client_name);

        for queue in &config.queues {
            let settings =
                QueueSettings::resolve(queue, &default_queue, config.default_concurrency_limit);
            let topology = AmqpTopology::for_queue(&settings, &queue.handlers);

            let mut handlers = queue.handlers.clone();
            handlers.insert(
                RPC_REQUEST_TAG.to_owned(),
                RpcRequestHandler::new(
                    queue.handlers.clone(),
                    publisher.clone(),
                    &config.client_name,
                ),
            )?;

            pipelines.push(QueuePipeline::new(
                settings,
                topology,
                handlers,
                pool.clone(),
                publisher.clone(),
                on_exception.clone(),
            ));
        }

        pipelines.push(reply_pipeline(
            &config,
            &correlator,
            &pool,
            &publisher,
            &on_exception,
        )?);

        let bus = ServiceBus {
            client_name: config.client_name.clone(),
            default_rpc_timeout: config.default_rpc_timeout,
            connection,
            pool,
            publisher,
            correlator,
            pipelines,
            on_exception,
        };

        for exchange in &config.custom_exchanges {
            if let Err(err) = bus.publisher.ensure_exchange(exchange).await {
                (bus.on_exception)(&BusException::new(
                    "failure to declare a custom exchange",
                    exchange.name(),
                    "",
                    err,
                ));
            }
        }

        for pipeline in &bus.pipelines {
            // failures are already reported by the pipeline
            let _ = pipeline.start().await;
        }

        debug!(
            client_name = bus.client_name.as_str(),
            pipelines = bus.pipelines.len(),
            "service bus started"
        );

        Ok(bus)
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    /// Number of requests waiting for their reply.
    pub fn pending_requests(&self) -> usize {
        self.correlator.pending()
    }

    /// Whether the consumer of `queue` is running.
    pub fn is_consuming(&self, queue: &str) -> bool {
        self.pipelines
            .iter()
            .any(|pipeline| pipeline.queue_name() == queue && pipeline.is_running())
    }

    /// Publishes `message` to every queue handling its type.
    pub async fn publish<T: BusMessage>(&self, message: &T) -> Result<(), BusError> {
        self.publish_message(message, None).await
    }

    /// Like [`ServiceBus::publish`]; undelivered copies expire after `ttl`.
    pub async fn publish_with_ttl<T: BusMessage>(
        &self,
        message: &T,
        ttl: Duration,
    ) -> Result<(), BusError> {
        self.publish_message(message, Some(ttl)).await
    }

    /// Publishes `message` to the custom `exchange` with `routing_key`.
    /// The exchange must exist.
    pub async fn publish_to<T: BusMessage>(
        &self,
        exchange: &str,
        message: &T,
        routing_key: &str,
        ttl: Option<Duration>,
    ) -> Result<(), BusError> {
        let envelope = Envelope::wrap(message, exchange, routing_key, &self.client_name)?;
        self.publisher.publish(&envelope, ttl).await
    }

    /// Sends `message` straight to `queue`.
    pub async fn send<T: BusMessage>(&self, queue: &str, message: &T) -> Result<(), BusError> {
        self.send_message(queue, message, None).await
    }

    pub async fn send_with_ttl<T: BusMessage>(
        &self,
        queue: &str,
        message: &T,
        ttl: Duration,
    ) -> Result<(), BusError> {
        self.send_message(queue, message, Some(ttl)).await
    }

    /// Sends `message` to `queue` as a request and waits for the reply of
    /// its RPC handler, at most the default rpc timeout.
    pub async fn request<Req, Res>(&self, queue: &str, message: &Req) -> Result<Res, BusError>
    where
        Req: BusMessage,
        Res: RpcResult,
    {
        self.request_with_timeout(queue, message, self.default_rpc_timeout)
            .await
    }

    /// Sends `message` to `queue` as a request and waits for the reply for
    /// at most `timeout`. The request id is the message id.
    ///
    /// Fails with [`BusError::RpcTimeout`] when no reply arrives in time,
    /// [`BusError::Rpc`] when the remote side could not answer and
    /// [`BusError::ResponseType`] when the result is not a `Res`.
    pub async fn request_with_timeout<Req, Res>(
        &self,
        queue: &str,
        message: &Req,
        timeout: Duration,
    ) -> Result<Res, BusError>
    where
        Req: BusMessage,
        Res: RpcResult,
    {
        let request = RpcRequest::new(message, &self.client_name)?;
        let envelope = Envelope::wrap(&request, "", queue, &self.client_name)?;

        self.correlator
            .issue_request(
                request.message_id,
                timeout,
                self.publisher.publish(&envelope, Some(timeout)),
            )
            .await
    }

    /// Declares `exchange` on the broker.
    pub async fn create_exchange(&self, exchange: &ExchangeDefinition) -> Result<(), BusError> {
        exchange.validate()?;
        self.publisher.ensure_exchange(exchange).await
    }

    /// Binds `queue` to `exchange` with `routing_key`.
    pub async fn bind_exchange(
        &self,
        exchange: &str,
        queue: &str,
        routing_key: &str,
    ) -> Result<(), BusError> {
        self.publisher.bind(exchange, queue, routing_key).await
    }

    /// Restarts every pipeline whose consumer is not running, e.g. one that
    /// failed to start. Consumers losing their delivery stream restart on
    /// their own. Returns the first startup failure; every failure is
    /// reported.
    pub async fn resume(&self) -> Result<(), BusError> {
        let mut result = Ok(());

        for pipeline in &self.pipelines {
            if let Err(err) = pipeline.start().await {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        result
    }

    /// Stops every consumer, cancels the pending requests and closes the
    /// channels and the connection. Deliveries being handled are finished
    /// and acknowledged first.
    pub async fn shutdown(&self) {
        for pipeline in &self.pipelines {
            pipeline.stop().await;
        }

        self.correlator.shutdown();
        self.publisher.close().await;
        self.pool.close_all().await;

        if let Err(err) = self.connection.close().await {
            error!(error = err.to_string(), "error to close the connection");
        }

        debug!(
            client_name = self.client_name.as_str(),
            "service bus stopped"
        );
    }

    async fn publish_message<T: BusMessage>(
        &self,
        message: &T,
        ttl: Option<Duration>,
    ) -> Result<(), BusError> {
        let exchange = naming::exchange_name(&T::type_tag());
        self.publisher
            .ensure_exchange(&ExchangeDefinition::for_message_type(exchange.clone()))
            .await?;

        let envelope = Envelope::wrap(message, &exchange, "", &self.client_name)?;
        self.publisher.publish(&envelope, ttl).await
    }

    async fn send_message<T: BusMessage>(
        &self,
        queue: &str,
        message: &T,
        ttl: Option<Duration>,
    ) -> Result<(), BusError> {
        let envelope = Envelope::wrap(message, "", queue, &self.client_name)?;
        self.publisher.publish(&envelope, ttl).await
    }
}

/// Pipeline of the client's reply queue, resolving pending requests.
fn reply_pipeline(
    config: &ServiceBusConfiguration,
    correlator: &Arc<RpcCorrelator>,
    pool: &Arc<ChannelPool>,
    publisher: &Arc<BusPublisher>,
    on_exception: &OnException,
) -> Result<Arc<QueuePipeline>, BusError> {
    let reply_queue = naming::rpc_reply_queue(&config.client_name);
    let queue = QueueConfiguration::new()
        .with_queue_name(&reply_queue)?
        .with_retry_limit(RPC_REPLY_RETRY_LIMIT)
        .with_idle_timeout(RPC_REPLY_QUEUE_IDLE_TIMEOUT)?;

    let settings = QueueSettings::resolve(&queue, &reply_queue, config.default_concurrency_limit);
    let topology = AmqpTopology::for_queue(&settings, &HandlerRegistry::default());

    let mut handlers = HandlerRegistry::default();
    handlers.insert(
        RPC_RESPONSE_TAG.to_owned(),
        RpcReplyHandler::<RpcResponse>::new(correlator.clone(), on_exception.clone(), &reply_queue),
    )?;
    handlers.insert(
        RPC_ERROR_TAG.to_owned(),
        RpcReplyHandler::<RpcError>::new(correlator.clone(), on_exception.clone(), &reply_queue),
    )?;

    Ok(QueuePipeline::new(
        settings,
        topology,
        handlers,
        pool.clone(),
        publisher.clone(),
        on_exception.clone(),
    ))
}

fn log_exception(exception: &BusException) {
    error!(
        error = exception.source.to_string(),
        exchange = exception.exchange.as_str(),
        queue = exception.queue.as_str(),
        raw_message = exception.raw_message.as_deref(),
        "{}",
        exception.message
    );
}
