// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Consumer
//!
//! A [`QueueConsumer`] drives the consume loop of one queue: it sets the
//! channel prefetch to the queue concurrency limit, registers a broker
//! consumer and dispatches every delivery on its own task. The prefetch is
//! what bounds the number of deliveries processed at once.
//!
//! Stopping signals the loop, cancels the broker consumer and waits for the
//! deliveries already dispatched, so they are acknowledged before the channel
//! goes away. A delivery stream ending without a stop request is handed to
//! the consumer's [`OnConsumerLost`] callback.

use crate::{
    configs::OnException,
    consumer::{consume, DeliveryContext},
    errors::AmqpError,
    handler::HandlerRegistry,
    publisher::EnvelopePublisher,
    queue::QueueSettings,
    transport::{BrokerChannel, DeliveryStream},
};
use futures_util::StreamExt;
use opentelemetry::global;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::{
    sync::{watch, Mutex},
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Invoked with the cause when a running consumer loses its delivery stream.
pub(crate) type OnConsumerLost = Arc<dyn Fn(AmqpError) + Send + Sync>;

struct Running {
    consumer_tag: String,
    channel: Arc<dyn BrokerChannel>,
    shutdown: watch::Sender<bool>,
    consume_loop: JoinHandle<()>,
}

/// Consume loop of one queue.
pub(crate) struct QueueConsumer {
    settings: Arc<QueueSettings>,
    handlers: HandlerRegistry,
    publisher: Arc<dyn EnvelopePublisher>,
    on_exception: OnException,
    on_lost: OnConsumerLost,
    running: Arc<AtomicBool>,
    current: Mutex<Option<Running>>,
}

impl QueueConsumer {
    pub fn new(
        settings: Arc<QueueSettings>,
        handlers: HandlerRegistry,
        publisher: Arc<dyn EnvelopePublisher>,
        on_exception: OnException,
        on_lost: OnConsumerLost,
    ) -> QueueConsumer {
        QueueConsumer {
            settings,
            handlers,
            publisher,
            on_exception,
            on_lost,
            running: Arc::new(AtomicBool::new(false)),
            current: Mutex::new(None),
        }
    }

    /// Whether the consume loop is alive. It ends when stopped or when the
    /// broker closes the delivery stream.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Starts consuming on `channel`. A no-op while already running.
    ///
    /// # Parameters
    /// * `channel` - The queue channel; its prefetch is set to the queue
    ///   concurrency limit
    ///
    /// # Returns
    /// The broker error when the prefetch or the consumer could not be set up
    pub async fn start(&self, channel: Arc<dyn BrokerChannel>) -> Result<(), AmqpError> {
        let mut current = self.current.lock().await;

        if self.is_running() {
            return Ok(());
        }

        channel.qos(self.settings.concurrency_limit).await?;

        let consumer_tag = format!("{}-{}", self.settings.name, Uuid::new_v4());
        let stream = channel.consume(&self.settings.name, &consumer_tag).await?;

        let (shutdown, signal) = watch::channel(false);
        let ctx = Arc::new(DeliveryContext {
            settings: self.settings.clone(),
            handlers: self.handlers.clone(),
            channel: channel.clone(),
            publisher: self.publisher.clone(),
            on_exception: self.on_exception.clone(),
        });

        self.running.store(true, Ordering::SeqCst);
        let consume_loop = tokio::spawn(consume_loop(
            stream,
            ctx,
            signal,
            self.running.clone(),
            self.on_lost.clone(),
        ));

        debug!(
            queue = self.settings.name.as_str(),
            consumer_tag = consumer_tag.as_str(),
            prefetch = self.settings.concurrency_limit,
            "consumer started"
        );

        *current = Some(Running {
            consumer_tag,
            channel,
            shutdown,
            consume_loop,
        });

        Ok(())
    }

    /// Stops the consume loop, cancels the broker consumer and waits for the
    /// deliveries in flight.
    pub async fn stop(&self) {
        let Some(running) = self.current.lock().await.take() else {
            return;
        };

        let _ = running.shutdown.send(true);
        self.running.store(false, Ordering::SeqCst);

        if running.channel.is_open() {
            if let Err(err) = running.channel.cancel(&running.consumer_tag).await {
                warn!(error = err.to_string(), "error to cancel the consumer");
            }
        }

        if let Err(err) = running.consume_loop.await {
            error!(error = err.to_string(), "consume loop ended abnormally");
        }

        debug!(queue = self.settings.name.as_str(), "consumer stopped");
    }
}

async fn consume_loop(
    mut stream: DeliveryStream,
    ctx: Arc<DeliveryContext>,
    mut shutdown: watch::Receiver<bool>,
    running: Arc<AtomicBool>,
    on_lost: OnConsumerLost,
) {
    let tracer = Arc::new(global::tracer("servicebus consumer"));
    let mut in_flight = JoinSet::new();

    let lost = loop {
        tokio::select! {
            _ = shutdown.changed() => break None,
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            next = stream.next() => match next {
                Some(Ok(delivery)) => {
                    let ctx = ctx.clone();
                    let tracer = tracer.clone();
                    in_flight.spawn(async move {
                        if let Err(err) = consume(&tracer, delivery, &ctx).await {
                            error!(error = err.to_string(), "error consume msg");
                        }
                    });
                }
                Some(Err(err)) => break Some(err),
                None => break Some(AmqpError::ConsumerError("delivery stream closed".to_owned())),
            },
        }
    };

    if let Some(err) = lost.filter(|_| !*shutdown.borrow()) {
        warn!(
            error = err.to_string(),
            queue = ctx.settings.name.as_str(),
            "consumer lost its delivery stream"
        );
        running.store(false, Ordering::SeqCst);
        on_lost(err);
    }

    while in_flight.join_next().await.is_some() {}
}
