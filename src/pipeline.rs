// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Pipeline
//!
//! One pipeline per consumed queue. Starting it borrows the queue channel
//! from the pool, installs the queue topology and starts the consumer.
//! Starting is idempotent and a no-op while the consumer runs, which is what
//! makes [`crate::client::ServiceBus::resume`] safe to call at any time.
//!
//! Startup failures are reported through the client exception callback and
//! only abort this pipeline. When a running consumer loses its delivery
//! stream, the loss is reported and the pipeline restarts itself with an
//! exponential backoff until it consumes again or is stopped.

use crate::{
    channel::{ChannelLease, ChannelPool},
    configs::OnException,
    dispatcher::{OnConsumerLost, QueueConsumer},
    errors::{AmqpError, BusError, BusException},
    handler::HandlerRegistry,
    publisher::EnvelopePublisher,
    queue::QueueSettings,
    topology::AmqpTopology,
};
use backon::{BackoffBuilder, ExponentialBuilder};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

const RECOVERY_MIN_DELAY: Duration = Duration::from_millis(100);
const RECOVERY_MAX_DELAY: Duration = Duration::from_secs(30);

pub(crate) struct QueuePipeline {
    settings: Arc<QueueSettings>,
    topology: AmqpTopology,
    pool: Arc<ChannelPool>,
    consumer: QueueConsumer,
    lease: Mutex<Option<ChannelLease>>,
    on_exception: OnException,
    stopped: AtomicBool,
}

impl QueuePipeline {
    /// `handlers` is the full dispatch table of the queue. The topology only
    /// binds the exchanges of the message types the application handles.
    pub fn new(
        settings: Arc<QueueSettings>,
        topology: AmqpTopology,
        handlers: HandlerRegistry,
        pool: Arc<ChannelPool>,
        publisher: Arc<dyn EnvelopePublisher>,
        on_exception: OnException,
    ) -> Arc<QueuePipeline> {
        Arc::new_cyclic(|pipeline: &Weak<QueuePipeline>| {
            let pipeline = pipeline.clone();
            let on_lost: OnConsumerLost = Arc::new(move |err: AmqpError| {
                if let Some(pipeline) = pipeline.upgrade() {
                    tokio::spawn(pipeline.recover(err));
                }
            });

            QueuePipeline {
                consumer: QueueConsumer::new(
                    settings.clone(),
                    handlers,
                    publisher,
                    on_exception.clone(),
                    on_lost,
                ),
                settings,
                topology,
                pool,
                lease: Mutex::new(None),
                on_exception,
                stopped: AtomicBool::new(false),
            }
        })
    }

    pub fn queue_name(&self) -> &str {
        &self.settings.name
    }

    pub fn is_running(&self) -> bool {
        self.consumer.is_running()
    }

    pub async fn start(&self) -> Result<(), BusError> {
        self.stopped.store(false, Ordering::SeqCst);
        self.restart().await
    }

    /// Stops the consumer once its deliveries in flight are done, then gives
    /// the channel back to the pool. Cancels a pending recovery.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let mut current = self.lease.lock().await;

        self.consumer.stop().await;

        if let Some(lease) = current.take() {
            lease.release().await;
        }
    }

    async fn restart(&self) -> Result<(), BusError> {
        let mut current = self.lease.lock().await;

        if self.consumer.is_running() || self.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(stale) = current.take() {
            debug!(queue = self.queue_name(), "restarting the pipeline");
            stale.release().await;
        }

        let lease = match self.pool.acquire(&self.settings.name).await {
            Ok(lease) => lease,
            Err(err) => return Err(self.report("failure to open the queue channel", err.into())),
        };

        if let Err(err) = self.topology.install(lease.channel().as_ref()).await {
            lease.release().await;
            return Err(self.report("failure to install the queue topology", err.into()));
        }

        if let Err(err) = self.consumer.start(lease.channel().clone()).await {
            lease.release().await;
            return Err(self.report("failure to start the consumer", err.into()));
        }

        *current = Some(lease);
        Ok(())
    }

    /// Brings the consumer back after it lost its delivery stream. Every
    /// failed attempt is reported by [`QueuePipeline::restart`].
    async fn recover(self: Arc<Self>, err: AmqpError) {
        self.report("the consumer lost its delivery stream", err.into());

        let mut backoff = ExponentialBuilder::default()
            .with_min_delay(RECOVERY_MIN_DELAY)
            .with_max_delay(RECOVERY_MAX_DELAY)
            .with_max_times(usize::MAX)
            .with_jitter()
            .build();
        let mut attempt = 1u32;

        while !self.stopped.load(Ordering::SeqCst) {
            let delay = backoff.next().unwrap_or(RECOVERY_MAX_DELAY);
            warn!(
                queue = self.queue_name(),
                attempt,
                backoff_ms = delay.as_millis() as u64,
                "restarting the consumer after backoff"
            );
            tokio::time::sleep(delay).await;

            if self.restart().await.is_ok() {
                if self.is_running() {
                    debug!(queue = self.queue_name(), attempt, "consumer recovered");
                }
                return;
            }
            attempt += 1;
        }
    }

    fn report(&self, message: &str, err: BusError) -> BusError {
        error!(
            error = err.to_string(),
            queue = self.queue_name(),
            "{message}"
        );
        (self.on_exception)(&BusException::new(
            message,
            "",
            &self.settings.name,
            err.clone(),
        ));
        err
    }
}
