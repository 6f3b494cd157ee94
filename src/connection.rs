// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connection
//!
//! One connection is shared by a whole client. It is opened on first use and
//! re-opened whenever it is found closed. Failed connect attempts are retried
//! with an exponential backoff starting at `retry_interval`, for at most
//! `retry_timeout` in total.

use crate::{
    configs::ConnectionConfiguration,
    errors::AmqpError,
    transport::{BrokerChannel, BrokerConnection, BrokerConnector},
};
use backon::{BackoffBuilder, ExponentialBuilder};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::Mutex,
    time::{sleep, Instant},
};
use tracing::{debug, error, warn};

const MAX_CONNECT_DELAY: Duration = Duration::from_secs(30);

/// Lazily connected, self-healing broker connection.
pub struct ConnectionManager {
    connector: Arc<dyn BrokerConnector>,
    retry_timeout: Duration,
    retry_interval: Duration,
    current: Mutex<Option<Arc<dyn BrokerConnection>>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn BrokerConnector>, cfg: &ConnectionConfiguration) -> Self {
        ConnectionManager {
            connector,
            retry_timeout: cfg.retry_timeout(),
            retry_interval: cfg.retry_interval(),
            current: Mutex::new(None),
        }
    }

    /// The open connection, connecting first if needed.
    pub async fn connection(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut current = self.current.lock().await;

        if let Some(conn) = current.as_ref() {
            if conn.is_open() {
                return Ok(conn.clone());
            }
            warn!("amqp connection was closed, reconnecting...");
        }

        let conn = self.connect().await?;
        *current = Some(conn.clone());

        Ok(conn)
    }

    pub async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");

        match self.connection().await?.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(channel)
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(err)
            }
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.current
            .lock()
            .await
            .as_ref()
            .is_some_and(|conn| conn.is_open())
    }

    /// Closes the connection if one is open. The next access reconnects.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let Some(conn) = self.current.lock().await.take() else {
            return Ok(());
        };

        if !conn.is_open() {
            return Ok(());
        }

        conn.close().await
    }

    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let deadline = Instant::now() + self.retry_timeout;
        let mut backoff = ExponentialBuilder::default()
            .with_min_delay(self.retry_interval)
            .with_max_delay(MAX_CONNECT_DELAY.max(self.retry_interval))
            .with_max_times(usize::MAX)
            .with_jitter()
            .build();
        let mut attempt = 1u32;

        loop {
            debug!(attempt, "creating amqp connection...");

            let err = match self.connector.connect().await {
                Ok(conn) => {
                    debug!("amqp connected");
                    return Ok(conn);
                }
                Err(err) => err,
            };

            match backoff.next() {
                Some(delay) if Instant::now() + delay < deadline => {
                    warn!(
                        error = err.to_string(),
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        "failure to connect, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                _ => {
                    error!(error = err.to_string(), attempt, "failure to connect");
                    return Err(err);
                }
            }
        }
    }
}
