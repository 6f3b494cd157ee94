// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Pool
//!
//! Consumers of the same queue share one broker channel. The pool keeps a
//! reference count per queue name: the channel is created on the first
//! [`ChannelPool::acquire`] and closed when the last [`ChannelLease`] is
//! released. Leases are the only way to release, so a count can never go
//! below zero.

use crate::{connection::ConnectionManager, errors::AmqpError, transport::BrokerChannel};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

struct PoolEntry {
    channel: Arc<dyn BrokerChannel>,
    consumers: usize,
}

/// Reference-counted channels keyed by queue name.
pub struct ChannelPool {
    connection: Arc<ConnectionManager>,
    entries: Arc<Mutex<HashMap<String, PoolEntry>>>,
}

impl ChannelPool {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        ChannelPool {
            connection,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Borrows the channel of `queue`, creating it on first use.
    pub async fn acquire(&self, queue: &str) -> Result<ChannelLease, AmqpError> {
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get_mut(queue) {
            if entry.channel.is_open() {
                entry.consumers += 1;
                return Ok(self.lease(queue, entry.channel.clone()));
            }

            warn!(queue, "pooled channel was closed, replacing it");
            entries.remove(queue);
        }

        let channel = self.connection.create_channel().await?;
        entries.insert(
            queue.to_owned(),
            PoolEntry {
                channel: channel.clone(),
                consumers: 1,
            },
        );

        debug!(queue, "channel added to the pool");

        Ok(self.lease(queue, channel))
    }

    /// Number of live leases on the channel of `queue`.
    pub async fn consumers(&self, queue: &str) -> usize {
        self.entries
            .lock()
            .await
            .get(queue)
            .map_or(0, |entry| entry.consumers)
    }

    /// Closes every pooled channel. Outstanding leases become no-ops.
    pub async fn close_all(&self) {
        let drained: Vec<(String, PoolEntry)> = self.entries.lock().await.drain().collect();

        for (queue, entry) in drained {
            close_channel(&queue, entry.channel.as_ref()).await;
        }
    }

    fn lease(&self, queue: &str, channel: Arc<dyn BrokerChannel>) -> ChannelLease {
        ChannelLease {
            queue: queue.to_owned(),
            channel,
            entries: Some(self.entries.clone()),
        }
    }
}

/// A counted borrow of a pooled channel.
///
/// Call [`ChannelLease::release`] when done. A lease dropped without release
/// is released in the background.
pub struct ChannelLease {
    queue: String,
    channel: Arc<dyn BrokerChannel>,
    entries: Option<Arc<Mutex<HashMap<String, PoolEntry>>>>,
}

impl ChannelLease {
    pub fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.channel
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub async fn release(mut self) {
        if let Some(entries) = self.entries.take() {
            release(entries, &self.queue, &self.channel).await;
        }
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        let Some(entries) = self.entries.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let queue = std::mem::take(&mut self.queue);
                let channel = self.channel.clone();
                handle.spawn(async move { release(entries, &queue, &channel).await });
            }
            Err(_) => warn!(
                queue = self.queue.as_str(),
                "channel lease dropped outside of a runtime"
            ),
        }
    }
}

async fn release(
    entries: Arc<Mutex<HashMap<String, PoolEntry>>>,
    queue: &str,
    channel: &Arc<dyn BrokerChannel>,
) {
    let mut entries = entries.lock().await;

    // the entry may already belong to a replacement channel
    let Some(entry) = entries
        .get_mut(queue)
        .filter(|entry| Arc::ptr_eq(&entry.channel, channel))
    else {
        return;
    };

    entry.consumers -= 1;
    if entry.consumers > 0 {
        return;
    }

    if let Some(entry) = entries.remove(queue) {
        close_channel(queue, entry.channel.as_ref()).await;
        debug!(queue, "channel removed from the pool");
    }
}

async fn close_channel(queue: &str, channel: &dyn BrokerChannel) {
    if !channel.is_open() {
        return;
    }

    if let Err(err) = channel.close().await {
        error!(error = err.to_string(), queue, "error to close the channel");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        configs::ConnectionConfiguration,
        transport::{BrokerConnection, MockBrokerChannel, MockBrokerConnection, MockBrokerConnector},
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counters {
        created: AtomicUsize,
        closed: AtomicUsize,
    }

    fn pool() -> (ChannelPool, Arc<Counters>) {
        let counters = Arc::new(Counters {
            created: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        });

        let on_connect = counters.clone();
        let mut connector = MockBrokerConnector::new();
        connector.expect_connect().returning(move || {
            let on_create = on_connect.clone();
            let mut conn = MockBrokerConnection::new();
            conn.expect_is_open().return_const(true);
            conn.expect_create_channel().returning(move || {
                on_create.created.fetch_add(1, Ordering::SeqCst);
                let on_close = on_create.clone();
                let mut channel = MockBrokerChannel::new();
                channel.expect_is_open().return_const(true);
                channel.expect_close().returning(move || {
                    on_close.closed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
                Ok(Arc::new(channel) as Arc<dyn BrokerChannel>)
            });
            Ok(Arc::new(conn) as Arc<dyn BrokerConnection>)
        });

        let manager = ConnectionManager::new(
            Arc::new(connector),
            &ConnectionConfiguration::default(),
        );

        (ChannelPool::new(Arc::new(manager)), counters)
    }

    #[tokio::test]
    async fn one_channel_per_queue_closed_on_last_release() {
        let (pool, counters) = pool();

        let first = pool.acquire("orders").await.unwrap();
        let second = pool.acquire("orders").await.unwrap();

        assert!(Arc::ptr_eq(first.channel(), second.channel()));
        assert_eq!(pool.consumers("orders").await, 2);
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);

        first.release().await;
        assert_eq!(pool.consumers("orders").await, 1);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 0);

        second.release().await;
        assert_eq!(pool.consumers("orders").await, 0);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn queues_get_their_own_channel() {
        let (pool, counters) = pool();

        let orders = pool.acquire("orders").await.unwrap();
        let billing = pool.acquire("billing").await.unwrap();

        assert!(!Arc::ptr_eq(orders.channel(), billing.channel()));
        assert_eq!(counters.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_acquires_share_a_single_channel() {
        let (pool, counters) = pool();
        let pool = Arc::new(pool);

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.acquire("orders").await.unwrap() })
            })
            .collect();

        let mut leases = vec![];
        for task in tasks {
            leases.push(task.await.unwrap());
        }

        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.consumers("orders").await, 10);

        for lease in leases {
            lease.release().await;
        }
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_leases_are_released_in_background() {
        let (pool, counters) = pool();

        drop(pool.acquire("orders").await.unwrap());

        for _ in 0..100 {
            if pool.consumers("orders").await == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert_eq!(pool.consumers("orders").await, 0);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_all_empties_the_pool() {
        let (pool, counters) = pool();

        let lease = pool.acquire("orders").await.unwrap();
        pool.acquire("billing").await.unwrap().release().await;
        pool.close_all().await;

        assert_eq!(pool.consumers("orders").await, 0);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 2);

        lease.release().await;
        assert_eq!(counters.closed.load(Ordering::SeqCst), 2);
    }
}
