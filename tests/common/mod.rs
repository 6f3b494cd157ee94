// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use servicebus::{
    BusError, BusException, BusMessage, MemoryBroker, OnException, ServiceBus,
    ServiceBusConfiguration,
};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Multiply {
    pub id: Uuid,
    pub a: i64,
    pub b: i64,
}

impl Multiply {
    pub fn new(a: i64, b: i64) -> Multiply {
        Multiply {
            id: Uuid::new_v4(),
            a,
            b,
        }
    }
}

impl BusMessage for Multiply {
    fn message_id(&self) -> Uuid {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub id: Uuid,
    pub total: u32,
}

impl OrderPlaced {
    pub fn new(total: u32) -> OrderPlaced {
        OrderPlaced {
            id: Uuid::new_v4(),
            total,
        }
    }
}

impl BusMessage for OrderPlaced {
    fn message_id(&self) -> Uuid {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unhandled {
    pub id: Uuid,
}

impl BusMessage for Unhandled {
    fn message_id(&self) -> Uuid {
        self.id
    }
}

/// Collects what a client reports through its exception callback.
#[derive(Clone, Default)]
pub struct Reported(Arc<Mutex<Vec<BusException>>>);

impl Reported {
    pub fn callback(&self) -> OnException {
        let sink = self.0.clone();
        Arc::new(move |exception: &BusException| sink.lock().unwrap().push(exception.clone()))
    }

    pub fn all(&self) -> Vec<BusException> {
        self.0.lock().unwrap().clone()
    }

    pub fn sources(&self) -> Vec<BusError> {
        self.all().into_iter().map(|e| e.source).collect()
    }
}

pub fn config(client_name: &str) -> ServiceBusConfiguration {
    ServiceBusConfiguration::new().with_client_name(client_name)
}

pub async fn start(broker: &MemoryBroker, config: ServiceBusConfiguration) -> ServiceBus {
    ServiceBus::start(config, Arc::new(broker.clone()))
        .await
        .unwrap()
}

pub async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..600 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
