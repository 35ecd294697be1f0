//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use flow_runtime::{
    delivery_channel, spawn_intake, shutdown_channel, Connection, ConnectionSettings,
    InMemoryBroker, InMemoryConnection, PendingBuffer, QueueEndpoint, QueueName, Reconciler,
    ReconcilerConfig, RetryPolicy, ShutdownTrigger,
};
use std::sync::Arc;
use std::time::Duration;

pub fn queue(name: &str) -> QueueName {
    QueueName::new(name.to_string()).expect("valid queue name")
}

/// Broker with one provisioned durable queue and an open connection
pub struct Fixture {
    pub broker: InMemoryBroker,
    pub name: QueueName,
    pub connection: Arc<InMemoryConnection>,
}

impl Fixture {
    pub fn new(queue_name: &str) -> Self {
        let broker = InMemoryBroker::new();
        let name = queue(queue_name);
        broker.provision_queue(name.clone());
        let connection = Arc::new(
            broker
                .connect(&ConnectionSettings::default())
                .expect("connect to in-memory broker"),
        );
        Self {
            broker,
            name,
            connection,
        }
    }

    pub fn publish_many(&self, count: usize) {
        for i in 0..count {
            self.broker
                .publish(&self.name, format!("message {i}"))
                .expect("publish");
        }
    }

    /// Reconciler wired to a running intake, with immediate rebinds
    pub fn reconciler(&self, max_rebinds_per_pass: u32) -> (Reconciler, PendingBuffer, ShutdownTrigger) {
        let buffer = PendingBuffer::new();
        let (sink, intake) = delivery_channel(buffer.clone());
        let (trigger, signal) = shutdown_channel();
        spawn_intake(intake, signal);

        let connection: Arc<dyn Connection> = self.connection.clone();
        let reconciler = Reconciler::new(
            connection,
            QueueEndpoint::durable(self.name.clone()),
            buffer.clone(),
            sink,
            ReconcilerConfig {
                max_rebinds_per_pass,
                rebind_backoff: RetryPolicy::immediate(),
            },
        );
        (reconciler, buffer, trigger)
    }

    /// Messages the broker still considers unsettled
    pub fn unsettled(&self) -> usize {
        let stats = self.broker.stats(&self.name).expect("queue exists");
        stats.ready + stats.in_flight
    }
}

/// Yield until `condition` holds, failing the test after `limit`
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(limit, async {
        while !condition() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition not reached in time");
}
