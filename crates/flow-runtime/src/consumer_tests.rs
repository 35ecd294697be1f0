//! Tests for consumer bootstrap and shutdown.

use super::*;
use crate::config::{ConnectionSettings, QueueSettings, ScheduleConfig};
use crate::error::BindError;
use crate::message::QueueName;
use crate::providers::memory::{AckFaults, InMemoryBroker};
use std::time::Duration;

fn config() -> ConsumerConfig {
    ConsumerConfig {
        queue: QueueSettings {
            name: "orders".to_string(),
            durable: true,
        },
        schedule: ScheduleConfig {
            initial_delay_ms: 100,
            period_ms: 500,
        },
        ..Default::default()
    }
}

fn broker_with_queue() -> (InMemoryBroker, QueueName, Arc<dyn Connection>) {
    let broker = InMemoryBroker::new();
    let name = QueueName::new("orders".to_string()).unwrap();
    broker.provision_queue(name.clone());
    let connection: Arc<dyn Connection> =
        Arc::new(broker.connect(&ConnectionSettings::default()).unwrap());
    (broker, name, connection)
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let (_broker, _name, connection) = broker_with_queue();
    let mut config = config();
    config.schedule.period_ms = 0;

    let result = FlowConsumer::start(connection, &config).await;
    assert!(matches!(result, Err(FlowError::Configuration(_))));
}

#[tokio::test]
async fn test_initial_bind_failure_is_returned() {
    let broker = InMemoryBroker::new();
    let connection: Arc<dyn Connection> =
        Arc::new(broker.connect(&ConnectionSettings::default()).unwrap());

    let result = FlowConsumer::start(connection, &config()).await;
    assert!(matches!(
        result,
        Err(FlowError::Bind(BindError::QueueNotFound { .. }))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_consumer_acknowledges_everything_published() {
    let (broker, name, connection) = broker_with_queue();
    broker.publish(&name, "before start").unwrap();

    let consumer = FlowConsumer::start(connection, &config()).await.unwrap();
    assert_eq!(consumer.endpoint().name, name);

    broker.publish(&name, "after start").unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(consumer.pending(), 0);

    let summary = consumer.shutdown().await;
    assert_eq!(summary.acknowledged, 2);
    assert_eq!(summary.abandoned, 0);
    assert_eq!(broker.stats(&name).unwrap().acknowledged, 2);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_recovered() {
    let (broker, name, connection) = broker_with_queue();
    for i in 0..3 {
        broker.publish(&name, format!("m{i}")).unwrap();
    }
    broker.set_ack_faults(AckFaults::scripted([false, true, false, true]));

    let consumer = FlowConsumer::start(connection, &config()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(consumer.pending(), 0);

    let summary = consumer.shutdown().await;
    assert_eq!(summary.rebinds, 2);
    assert_eq!(summary.abandoned, 0);

    let stats = broker.stats(&name).unwrap();
    assert_eq!(stats.acknowledged, 3);
    assert_eq!(stats.ready, 0);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_abandons_unacknowledged_messages() {
    let (broker, name, connection) = broker_with_queue();
    broker.publish(&name, "stuck-1").unwrap();
    broker.publish(&name, "stuck-2").unwrap();
    broker.set_ack_faults(AckFaults::Random { failure_rate: 1.0 });

    let consumer = FlowConsumer::start(connection, &config()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let summary = consumer.shutdown().await;
    assert_eq!(summary.acknowledged, 0);
    assert!(summary.abandoned >= 2);

    // Both messages are back on the broker for the next consumer.
    let stats = broker.stats(&name).unwrap();
    assert_eq!(stats.ready, 2);
    assert_eq!(stats.in_flight, 0);
}
