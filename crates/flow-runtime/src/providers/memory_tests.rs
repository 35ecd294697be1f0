//! Tests for the in-memory broker.

use super::*;
use crate::buffer::PendingBuffer;
use crate::delivery::{delivery_channel, Intake};

fn queue(name: &str) -> QueueName {
    QueueName::new(name.to_string()).unwrap()
}

fn provisioned(name: &str) -> (InMemoryBroker, QueueName) {
    let broker = InMemoryBroker::new();
    let name = queue(name);
    assert!(broker.provision_queue(name.clone()));
    (broker, name)
}

fn connect(broker: &InMemoryBroker) -> InMemoryConnection {
    broker.connect(&ConnectionSettings::default()).unwrap()
}

/// Move queued deliveries into the buffer and return them in buffer order
fn delivered(intake: &mut Intake, buffer: &PendingBuffer) -> Vec<InboundMessage> {
    intake.drain_ready();
    let mut scan = buffer.scan();
    let mut messages = Vec::new();
    while let Some(entry) = scan.current() {
        messages.push(entry.message().clone());
        scan.advance();
    }
    messages
}

mod connecting {
    use super::*;

    #[test]
    fn test_connect_with_defaults() {
        let broker = InMemoryBroker::new();
        let connection = connect(&broker);
        assert!(connection.is_connected());
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let broker = InMemoryBroker::new();
        let settings = ConnectionSettings {
            host: String::new(),
            ..Default::default()
        };

        let error = broker.connect(&settings).unwrap_err();
        assert!(matches!(error, ConnectError::InvalidProperties { .. }));
    }

    #[test]
    fn test_offline_broker_is_unreachable() {
        let broker = InMemoryBroker::new();
        broker.set_online(false);

        let error = broker.connect(&ConnectionSettings::default()).unwrap_err();
        assert!(matches!(error, ConnectError::Unreachable { .. }));
        assert!(error.is_transient());
    }

    #[test]
    fn test_registered_users_must_match() {
        let broker = InMemoryBroker::new().with_user("app", Some("secret".to_string()));

        let wrong = ConnectionSettings {
            username: "app".to_string(),
            password: Some("guess".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            broker.connect(&wrong),
            Err(ConnectError::AuthenticationFailed { .. })
        ));

        let right = ConnectionSettings {
            username: "app".to_string(),
            password: Some("secret".to_string()),
            ..Default::default()
        };
        assert!(broker.connect(&right).is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let broker = InMemoryBroker::new();
        let connection = connect(&broker);

        connection.disconnect().await;
        connection.disconnect().await;
        assert!(!connection.is_connected());
    }
}

mod binding {
    use super::*;

    #[tokio::test]
    async fn test_durable_queue_must_be_provisioned() {
        let broker = InMemoryBroker::new();
        let connection = connect(&broker);
        let (sink, _intake) = delivery_channel(PendingBuffer::new());

        let result = connection
            .bind(&QueueEndpoint::durable(queue("orders")), sink)
            .await;
        assert!(matches!(result, Err(BindError::QueueNotFound { .. })));
    }

    #[tokio::test]
    async fn test_temporary_queue_lives_with_its_connection() {
        let broker = InMemoryBroker::new();
        let connection = connect(&broker);
        let (sink, _intake) = delivery_channel(PendingBuffer::new());
        let name = queue("scratch");

        let receiver = connection
            .bind(&QueueEndpoint::temporary(name.clone()), sink)
            .await
            .unwrap();
        assert!(broker.has_queue(&name));

        connection.disconnect().await;
        assert!(receiver.is_closed());
        assert!(!broker.has_queue(&name));
    }

    #[tokio::test]
    async fn test_binding_is_exclusive() {
        let (broker, name) = provisioned("orders");
        let connection = connect(&broker);
        let endpoint = QueueEndpoint::durable(name);
        let (sink, _intake) = delivery_channel(PendingBuffer::new());

        let first = connection.bind(&endpoint, sink.clone()).await.unwrap();
        match connection.bind(&endpoint, sink.clone()).await {
            Err(BindError::ExclusiveBindingActive { binding_id, .. }) => {
                assert_eq!(&binding_id, first.binding_id());
            }
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("second binding should be refused"),
        }

        first.close().await;
        assert!(connection.bind(&endpoint, sink).await.is_ok());
    }

    #[tokio::test]
    async fn test_bind_after_disconnect_fails() {
        let (broker, name) = provisioned("orders");
        let connection = connect(&broker);
        connection.disconnect().await;

        let (sink, _intake) = delivery_channel(PendingBuffer::new());
        let result = connection.bind(&QueueEndpoint::durable(name), sink).await;
        assert!(matches!(
            result,
            Err(BindError::ConnectionUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_closed_receiver_cannot_start() {
        let (broker, name) = provisioned("orders");
        let connection = connect(&broker);
        let (sink, _intake) = delivery_channel(PendingBuffer::new());

        let receiver = connection
            .bind(&QueueEndpoint::durable(name), sink)
            .await
            .unwrap();
        receiver.close().await;
        receiver.close().await;

        assert!(receiver.is_closed());
        assert!(matches!(
            receiver.start().await,
            Err(ReceiverError::Closed { .. })
        ));
    }
}

mod deliveries {
    use super::*;

    #[test]
    fn test_publish_to_unknown_queue_fails() {
        let broker = InMemoryBroker::new();
        let error = broker.publish(&queue("missing"), "body").unwrap_err();
        assert!(matches!(error, FlowError::QueueNotFound { .. }));
    }

    #[tokio::test]
    async fn test_nothing_is_delivered_before_start() {
        let (broker, name) = provisioned("orders");
        let connection = connect(&broker);
        let buffer = PendingBuffer::new();
        let (sink, mut intake) = delivery_channel(buffer.clone());

        let first = broker.publish(&name, "one").unwrap();
        let receiver = connection
            .bind(&QueueEndpoint::durable(name.clone()), sink)
            .await
            .unwrap();
        assert!(delivered(&mut intake, &buffer).is_empty());

        receiver.start().await.unwrap();
        let second = broker.publish(&name, "two").unwrap();

        let messages = delivered(&mut intake, &buffer);
        let ids: Vec<_> = messages.iter().map(|m| m.message_id().clone()).collect();
        assert_eq!(ids, vec![first, second]);
        assert_eq!(messages[0].body(), &Bytes::from_static(b"one"));
        assert!(messages.iter().all(|m| !m.is_redelivered()));

        let stats = broker.stats(&name).unwrap();
        assert_eq!(stats.ready, 0);
        assert_eq!(stats.in_flight, 2);
    }

    #[tokio::test]
    async fn test_attributes_travel_with_the_message() {
        let (broker, name) = provisioned("orders");
        let connection = connect(&broker);
        let buffer = PendingBuffer::new();
        let (sink, mut intake) = delivery_channel(buffer.clone());

        let receiver = connection
            .bind(&QueueEndpoint::durable(name.clone()), sink)
            .await
            .unwrap();
        receiver.start().await.unwrap();

        let attributes = HashMap::from([("kind".to_string(), "order".to_string())]);
        broker
            .publish_with_attributes(&name, "payload", attributes)
            .unwrap();

        let messages = delivered(&mut intake, &buffer);
        assert_eq!(
            messages[0].attributes().get("kind").map(String::as_str),
            Some("order")
        );
    }

    #[tokio::test]
    async fn test_close_returns_in_flight_for_redelivery() {
        let (broker, name) = provisioned("orders");
        let connection = connect(&broker);
        let endpoint = QueueEndpoint::durable(name.clone());

        let first_ids: Vec<_> = (0..3)
            .map(|i| broker.publish(&name, format!("m{i}")).unwrap())
            .collect();

        let buffer = PendingBuffer::new();
        let (sink, mut intake) = delivery_channel(buffer.clone());
        let receiver = connection.bind(&endpoint, sink.clone()).await.unwrap();
        receiver.start().await.unwrap();
        assert_eq!(delivered(&mut intake, &buffer).len(), 3);

        receiver.close().await;
        let stats = broker.stats(&name).unwrap();
        assert_eq!(stats.ready, 3);
        assert_eq!(stats.in_flight, 0);

        let replacement = connection.bind(&endpoint, sink).await.unwrap();
        replacement.start().await.unwrap();

        let messages = delivered(&mut intake, &buffer);
        let redelivered: Vec<_> = messages[3..]
            .iter()
            .map(|m| m.message_id().clone())
            .collect();
        assert_eq!(redelivered, first_ids, "redelivery keeps queue order");
        assert!(messages[3..].iter().all(|m| m.is_redelivered()));
        assert!(messages[3..].iter().all(|m| m.delivery_count() == 2));
        assert_eq!(broker.stats(&name).unwrap().redelivered, 3);
    }
}

mod acknowledgment {
    use super::*;

    async fn started(
        broker: &InMemoryBroker,
        name: &QueueName,
    ) -> (InMemoryConnection, Box<dyn Receiver>, Intake, PendingBuffer) {
        let connection = connect(broker);
        let buffer = PendingBuffer::new();
        let (sink, intake) = delivery_channel(buffer.clone());
        let receiver = connection
            .bind(&QueueEndpoint::durable(name.clone()), sink)
            .await
            .unwrap();
        receiver.start().await.unwrap();
        (connection, receiver, intake, buffer)
    }

    #[tokio::test]
    async fn test_acknowledge_settles_message() {
        let (broker, name) = provisioned("orders");
        broker.publish(&name, "one").unwrap();
        let (_connection, _receiver, mut intake, buffer) = started(&broker, &name).await;

        let messages = delivered(&mut intake, &buffer);
        messages[0].acknowledge().await.unwrap();

        let stats = broker.stats(&name).unwrap();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.acknowledged, 1);
    }

    #[tokio::test]
    async fn test_duplicate_acknowledgment_is_harmless() {
        let (broker, name) = provisioned("orders");
        broker.publish(&name, "one").unwrap();
        let (_connection, receiver, mut intake, buffer) = started(&broker, &name).await;

        let original = delivered(&mut intake, &buffer).remove(0);
        receiver.close().await;

        let connection = connect(&broker);
        let (sink, mut second_intake) = delivery_channel(buffer.clone());
        let replacement = connection
            .bind(&QueueEndpoint::durable(name.clone()), sink)
            .await
            .unwrap();
        replacement.start().await.unwrap();
        second_intake.drain_ready();
        assert_eq!(buffer.size(), 2, "original and redelivered copy");

        original.acknowledge().await.unwrap();
        original.acknowledge().await.unwrap();

        let stats = broker.stats(&name).unwrap();
        assert_eq!(stats.acknowledged, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_scripted_faults_fail_in_order() {
        let (broker, name) = provisioned("orders");
        broker.publish(&name, "one").unwrap();
        broker.set_ack_faults(AckFaults::scripted([false, true]));
        let (_connection, _receiver, mut intake, buffer) = started(&broker, &name).await;

        let message = delivered(&mut intake, &buffer).remove(0);
        let failure = message.acknowledge().await.unwrap_err();
        assert!(matches!(failure, AckFailure::Rejected { .. }));
        assert_eq!(failure.message_id(), message.message_id());

        message.acknowledge().await.unwrap();
        assert_eq!(broker.stats(&name).unwrap().acknowledged, 1);
    }

    #[tokio::test]
    async fn test_certain_random_failure_always_rejects() {
        let (broker, name) = provisioned("orders");
        broker.publish(&name, "one").unwrap();
        broker.set_ack_faults(AckFaults::Random { failure_rate: 1.0 });
        let (_connection, _receiver, mut intake, buffer) = started(&broker, &name).await;

        let message = delivered(&mut intake, &buffer).remove(0);
        for _ in 0..5 {
            assert!(message.acknowledge().await.is_err());
        }

        broker.set_ack_faults(AckFaults::None);
        assert!(message.acknowledge().await.is_ok());
    }

    #[tokio::test]
    async fn test_settled_duplicates_do_not_draw_faults() {
        let (broker, name) = provisioned("orders");
        broker.publish(&name, "one").unwrap();
        broker.publish(&name, "two").unwrap();
        let (_connection, _receiver, mut intake, buffer) = started(&broker, &name).await;
        let mut messages = delivered(&mut intake, &buffer);
        let second = messages.remove(1);
        let first = messages.remove(0);

        first.acknowledge().await.unwrap();
        broker.set_ack_faults(AckFaults::scripted([false]));

        // The settled id succeeds and leaves the scripted failure untouched.
        first.acknowledge().await.unwrap();
        assert!(matches!(
            second.acknowledge().await,
            Err(AckFailure::Rejected { .. })
        ));
        second.acknowledge().await.unwrap();
        assert_eq!(broker.stats(&name).unwrap().acknowledged, 2);
    }

    #[tokio::test]
    async fn test_offline_broker_drops_bindings_and_acks() {
        let (broker, name) = provisioned("orders");
        broker.publish(&name, "one").unwrap();
        let (connection, receiver, mut intake, buffer) = started(&broker, &name).await;
        let message = delivered(&mut intake, &buffer).remove(0);

        broker.set_online(false);
        assert!(receiver.is_closed());
        assert!(!connection.is_connected());
        assert!(matches!(
            message.acknowledge().await,
            Err(AckFailure::TransportUnavailable { .. })
        ));
        assert_eq!(broker.stats(&name).unwrap().ready, 1);

        let (sink, _intake) = delivery_channel(PendingBuffer::new());
        assert!(matches!(
            connection
                .bind(&QueueEndpoint::durable(name.clone()), sink)
                .await,
            Err(BindError::ConnectionUnavailable { .. })
        ));

        broker.set_online(true);
        assert!(connection.is_connected());
        message.acknowledge().await.unwrap();
        assert_eq!(broker.stats(&name).unwrap().ready, 0);
    }
}
