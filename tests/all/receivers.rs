use crate::helpers::{context, CONNECTION};
use std::sync::Arc;
use std::time::Duration;
use warren::configuration::{ConnectionSettings, MessagingConfiguration, QueueSettings};
use warren::message::Bytes;
use warren::receivers::{Consumer, NoMessageMode};
use warren::registry::ConnectionRegistry;
use warren::senders::Producer;
use warren::transport::MemoryBroker;
use warren::{Error, ErrorCode};

const WINDOW: Option<Duration> = Some(Duration::from_millis(200));

#[tokio::test]
async fn an_empty_queue_times_out_or_returns_nothing_depending_on_the_mode() {
    // Arrange
    let context = context();
    let mut consumer: Consumer<_> =
        Consumer::new(context.registry.clone(), CONNECTION, &context.queue).unwrap();

    // Act
    let timed_out = consumer.receive(WINDOW).await;
    consumer.set_mode(NoMessageMode::ReturnNone);
    let nothing = consumer.receive(WINDOW).await;

    // Assert
    assert!(timed_out.unwrap_err().is_timeout());
    assert!(nothing.unwrap().is_none());
}

#[tokio::test]
async fn acknowledging_twice_is_harmless() {
    // Arrange
    let context = context();
    let mut producer: Producer<_> =
        Producer::new(context.registry.clone(), CONNECTION, &context.queue).unwrap();
    let mut consumer: Consumer<_> =
        Consumer::new(context.registry.clone(), CONNECTION, &context.queue).unwrap();
    producer.send("once").await.unwrap();
    let mut received = consumer.receive(WINDOW).await.unwrap().unwrap();

    // Act
    received.acknowledge().await.unwrap();
    received.acknowledge().await.unwrap();
    received.reject(true).await.unwrap();

    // Assert
    assert!(received.is_acknowledged());
    assert_eq!(0, context.broker.unacked_count(&context.queue));
    assert_eq!(0, context.broker.queue_depth(&context.queue));
}

#[tokio::test]
async fn a_rejected_message_is_redelivered_if_requeued() {
    // Arrange
    let context = context();
    let mut producer: Producer<_> =
        Producer::new(context.registry.clone(), CONNECTION, &context.queue).unwrap();
    let mut consumer: Consumer<_> =
        Consumer::new(context.registry.clone(), CONNECTION, &context.queue).unwrap();
    producer.send("try again").await.unwrap();
    let mut first = consumer.receive(WINDOW).await.unwrap().unwrap();

    // Act
    first.reject(true).await.unwrap();
    let mut second = consumer.receive(WINDOW).await.unwrap().unwrap();

    // Assert
    assert_eq!("try again", second.data);
    assert!(second.redelivered());
    second.acknowledge().await.unwrap();
}

#[tokio::test]
async fn rejecting_is_not_supported_on_transports_without_negative_acknowledgements() {
    // Arrange
    let context = context();
    context.broker.set_reject_supported(false);
    let mut producer: Producer<_> =
        Producer::new(context.registry.clone(), CONNECTION, &context.queue).unwrap();
    let mut consumer: Consumer<_> =
        Consumer::new(context.registry.clone(), CONNECTION, &context.queue).unwrap();
    producer.send("keep me").await.unwrap();
    let mut received = consumer.receive(WINDOW).await.unwrap().unwrap();

    // Act
    let outcome = received.reject(false).await;

    // Assert
    assert!(matches!(outcome, Err(Error::NotSupported(_))));
    assert!(!received.is_acknowledged());
    received.acknowledge().await.unwrap();
}

#[tokio::test]
async fn a_message_that_cannot_be_decoded_is_discarded_as_poison() {
    // Arrange
    let context = context();
    let mut bytes_producer: Producer<_, Bytes> =
        Producer::new(context.registry.clone(), CONNECTION, &context.queue).unwrap();
    let mut text_producer: Producer<_> =
        Producer::new(context.registry.clone(), CONNECTION, &context.queue).unwrap();
    let mut consumer: Consumer<_> =
        Consumer::new(context.registry.clone(), CONNECTION, &context.queue).unwrap();
    bytes_producer.send(&[0xffu8, 0xfe, 0xfd]).await.unwrap();
    text_producer.send("valid").await.unwrap();

    // Act
    let poison = consumer.receive(WINDOW).await;
    let mut valid = consumer.receive(WINDOW).await.unwrap().unwrap();

    // Assert
    assert_eq!(Some(ErrorCode::PoisonMessage), poison.unwrap_err().code());
    assert_eq!("valid", valid.data);
    valid.acknowledge().await.unwrap();
    assert_eq!(0, context.broker.unacked_count(&context.queue));
    assert_eq!(0, context.broker.queue_depth(&context.queue));
}

#[tokio::test]
async fn a_receive_is_cancelled_when_the_shutdown_signal_fires() {
    // Arrange
    let context = context();
    let mut consumer: Consumer<_> =
        Consumer::new(context.registry.clone(), CONNECTION, &context.queue).unwrap();

    // Act
    let outcome = consumer
        .receive_until(None, tokio::time::sleep(Duration::from_millis(50)))
        .await;

    // Assert
    assert!(matches!(outcome, Err(Error::Cancelled)));
}

#[tokio::test]
async fn clearing_the_buffer_hands_unsettled_messages_back() {
    // Arrange
    let context = context();
    let mut producer: Producer<_> =
        Producer::new(context.registry.clone(), CONNECTION, &context.queue).unwrap();
    let mut consumer: Consumer<_> =
        Consumer::new(context.registry.clone(), CONNECTION, &context.queue).unwrap();
    for body in ["one", "two", "three"] {
        producer.send(body).await.unwrap();
    }
    let first = consumer.receive(WINDOW).await.unwrap().unwrap();
    assert_eq!(1, context.broker.unacked_count(&context.queue));

    // Act
    consumer.clear_buffer().await.unwrap();

    // Assert
    assert_eq!(0, context.broker.unacked_count(&context.queue));
    assert_eq!(3, context.broker.queue_depth(&context.queue));
    drop(first);
    let mut again = consumer.receive(WINDOW).await.unwrap().unwrap();
    assert_eq!("one", again.data);
    assert!(again.redelivered());
    again.acknowledge().await.unwrap();
}

#[tokio::test]
async fn a_consumer_recovers_after_the_broker_drops_its_connections() {
    // Arrange
    let context = context();
    let mut producer: Producer<_> =
        Producer::new(context.registry.clone(), CONNECTION, &context.queue).unwrap();
    let mut consumer: Consumer<_> =
        Consumer::new(context.registry.clone(), CONNECTION, &context.queue).unwrap();
    producer.send("before").await.unwrap();
    let mut before = consumer.receive(WINDOW).await.unwrap().unwrap();
    before.acknowledge().await.unwrap();

    // Act
    assert_eq!(1, context.broker.drop_connections());
    producer.send("after").await.unwrap();
    let mut after = consumer.receive(WINDOW).await.unwrap().unwrap();

    // Assert
    assert_eq!("after", after.data);
    after.acknowledge().await.unwrap();
    assert_eq!(2, context.broker.stats().connections_opened);
    assert!(consumer.is_open());
}

#[tokio::test]
async fn an_unacknowledged_message_is_redelivered_after_the_connection_drops() {
    // Arrange
    let context = context();
    let mut producer: Producer<_> =
        Producer::new(context.registry.clone(), CONNECTION, &context.queue).unwrap();
    let mut consumer: Consumer<_> =
        Consumer::new(context.registry.clone(), CONNECTION, &context.queue).unwrap();
    producer.send("in flight").await.unwrap();
    let mut in_flight = consumer.receive(WINDOW).await.unwrap().unwrap();

    // Act
    context.broker.drop_connections();
    let late_ack = in_flight.acknowledge().await;
    let mut redelivered = consumer.receive(WINDOW).await.unwrap().unwrap();

    // Assert
    assert_eq!(Some(ErrorCode::LostConnection), late_ack.unwrap_err().code());
    assert_eq!("in flight", redelivered.data);
    assert!(redelivered.redelivered());
    redelivered.acknowledge().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn the_receive_timeout_also_bounds_reconnection() {
    // Arrange
    let broker = MemoryBroker::new();
    broker.set_unreachable("rmq-1:5672", true);
    broker.set_unreachable("rmq-2:5672", true);
    let configuration = MessagingConfiguration::default()
        .with_connection(ConnectionSettings {
            delay_on_reconnect_ms: 5_000,
            ..ConnectionSettings::new(CONNECTION, "rmq-1:5672,rmq-2:5672")
        })
        .with_queue(QueueSettings::new("orders"));
    let registry = Arc::new(ConnectionRegistry::new(broker, configuration));
    let mut consumer: Consumer<_> = Consumer::new(registry, CONNECTION, "orders").unwrap();

    // Act
    let started = tokio::time::Instant::now();
    let outcome = consumer.receive(Some(Duration::from_millis(100))).await;

    // Assert
    assert!(outcome.unwrap_err().is_timeout());
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn a_failed_acknowledgement_closes_the_consumer_link() {
    // Arrange
    let context = context();
    let mut producer: Producer<_> =
        Producer::new(context.registry.clone(), CONNECTION, &context.queue).unwrap();
    let mut consumer: Consumer<_> =
        Consumer::new(context.registry.clone(), CONNECTION, &context.queue).unwrap();
    producer.send("stale").await.unwrap();
    let mut first = consumer.receive(WINDOW).await.unwrap().unwrap();
    consumer.clear_buffer().await.unwrap();

    // Act
    let late_ack = first.acknowledge().await;

    // Assert
    assert_eq!(Some(ErrorCode::LostConnection), late_ack.unwrap_err().code());
    assert!(!consumer.is_open());
    let channels_before = context.broker.stats().channels_opened;
    let mut again = consumer.receive(WINDOW).await.unwrap().unwrap();
    assert_eq!("stale", again.data);
    assert!(again.redelivered());
    again.acknowledge().await.unwrap();
    assert_eq!(channels_before + 1, context.broker.stats().channels_opened);
}
