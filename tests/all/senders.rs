use crate::helpers::{context, CONNECTION};
use fake::faker::lorem::en::Sentence;
use fake::Fake;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use warren::message::{Bytes, Headers, Map, ReturnedMessage, Text};
use warren::receivers::{Consumer, Subscriber};
use warren::senders::{Producer, Publisher};

const WINDOW: Option<Duration> = Some(Duration::from_secs(1));

#[tokio::test]
async fn opening_twice_reuses_the_channel() {
    // Arrange
    let context = context();
    let mut producer: Producer<_> =
        Producer::new(context.registry.clone(), CONNECTION, &context.queue).unwrap();

    // Act
    producer.open().await.unwrap();
    producer.open().await.unwrap();

    // Assert
    assert!(producer.is_open());
    assert_eq!(1, context.broker.stats().channels_opened);
    assert!(context.broker.queue_exists(&context.queue));
}

#[tokio::test]
async fn text_messages_arrive_with_their_properties() {
    // Arrange
    let context = context();
    let mut producer: Producer<_> =
        Producer::new(context.registry.clone(), CONNECTION, &context.queue).unwrap();
    let mut consumer: Consumer<_> =
        Consumer::new(context.registry.clone(), CONNECTION, &context.queue).unwrap();
    let body: String = Sentence(3..8).fake();

    // Act
    producer
        .send_with(&body, |properties| {
            properties.correlation_id = Some("request-1".into());
            properties.set_header("tenant", "acme").set_header("attempt", 3);
        })
        .await
        .unwrap();
    let mut received = consumer.receive(WINDOW).await.unwrap().unwrap();

    // Assert
    assert_eq!(body, received.data);
    assert_eq!(Some("request-1"), received.correlation_id());
    assert_eq!(Some("text/plain"), received.content_type());
    assert!(received.message_id().is_some());
    assert_eq!(Some("acme".to_owned()), received.get_header::<String>("tenant"));
    assert_eq!(3, received.get_header_or::<i64>("attempt", 0));
    assert_eq!(0, received.get_header_or::<i64>("missing", 0));
    assert!(!received.redelivered());
    received.acknowledge().await.unwrap();
}

#[tokio::test]
async fn bytes_and_map_messages_round_trip() {
    // Arrange
    let context = context();
    let mut bytes_producer: Producer<_, Bytes> =
        Producer::new(context.registry.clone(), CONNECTION, &context.queue).unwrap();
    let mut map_producer: Producer<_, Map> =
        Producer::new(context.registry.clone(), CONNECTION, &context.queue).unwrap();
    let mut bytes_consumer: Consumer<_, Bytes> =
        Consumer::new(context.registry.clone(), CONNECTION, &context.queue).unwrap();
    let mut map: Headers = Headers::new();
    map.insert("order".into(), 42i64.into());
    map.insert("customer".into(), "ada".into());
    map.insert("paid".into(), true.into());

    // Act
    bytes_producer.send(&[0u8, 159, 146, 150]).await.unwrap();
    map_producer.send(&map).await.unwrap();
    let mut first = bytes_consumer.receive(WINDOW).await.unwrap().unwrap();
    first.acknowledge().await.unwrap();
    bytes_consumer.close().await;
    let mut map_consumer: Consumer<_, Map> =
        Consumer::new(context.registry.clone(), CONNECTION, &context.queue).unwrap();
    let mut second = map_consumer.receive(WINDOW).await.unwrap().unwrap();
    second.acknowledge().await.unwrap();

    // Assert
    assert_eq!(vec![0u8, 159, 146, 150], first.data);
    assert_eq!(Some("application/octet-stream"), first.content_type());
    assert_eq!(map, second.data);
    assert_eq!(Some("application/x-amqp-table"), second.content_type());
}

#[tokio::test]
async fn a_send_interrupted_by_a_connection_reset_is_retried_once() {
    // Arrange
    let context = context();
    let mut producer: Producer<_> =
        Producer::new(context.registry.clone(), CONNECTION, &context.queue).unwrap();
    producer.open().await.unwrap();
    context.broker.fail_next_publishes(1);

    // Act
    producer.send("hello").await.unwrap();

    // Assert
    let stats = context.broker.stats();
    assert_eq!(2, stats.publish_attempts);
    assert_eq!(2, stats.connections_opened);
    assert_eq!(1, context.broker.queue_depth(&context.queue));
}

#[tokio::test]
async fn a_send_is_not_retried_more_than_once() {
    // Arrange
    let context = context();
    let mut producer: Producer<_> =
        Producer::new(context.registry.clone(), CONNECTION, &context.queue).unwrap();
    producer.open().await.unwrap();
    context.broker.fail_next_publishes(2);

    // Act
    let error = producer.send("hello").await.unwrap_err();

    // Assert
    assert!(error.is_lost_connection());
    assert_eq!(2, context.broker.stats().publish_attempts);
    assert_eq!(0, context.broker.queue_depth(&context.queue));

    // The next send reconnects.
    producer.send("hello again").await.unwrap();
    assert_eq!(1, context.broker.queue_depth(&context.queue));
}

#[tokio::test]
async fn unroutable_messages_are_handed_to_the_return_callback() {
    // Arrange
    let context = context();
    let returned: Arc<Mutex<Vec<ReturnedMessage>>> = Arc::default();
    let sink = Arc::clone(&returned);
    let mut publisher: Publisher<_> =
        Publisher::new(context.registry.clone(), CONNECTION, &context.exchange)
            .unwrap()
            .on_return(move |message| sink.lock().unwrap().push(message.clone()));

    // Act
    publisher
        .send_with("nobody listens", |properties| {
            properties.routing_key = Some("orders.created".into());
        })
        .await
        .unwrap();

    // Assert
    let returned = returned.lock().unwrap();
    assert_eq!(1, returned.len());
    assert_eq!(312, returned[0].reply_code);
    assert_eq!("orders.created", returned[0].routing_key);
    assert_eq!(b"nobody listens".to_vec(), returned[0].data);
}

#[tokio::test]
async fn published_messages_reach_every_subscriber_whose_binding_matches() {
    // Arrange
    let context = context();
    let mut publisher: Publisher<_> =
        Publisher::new(context.registry.clone(), CONNECTION, &context.exchange).unwrap();
    let mut first: Subscriber<_> =
        Subscriber::new(context.registry.clone(), CONNECTION, &context.exchange).unwrap();
    let mut second: Subscriber<_> =
        Subscriber::durable(context.registry.clone(), CONNECTION, &context.exchange, "audit")
            .unwrap();
    first.open().await.unwrap();
    second.open().await.unwrap();

    // Act
    publisher
        .send_with("created", |properties| {
            properties.routing_key = Some("orders.created".into());
        })
        .await
        .unwrap();
    let mut to_first = first.receive(WINDOW).await.unwrap().unwrap();
    let mut to_second = second.receive(WINDOW).await.unwrap().unwrap();

    // Assert
    assert_eq!("created", to_first.data);
    assert_eq!("created", to_second.data);
    assert_eq!("orders.created", to_first.routing_key());
    assert_eq!(context.exchange, to_second.exchange());
    assert_eq!(
        Some(format!("{}.audit", context.exchange).as_str()),
        second.queue_name()
    );
    to_first.acknowledge().await.unwrap();
    to_second.acknowledge().await.unwrap();
}

#[tokio::test]
async fn text_producers_are_the_default() {
    // Arrange
    let context = context();
    let mut producer: Producer<_, Text> =
        Producer::new(context.registry.clone(), CONNECTION, &context.queue).unwrap();

    // Act
    producer.send("plain").await.unwrap();

    // Assert
    assert_eq!(1, context.broker.queue_depth(&context.queue));
}

#[tokio::test]
async fn a_producer_ignores_a_routing_key_override() {
    // Arrange
    let context = context();
    let mut producer: Producer<_> =
        Producer::new(context.registry.clone(), CONNECTION, &context.queue).unwrap();
    let mut consumer: Consumer<_> =
        Consumer::new(context.registry.clone(), CONNECTION, &context.queue).unwrap();

    // Act
    producer
        .send_with("to the queue", |properties| {
            properties.routing_key = Some("elsewhere".into());
        })
        .await
        .unwrap();

    // Assert
    let mut received = consumer.receive(WINDOW).await.unwrap().unwrap();
    assert_eq!("to the queue", received.data);
    assert_eq!(context.queue, received.routing_key());
    received.acknowledge().await.unwrap();
}
