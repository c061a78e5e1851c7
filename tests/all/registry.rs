use crate::helpers::{connection_settings, CONNECTION};
use warren::configuration::MessagingConfiguration;
use warren::registry::ConnectionRegistry;
use warren::transport::MemoryBroker;
use warren::ErrorCode;

fn registry(broker: &MemoryBroker, endpoints: &str) -> ConnectionRegistry<MemoryBroker> {
    let configuration =
        MessagingConfiguration::default().with_connection(connection_settings(endpoints));
    ConnectionRegistry::new(broker.clone(), configuration)
}

#[tokio::test]
async fn the_registry_fails_over_to_the_first_reachable_endpoint_and_starts_from_it_next_time() {
    // Arrange
    let broker = MemoryBroker::new();
    broker.set_unreachable("rmq-1:5672", true);
    broker.set_unreachable("rmq-2:5672", true);
    let registry = registry(&broker, "rmq-1:5672,rmq-2:5672,rmq-3:5672");

    // Act
    registry.create_connection(CONNECTION).await.unwrap();

    // Assert
    assert_eq!(Some(2), registry.active_endpoint(CONNECTION));
    assert_eq!(3, broker.stats().connect_attempts);

    // Act
    broker.set_unreachable("rmq-1:5672", false);
    broker.drop_connections();
    registry.create_connection(CONNECTION).await.unwrap();

    // Assert
    assert_eq!(Some(2), registry.active_endpoint(CONNECTION));
    assert_eq!(4, broker.stats().connect_attempts);
}

#[tokio::test]
async fn a_healthy_connection_is_shared() {
    // Arrange
    let broker = MemoryBroker::new();
    let registry = registry(&broker, "rmq-1:5672");

    // Act
    let first = registry.create_connection(CONNECTION).await.unwrap();
    let second = registry.create_connection(CONNECTION).await.unwrap();

    // Assert
    assert!(std::sync::Arc::ptr_eq(&first, &second));
    assert_eq!(1, broker.stats().connections_opened);
}

#[tokio::test]
async fn when_no_endpoint_is_reachable_every_failure_is_reported() {
    // Arrange
    let broker = MemoryBroker::new();
    broker.set_unreachable("rmq-1:5672", true);
    broker.set_unreachable("rmq-2:5672", true);
    let registry = registry(&broker, "rmq-1:5672,rmq-2:5672");

    // Act
    let error = registry.create_connection(CONNECTION).await.unwrap_err();

    // Assert
    assert_eq!(ErrorCode::NoAcceptableEndpoints, error.code());
    let aggregate = error.aggregate().expect("Failures are aggregated");
    assert_eq!(2, aggregate.len());
    assert_eq!("amqp://rmq-1:5672", aggregate.failures()[0].endpoint);
    assert!(!registry.is_cached(CONNECTION));
    assert_eq!(0, broker.open_connections());
}

#[tokio::test]
async fn removing_a_connection_closes_it() {
    // Arrange
    let broker = MemoryBroker::new();
    let registry = registry(&broker, "rmq-1:5672");
    registry.create_connection(CONNECTION).await.unwrap();

    // Act
    registry.remove_connection(CONNECTION).await;

    // Assert
    assert!(!registry.is_cached(CONNECTION));
    assert_eq!(0, broker.open_connections());
}
