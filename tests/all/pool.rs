use crate::helpers::{context_with, TestContext, CONNECTION};
use futures_util::future::join_all;
use std::collections::HashSet;
use std::time::Duration;
use warren::configuration::{ExchangeKind, MessagingConfiguration};
use warren::message::Text;
use warren::pool::{Pool, PoolError, PoolSettings};
use warren::transport::MemoryBroker;

fn pool(max_size: usize, initial_size: usize) -> (TestContext, Pool<MemoryBroker>) {
    let settings = PoolSettings {
        initial_size,
        max_size,
        wait_timeout_ms: Some(100),
    };
    let context = context_with(
        MessagingConfiguration::default().with_pool(settings.clone()),
        ExchangeKind::Fanout,
    );
    let pool = Pool::new(context.registry.clone(), settings);
    (context, pool)
}

#[tokio::test]
async fn a_returned_instance_is_handed_out_again() {
    // Arrange
    let (context, pool) = pool(4, 0);
    let first = pool
        .producer::<Text>(CONNECTION, &context.queue)
        .await
        .unwrap();
    let first_id = first.pool_instance_id();
    drop(first);

    // Act
    let mut second = pool
        .producer::<Text>(CONNECTION, &context.queue)
        .await
        .unwrap();
    second.send("reused").await.unwrap();

    // Assert
    assert_eq!(first_id, second.pool_instance_id());
    assert_eq!(1, context.broker.stats().channels_opened);
    assert_eq!(1, pool.total_pool_size());
    assert_eq!(1, context.broker.queue_depth(&context.queue));
}

#[tokio::test]
async fn instances_are_pooled_per_role_and_destination() {
    // Arrange
    let (context, pool) = pool(4, 0);

    // Act
    let producer = pool
        .producer::<Text>(CONNECTION, &context.queue)
        .await
        .unwrap();
    let consumer = pool
        .consumer::<Text>(CONNECTION, &context.queue)
        .await
        .unwrap();
    let publisher = pool
        .publisher::<Text>(CONNECTION, &context.exchange)
        .await
        .unwrap();
    let subscriber = pool
        .subscriber::<Text>(CONNECTION, &context.exchange)
        .await
        .unwrap();

    // Assert
    assert_eq!(4, pool.total_pool_size());
    assert_eq!(4, context.broker.stats().channels_opened);
    assert!(producer.is_open() && consumer.is_open());
    assert!(publisher.is_open() && subscriber.is_open());
}

#[tokio::test]
async fn a_full_pool_refuses_a_lease_without_waiting() {
    // Arrange
    let (context, pool) = pool(1, 0);
    let _leased = pool
        .consumer::<Text>(CONNECTION, &context.queue)
        .await
        .unwrap();

    // Act
    let outcome = pool.try_consumer::<Text>(CONNECTION, &context.queue).await;

    // Assert
    assert!(matches!(outcome, Err(PoolError::Exhausted)));
}

#[tokio::test]
async fn a_full_pool_gives_up_after_the_wait_timeout() {
    // Arrange
    let (context, pool) = pool(1, 0);
    let _leased = pool
        .producer::<Text>(CONNECTION, &context.queue)
        .await
        .unwrap();

    // Act
    let started = tokio::time::Instant::now();
    let outcome = pool.producer::<Text>(CONNECTION, &context.queue).await;

    // Assert
    assert!(matches!(outcome, Err(PoolError::Exhausted)));
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn the_first_lease_prewarms_the_pool() {
    // Arrange
    let (context, pool) = pool(4, 3);

    // Act
    let _leased = pool
        .producer::<Text>(CONNECTION, &context.queue)
        .await
        .unwrap();

    // Assert
    assert_eq!(3, pool.total_pool_size());
    assert_eq!(3, context.broker.stats().channels_opened);
}

#[tokio::test]
async fn an_instance_that_lost_its_channel_is_replaced() {
    // Arrange
    let (context, pool) = pool(4, 0);
    let first = pool
        .consumer::<Text>(CONNECTION, &context.queue)
        .await
        .unwrap();
    let first_id = first.pool_instance_id();
    drop(first);
    context.broker.drop_connections();

    // Act
    let second = pool
        .consumer::<Text>(CONNECTION, &context.queue)
        .await
        .unwrap();

    // Assert
    assert_ne!(first_id, second.pool_instance_id());
    assert!(second.is_open());
    assert_eq!(1, pool.total_pool_size());
}

#[tokio::test]
async fn a_detached_instance_leaves_the_pool() {
    // Arrange
    let (context, pool) = pool(2, 0);
    let leased = pool
        .producer::<Text>(CONNECTION, &context.queue)
        .await
        .unwrap();

    // Act
    let mut detached = leased.detach();

    // Assert
    assert_eq!(0, pool.total_pool_size());
    detached.send("still works").await.unwrap();
    assert_eq!(1, context.broker.queue_depth(&context.queue));
}

#[tokio::test]
async fn a_closed_pool_closes_idle_instances_and_refuses_leases() {
    // Arrange
    let (context, pool) = pool(4, 2);
    drop(
        pool.producer::<Text>(CONNECTION, &context.queue)
            .await
            .unwrap(),
    );

    // Act
    pool.close().await;
    let outcome = pool.producer::<Text>(CONNECTION, &context.queue).await;

    // Assert
    assert!(matches!(outcome, Err(PoolError::Closed)));
    assert_eq!(2, context.broker.stats().channels_closed);
    assert_eq!(0, pool.total_pool_size());
}

#[tokio::test]
async fn closing_a_pool_with_a_dead_idle_instance_opens_nothing() {
    // Arrange
    let (context, pool) = pool(4, 0);
    drop(
        pool.producer::<Text>(CONNECTION, &context.queue)
            .await
            .unwrap(),
    );
    context.broker.drop_connections();
    let before = context.broker.stats();

    // Act
    pool.close().await;

    // Assert
    let after = context.broker.stats();
    assert_eq!(before.connect_attempts, after.connect_attempts);
    assert_eq!(before.channels_opened, after.channels_opened);
    assert_eq!(0, context.broker.open_connections());
    assert_eq!(0, pool.total_pool_size());
}

#[tokio::test]
async fn concurrent_leases_fill_the_pool_with_distinct_instances() {
    // Arrange
    let (context, pool) = pool(4, 0);

    // Act
    let leases = tokio::time::timeout(
        Duration::from_millis(500),
        join_all((0..4).map(|_| pool.producer::<Text>(CONNECTION, &context.queue))),
    )
    .await
    .expect("Concurrent leases should not wait on each other");

    // Assert
    let ids: HashSet<_> = leases
        .iter()
        .map(|lease| lease.as_ref().unwrap().pool_instance_id())
        .collect();
    assert_eq!(4, ids.len());
    assert_eq!(4, pool.total_pool_size());
    assert_eq!(1, context.broker.stats().connections_opened);
}
