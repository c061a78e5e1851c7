//! Implements [`Manager`] for senders and receivers.
use crate::error::{Error, MessageError};
use crate::message::Payload;
use crate::receivers::{Consumer, Subscriber};
use crate::registry::ConnectionRegistry;
use crate::senders::{Producer, Publisher};
use crate::transport::Transport;
use deadpool::managed::{self, Manager, Object};
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// A sender or receiver that can be kept warm in a [`Pool`](super::Pool).
#[async_trait::async_trait]
pub trait Poolable<T: Transport>: Sized + Send + Sync + 'static {
    /// Build an instance bound to `connection` and `destination`, with its channel open.
    async fn create(
        registry: Arc<ConnectionRegistry<T>>,
        connection: &str,
        destination: &str,
    ) -> Result<Self, Error>;

    /// Whether the instance can be handed out again.
    fn is_healthy(&self) -> bool;

    async fn close(&mut self);
}

#[async_trait::async_trait]
impl<T: Transport, P: Payload> Poolable<T> for Consumer<T, P> {
    async fn create(
        registry: Arc<ConnectionRegistry<T>>,
        connection: &str,
        queue: &str,
    ) -> Result<Self, Error> {
        let mut consumer = Consumer::new(registry, connection, queue)?;
        consumer.open().await?;
        Ok(consumer)
    }

    fn is_healthy(&self) -> bool {
        self.is_open()
    }

    async fn close(&mut self) {
        Consumer::close(self).await;
    }
}

#[async_trait::async_trait]
impl<T: Transport, P: Payload> Poolable<T> for Subscriber<T, P> {
    async fn create(
        registry: Arc<ConnectionRegistry<T>>,
        connection: &str,
        exchange: &str,
    ) -> Result<Self, Error> {
        let mut subscriber = Subscriber::new(registry, connection, exchange)?;
        subscriber.open().await?;
        Ok(subscriber)
    }

    fn is_healthy(&self) -> bool {
        self.is_open()
    }

    async fn close(&mut self) {
        Subscriber::close(self).await;
    }
}

#[async_trait::async_trait]
impl<T: Transport, P: Payload> Poolable<T> for Producer<T, P> {
    async fn create(
        registry: Arc<ConnectionRegistry<T>>,
        connection: &str,
        queue: &str,
    ) -> Result<Self, Error> {
        let mut producer = Producer::new(registry, connection, queue)?;
        producer.open().await?;
        Ok(producer)
    }

    fn is_healthy(&self) -> bool {
        self.is_open()
    }

    async fn close(&mut self) {
        Producer::close(self).await;
    }
}

#[async_trait::async_trait]
impl<T: Transport, P: Payload> Poolable<T> for Publisher<T, P> {
    async fn create(
        registry: Arc<ConnectionRegistry<T>>,
        connection: &str,
        exchange: &str,
    ) -> Result<Self, Error> {
        let mut publisher = Publisher::new(registry, connection, exchange)?;
        publisher.open().await?;
        Ok(publisher)
    }

    fn is_healthy(&self) -> bool {
        self.is_open()
    }

    async fn close(&mut self) {
        Publisher::close(self).await;
    }
}

/// A pooled instance and the id it was given on creation.
pub(crate) struct Pooled<R> {
    pub(crate) id: Uuid,
    pub(crate) instance: R,
}

/// `RoleManager` implements [`Manager`] to create and recycle one kind of sender or receiver
/// bound to one connection and destination.
///
/// Once `draining` is set it creates nothing and recycles everything, so that closing a pool
/// only disposes of the instances it already holds.
pub(crate) struct RoleManager<T: Transport, R> {
    pub(crate) registry: Arc<ConnectionRegistry<T>>,
    pub(crate) connection: String,
    pub(crate) destination: String,
    pub(crate) draining: Arc<AtomicBool>,
    pub(crate) _role: PhantomData<fn() -> R>,
}

#[async_trait::async_trait]
impl<T: Transport, R: Poolable<T>> Manager for RoleManager<T, R> {
    type Type = Pooled<R>;
    type Error = Error;

    async fn create(&self) -> Result<Pooled<R>, Error> {
        if self.draining.load(Ordering::Acquire) {
            return Err(MessageError::unhandled("The pool is closing").into());
        }
        let instance = R::create(
            Arc::clone(&self.registry),
            &self.connection,
            &self.destination,
        )
        .await?;
        let id = Uuid::new_v4();
        debug!(
            pool_instance_id = %id,
            connection = %self.connection,
            destination = %self.destination,
            "Created a pooled instance"
        );
        Ok(Pooled { id, instance })
    }

    async fn recycle(&self, pooled: &mut Pooled<R>) -> managed::RecycleResult<Error> {
        if self.draining.load(Ordering::Acquire) || pooled.instance.is_healthy() {
            Ok(())
        } else {
            debug!(
                pool_instance_id = %pooled.id,
                "Discarding a pooled instance with a closed channel"
            );
            Err(managed::RecycleError::StaticMessage("The pooled instance lost its channel"))
        }
    }
}

/// A leased sender or receiver. It goes back to its pool when dropped.
pub struct PoolContainer<T: Transport, R: Poolable<T>> {
    object: Object<RoleManager<T, R>>,
}

impl<T: Transport, R: Poolable<T>> PoolContainer<T, R> {
    pub(crate) fn new(object: Object<RoleManager<T, R>>) -> Self {
        Self { object }
    }

    /// Identifies the pooled instance across leases.
    pub fn pool_instance_id(&self) -> Uuid {
        self.object.id
    }

    /// Take the instance out of the pool for good, freeing its slot.
    pub fn detach(self) -> R {
        Object::take(self.object).instance
    }
}

impl<T: Transport, R: Poolable<T>> Deref for PoolContainer<T, R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.object.instance
    }
}

impl<T: Transport, R: Poolable<T>> DerefMut for PoolContainer<T, R> {
    fn deref_mut(&mut self) -> &mut R {
        &mut self.object.instance
    }
}
