use crate::configuration::ExchangeSettings;
use crate::error::{Error, MessageError};
use crate::message::{Payload, Text};
use crate::receivers::{NoMessageMode, Received, Receiver};
use crate::registry::ConnectionRegistry;
use crate::topology::SubscriptionTopology;
use crate::transport::Transport;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// Reads the messages published to an exchange.
///
/// A subscriber binds its own queue to the exchange, using every configured routing key (or a
/// catch-all binding when there are none). By default the queue is temporary and messages
/// published while the subscriber is disconnected are lost; [`Subscriber::durable`] keeps
/// them in a queue named `<exchange>.<subscription id>`.
pub struct Subscriber<T: Transport, P: Payload = Text> {
    receiver: Receiver<T, SubscriptionTopology>,
    exchange: String,
    subscription_id: Option<String>,
    _payload: PhantomData<fn() -> P>,
}

impl<T: Transport, P: Payload> Subscriber<T, P> {
    /// A temporary subscription to the exchange configured as `exchange`.
    pub fn new(
        registry: Arc<ConnectionRegistry<T>>,
        connection: &str,
        exchange: &str,
    ) -> Result<Self, MessageError> {
        let exchange = registry.settings().get_exchange_settings(exchange, None)?;
        Self::with_exchange(registry, connection, exchange, None)
    }

    /// A durable subscription: the queue outlives the subscriber.
    pub fn durable(
        registry: Arc<ConnectionRegistry<T>>,
        connection: &str,
        exchange: &str,
        subscription_id: impl Into<String>,
    ) -> Result<Self, MessageError> {
        let exchange = registry.settings().get_exchange_settings(exchange, None)?;
        Self::with_exchange(registry, connection, exchange, Some(subscription_id.into()))
    }

    pub fn with_exchange(
        registry: Arc<ConnectionRegistry<T>>,
        connection: &str,
        exchange: ExchangeSettings,
        subscription_id: Option<String>,
    ) -> Result<Self, MessageError> {
        let name = exchange.name.clone();
        let topology = SubscriptionTopology {
            exchange,
            subscription_id: subscription_id.clone(),
        };
        Ok(Self {
            receiver: Receiver::new(registry, connection, topology)?,
            exchange: name,
            subscription_id,
            _payload: PhantomData,
        })
    }

    #[must_use]
    pub fn with_mode(mut self, mode: NoMessageMode) -> Self {
        self.receiver.set_mode(mode);
        self
    }

    pub fn set_mode(&mut self, mode: NoMessageMode) {
        self.receiver.set_mode(mode);
    }

    pub fn mode(&self) -> NoMessageMode {
        self.receiver.mode()
    }

    /// The logical name of the exchange.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription_id.as_deref()
    }

    /// The subscription queue on the broker, once declared.
    pub fn queue_name(&self) -> Option<&str> {
        self.receiver.queue_name()
    }

    pub async fn open(&mut self) -> Result<(), Error> {
        self.receiver.open().await
    }

    pub async fn close(&mut self) {
        self.receiver.close().await;
    }

    pub fn is_open(&self) -> bool {
        self.receiver.is_open()
    }

    /// Wait up to `timeout` for the next message (forever if `None`).
    ///
    /// The subscription queue is bound on the first call: only messages published from then on
    /// are received.
    pub async fn receive(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Option<Received<P>>, Error> {
        self.receiver.receive(timeout).await
    }

    pub async fn receive_until(
        &mut self,
        timeout: Option<Duration>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<Option<Received<P>>, Error> {
        self.receiver.receive_until(timeout, shutdown).await
    }

    pub async fn clear_buffer(&mut self) -> Result<(), Error> {
        self.receiver.clear_buffer().await
    }
}
