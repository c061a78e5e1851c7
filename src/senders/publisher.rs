use crate::configuration::ExchangeSettings;
use crate::error::{Error, MessageError};
use crate::message::{Payload, ReturnedMessage, SendProperties, Text};
use crate::registry::ConnectionRegistry;
use crate::senders::{encode, prepare_properties, Route, Sender};
use crate::topology::ExchangeTopology;
use crate::transport::{PublishOutcome, Transport};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::warn;

/// Invoked with the messages the broker could not route.
pub type ReturnCallback = Arc<dyn Fn(&ReturnedMessage) + Send + Sync>;

/// Publishes messages to an exchange.
///
/// The routing key of a message is the one set through [`SendProperties::routing_key`], or the
/// first routing key configured on the exchange, or `""`.
///
/// Messages are published as mandatory: if no queue is bound for their routing key the broker
/// hands them back and the [`Publisher::on_return`] callback is invoked. This is not an error,
/// `send` still succeeds.
pub struct Publisher<T: Transport, P: Payload = Text> {
    sender: Sender<T, ExchangeTopology>,
    exchange: String,
    default_routing_key: String,
    persistent: bool,
    on_return: Option<ReturnCallback>,
    _payload: PhantomData<fn() -> P>,
}

impl<T: Transport, P: Payload> Publisher<T, P> {
    /// A publisher for the exchange configured as `exchange`, on the connection configured as
    /// `connection`.
    pub fn new(
        registry: Arc<ConnectionRegistry<T>>,
        connection: &str,
        exchange: &str,
    ) -> Result<Self, MessageError> {
        let exchange = registry.settings().get_exchange_settings(exchange, None)?;
        Self::with_exchange(registry, connection, exchange)
    }

    /// A publisher for an exchange that is not part of the configuration.
    pub fn with_exchange(
        registry: Arc<ConnectionRegistry<T>>,
        connection: &str,
        exchange: ExchangeSettings,
    ) -> Result<Self, MessageError> {
        registry.settings().get_connection_settings(connection)?;
        Ok(Self {
            exchange: exchange.name.clone(),
            default_routing_key: exchange.routing_keys.first().cloned().unwrap_or_default(),
            persistent: exchange.persistent,
            sender: Sender::new(registry, connection, ExchangeTopology(exchange)),
            on_return: None,
            _payload: PhantomData,
        })
    }

    /// Call `callback` for every message the broker returns as unroutable.
    #[must_use]
    pub fn on_return(
        mut self,
        callback: impl Fn(&ReturnedMessage) + Send + Sync + 'static,
    ) -> Self {
        self.set_on_return(callback);
        self
    }

    pub fn set_on_return(&mut self, callback: impl Fn(&ReturnedMessage) + Send + Sync + 'static) {
        self.on_return = Some(Arc::new(callback));
    }

    /// The logical name of the exchange.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Open the channel and declare the exchange now instead of on the first send.
    pub async fn open(&mut self) -> Result<(), Error> {
        self.sender.open().await
    }

    pub async fn close(&mut self) {
        self.sender.close().await;
    }

    pub fn is_open(&self) -> bool {
        self.sender.is_open()
    }

    pub async fn send(&mut self, data: &P::Borrowed) -> Result<(), Error> {
        self.send_with(data, |_| {}).await
    }

    /// Send, after letting `configure` set the properties (and the routing key) of this message.
    pub async fn send_with(
        &mut self,
        data: &P::Borrowed,
        configure: impl FnOnce(&mut SendProperties),
    ) -> Result<(), Error> {
        let properties = prepare_properties::<P>(configure, self.persistent);
        let payload = encode::<P>(data)?;
        let routing_key = properties
            .routing_key
            .as_deref()
            .unwrap_or(&self.default_routing_key)
            .to_owned();
        let outcome = self
            .sender
            .publish(
                Route::Exchange {
                    routing_key: &routing_key,
                },
                &payload,
                &properties,
            )
            .await?;
        if let PublishOutcome::Returned(returned) = outcome {
            match &self.on_return {
                Some(callback) => callback(&returned),
                None => warn!(
                    exchange = %returned.exchange,
                    routing_key = %returned.routing_key,
                    reply_code = returned.reply_code,
                    "The broker returned an unroutable message"
                ),
            }
        }
        Ok(())
    }
}
