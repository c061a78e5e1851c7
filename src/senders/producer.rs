use crate::configuration::QueueSettings;
use crate::error::{Error, MessageError};
use crate::message::{Payload, SendProperties, Text};
use crate::registry::ConnectionRegistry;
use crate::senders::{encode, prepare_properties, Route, Sender};
use crate::topology::QueueTopology;
use crate::transport::Transport;
use std::marker::PhantomData;
use std::sync::Arc;

/// Sends messages to a queue, through the default exchange.
///
/// The payload type decides what `send` accepts: `Producer<_, Text>` sends `&str`,
/// `Producer<_, Bytes>` sends `&[u8]` and `Producer<_, Map>` sends map messages.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use warren::configuration::{ConnectionSettings, MessagingConfiguration, QueueSettings};
/// use warren::registry::ConnectionRegistry;
/// use warren::senders::Producer;
/// use warren::transport::RabbitMq;
///
/// # async fn run() -> Result<(), warren::Error> {
/// let configuration = MessagingConfiguration::default()
///     .with_connection(ConnectionSettings::new("main", "rmq-1:5672,rmq-2:5672"))
///     .with_queue(QueueSettings::new("orders"));
/// let registry = Arc::new(ConnectionRegistry::new(RabbitMq::new(), configuration));
///
/// let mut producer: Producer<_> = Producer::new(registry, "main", "orders")?;
/// producer
///     .send_with(r#"{"id": 42}"#, |properties| {
///         properties.content_type = Some("application/json".into());
///         properties.time_to_live = Some(Duration::from_secs(60));
///     })
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct Producer<T: Transport, P: Payload = Text> {
    sender: Sender<T, QueueTopology>,
    queue: String,
    persistent: bool,
    _payload: PhantomData<fn() -> P>,
}

impl<T: Transport, P: Payload> Producer<T, P> {
    /// A producer for the queue configured as `queue`, on the connection configured as
    /// `connection`.
    pub fn new(
        registry: Arc<ConnectionRegistry<T>>,
        connection: &str,
        queue: &str,
    ) -> Result<Self, MessageError> {
        let queue = registry.settings().get_queue_settings(queue, None)?;
        Self::with_queue(registry, connection, queue)
    }

    /// A producer for a queue that is not part of the configuration.
    pub fn with_queue(
        registry: Arc<ConnectionRegistry<T>>,
        connection: &str,
        queue: QueueSettings,
    ) -> Result<Self, MessageError> {
        registry.settings().get_connection_settings(connection)?;
        Ok(Self {
            queue: queue.name.clone(),
            persistent: queue.persistent,
            sender: Sender::new(registry, connection, QueueTopology(queue)),
            _payload: PhantomData,
        })
    }

    /// The logical name of the queue.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Open the channel and declare the queue now instead of on the first send.
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

    /// Send, after letting `configure` set the properties of this message.
    ///
    /// Messages always go to the producer's queue through the default exchange:
    /// [`SendProperties::routing_key`] is ignored.
    pub async fn send_with(
        &mut self,
        data: &P::Borrowed,
        configure: impl FnOnce(&mut SendProperties),
    ) -> Result<(), Error> {
        let properties = prepare_properties::<P>(configure, self.persistent);
        let payload = encode::<P>(data)?;
        self.sender
            .publish(Route::Queue, &payload, &properties)
            .await?;
        Ok(())
    }
}
