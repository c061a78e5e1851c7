use crate::configuration::QueueSettings;
use crate::error::{Error, MessageError};
use crate::message::{Payload, Text};
use crate::receivers::{NoMessageMode, Received, Receiver};
use crate::registry::ConnectionRegistry;
use crate::topology::QueueTopology;
use crate::transport::Transport;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// Reads messages from a queue.
///
/// The queue is declared (and bound to its exchange, if configured) the first time a message
/// is requested, and again after every reconnection.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use warren::configuration::{ConnectionSettings, MessagingConfiguration, QueueSettings};
/// use warren::receivers::Consumer;
/// use warren::registry::ConnectionRegistry;
/// use warren::transport::RabbitMq;
///
/// # async fn run() -> Result<(), warren::Error> {
/// let configuration = MessagingConfiguration::default()
///     .with_connection(ConnectionSettings::new("main", "rmq-1:5672,rmq-2:5672"))
///     .with_queue(QueueSettings::new("orders"));
/// let registry = Arc::new(ConnectionRegistry::new(RabbitMq::new(), configuration));
///
/// let mut consumer: Consumer<_> = Consumer::new(registry, "main", "orders")?;
/// if let Some(mut message) = consumer.receive(Some(Duration::from_secs(5))).await? {
///     println!("{}", message.data);
///     message.acknowledge().await?;
/// }
/// # Ok(())
/// # }
/// ```
pub struct Consumer<T: Transport, P: Payload = Text> {
    receiver: Receiver<T, QueueTopology>,
    queue: String,
    _payload: PhantomData<fn() -> P>,
}

impl<T: Transport, P: Payload> Consumer<T, P> {
    /// A consumer of the queue configured as `queue`, on the connection configured as
    /// `connection`.
    pub fn new(
        registry: Arc<ConnectionRegistry<T>>,
        connection: &str,
        queue: &str,
    ) -> Result<Self, MessageError> {
        let queue = registry.settings().get_queue_settings(queue, None)?;
        Self::with_queue(registry, connection, queue)
    }

    /// A consumer of a queue that is not part of the configuration.
    pub fn with_queue(
        registry: Arc<ConnectionRegistry<T>>,
        connection: &str,
        queue: QueueSettings,
    ) -> Result<Self, MessageError> {
        let name = queue.name.clone();
        Ok(Self {
            receiver: Receiver::new(registry, connection, QueueTopology(queue))?,
            queue: name,
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

    /// The logical name of the queue.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// The queue name on the broker, once declared.
    pub fn queue_name(&self) -> Option<&str> {
        self.receiver.queue_name()
    }

    /// Open the channel now instead of on the first receive.
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
    /// An empty window is an [`Error::Timeout`] or `Ok(None)`, depending on the
    /// [`NoMessageMode`]. The window includes reconnecting, so it also bounds a broker outage.
    pub async fn receive(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Option<Received<P>>, Error> {
        self.receiver.receive(timeout).await
    }

    /// Like [`Consumer::receive`], giving up with [`Error::Cancelled`] as soon as `shutdown`
    /// completes.
    pub async fn receive_until(
        &mut self,
        timeout: Option<Duration>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<Option<Received<P>>, Error> {
        self.receiver.receive_until(timeout, shutdown).await
    }

    /// Return every prefetched, unacknowledged message to the queue.
    pub async fn clear_buffer(&mut self) -> Result<(), Error> {
        self.receiver.clear_buffer().await
    }
}
