use crate::error::{Error, ErrorCode, MessageError};
use crate::link::Link;
use crate::message::Payload;
use crate::receivers::received::{Classifier, Received};
use crate::receivers::NoMessageMode;
use crate::registry::ConnectionRegistry;
use crate::topology::Topology;
use crate::transport::{ChannelMode, Delivery, Transport, TransportChannel};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// The receive loop shared by consumers and subscribers.
pub(crate) struct Receiver<T: Transport, D: Topology> {
    link: Link<T>,
    topology: D,
    /// The declared queue, and the link generation it was declared on.
    queue: Option<(u64, String)>,
    mode: NoMessageMode,
    /// Set when settling a delivered message hit a connection or channel error.
    broken: Arc<AtomicBool>,
}

impl<T: Transport, D: Topology> Receiver<T, D> {
    pub(crate) fn new(
        registry: Arc<ConnectionRegistry<T>>,
        connection_name: &str,
        topology: D,
    ) -> Result<Self, MessageError> {
        let prefetch_count = registry
            .settings()
            .get_connection_settings(connection_name)?
            .prefetch();
        Ok(Self {
            link: Link::new(
                registry,
                connection_name,
                ChannelMode::Consume { prefetch_count },
            ),
            topology,
            queue: None,
            mode: NoMessageMode::default(),
            broken: Arc::new(AtomicBool::new(false)),
        })
    }

    pub(crate) fn mode(&self) -> NoMessageMode {
        self.mode
    }

    pub(crate) fn set_mode(&mut self, mode: NoMessageMode) {
        self.mode = mode;
    }

    /// The queue on the broker, once declared.
    pub(crate) fn queue_name(&self) -> Option<&str> {
        self.queue.as_ref().map(|(_, name)| name.as_str())
    }

    /// Open the link and declare the queue, without consuming yet.
    pub(crate) async fn open(&mut self) -> Result<(), Error> {
        self.ensure_declared().await.map(|_| ())
    }

    pub(crate) async fn close(&mut self) {
        self.link.close().await;
        self.broken.store(false, Ordering::Release);
    }

    pub(crate) fn is_open(&self) -> bool {
        !self.broken.load(Ordering::Acquire) && self.link.is_open()
    }

    /// Open the link and declare the queue if this link generation has not declared it yet.
    async fn ensure_declared(&mut self) -> Result<String, Error> {
        if self.broken.swap(false, Ordering::AcqRel) {
            self.link.close().await;
        }
        self.link.open().await?;
        let generation = self.link.generation();
        let channel = self.link.channel().await?;

        let declared = match &self.queue {
            Some((declared_on, name)) if *declared_on == generation => Some(name.clone()),
            _ => None,
        };
        let queue = match declared {
            Some(name) => name,
            None => {
                let declared = self.topology.declare(channel).await;
                match declared {
                    Ok(name) => {
                        self.queue = Some((generation, name.clone()));
                        name
                    }
                    Err(e) => return Err(self.link.handle_error(e).await),
                }
            }
        };
        Ok(queue)
    }

    /// Declare the queue on a fresh link and register as its consumer.
    async fn ensure_consuming(&mut self) -> Result<(), Error> {
        let queue = self.ensure_declared().await?;
        let channel = self.link.channel().await?;
        if channel.is_consuming() {
            return Ok(());
        }
        let started = channel.start_consuming(&queue).await;
        match started {
            Ok(()) => Ok(()),
            Err(e) => Err(self.link.handle_error(e).await),
        }
    }

    /// Wait for the next message.
    ///
    /// The `timeout` window covers reopening the link after a lost connection, so a broker
    /// outage ends in a timeout rather than outlasting it.
    pub(crate) async fn receive<P: Payload>(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Option<Received<P>>, Error> {
        let delivery = match timeout {
            Some(window) => match tokio::time::timeout(window, self.next_delivery()).await {
                Ok(delivery) => delivery?,
                Err(_) => {
                    return match self.mode {
                        NoMessageMode::Timeout => Err(Error::Timeout(window)),
                        NoMessageMode::ReturnNone => Ok(None),
                    }
                }
            },
            None => self.next_delivery().await?,
        };
        self.wrap(delivery).await.map(Some)
    }

    async fn next_delivery(&mut self) -> Result<Delivery, Error> {
        self.ensure_consuming().await?;
        let channel = self.link.channel().await?;
        let delivery = channel.next_delivery().await;
        match delivery {
            Ok(delivery) => Ok(delivery),
            Err(e) => Err(self.link.handle_error(e).await),
        }
    }

    pub(crate) async fn receive_until<P: Payload>(
        &mut self,
        timeout: Option<Duration>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<Option<Received<P>>, Error> {
        tokio::select! {
            biased;

            _ = shutdown => Err(Error::Cancelled),
            received = self.receive(timeout) => received,
        }
    }

    pub(crate) async fn clear_buffer(&mut self) -> Result<(), Error> {
        let Some(channel) = self.link.channel_if_open() else {
            return Ok(());
        };
        let cleared = channel.clear_buffer().await;
        match cleared {
            Ok(()) => Ok(()),
            Err(e) => Err(self.link.handle_error(e).await),
        }
    }

    fn classifier(&self) -> Classifier {
        let registry = Arc::clone(self.link.registry());
        let connection = self.link.connection();
        let broken = Arc::clone(&self.broken);
        Arc::new(move |error| {
            let code = registry.transport().classify(connection.as_deref(), error);
            if code.is_some() {
                broken.store(true, Ordering::Release);
            }
            code
        })
    }

    async fn wrap<P: Payload>(&mut self, delivery: Delivery) -> Result<Received<P>, Error> {
        let Delivery {
            message_id,
            correlation_id,
            content_type,
            exchange,
            routing_key,
            redelivered,
            headers,
            data,
            acker,
        } = delivery;
        match P::decode(data) {
            Ok(data) => Ok(Received {
                data,
                message_id,
                correlation_id,
                content_type,
                exchange,
                routing_key,
                redelivered,
                headers,
                settled: false,
                acker,
                classify: self.classifier(),
            }),
            Err(e) => {
                warn!(
                    connection = self.link.connection_name(),
                    message_id = ?message_id,
                    error = ?e,
                    "Discarding a message that cannot be decoded"
                );
                let settled = if acker.can_reject() {
                    acker.reject(false).await
                } else {
                    acker.ack().await
                };
                if let Err(settle_error) = settled {
                    warn!(error = ?settle_error, "Failed to discard a poison message");
                }
                Err(MessageError::new(ErrorCode::PoisonMessage, e).into())
            }
        }
    }
}
