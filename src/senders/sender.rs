use crate::error::{Error, ErrorCode, MessageError};
use crate::link::Link;
use crate::message::{Payload, SendProperties};
use crate::registry::ConnectionRegistry;
use crate::topology::Topology;
use crate::transport::{ChannelMode, Publication, PublishOutcome, Transport, TransportChannel};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;
use uuid::Uuid;

/// Where a message goes once the destination is declared.
pub(crate) enum Route<'a> {
    /// Through the default exchange, straight into the declared queue.
    Queue,
    /// Into the declared exchange, returned to us if it cannot be routed.
    Exchange { routing_key: &'a str },
}

/// The publish path shared by producers and publishers.
pub(crate) struct Sender<T: Transport, D: Topology> {
    link: Link<T>,
    topology: D,
    /// The declared destination, and the link generation it was declared on.
    destination: Option<(u64, String)>,
}

impl<T: Transport, D: Topology> Sender<T, D> {
    pub(crate) fn new(
        registry: Arc<ConnectionRegistry<T>>,
        connection_name: &str,
        topology: D,
    ) -> Self {
        Self {
            link: Link::new(
                registry,
                connection_name,
                ChannelMode::Publish { confirms: true },
            ),
            topology,
            destination: None,
        }
    }

    pub(crate) async fn open(&mut self) -> Result<(), Error> {
        self.ensure_declared().await.map(|_| ())
    }

    pub(crate) async fn close(&mut self) {
        self.link.close().await;
    }

    pub(crate) fn is_open(&self) -> bool {
        self.link.is_open()
    }

    /// Open the link and declare the destination if this link generation has not declared it yet.
    async fn ensure_declared(&mut self) -> Result<String, Error> {
        self.link.open().await?;
        let generation = self.link.generation();
        let declared = match &self.destination {
            Some((declared_on, name)) if *declared_on == generation => Some(name.clone()),
            _ => None,
        };
        if let Some(name) = declared {
            return Ok(name);
        }
        let channel = self.link.channel().await?;
        let declared = self.topology.declare(channel).await;
        match declared {
            Ok(name) => {
                self.destination = Some((generation, name.clone()));
                Ok(name)
            }
            Err(e) => Err(self.link.handle_error(e).await),
        }
    }

    async fn try_publish(
        &mut self,
        route: &Route<'_>,
        payload: &[u8],
        properties: &SendProperties,
    ) -> Result<PublishOutcome, Error> {
        let destination = self.ensure_declared().await?;
        let (exchange, routing_key, mandatory) = match route {
            Route::Queue => ("", destination.as_str(), false),
            Route::Exchange { routing_key } => (destination.as_str(), *routing_key, true),
        };
        let channel = self.link.channel().await?;
        let published = channel
            .publish(Publication {
                exchange,
                routing_key,
                payload,
                properties,
                mandatory,
            })
            .await;
        match published {
            Ok(outcome) => Ok(outcome),
            Err(e) => Err(self.link.handle_error(e).await),
        }
    }

    /// Publish, reopening the link and trying once more if the first attempt lost the
    /// connection.
    pub(crate) async fn publish(
        &mut self,
        route: Route<'_>,
        payload: &[u8],
        properties: &SendProperties,
    ) -> Result<PublishOutcome, Error> {
        match self.try_publish(&route, payload, properties).await {
            Err(e) if e.is_lost_connection() => {
                warn!(
                    connection = self.link.connection_name(),
                    error = ?e,
                    "Lost the connection while sending, retrying once"
                );
                self.try_publish(&route, payload, properties).await
            }
            outcome => outcome,
        }
    }
}

/// Encode a payload, failing with an [`ErrorCode::UnhandledError`].
pub(crate) fn encode<P: Payload>(data: &P::Borrowed) -> Result<std::borrow::Cow<'_, [u8]>, Error> {
    P::encode(data).map_err(|e| MessageError::new(ErrorCode::UnhandledError, e).into())
}

/// Fill in what the caller left out: message id, timestamp, content type and delivery mode.
pub(crate) fn prepare_properties<P: Payload>(
    configure: impl FnOnce(&mut SendProperties),
    persistent: bool,
) -> SendProperties {
    let mut properties = SendProperties::default();
    configure(&mut properties);
    if properties.timestamp.is_none() {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(now) => properties.timestamp = Some(now.as_secs()),
            Err(_) => warn!("System time is before 1970"),
        }
    }
    properties
        .message_id
        .get_or_insert_with(|| Uuid::new_v4().to_string());
    properties
        .content_type
        .get_or_insert_with(|| P::CONTENT_TYPE.to_owned());
    properties.persistent.get_or_insert(persistent);
    properties
}
