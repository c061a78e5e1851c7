//! The seam between the resilience policy and the broker client.
//!
//! A [`Transport`] knows how to dial one endpoint, open channels on a connection and tell
//! which of its errors mean the connection (or the channel) is gone. Everything else
//! (caching, failover, retries, pooling) is built on top of these primitives.
use crate::configuration::{ConnectionSettings, Endpoint, ExchangeSettings, QueueSettings};
use crate::error::ErrorCode;
use crate::message::{Headers, ReturnedMessage, SendProperties};

#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod rabbit_mq;

#[cfg(any(test, feature = "test-util"))]
pub use memory::{BrokerStats, MemoryBroker, MemoryError};
pub use rabbit_mq::RabbitMq;

/// What a channel is going to be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    /// Manual acknowledgements with at most `prefetch_count` unacknowledged deliveries.
    Consume { prefetch_count: u16 },
    /// With `confirms`, every publish waits for the broker to take responsibility for it.
    Publish { confirms: bool },
}

/// One message handed to [`TransportChannel::publish`].
#[derive(Debug)]
pub struct Publication<'a> {
    pub exchange: &'a str,
    pub routing_key: &'a str,
    pub payload: &'a [u8],
    pub properties: &'a SendProperties,
    /// Ask the broker to return the message if it cannot be routed.
    pub mandatory: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    Delivered,
    /// The broker could not route a mandatory message.
    Returned(ReturnedMessage),
}

/// A message delivered to a consuming channel, still to be settled through `acker`.
pub struct Delivery {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub headers: Headers,
    pub data: Vec<u8>,
    pub acker: Box<dyn Acknowledge>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message_id", &self.message_id)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Settles one delivery with the broker.
#[async_trait::async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<(), anyhow::Error>;

    async fn reject(&self, requeue: bool) -> Result<(), anyhow::Error>;

    /// Whether [`Acknowledge::reject`] is available on this transport.
    fn can_reject(&self) -> bool {
        true
    }
}

/// Connection-level primitives of a broker client.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    type Connection: Send + Sync + 'static;
    type Channel: TransportChannel;

    /// Dial a single endpoint.
    async fn connect(
        &self,
        endpoint: &Endpoint,
        settings: &ConnectionSettings,
    ) -> Result<Self::Connection, anyhow::Error>;

    fn is_connected(&self, connection: &Self::Connection) -> bool;

    async fn close_connection(&self, connection: &Self::Connection) -> Result<(), anyhow::Error>;

    async fn create_channel(
        &self,
        connection: &Self::Connection,
        mode: ChannelMode,
    ) -> Result<Self::Channel, anyhow::Error>;

    /// Map a transport error to the code callers act upon.
    ///
    /// `None` means the error is not recognised and is passed through untouched.
    fn classify(
        &self,
        connection: Option<&Self::Connection>,
        error: &anyhow::Error,
    ) -> Option<ErrorCode>;
}

/// Channel-level primitives. A channel is used by a single owner at a time.
#[async_trait::async_trait]
pub trait TransportChannel: Send + Sync + 'static {
    fn is_open(&self) -> bool;

    async fn close(&mut self) -> Result<(), anyhow::Error>;

    /// Declare a queue, returning its name on the broker (generated if the path is empty).
    async fn declare_queue(&mut self, queue: &QueueSettings) -> Result<String, anyhow::Error>;

    async fn declare_exchange(&mut self, exchange: &ExchangeSettings) -> Result<(), anyhow::Error>;

    async fn bind_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), anyhow::Error>;

    async fn publish(
        &mut self,
        publication: Publication<'_>,
    ) -> Result<PublishOutcome, anyhow::Error>;

    /// Register this channel as a consumer of `queue`.
    async fn start_consuming(&mut self, queue: &str) -> Result<(), anyhow::Error>;

    fn is_consuming(&self) -> bool;

    /// Wait for the next delivery. Only valid after [`TransportChannel::start_consuming`].
    ///
    /// It must be cancellation safe: dropping the future must not lose a delivery.
    async fn next_delivery(&mut self) -> Result<Delivery, anyhow::Error>;

    /// Stop consuming and hand every unacknowledged delivery of this channel back to the
    /// broker, so that consumption restarts from a clean slate.
    async fn clear_buffer(&mut self) -> Result<(), anyhow::Error>;
}
