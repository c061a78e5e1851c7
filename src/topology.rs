//! Declaration of the broker objects a sender or receiver relies on.
use crate::configuration::{ExchangeKind, ExchangeSettings, QueueSettings};
use crate::transport::TransportChannel;

/// Ensures the objects behind a destination exist before it is used.
///
/// Declarations are idempotent, and they run again every time a link reopens since the broker
/// may have restarted and lost transient objects in the meantime.
#[async_trait::async_trait]
pub(crate) trait Topology: Send + Sync + 'static {
    /// Declare everything, returning the name of the queue or exchange messages go through.
    async fn declare<C: TransportChannel>(&self, channel: &mut C) -> Result<String, anyhow::Error>;
}

/// A queue, bound to its exchange when it has one.
pub(crate) struct QueueTopology(pub(crate) QueueSettings);

#[async_trait::async_trait]
impl Topology for QueueTopology {
    async fn declare<C: TransportChannel>(&self, channel: &mut C) -> Result<String, anyhow::Error> {
        let queue = &self.0;
        let name = channel.declare_queue(queue).await?;
        if let Some(exchange) = &queue.exchange {
            channel.declare_exchange(exchange).await?;
            bind(channel, &name, exchange, &queue.routing_keys).await?;
        }
        Ok(name)
    }
}

/// An exchange publishers write to.
pub(crate) struct ExchangeTopology(pub(crate) ExchangeSettings);

#[async_trait::async_trait]
impl Topology for ExchangeTopology {
    async fn declare<C: TransportChannel>(&self, channel: &mut C) -> Result<String, anyhow::Error> {
        channel.declare_exchange(&self.0).await?;
        Ok(self.0.physical_name().to_owned())
    }
}

/// A subscriber queue bound to an exchange.
///
/// Without a subscription id the queue is temporary: server-named, exclusive to the connection
/// and deleted with it. With one, the queue is durable and named `<exchange>.<subscription id>`
/// so that messages published while the subscriber is away are kept.
pub(crate) struct SubscriptionTopology {
    pub(crate) exchange: ExchangeSettings,
    pub(crate) subscription_id: Option<String>,
}

impl SubscriptionTopology {
    fn queue(&self) -> QueueSettings {
        match &self.subscription_id {
            Some(id) => QueueSettings::new(format!("{}.{id}", self.exchange.physical_name())),
            None => QueueSettings::new("")
                .with_path("")
                .durable(false)
                .exclusive(true)
                .auto_delete(true),
        }
    }
}

#[async_trait::async_trait]
impl Topology for SubscriptionTopology {
    async fn declare<C: TransportChannel>(&self, channel: &mut C) -> Result<String, anyhow::Error> {
        channel.declare_exchange(&self.exchange).await?;
        let name = channel.declare_queue(&self.queue()).await?;
        bind(channel, &name, &self.exchange, &self.exchange.routing_keys).await?;
        Ok(name)
    }
}

async fn bind<C: TransportChannel>(
    channel: &mut C,
    queue: &str,
    exchange: &ExchangeSettings,
    routing_keys: &[String],
) -> Result<(), anyhow::Error> {
    let exchange_name = exchange.physical_name();
    if routing_keys.is_empty() {
        let catch_all = match exchange.kind {
            ExchangeKind::Topic => "#",
            _ => "",
        };
        return channel.bind_queue(queue, exchange_name, catch_all).await;
    }
    for routing_key in routing_keys {
        channel.bind_queue(queue, exchange_name, routing_key).await?;
    }
    Ok(())
}
