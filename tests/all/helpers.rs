use std::sync::Arc;
use uuid::Uuid;
use warren::configuration::{
    ConnectionSettings, ExchangeKind, ExchangeSettings, MessagingConfiguration, QueueSettings,
};
use warren::registry::ConnectionRegistry;
use warren::transport::MemoryBroker;

pub const CONNECTION: &str = "main";

/// A broker, a registry pointing at it and a fresh queue and exchange, both configured.
pub struct TestContext {
    pub broker: MemoryBroker,
    pub registry: Arc<ConnectionRegistry<MemoryBroker>>,
    pub queue: String,
    pub exchange: String,
}

pub fn connection_settings(endpoints: &str) -> ConnectionSettings {
    ConnectionSettings {
        delay_on_reconnect_ms: 0,
        ..ConnectionSettings::new(CONNECTION, endpoints)
    }
}

pub fn context() -> TestContext {
    context_with(MessagingConfiguration::default(), ExchangeKind::Topic)
}

pub fn context_with(configuration: MessagingConfiguration, kind: ExchangeKind) -> TestContext {
    let broker = MemoryBroker::new();
    let queue = Uuid::new_v4().to_string();
    let exchange = Uuid::new_v4().to_string();
    let configuration = configuration
        .with_connection(connection_settings("rmq-1:5672"))
        .with_queue(QueueSettings::new(&queue))
        .with_exchange(ExchangeSettings::new(&exchange, kind));
    TestContext {
        registry: Arc::new(ConnectionRegistry::new(broker.clone(), configuration)),
        broker,
        queue,
        exchange,
    }
}
