//! Settings required to connect to a broker and to declare the destinations we talk to.
use crate::error::MessageError;
use crate::message::Headers;
use crate::pool::PoolSettings;
use anyhow::Context;
use native_tls::Certificate;
use redact::Secret;
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_number_from_string;
use std::fmt;
use std::time::Duration;

const AMQP_PORT: u16 = 5672;
const AMQPS_PORT: u16 = 5671;

fn default_vhost() -> String {
    "/".into()
}

fn default_delay_on_reconnect_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
/// Configuration to establish a named connection with a RabbitMq cluster.
///
/// You can use `ConnectionSettings::default()` to get the configuration of an out-of-the-box
/// RabbitMq installation (e.g. launched via the official Docker image).
pub struct ConnectionSettings {
    /// The logical name senders and receivers refer to.
    pub name: String,
    /// Comma separated list of broker addresses, tried in order on (re)connection.
    ///
    /// E.g. `rmq-1:5672,rmq-2:5672` or `amqps://rmq.example.com`.
    pub endpoints: String,
    /// The name of the [virtual host](https://www.rabbitmq.com/vhosts.html) you want to connect to.
    #[serde(default = "default_vhost")]
    pub vhost: String,
    pub username: String,
    pub password: Secret<String>,
    /// Pause between two endpoint attempts, in milliseconds.
    #[serde(
        default = "default_delay_on_reconnect_ms",
        deserialize_with = "deserialize_number_from_string"
    )]
    pub delay_on_reconnect_ms: u64,
    /// A healthy connection older than this is closed and redialled, in seconds.
    ///
    /// Lets long-lived processes move back to a preferred endpoint after a failover.
    #[serde(default)]
    pub forced_reconnection_seconds: Option<u64>,
    /// How long you should wait when trying to connect to one endpoint before giving up,
    /// in seconds.
    #[serde(default)]
    pub connection_timeout_seconds: Option<u64>,
    /// How many unacknowledged messages a receiver channel buffers.
    #[serde(default)]
    pub prefetch_count: Option<u16>,
    /// Configuration to establish an encrypted connection with the broker.
    /// If omitted the connection will be in plain text, unless an endpoint uses `amqps://`.
    #[serde(default)]
    pub tls: Option<TlsSettings>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            name: "default".into(),
            endpoints: format!("localhost:{AMQP_PORT}"),
            vhost: default_vhost(),
            username: "guest".into(),
            password: "guest".to_owned().into(),
            delay_on_reconnect_ms: default_delay_on_reconnect_ms(),
            forced_reconnection_seconds: None,
            connection_timeout_seconds: Some(10),
            prefetch_count: Some(50),
            tls: None,
        }
    }
}

impl ConnectionSettings {
    /// Settings for `name` pointing at `endpoints`, everything else defaulted.
    pub fn new(name: impl Into<String>, endpoints: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoints: endpoints.into(),
            ..Default::default()
        }
    }

    /// Split the endpoint list, in the order they should be tried.
    ///
    /// Fails if the list is empty or any entry cannot be parsed.
    pub fn endpoints(&self) -> Result<Vec<Endpoint>, MessageError> {
        let endpoints = self
            .endpoints
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(|e| Endpoint::parse(e, self.tls.is_some()))
            .collect::<Result<Vec<_>, _>>()?;
        if endpoints.is_empty() {
            return Err(MessageError::unhandled(format!(
                "Connection `{}` has no endpoints configured",
                self.name
            )));
        }
        Ok(endpoints)
    }

    pub fn delay_on_reconnect(&self) -> Duration {
        Duration::from_millis(self.delay_on_reconnect_ms)
    }

    pub fn forced_reconnection(&self) -> Option<Duration> {
        self.forced_reconnection_seconds.map(Duration::from_secs)
    }

    /// Retrieve the timeout observed when dialling one endpoint, 10 seconds if unspecified.
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_seconds.unwrap_or(10))
    }

    pub fn prefetch(&self) -> u16 {
        self.prefetch_count.unwrap_or(50)
    }
}

/// One broker address out of [`ConnectionSettings::endpoints`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl Endpoint {
    /// Parse `host`, `host:port` or `scheme://host[:port]`.
    ///
    /// `amqps://` switches TLS on and defaults the port to 5671.
    pub fn parse(raw: &str, tls_by_default: bool) -> Result<Self, MessageError> {
        let (tls, rest) = if let Some(rest) = raw.strip_prefix("amqps://") {
            (true, rest)
        } else if let Some(rest) = raw.strip_prefix("amqp://") {
            (tls_by_default, rest)
        } else {
            (tls_by_default, raw)
        };
        let rest = rest.trim_end_matches('/');
        let default_port = if tls { AMQPS_PORT } else { AMQP_PORT };
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    MessageError::unhandled(format!("Invalid port in endpoint `{raw}`"))
                })?;
                (host, port)
            }
            None => (rest, default_port),
        };
        if host.is_empty() {
            return Err(MessageError::unhandled(format!(
                "Missing host in endpoint `{raw}`"
            )));
        }
        Ok(Self {
            host: host.to_owned(),
            port,
            tls,
        })
    }

    /// `host:port`
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "amqps" } else { "amqp" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
/// Configuration to establish an encrypted connection with a RabbitMq broker.
pub struct TlsSettings {
    /// The domain we expect as CN on the server certificate.
    /// If left unspecified, it defaults to the endpoint host.
    pub domain: Option<String>,
    /// Root certificate chain to be trusted when validating server certificates, in PEM format.
    ///
    /// If set to `None`, the system's trust root will be used.
    ///
    /// ```text
    /// -----BEGIN CERTIFICATE-----
    /// <-- OMITTED -->
    /// -----END CERTIFICATE-----
    /// ```
    pub ca_certificate_chain_pem: Option<String>,
}

impl TlsSettings {
    /// Parse the CA certificate chain into the format understood by `native_tls`.
    pub fn ca_certificate_chain(&self) -> Result<Option<Certificate>, anyhow::Error> {
        self.ca_certificate_chain_pem
            .as_ref()
            .map(String::as_bytes)
            .map(Certificate::from_pem)
            .transpose()
            .context("Failed to decode PEM certificate chain for RabbitMQ TLS.")
    }
}

/// Exchange types understood by the broker.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Topic,
    Fanout,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Topic => "topic",
            Self::Fanout => "fanout",
            Self::Headers => "headers",
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
/// A queue consumers read from and producers write to.
pub struct QueueSettings {
    /// The logical name used to look the settings up.
    pub name: String,
    /// The queue name on the broker, `name` if absent.
    ///
    /// An explicitly empty path asks the broker to generate a name.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_true")]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub exclusive: bool,
    /// Delivery mode of the messages sent to this queue.
    #[serde(default = "default_true")]
    pub persistent: bool,
    /// Exchange the queue is bound to on declaration, by `routing_keys`.
    #[serde(default)]
    pub exchange: Option<ExchangeSettings>,
    #[serde(default)]
    pub routing_keys: Vec<String>,
    /// Declaration arguments, e.g. `x-dead-letter-exchange`.
    #[serde(default)]
    pub arguments: Headers,
}

impl QueueSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: None,
            durable: true,
            auto_delete: false,
            exclusive: false,
            persistent: true,
            exchange: None,
            routing_keys: Vec::new(),
            arguments: Headers::new(),
        }
    }

    pub fn physical_name(&self) -> &str {
        self.path.as_deref().unwrap_or(&self.name)
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    #[must_use]
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    #[must_use]
    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    #[must_use]
    pub fn bound_to(mut self, exchange: ExchangeSettings, routing_keys: Vec<String>) -> Self {
        self.exchange = Some(exchange);
        self.routing_keys = routing_keys;
        self
    }

    #[must_use]
    pub fn with_argument(
        mut self,
        key: impl Into<String>,
        value: impl Into<crate::message::HeaderValue>,
    ) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    fn merged(mut self, extra: Option<&Headers>) -> Self {
        if let Some(extra) = extra {
            self.arguments
                .extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        self
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
/// An exchange publishers write to and subscribers bind to.
pub struct ExchangeSettings {
    pub name: String,
    /// The exchange name on the broker, `name` if absent.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub kind: ExchangeKind,
    #[serde(default = "default_true")]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default = "default_true")]
    pub persistent: bool,
    /// Publishers use the first key unless overridden per send; subscribers bind every key.
    #[serde(default)]
    pub routing_keys: Vec<String>,
    #[serde(default)]
    pub arguments: Headers,
}

impl ExchangeSettings {
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            path: None,
            kind,
            durable: true,
            auto_delete: false,
            persistent: true,
            routing_keys: Vec::new(),
            arguments: Headers::new(),
        }
    }

    pub fn physical_name(&self) -> &str {
        self.path.as_deref().unwrap_or(&self.name)
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_routing_keys(mut self, routing_keys: Vec<String>) -> Self {
        self.routing_keys = routing_keys;
        self
    }

    #[must_use]
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    fn merged(mut self, extra: Option<&Headers>) -> Self {
        if let Some(extra) = extra {
            self.arguments
                .extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        self
    }
}

/// Where senders, receivers and the registry look their settings up.
///
/// Implement it to plug in your own configuration source, or use [`MessagingConfiguration`].
pub trait SettingsProvider: Send + Sync + 'static {
    fn get_connection_settings(&self, name: &str) -> Result<ConnectionSettings, MessageError>;

    /// `arguments` are merged over the configured declaration arguments.
    fn get_queue_settings(
        &self,
        name: &str,
        arguments: Option<&Headers>,
    ) -> Result<QueueSettings, MessageError>;

    /// `arguments` are merged over the configured declaration arguments.
    fn get_exchange_settings(
        &self,
        name: &str,
        arguments: Option<&Headers>,
    ) -> Result<ExchangeSettings, MessageError>;
}

/// Every named setting of an application, usually deserialized from its configuration file.
///
/// ```json
/// {
///   "connections": [{ "name": "main", "endpoints": "rmq-1,rmq-2", "username": "app", "password": "secret" }],
///   "queues": [{ "name": "orders" }],
///   "exchanges": [{ "name": "events", "kind": "topic", "routing_keys": ["orders.created"] }],
///   "pool": { "max_size": 8 }
/// }
/// ```
#[derive(Debug, Deserialize, Clone, Default)]
pub struct MessagingConfiguration {
    #[serde(default)]
    pub connections: Vec<ConnectionSettings>,
    #[serde(default)]
    pub queues: Vec<QueueSettings>,
    #[serde(default)]
    pub exchanges: Vec<ExchangeSettings>,
    #[serde(default)]
    pub pool: PoolSettings,
}

impl MessagingConfiguration {
    /// Add or replace a connection, keyed by its name.
    #[must_use]
    pub fn with_connection(mut self, settings: ConnectionSettings) -> Self {
        self.connections.retain(|c| c.name != settings.name);
        self.connections.push(settings);
        self
    }

    /// Add or replace a queue, keyed by its name.
    #[must_use]
    pub fn with_queue(mut self, settings: QueueSettings) -> Self {
        self.queues.retain(|q| q.name != settings.name);
        self.queues.push(settings);
        self
    }

    /// Add or replace an exchange, keyed by its name.
    #[must_use]
    pub fn with_exchange(mut self, settings: ExchangeSettings) -> Self {
        self.exchanges.retain(|e| e.name != settings.name);
        self.exchanges.push(settings);
        self
    }

    #[must_use]
    pub fn with_pool(mut self, pool: PoolSettings) -> Self {
        self.pool = pool;
        self
    }
}

impl SettingsProvider for MessagingConfiguration {
    fn get_connection_settings(&self, name: &str) -> Result<ConnectionSettings, MessageError> {
        self.connections
            .iter()
            .find(|c| c.name == name)
            .cloned()
            .ok_or_else(|| MessageError::unhandled(format!("Unknown connection `{name}`")))
    }

    fn get_queue_settings(
        &self,
        name: &str,
        arguments: Option<&Headers>,
    ) -> Result<QueueSettings, MessageError> {
        self.queues
            .iter()
            .find(|q| q.name == name)
            .cloned()
            .map(|q| q.merged(arguments))
            .ok_or_else(|| MessageError::unhandled(format!("Unknown queue `{name}`")))
    }

    fn get_exchange_settings(
        &self,
        name: &str,
        arguments: Option<&Headers>,
    ) -> Result<ExchangeSettings, MessageError> {
        self.exchanges
            .iter()
            .find(|e| e.name == name)
            .cloned()
            .map(|e| e.merged(arguments))
            .ok_or_else(|| MessageError::unhandled(format!("Unknown exchange `{name}`")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::message::HeaderValue;

    #[test]
    fn endpoints_are_split_in_order_with_default_ports() {
        let settings = ConnectionSettings::new("main", "rmq-1, rmq-2:5673 ,amqps://rmq-3");

        let endpoints = settings.endpoints().unwrap();

        assert_eq!(3, endpoints.len());
        assert_eq!("rmq-1:5672", endpoints[0].authority());
        assert_eq!("rmq-2:5673", endpoints[1].authority());
        assert!(endpoints[2].tls);
        assert_eq!("amqps://rmq-3:5671", endpoints[2].to_string());
    }

    #[test]
    fn empty_or_malformed_endpoints_are_configuration_errors() {
        for raw in ["", " , ", "rmq:not-a-port", ":5672"] {
            let error = ConnectionSettings::new("main", raw)
                .endpoints()
                .unwrap_err();
            assert_eq!(ErrorCode::UnhandledError, error.code(), "{raw}");
        }
    }

    #[test]
    fn configuration_deserializes_with_defaults() {
        let configuration: MessagingConfiguration = serde_json::from_value(serde_json::json!({
            "connections": [{
                "name": "main",
                "endpoints": "rmq-1,rmq-2",
                "username": "app",
                "password": "secret",
                "delay_on_reconnect_ms": "250"
            }],
            "queues": [{ "name": "orders", "path": "orders.v2", "arguments": { "x-max-priority": 10 } }],
            "exchanges": [{ "name": "events", "kind": "topic", "routing_keys": ["orders.#"] }]
        }))
        .unwrap();

        let connection = configuration.get_connection_settings("main").unwrap();
        assert_eq!(Duration::from_millis(250), connection.delay_on_reconnect());
        assert_eq!("/", connection.vhost);
        assert_eq!(50, connection.prefetch());
        assert_eq!(Duration::from_secs(10), connection.connection_timeout());

        let queue = configuration.get_queue_settings("orders", None).unwrap();
        assert_eq!("orders.v2", queue.physical_name());
        assert!(queue.durable && queue.persistent);

        let exchange = configuration.get_exchange_settings("events", None).unwrap();
        assert_eq!(ExchangeKind::Topic, exchange.kind);
        assert_eq!("events", exchange.physical_name());
    }

    #[test]
    fn lookup_arguments_are_merged_over_configured_ones() {
        let configuration = MessagingConfiguration::default().with_queue(
            QueueSettings::new("orders")
                .with_argument("x-max-priority", 10)
                .with_argument("x-dead-letter-exchange", "dlx"),
        );
        let mut extra = Headers::new();
        extra.insert("x-max-priority".into(), HeaderValue::Int(5));

        let queue = configuration
            .get_queue_settings("orders", Some(&extra))
            .unwrap();

        assert_eq!(Some(&HeaderValue::Int(5)), queue.arguments.get("x-max-priority"));
        assert_eq!(
            Some(&HeaderValue::String("dlx".into())),
            queue.arguments.get("x-dead-letter-exchange")
        );
    }

    #[test]
    fn unknown_names_are_unhandled_errors() {
        let configuration = MessagingConfiguration::default();
        assert_eq!(
            ErrorCode::UnhandledError,
            configuration.get_connection_settings("nope").unwrap_err().code()
        );
        assert_eq!(
            ErrorCode::UnhandledError,
            configuration.get_exchange_settings("nope", None).unwrap_err().code()
        );
    }
}
