//! RabbitMq over `lapin`.
use crate::configuration::{
    ConnectionSettings, Endpoint, ExchangeKind, ExchangeSettings, QueueSettings,
};
use crate::error::ErrorCode;
use crate::message::{from_field_table, to_field_table, ReturnedMessage, SendProperties};
use crate::transport::{
    Acknowledge, ChannelMode, Delivery, Publication, PublishOutcome, Transport, TransportChannel,
};
use anyhow::Context;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, BasicRecoverOptions, BasicRejectOptions, ConfirmSelectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    publisher_confirm::Confirmation,
    tcp::{AMQPUriTcpExt, NativeTlsConnector},
    types::{FieldTable, ShortString},
    uri::{AMQPAuthority, AMQPScheme, AMQPUri, AMQPUserInfo},
    BasicProperties, ConnectionProperties,
};
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

// Reply Code 312 - NO_ROUTE
// See https://www.rabbitmq.com/amqp-0-9-1-reference.html
const NO_ROUTE: u16 = 312;
const REPLY_SUCCESS: u16 = 200;

/// The broker ended a consumer, e.g. because its queue was deleted.
#[derive(thiserror::Error, Debug)]
#[error("The consumer was cancelled by the broker")]
pub struct ConsumerCancelled;

/// Talks to RabbitMq brokers through `lapin`.
///
/// Endpoints are dialled with the credentials, virtual host and timeout of their
/// [`ConnectionSettings`]. TLS is used when the settings carry a [`TlsSettings`] section or the
/// endpoint uses the `amqps://` scheme.
///
/// [`TlsSettings`]: crate::configuration::TlsSettings
#[derive(Clone, Default)]
pub struct RabbitMq {
    tls_connector: Option<NativeTlsConnector>,
}

impl RabbitMq {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use this TLS connector for encrypted endpoints instead of one built from the settings.
    #[must_use]
    pub fn with_tls_connector(mut self, connector: NativeTlsConnector) -> Self {
        self.tls_connector = Some(connector);
        self
    }

    fn amqp_uri(endpoint: &Endpoint, settings: &ConnectionSettings) -> AMQPUri {
        AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: settings.username.clone(),
                    password: settings.password.expose_secret().clone(),
                },
                host: endpoint.host.clone(),
                port: endpoint.port,
            },
            scheme: AMQPScheme::AMQP,
            vhost: settings.vhost.clone(),
            query: Default::default(),
        }
    }

    fn tls(
        &self,
        endpoint: &Endpoint,
        settings: &ConnectionSettings,
    ) -> Result<Tls, anyhow::Error> {
        let domain_name = settings
            .tls
            .as_ref()
            .and_then(|tls| tls.domain.clone())
            .unwrap_or_else(|| endpoint.host.clone());
        let connector = match &self.tls_connector {
            Some(connector) => connector.clone(),
            None => {
                let mut builder = NativeTlsConnector::builder();
                if let Some(certificate) = settings
                    .tls
                    .as_ref()
                    .map(|tls| tls.ca_certificate_chain())
                    .transpose()?
                    .flatten()
                {
                    builder.add_root_certificate(certificate);
                }
                builder.build().context("TLS configuration failed")?
            }
        };
        Ok(Tls {
            connector,
            domain_name,
        })
    }
}

struct Tls {
    connector: NativeTlsConnector,
    domain_name: String,
}

async fn connect_without_tls(
    uri: AMQPUri,
    properties: ConnectionProperties,
) -> Result<lapin::Connection, lapin::Error> {
    lapin::Connection::connect_uri(uri, properties).await
}

async fn connect_with_tls(
    uri: AMQPUri,
    properties: ConnectionProperties,
    tls: Arc<Tls>,
) -> Result<lapin::Connection, lapin::Error> {
    lapin::Connection::connector(
        uri,
        Box::new(move |uri| {
            // Plain TCP first, then the TLS handshake against the expected domain.
            let mut amqp_uri = uri.clone();
            amqp_uri.scheme = AMQPScheme::AMQP;
            amqp_uri
                .connect()
                .and_then(|tcp| tcp.into_native_tls(&tls.connector, &tls.domain_name))
        }),
        properties,
    )
    .await
}

#[async_trait::async_trait]
impl Transport for RabbitMq {
    type Connection = lapin::Connection;
    type Channel = RabbitMqChannel;

    #[tracing::instrument(
        name = "rabbitmq_connect",
        skip(self, endpoint, settings),
        fields(endpoint = %endpoint)
    )]
    async fn connect(
        &self,
        endpoint: &Endpoint,
        settings: &ConnectionSettings,
    ) -> Result<lapin::Connection, anyhow::Error> {
        let uri = Self::amqp_uri(endpoint, settings);
        let properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
        let tls = if endpoint.tls || settings.tls.is_some() {
            Some(Arc::new(self.tls(endpoint, settings)?))
        } else {
            None
        };
        let connection = timeout(settings.connection_timeout(), async {
            match tls {
                None => connect_without_tls(uri, properties).await,
                Some(tls) => connect_with_tls(uri, properties, tls).await,
            }
        })
        .await??;
        let name = settings.name.clone();
        connection.on_error(move |e| {
            warn!(connection = %name, "RabbitMQ broken connection: {:?}", e);
        });
        Ok(connection)
    }

    fn is_connected(&self, connection: &lapin::Connection) -> bool {
        connection.status().connected()
    }

    async fn close_connection(&self, connection: &lapin::Connection) -> Result<(), anyhow::Error> {
        if connection.status().connected() {
            connection.close(REPLY_SUCCESS, "closing").await?;
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, connection))]
    async fn create_channel(
        &self,
        connection: &lapin::Connection,
        mode: ChannelMode,
    ) -> Result<RabbitMqChannel, anyhow::Error> {
        let channel = connection.create_channel().await?;
        match mode {
            ChannelMode::Consume { prefetch_count } => {
                channel
                    .basic_qos(prefetch_count, BasicQosOptions { global: false })
                    .await?;
            }
            ChannelMode::Publish { confirms: true } => {
                channel
                    .confirm_select(ConfirmSelectOptions::default())
                    .await?;
            }
            ChannelMode::Publish { confirms: false } => {}
        }
        debug!(channel_id = channel.id(), "Opened a RabbitMQ channel");
        Ok(RabbitMqChannel {
            channel,
            consumer: None,
        })
    }

    fn classify(
        &self,
        connection: Option<&lapin::Connection>,
        error: &anyhow::Error,
    ) -> Option<ErrorCode> {
        if let Some(error) = error.downcast_ref::<lapin::Error>() {
            #[allow(unreachable_patterns)]
            let code = match error {
                lapin::Error::IOError(_)
                | lapin::Error::InvalidChannel(_)
                | lapin::Error::InvalidChannelState(_)
                | lapin::Error::InvalidConnectionState(_)
                | lapin::Error::MissingHeartbeatError => Some(ErrorCode::LostConnection),
                lapin::Error::ProtocolError(amqp) => Some(match amqp.kind() {
                    AMQPErrorKind::Hard(_) => ErrorCode::LostConnection,
                    AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED)
                    | AMQPErrorKind::Soft(AMQPSoftError::RESOURCELOCKED) => {
                        ErrorCode::ExclusiveLock
                    }
                    AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND)
                    | AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                        ErrorCode::UnhandledError
                    }
                    AMQPErrorKind::Soft(_) => ErrorCode::LostConnection,
                }),
                _ => None,
            };
            if code.is_some() {
                return code;
            }
        }
        if error.is::<std::io::Error>()
            || error.is::<ConsumerCancelled>()
            || error.is::<tokio::time::error::Elapsed>()
        {
            return Some(ErrorCode::LostConnection);
        }
        match connection {
            Some(connection) if connection.status().connected() => None,
            _ => Some(ErrorCode::LostConnection),
        }
    }
}

/// A `lapin` channel, plus its consumer once consumption started.
pub struct RabbitMqChannel {
    channel: lapin::Channel,
    consumer: Option<lapin::Consumer>,
}

fn basic_properties(properties: &SendProperties) -> BasicProperties {
    let mut basic = BasicProperties::default()
        .with_delivery_mode(if properties.is_persistent() { 2 } else { 1 })
        .with_headers(to_field_table(&properties.headers));
    if let Some(id) = &properties.message_id {
        basic = basic.with_message_id(ShortString::from(id.as_str()));
    }
    if let Some(id) = &properties.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(id.as_str()));
    }
    if let Some(reply_to) = &properties.reply_to {
        basic = basic.with_reply_to(ShortString::from(reply_to.as_str()));
    }
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.as_str()));
    }
    if let Some(ttl) = properties.time_to_live {
        basic = basic.with_expiration(ShortString::from(ttl.as_millis().to_string()));
    }
    if let Some(priority) = properties.priority {
        basic = basic.with_priority(priority);
    }
    if let Some(timestamp) = properties.timestamp {
        basic = basic.with_timestamp(timestamp);
    }
    basic
}

fn short_string(value: &Option<ShortString>) -> Option<String> {
    value.as_ref().map(|s| s.as_str().to_owned())
}

#[async_trait::async_trait]
impl TransportChannel for RabbitMqChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&mut self) -> Result<(), anyhow::Error> {
        self.consumer = None;
        if self.channel.status().connected() {
            self.channel.close(REPLY_SUCCESS, "closing").await?;
        }
        Ok(())
    }

    async fn declare_queue(&mut self, queue: &QueueSettings) -> Result<String, anyhow::Error> {
        let declared = self
            .channel
            .queue_declare(
                queue.physical_name(),
                QueueDeclareOptions {
                    durable: queue.durable,
                    exclusive: queue.exclusive,
                    auto_delete: queue.auto_delete,
                    ..Default::default()
                },
                to_field_table(&queue.arguments),
            )
            .await?;
        Ok(declared.name().as_str().to_owned())
    }

    async fn declare_exchange(&mut self, exchange: &ExchangeSettings) -> Result<(), anyhow::Error> {
        let kind = match exchange.kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        };
        self.channel
            .exchange_declare(
                exchange.physical_name(),
                kind,
                ExchangeDeclareOptions {
                    durable: exchange.durable,
                    auto_delete: exchange.auto_delete,
                    ..Default::default()
                },
                to_field_table(&exchange.arguments),
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), anyhow::Error> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    #[tracing::instrument(
        level = "debug",
        skip(self, publication),
        fields(exchange = publication.exchange, routing_key = publication.routing_key)
    )]
    async fn publish(
        &mut self,
        publication: Publication<'_>,
    ) -> Result<PublishOutcome, anyhow::Error> {
        let options = BasicPublishOptions {
            mandatory: publication.mandatory,
            // The immediate flag was dropped in RabbitMQ 3.0, `true` causes a not-supported error.
            immediate: false,
        };
        let confirmation = self
            .channel
            .basic_publish(
                publication.exchange,
                publication.routing_key,
                options,
                publication.payload,
                basic_properties(publication.properties),
            )
            .await?
            .await?;
        match confirmation {
            Confirmation::Ack(Some(returned)) if returned.reply_code == NO_ROUTE => {
                let delivery = &returned.delivery;
                Ok(PublishOutcome::Returned(ReturnedMessage {
                    reply_code: returned.reply_code,
                    reply_text: returned.reply_text.as_str().to_owned(),
                    exchange: delivery.exchange.as_str().to_owned(),
                    routing_key: delivery.routing_key.as_str().to_owned(),
                    message_id: short_string(delivery.properties.message_id()),
                    headers: delivery
                        .properties
                        .headers()
                        .as_ref()
                        .map(from_field_table)
                        .unwrap_or_default(),
                    data: delivery.data.clone(),
                }))
            }
            Confirmation::Ack(_) | Confirmation::NotRequested => Ok(PublishOutcome::Delivered),
            Confirmation::Nack(returned) => Err(anyhow::anyhow!(
                "The RabbitMq broker nacked the publishing of the message: {:?}",
                returned.map(|r| r.reply_text.as_str().to_owned())
            )),
        }
    }

    async fn start_consuming(&mut self, queue: &str) -> Result<(), anyhow::Error> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &Uuid::new_v4().to_string(),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        self.consumer = Some(consumer);
        Ok(())
    }

    fn is_consuming(&self) -> bool {
        self.consumer.is_some()
    }

    async fn next_delivery(&mut self) -> Result<Delivery, anyhow::Error> {
        let consumer = self
            .consumer
            .as_mut()
            .context("The channel is not consuming")?;
        let delivery = match consumer.next().await {
            Some(delivery) => delivery?,
            None => return Err(ConsumerCancelled.into()),
        };
        let properties = &delivery.properties;
        Ok(Delivery {
            message_id: short_string(properties.message_id()),
            correlation_id: short_string(properties.correlation_id()),
            content_type: short_string(properties.content_type()),
            exchange: delivery.exchange.as_str().to_owned(),
            routing_key: delivery.routing_key.as_str().to_owned(),
            redelivered: delivery.redelivered,
            headers: properties
                .headers()
                .as_ref()
                .map(from_field_table)
                .unwrap_or_default(),
            data: delivery.data,
            acker: Box::new(RabbitMqAcker(delivery.acker)),
        })
    }

    async fn clear_buffer(&mut self) -> Result<(), anyhow::Error> {
        if let Some(consumer) = self.consumer.take() {
            self.channel
                .basic_cancel(consumer.tag().as_str(), BasicCancelOptions::default())
                .await?;
        }
        self.channel
            .basic_recover(BasicRecoverOptions { requeue: true })
            .await?;
        Ok(())
    }
}

struct RabbitMqAcker(Acker);

#[async_trait::async_trait]
impl Acknowledge for RabbitMqAcker {
    async fn ack(&self) -> Result<(), anyhow::Error> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), anyhow::Error> {
        self.0.reject(BasicRejectOptions { requeue }).await?;
        Ok(())
    }
}
