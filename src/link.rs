use crate::error::{Error, ErrorCode, MessageError};
use crate::registry::ConnectionRegistry;
use crate::transport::{ChannelMode, Transport, TransportChannel};
use std::sync::Arc;
use tracing::{debug, warn};

struct OpenLink<T: Transport> {
    connection: Arc<T::Connection>,
    channel: T::Channel,
}

/// The channel of one sender or receiver, opened lazily on the shared connection of its name.
///
/// A link is either closed or open. Any classified transport error closes it again, and the
/// next operation reopens it, redialling the connection if it died.
pub(crate) struct Link<T: Transport> {
    registry: Arc<ConnectionRegistry<T>>,
    connection_name: String,
    mode: ChannelMode,
    state: Option<OpenLink<T>>,
    /// Bumped on every successful open, so that owners know when to redeclare.
    generation: u64,
}

impl<T: Transport> Link<T> {
    pub(crate) fn new(
        registry: Arc<ConnectionRegistry<T>>,
        connection_name: impl Into<String>,
        mode: ChannelMode,
    ) -> Self {
        Self {
            registry,
            connection_name: connection_name.into(),
            mode,
            state: None,
            generation: 0,
        }
    }

    pub(crate) fn registry(&self) -> &Arc<ConnectionRegistry<T>> {
        &self.registry
    }

    pub(crate) fn connection_name(&self) -> &str {
        &self.connection_name
    }

    /// The connection the open channel lives on.
    pub(crate) fn connection(&self) -> Option<Arc<T::Connection>> {
        self.state.as_ref().map(|s| Arc::clone(&s.connection))
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state
            .as_ref()
            .is_some_and(|state| state.channel.is_open())
    }

    /// Open a channel unless one is already open.
    pub(crate) async fn open(&mut self) -> Result<(), Error> {
        if self.is_open() {
            return Ok(());
        }
        // The channel was closed under our feet.
        self.close().await;

        let connection = self
            .registry
            .create_connection(&self.connection_name)
            .await?;
        match self
            .registry
            .transport()
            .create_channel(&connection, self.mode)
            .await
        {
            Ok(channel) => {
                self.state = Some(OpenLink {
                    connection,
                    channel,
                });
                self.generation += 1;
                debug!(connection = %self.connection_name, mode = ?self.mode, "Link opened");
                Ok(())
            }
            Err(e) => Err(self.translate(Some(connection), e).await),
        }
    }

    /// Close the channel, leaving the shared connection alone. Errors are logged and ignored.
    pub(crate) async fn close(&mut self) {
        if let Some(mut state) = self.state.take() {
            if let Err(e) = state.channel.close().await {
                debug!(connection = %self.connection_name, error = ?e, "Failed to close a channel");
            }
        }
    }

    /// The open channel, opening it first if needed.
    pub(crate) async fn channel(&mut self) -> Result<&mut T::Channel, Error> {
        self.open().await?;
        match self.state.as_mut() {
            Some(state) => Ok(&mut state.channel),
            None => Err(MessageError::new(
                ErrorCode::LostConnection,
                anyhow::anyhow!("The link to `{}` is not open", self.connection_name),
            )
            .into()),
        }
    }

    /// The channel if it is open, without trying to open it.
    pub(crate) fn channel_if_open(&mut self) -> Option<&mut T::Channel> {
        self.state
            .as_mut()
            .filter(|state| state.channel.is_open())
            .map(|state| &mut state.channel)
    }

    /// Translate an error raised while using the channel.
    pub(crate) async fn handle_error(&mut self, error: anyhow::Error) -> Error {
        let connection = self.connection();
        self.translate(connection, error).await
    }

    async fn translate(
        &mut self,
        connection: Option<Arc<T::Connection>>,
        error: anyhow::Error,
    ) -> Error {
        let transport = self.registry.transport();
        let Some(code) = transport.classify(connection.as_deref(), &error) else {
            return Error::Transport(error);
        };
        self.close().await;
        if code == ErrorCode::LostConnection {
            if let Some(connection) = connection {
                if !self.registry.transport().is_connected(&connection) {
                    self.registry
                        .evict(&self.connection_name, &connection)
                        .await;
                }
            }
        }
        warn!(
            connection = %self.connection_name,
            %code,
            error = ?error,
            "Messaging operation failed"
        );
        MessageError::new(code, error).into()
    }
}

impl<T: Transport> Drop for Link<T> {
    fn drop(&mut self) {
        let Some(mut state) = self.state.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let connection_name = std::mem::take(&mut self.connection_name);
            handle.spawn(async move {
                if let Err(e) = state.channel.close().await {
                    debug!(
                        connection = %connection_name,
                        error = ?e,
                        "Failed to close a dropped channel"
                    );
                }
            });
        }
    }
}
