//! One cached connection per logical connection name, redialled across endpoints on failure.
use crate::configuration::SettingsProvider;
use crate::error::{AggregateError, EndpointFailure, ErrorCode, MessageError};
use crate::named_lock::NamedLocks;
use crate::transport::Transport;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

struct Cached<C> {
    connection: Arc<C>,
    established_at: Instant,
}

struct Slot<C> {
    /// Index of the endpoint to dial first, always within the endpoint list.
    cursor: usize,
    connection: Option<Cached<C>>,
}

impl<C> Default for Slot<C> {
    fn default() -> Self {
        Self {
            cursor: 0,
            connection: None,
        }
    }
}

/// Hands out connections by name, dialling the configured endpoints in turn.
///
/// Senders and receivers share the cached connection of their name and open their own channel
/// on it. A connection is only closed through [`ConnectionRegistry::remove_connection`],
/// [`ConnectionRegistry::close_all`], or when it is found dead (or older than the forced
/// reconnection window) on the next [`ConnectionRegistry::create_connection`].
///
/// Dials of the same name are serialised; dials of different names run concurrently.
pub struct ConnectionRegistry<T: Transport> {
    transport: T,
    settings: Arc<dyn SettingsProvider>,
    slots: Mutex<HashMap<String, Slot<T::Connection>>>,
    dial_locks: NamedLocks,
}

impl<T: Transport> ConnectionRegistry<T> {
    pub fn new(transport: T, settings: impl SettingsProvider) -> Self {
        Self::with_shared_settings(transport, Arc::new(settings))
    }

    pub fn with_shared_settings(transport: T, settings: Arc<dyn SettingsProvider>) -> Self {
        Self {
            transport,
            settings,
            slots: Mutex::new(HashMap::new()),
            dial_locks: NamedLocks::new(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn settings(&self) -> &dyn SettingsProvider {
        self.settings.as_ref()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot<T::Connection>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn healthy(
        &self,
        name: &str,
        forced_reconnection: Option<Duration>,
    ) -> Option<Arc<T::Connection>> {
        let slots = self.slots();
        let cached = slots.get(name)?.connection.as_ref()?;
        let expired = forced_reconnection
            .is_some_and(|window| cached.established_at.elapsed() >= window);
        (!expired && self.transport.is_connected(&cached.connection))
            .then(|| Arc::clone(&cached.connection))
    }

    /// The connection registered under `name`, dialling it if there is no healthy one.
    ///
    /// Endpoints are tried in order starting from the last one that worked, waiting
    /// `delay_on_reconnect_ms` between two attempts. If every endpoint fails the error is
    /// [`ErrorCode::NoAcceptableEndpoints`] and its [`AggregateError`] lists every failure.
    #[tracing::instrument(name = "registry_create_connection", skip(self))]
    pub async fn create_connection(&self, name: &str) -> Result<Arc<T::Connection>, MessageError> {
        let settings = self.settings.get_connection_settings(name)?;
        let endpoints = settings.endpoints()?;
        let forced_reconnection = settings.forced_reconnection();

        if let Some(connection) = self.healthy(name, forced_reconnection) {
            return Ok(connection);
        }
        let _dialling = self.dial_locks.lock(name).await;
        // Someone else may have dialled while we were waiting.
        if let Some(connection) = self.healthy(name, forced_reconnection) {
            return Ok(connection);
        }

        let (stale, start) = {
            let mut slots = self.slots();
            let slot = slots.entry(name.to_owned()).or_default();
            (slot.connection.take(), slot.cursor % endpoints.len())
        };
        if let Some(stale) = stale {
            debug!(connection = name, "Discarding a stale connection");
            if let Err(e) = self.transport.close_connection(&stale.connection).await {
                debug!(connection = name, error = ?e, "Failed to close a stale connection");
            }
        }

        let mut failures = Vec::with_capacity(endpoints.len());
        let mut cursor = start;
        for attempt in 0..endpoints.len() {
            if attempt > 0 {
                tokio::time::sleep(settings.delay_on_reconnect()).await;
            }
            let endpoint = &endpoints[cursor];
            match self.transport.connect(endpoint, &settings).await {
                Ok(connection) => {
                    let connection = Arc::new(connection);
                    let mut slots = self.slots();
                    let slot = slots.entry(name.to_owned()).or_default();
                    slot.cursor = cursor;
                    slot.connection = Some(Cached {
                        connection: Arc::clone(&connection),
                        established_at: Instant::now(),
                    });
                    info!(connection = name, endpoint = %endpoint, "Connected");
                    return Ok(connection);
                }
                Err(e) => {
                    warn!(connection = name, endpoint = %endpoint, error = ?e, "Failed to connect");
                    failures.push(EndpointFailure {
                        endpoint: endpoint.to_string(),
                        error: e,
                    });
                    cursor = (cursor + 1) % endpoints.len();
                }
            }
        }

        self.slots().entry(name.to_owned()).or_default().cursor = cursor;
        let aggregate = AggregateError::new(failures);
        error!(connection = name, "{aggregate}");
        Err(MessageError::new(ErrorCode::NoAcceptableEndpoints, aggregate))
    }

    /// Close and forget the connection of `name`; the next request redials.
    pub async fn remove_connection(&self, name: &str) {
        let cached = self
            .slots()
            .get_mut(name)
            .and_then(|slot| slot.connection.take());
        if let Some(cached) = cached {
            self.close(name, &cached.connection).await;
        }
    }

    /// Forget the connection of `name` only if it is still `connection`.
    ///
    /// A link that saw its connection die must not evict a replacement dialled in the meantime.
    pub(crate) async fn evict(&self, name: &str, connection: &Arc<T::Connection>) {
        let evicted = {
            let mut slots = self.slots();
            match slots.get_mut(name) {
                Some(slot)
                    if slot
                        .connection
                        .as_ref()
                        .is_some_and(|c| Arc::ptr_eq(&c.connection, connection)) =>
                {
                    slot.connection.take()
                }
                _ => None,
            }
        };
        if let Some(cached) = evicted {
            debug!(connection = name, "Evicting a dead connection");
            self.close(name, &cached.connection).await;
        }
    }

    /// Index of the endpoint the next dial of `name` starts from.
    pub fn active_endpoint(&self, name: &str) -> Option<usize> {
        self.slots().get(name).map(|slot| slot.cursor)
    }

    /// Whether a connection is cached under `name`, healthy or not.
    pub fn is_cached(&self, name: &str) -> bool {
        self.slots()
            .get(name)
            .is_some_and(|slot| slot.connection.is_some())
    }

    /// Close every cached connection.
    pub async fn close_all(&self) {
        let cached = self
            .slots()
            .iter_mut()
            .filter_map(|(name, slot)| slot.connection.take().map(|c| (name.clone(), c)))
            .collect::<Vec<_>>();
        for (name, cached) in cached {
            self.close(&name, &cached.connection).await;
        }
    }

    async fn close(&self, name: &str, connection: &T::Connection) {
        if let Err(e) = self.transport.close_connection(connection).await {
            warn!(connection = name, error = ?e, "Failed to close a connection");
        }
    }
}
