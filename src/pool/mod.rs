//! Keeps senders and receivers warm, one [`deadpool`] pool per role, connection and destination.
//!
//! Creating a sender or receiver opens a channel (and declares its queue or exchange), which is
//! expensive compared to sending a message. A [`Pool`] hands out [`PoolContainer`]s that go back
//! to their pool when dropped, so the next lease of the same kind reuses the open channel.
//! Instances whose channel was lost are discarded instead of being handed out again.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use warren::configuration::{ConnectionSettings, MessagingConfiguration, QueueSettings};
//! use warren::message::Text;
//! use warren::pool::Pool;
//! use warren::registry::ConnectionRegistry;
//! use warren::transport::RabbitMq;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let configuration = MessagingConfiguration::default()
//!     .with_connection(ConnectionSettings::new("main", "rmq-1,rmq-2"))
//!     .with_queue(QueueSettings::new("orders"));
//! let pool_settings = configuration.pool.clone();
//! let registry = Arc::new(ConnectionRegistry::new(RabbitMq::new(), configuration));
//! let pool = Pool::new(registry, pool_settings);
//!
//! let mut producer = pool.producer::<Text>("main", "orders").await?;
//! producer.send("hello").await?;
//! # Ok(())
//! # }
//! ```
use crate::receivers::{Consumer, Subscriber};
use crate::registry::ConnectionRegistry;
use crate::senders::{Producer, Publisher};
use crate::transport::Transport;
use deadpool::managed::{self, Object, Timeouts};
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_option_number_from_string;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

mod error;
mod manager;

pub use error::PoolError;
pub use manager::{PoolContainer, Poolable};

use manager::RoleManager;

/// Sizing of every keyed pool.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    /// Instances created up front the first time a key is requested.
    #[serde(default)]
    pub initial_size: usize,
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// How long a lease waits for an instance once `max_size` are out. Unset waits forever.
    #[serde(default, deserialize_with = "deserialize_option_number_from_string")]
    pub wait_timeout_ms: Option<u64>,
}

fn default_max_size() -> usize {
    10
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            initial_size: 0,
            max_size: default_max_size(),
            wait_timeout_ms: None,
        }
    }
}

impl PoolSettings {
    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    role: TypeId,
    connection: String,
    destination: String,
}

/// The type-erased view of the pool of one key.
#[async_trait::async_trait]
trait KeyedPool: Send + Sync {
    fn size(&self) -> usize;

    async fn close(&self);

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

struct RolePool<T: Transport, R: Poolable<T>> {
    pool: managed::Pool<RoleManager<T, R>>,
    draining: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl<T: Transport, R: Poolable<T>> KeyedPool for RolePool<T, R> {
    fn size(&self) -> usize {
        self.pool.status().size
    }

    async fn close(&self) {
        // Idle instances are closed gracefully; leased ones are dropped when returned.
        self.draining.store(true, Ordering::Release);
        let mut remaining = self.pool.status().size;
        while self.pool.status().available > 0 && remaining > 0 {
            remaining -= 1;
            match self.pool.timeout_get(&no_wait()).await {
                Ok(object) => {
                    let mut pooled = Object::take(object);
                    pooled.instance.close().await;
                }
                Err(_) => break,
            }
        }
        self.pool.close();
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

fn no_wait() -> Timeouts {
    Timeouts {
        wait: Some(Duration::ZERO),
        create: None,
        recycle: None,
    }
}

/// Leases senders and receivers by role, connection name and destination name.
pub struct Pool<T: Transport> {
    registry: Arc<ConnectionRegistry<T>>,
    settings: PoolSettings,
    pools: Mutex<HashMap<PoolKey, Arc<dyn KeyedPool>>>,
    closed: AtomicBool,
}

impl<T: Transport> Pool<T> {
    pub fn new(registry: Arc<ConnectionRegistry<T>>, settings: PoolSettings) -> Self {
        Self {
            registry,
            settings,
            pools: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry<T>> {
        &self.registry
    }

    /// Lease an instance of `R`, waiting up to the configured wait timeout if the pool of this
    /// key is at its maximum size.
    pub async fn get<R: Poolable<T>>(
        &self,
        connection: &str,
        destination: &str,
    ) -> Result<PoolContainer<T, R>, PoolError> {
        let pool = self.role_pool::<R>(connection, destination).await?;
        let object = pool.pool.get().await?;
        Ok(PoolContainer::new(object))
    }

    /// Lease an instance of `R` without waiting: fails with [`PoolError::Exhausted`] if every
    /// instance of this key is leased and the pool is at its maximum size.
    pub async fn try_get<R: Poolable<T>>(
        &self,
        connection: &str,
        destination: &str,
    ) -> Result<PoolContainer<T, R>, PoolError> {
        let pool = self.role_pool::<R>(connection, destination).await?;
        let object = pool.pool.timeout_get(&no_wait()).await?;
        Ok(PoolContainer::new(object))
    }

    pub async fn consumer<P: crate::message::Payload>(
        &self,
        connection: &str,
        queue: &str,
    ) -> Result<PoolContainer<T, Consumer<T, P>>, PoolError> {
        self.get(connection, queue).await
    }

    pub async fn try_consumer<P: crate::message::Payload>(
        &self,
        connection: &str,
        queue: &str,
    ) -> Result<PoolContainer<T, Consumer<T, P>>, PoolError> {
        self.try_get(connection, queue).await
    }

    /// Pooled subscribers always use a temporary queue.
    pub async fn subscriber<P: crate::message::Payload>(
        &self,
        connection: &str,
        exchange: &str,
    ) -> Result<PoolContainer<T, Subscriber<T, P>>, PoolError> {
        self.get(connection, exchange).await
    }

    pub async fn try_subscriber<P: crate::message::Payload>(
        &self,
        connection: &str,
        exchange: &str,
    ) -> Result<PoolContainer<T, Subscriber<T, P>>, PoolError> {
        self.try_get(connection, exchange).await
    }

    pub async fn producer<P: crate::message::Payload>(
        &self,
        connection: &str,
        queue: &str,
    ) -> Result<PoolContainer<T, Producer<T, P>>, PoolError> {
        self.get(connection, queue).await
    }

    pub async fn try_producer<P: crate::message::Payload>(
        &self,
        connection: &str,
        queue: &str,
    ) -> Result<PoolContainer<T, Producer<T, P>>, PoolError> {
        self.try_get(connection, queue).await
    }

    pub async fn publisher<P: crate::message::Payload>(
        &self,
        connection: &str,
        exchange: &str,
    ) -> Result<PoolContainer<T, Publisher<T, P>>, PoolError> {
        self.get(connection, exchange).await
    }

    pub async fn try_publisher<P: crate::message::Payload>(
        &self,
        connection: &str,
        exchange: &str,
    ) -> Result<PoolContainer<T, Publisher<T, P>>, PoolError> {
        self.try_get(connection, exchange).await
    }

    /// Instances alive across every key, leased or idle.
    pub fn total_pool_size(&self) -> usize {
        self.pools().values().map(|pool| pool.size()).sum()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close every idle instance and refuse further leases.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let pools: Vec<_> = self.pools().drain().map(|(_, pool)| pool).collect();
        for pool in pools {
            pool.close().await;
        }
    }

    fn pools(&self) -> MutexGuard<'_, HashMap<PoolKey, Arc<dyn KeyedPool>>> {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn role_pool<R: Poolable<T>>(
        &self,
        connection: &str,
        destination: &str,
    ) -> Result<Arc<RolePool<T, R>>, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        let key = PoolKey {
            role: TypeId::of::<R>(),
            connection: connection.to_owned(),
            destination: destination.to_owned(),
        };

        let (pool, created) = {
            let mut pools = self.pools();
            match pools.get(&key) {
                Some(pool) => (Arc::clone(pool), false),
                None => {
                    let pool: Arc<dyn KeyedPool> =
                        Arc::new(self.build::<R>(connection, destination)?);
                    pools.insert(key, Arc::clone(&pool));
                    (pool, true)
                }
            }
        };
        let pool = pool
            .as_any()
            .downcast::<RolePool<T, R>>()
            .map_err(|_| PoolError::Other(anyhow::anyhow!("Pool key maps to another role")))?;

        if created {
            self.prewarm(&pool, connection, destination).await;
        }
        Ok(pool)
    }

    fn build<R: Poolable<T>>(
        &self,
        connection: &str,
        destination: &str,
    ) -> Result<RolePool<T, R>, PoolError> {
        let draining = Arc::new(AtomicBool::new(false));
        let manager = RoleManager {
            registry: Arc::clone(&self.registry),
            connection: connection.to_owned(),
            destination: destination.to_owned(),
            draining: Arc::clone(&draining),
            _role: PhantomData,
        };
        let pool = managed::Pool::builder(manager)
            .max_size(self.settings.max_size)
            .runtime(deadpool::Runtime::Tokio1)
            .wait_timeout(self.settings.wait_timeout())
            .build()
            .map_err(|e| PoolError::Other(anyhow::anyhow!("Failed to build a pool: {e}")))?;
        Ok(RolePool { pool, draining })
    }

    async fn prewarm<R: Poolable<T>>(
        &self,
        pool: &RolePool<T, R>,
        connection: &str,
        destination: &str,
    ) {
        let target = self.settings.initial_size.min(self.settings.max_size);
        let mut warm = Vec::with_capacity(target);
        for _ in 0..target {
            match pool.pool.timeout_get(&no_wait()).await {
                Ok(object) => warm.push(object),
                Err(e) => {
                    warn!(
                        error = %e,
                        connection = %connection,
                        destination = %destination,
                        "Failed to prewarm a pool"
                    );
                    break;
                }
            }
        }
        debug!(
            instances = warm.len(),
            connection = %connection,
            destination = %destination,
            "Prewarmed a pool"
        );
    }
}
