use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::config::PoolConfig;
use crate::lock::Mutex;
use crate::provider::PoolProvider;
use crate::registry::{PoolEntry, PoolId, Registry, DEFAULT_POOL_NAME};
use crate::Error;

/// A handle on a registered pool.
///
/// Clones refer to the same handle: closing one closes all of them. A client
/// that is dropped without being closed releases its pool reference in the
/// background.
pub struct Client<P: PoolProvider> {
    inner: Arc<ClientInner<P>>,
}

struct ClientInner<P: PoolProvider> {
    entry: PoolEntry<P>,
    registry: Registry<P>,
    closed: AtomicBool,
}

impl<P: PoolProvider> Client<P> {
    /// Creates a client for the pool registered under `id`, creating the pool
    /// from `config` if needed.
    pub async fn create(
        registry: &Registry<P>,
        id: impl Into<PoolId>,
        config: &PoolConfig,
    ) -> Result<Self, Error> {
        let entry = registry.get_or_create(id, config).await?;
        Ok(Self::from_entry(registry, entry))
    }

    /// Creates a client sharing the pool named `name` with every other
    /// client created under that name.
    ///
    /// Only the first call for a name uses `config`.
    pub async fn create_shared(
        registry: &Registry<P>,
        name: impl Into<String>,
        config: &PoolConfig,
    ) -> Result<Self, Error> {
        Self::create(registry, PoolId::Named(name.into()), config).await
    }

    /// Creates a client sharing the default pool.
    pub async fn create_default(
        registry: &Registry<P>,
        config: &PoolConfig,
    ) -> Result<Self, Error> {
        Self::create_shared(registry, DEFAULT_POOL_NAME, config).await
    }

    /// Creates a client with a pool of its own.
    pub async fn create_non_shared(
        registry: &Registry<P>,
        config: &PoolConfig,
    ) -> Result<Self, Error> {
        let entry = registry.create_non_shared(config).await?;
        Ok(Self::from_entry(registry, entry))
    }

    /// Creates a client over a pool that was built by the caller. The pool
    /// is destroyed through the provider when the client is closed.
    pub fn with_pool(
        registry: &Registry<P>,
        pool: P::Pool,
        config: &PoolConfig,
    ) -> Result<Self, Error> {
        let entry = registry.adopt(pool, config)?;
        Ok(Self::from_entry(registry, entry))
    }

    fn from_entry(registry: &Registry<P>, entry: PoolEntry<P>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                entry,
                registry: registry.clone(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The identifier of the pool this client uses.
    pub fn id(&self) -> &PoolId {
        self.inner.entry.id()
    }

    /// The pool this client uses, with its creation-time configuration.
    pub fn entry(&self) -> &PoolEntry<P> {
        &self.inner.entry
    }

    /// Whether `close` has been called on this client.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Waits for a connection, at most the pool's `checkout_timeout`.
    pub async fn get_connection(&self) -> Result<P::Connection, Error> {
        let timeout = self.inner.entry.settings().checkout_timeout();
        self.get_connection_timeout(timeout).await
    }

    /// Waits at most `timeout` for a connection.
    pub async fn get_connection_timeout(
        &self,
        timeout: Duration,
    ) -> Result<P::Connection, Error> {
        if self.is_closed() {
            return Err(Error::AlreadyClosed);
        }

        let inner = &self.inner;
        inner
            .registry
            .provider()
            .acquire(inner.entry.pool(), timeout)
            .await
    }

    /// Releases this client's reference on its pool.
    ///
    /// Closing an already closed client, or one whose pool was removed by
    /// `Registry::shutdown`, does nothing.
    pub async fn close(&self) -> Result<(), Error> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!(pool = %self.id(), "client already closed");
            return Ok(());
        }

        match self.inner.registry.release_entry(&self.inner.entry).await {
            Err(e) if e.is_idempotent_close() => {
                debug!(pool = %self.id(), error = %e, "pool already gone");
                Ok(())
            }
            result => result,
        }
    }

    pub(crate) fn close_in_background(&self) {
        self.inner.close_in_background();
    }
}

impl<P: PoolProvider> ClientInner<P> {
    fn close_in_background(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let entry = self.entry.clone();
        let Ok(handle) = Handle::try_current() else {
            warn!(
                pool = %entry.id(),
                "client dropped outside of a tokio runtime, pool reference leaked"
            );
            return;
        };

        let registry = self.registry.clone();
        handle.spawn(async move {
            match registry.release_entry(&entry).await {
                Err(e) if !e.is_idempotent_close() => {
                    warn!(pool = %entry.id(), error = %e, "failed to release pool");
                }
                _ => {}
            }
        });
    }
}

impl<P: PoolProvider> Drop for ClientInner<P> {
    fn drop(&mut self) {
        self.close_in_background();
    }
}

impl<P: PoolProvider> Clone for Client<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: PoolProvider> fmt::Debug for Client<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", self.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Owns the clients created through it, and closes each of them exactly
/// once when the scope is closed or dropped.
///
/// Use one per managed-lifetime unit of the application, such as a worker
/// or a service component.
pub struct ClientScope<P: PoolProvider> {
    registry: Registry<P>,
    clients: Mutex<Vec<Client<P>>>,
}

impl<P: PoolProvider> ClientScope<P> {
    /// Creates a scope creating its clients through `registry`.
    pub fn new(registry: Registry<P>) -> Self {
        Self {
            registry,
            clients: Mutex::new(Vec::new()),
        }
    }

    /// See [`Client::create`].
    pub async fn create(
        &self,
        id: impl Into<PoolId>,
        config: &PoolConfig,
    ) -> Result<Client<P>, Error> {
        let client = Client::create(&self.registry, id, config).await?;
        Ok(self.track(client))
    }

    /// See [`Client::create_shared`].
    pub async fn create_shared(
        &self,
        name: impl Into<String>,
        config: &PoolConfig,
    ) -> Result<Client<P>, Error> {
        let client = Client::create_shared(&self.registry, name, config).await?;
        Ok(self.track(client))
    }

    /// See [`Client::create_default`].
    pub async fn create_default(&self, config: &PoolConfig) -> Result<Client<P>, Error> {
        let client = Client::create_default(&self.registry, config).await?;
        Ok(self.track(client))
    }

    /// See [`Client::create_non_shared`].
    pub async fn create_non_shared(&self, config: &PoolConfig) -> Result<Client<P>, Error> {
        let client = Client::create_non_shared(&self.registry, config).await?;
        Ok(self.track(client))
    }

    fn track(&self, client: Client<P>) -> Client<P> {
        self.clients.lock().push(client.clone());
        client
    }

    /// The number of clients the scope will close.
    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    /// Whether the scope tracks no clients.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes every client created through this scope, returning the first
    /// error. Every client is closed even if some fail.
    pub async fn close(&self) -> Result<(), Error> {
        let clients = mem::take(&mut *self.clients.lock());
        let mut first_error = None;
        for client in clients {
            if let Err(e) = client.close().await {
                warn!(pool = %client.id(), error = %e, "failed to close client");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<P: PoolProvider> Drop for ClientScope<P> {
    fn drop(&mut self) {
        for client in mem::take(&mut *self.clients.lock()) {
            client.close_in_background();
        }
    }
}

impl<P: PoolProvider> fmt::Debug for ClientScope<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientScope")
            .field("clients", &self.len())
            .finish()
    }
}
