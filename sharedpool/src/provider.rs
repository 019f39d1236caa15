//! The capability interface a pool provider implements, and the built-in
//! provider backed by [`Pool`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::api::{Builder, ManageConnection, Pool, PooledConnection};
use crate::config::{PoolConfig, PoolSettings};
use crate::Error;

/// Creates, hands out connections from, and destroys physical pools.
///
/// The registry is the only caller of `create_pool` and `destroy_pool`;
/// clients only call `acquire`.
#[async_trait]
pub trait PoolProvider: Send + Sync + 'static {
    /// The pool handle owned by a registry entry.
    type Pool: Send + Sync + 'static;
    /// The connection handed out by `acquire`.
    type Connection: Send + 'static;

    /// The name matched against the `provider_class` configuration key.
    fn name(&self) -> &str;

    /// Creates a pool from the configuration and its parsed settings.
    async fn create_pool(
        &self,
        config: &PoolConfig,
        settings: &PoolSettings,
    ) -> Result<Self::Pool, Error>;

    /// Tears a pool down. Called once, when the last client releases it.
    async fn destroy_pool(&self, pool: &Self::Pool) -> Result<(), Error>;

    /// Waits at most `timeout` for a connection from `pool`.
    async fn acquire(&self, pool: &Self::Pool, timeout: Duration)
        -> Result<Self::Connection, Error>;
}

/// Builds the connection manager for a new pool from its configuration.
pub trait MakeManager: Send + Sync + 'static {
    /// The manager opening connections for pools built by this driver.
    type Manager: ManageConnection;

    /// Creates a manager. Unrecognized configuration keys are available
    /// through `config`.
    fn make_manager(
        &self,
        config: &PoolConfig,
        settings: &PoolSettings,
    ) -> Result<Self::Manager, Error>;
}

/// The default provider: a [`Pool`] per entry, with connections opened by
/// the manager `D` builds.
#[derive(Clone)]
pub struct BuiltinProvider<D> {
    driver: D,
}

impl<D: MakeManager> BuiltinProvider<D> {
    /// The name this provider answers to in `provider_class`.
    pub const NAME: &'static str = "builtin";

    /// Creates a provider using `driver` to build connection managers.
    pub fn new(driver: D) -> Self {
        Self { driver }
    }

    /// The driver building connection managers.
    pub fn driver(&self) -> &D {
        &self.driver
    }
}

impl<D> fmt::Debug for BuiltinProvider<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuiltinProvider").finish_non_exhaustive()
    }
}

#[async_trait]
impl<D: MakeManager> PoolProvider for BuiltinProvider<D> {
    type Pool = Pool<D::Manager>;
    type Connection = PooledConnection<D::Manager>;

    fn name(&self) -> &str {
        Self::NAME
    }

    async fn create_pool(
        &self,
        config: &PoolConfig,
        settings: &PoolSettings,
    ) -> Result<Self::Pool, Error> {
        let manager = self.driver.make_manager(config, settings)?;
        let pool = Builder::from_settings(settings)
            .build(manager)
            .await
            .map_err(|e| match e {
                Error::Driver(e) => Error::Provider(e),
                e => e,
            })?;
        debug!(state = ?pool.state(), "built pool");
        Ok(pool)
    }

    async fn destroy_pool(&self, pool: &Self::Pool) -> Result<(), Error> {
        pool.close();
        Ok(())
    }

    async fn acquire(
        &self,
        pool: &Self::Pool,
        timeout: Duration,
    ) -> Result<Self::Connection, Error> {
        pool.get_timeout(timeout).await
    }
}
