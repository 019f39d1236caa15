use std::error;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::PoolSettings;
use crate::inner::PoolInner;
use crate::internals::Conn;
pub use crate::internals::State;
use crate::Error;

/// An asynchronous connection pool, the pool type of the built-in provider.
pub struct Pool<M>
where
    M: ManageConnection,
{
    pub(crate) inner: PoolInner<M>,
}

impl<M> Clone for Pool<M>
where
    M: ManageConnection,
{
    fn clone(&self) -> Self {
        Pool {
            inner: self.inner.clone(),
        }
    }
}

impl<M> fmt::Debug for Pool<M>
where
    M: ManageConnection,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_fmt(format_args!("Pool({:?})", self.inner))
    }
}

impl<M: ManageConnection> Pool<M> {
    /// Returns a `Builder` instance to configure a new pool.
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Returns information about the current state of the pool.
    pub fn state(&self) -> State {
        self.inner.state()
    }

    /// Retrieves a connection from the pool, waiting at most the configured
    /// connection timeout.
    pub async fn get(&self) -> Result<PooledConnection<M>, Error> {
        self.inner.get().await
    }

    /// Retrieves a connection from the pool, waiting at most `timeout`.
    pub async fn get_timeout(&self, timeout: Duration) -> Result<PooledConnection<M>, Error> {
        self.inner.get_timeout(timeout).await
    }

    /// Get a new dedicated connection that will not be managed by the pool.
    ///
    /// This method allows reusing the manager's configuration but otherwise
    /// bypassing the pool.
    pub async fn dedicated_connection(&self) -> Result<M::Connection, Error> {
        self.inner.connect().await
    }

    /// Closes the pool.
    ///
    /// Idle connections are dropped right away; connections that are checked
    /// out are dropped when they are returned. Waiting and future checkouts
    /// fail with `Error::AlreadyClosed`.
    pub fn close(&self) {
        self.inner.close()
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// A builder for a connection pool.
#[derive(Debug, Clone)]
pub struct Builder {
    /// The maximum number of connections allowed.
    pub(crate) max_size: u32,
    /// The minimum idle connection count the pool will attempt to maintain.
    pub(crate) min_idle: Option<u32>,
    /// The number of connections opened when the pool is built.
    pub(crate) initial_size: u32,
    /// Whether or not to test the connection on checkout.
    pub(crate) test_on_check_out: bool,
    /// The duration, if any, after which idle connections are closed.
    pub(crate) idle_timeout: Option<Duration>,
    /// The duration to wait for a connection before giving up.
    pub(crate) connection_timeout: Duration,
    /// The time interval used to wake up and reap connections.
    pub(crate) reaper_rate: Duration,
}

impl Default for Builder {
    fn default() -> Self {
        Builder {
            max_size: 15,
            min_idle: None,
            initial_size: 3,
            test_on_check_out: true,
            idle_timeout: None,
            connection_timeout: Duration::from_secs(30),
            reaper_rate: Duration::from_secs(30),
        }
    }
}

impl Builder {
    /// Constructs a new `Builder`.
    ///
    /// Parameters are initialized with their default values.
    pub fn new() -> Builder {
        Default::default()
    }

    /// Constructs a `Builder` from validated pool settings.
    pub fn from_settings(settings: &PoolSettings) -> Builder {
        Builder::new()
            .max_size(settings.max_pool_size)
            .min_idle(settings.min_pool_size)
            .initial_size(settings.initial_pool_size)
            .test_on_check_out(settings.test_connection_on_checkout)
            .idle_timeout(settings.idle_timeout())
            .connection_timeout(settings.checkout_timeout())
    }

    /// Sets the maximum number of connections managed by the pool.
    ///
    /// Defaults to 15.
    pub fn max_size(mut self, max_size: u32) -> Builder {
        assert!(max_size > 0, "max_size must be greater than zero!");
        self.max_size = max_size;
        self
    }

    /// Sets the minimum idle connection count maintained by the pool.
    ///
    /// If set, the pool will try to maintain at least this many idle
    /// connections at all times, while respecting the value of `max_size`.
    ///
    /// Defaults to None.
    pub fn min_idle(mut self, min_idle: Option<u32>) -> Builder {
        self.min_idle = min_idle;
        self
    }

    /// Sets the number of connections opened when the pool is built.
    ///
    /// Defaults to 3.
    pub fn initial_size(mut self, initial_size: u32) -> Builder {
        self.initial_size = initial_size;
        self
    }

    /// If true, the health of a connection will be verified through a call to
    /// `ManageConnection::is_valid` before it is provided to a pool user.
    ///
    /// Defaults to true.
    pub fn test_on_check_out(mut self, test_on_check_out: bool) -> Builder {
        self.test_on_check_out = test_on_check_out;
        self
    }

    /// Sets the idle timeout used by the pool.
    ///
    /// If set, idle connections will be closed at the next reaping after
    /// remaining idle past this duration, and replaced as needed to honor
    /// `min_idle`.
    ///
    /// Defaults to None.
    pub fn idle_timeout(mut self, idle_timeout: Option<Duration>) -> Builder {
        assert!(
            idle_timeout != Some(Duration::from_secs(0)),
            "idle_timeout must be greater than zero!"
        );
        self.idle_timeout = idle_timeout;
        self
    }

    /// Sets the connection timeout used by the pool.
    ///
    /// Futures returned by `Pool::get` will wait this long before giving up and
    /// resolving with an error.
    ///
    /// Defaults to 30 seconds.
    pub fn connection_timeout(mut self, connection_timeout: Duration) -> Builder {
        assert!(
            connection_timeout > Duration::from_secs(0),
            "connection_timeout must be non-zero"
        );
        self.connection_timeout = connection_timeout;
        self
    }

    /// Used by tests
    #[allow(dead_code)]
    pub fn reaper_rate(mut self, reaper_rate: Duration) -> Builder {
        self.reaper_rate = reaper_rate;
        self
    }

    fn build_inner<M: ManageConnection>(self, manager: M) -> Pool<M> {
        if let Some(min_idle) = self.min_idle {
            assert!(
                self.max_size >= min_idle,
                "min_idle must be no larger than max_size"
            );
        }

        Pool {
            inner: PoolInner::new(self, manager),
        }
    }

    /// Consumes the builder, returning a new, initialized `Pool`.
    ///
    /// The `Pool` will not be returned until it has established its initial
    /// connections, or it times out.
    pub async fn build<M: ManageConnection>(self, manager: M) -> Result<Pool<M>, Error> {
        let pool = self.build_inner(manager);
        pool.inner.start_connections().await.map(|()| pool)
    }

    /// Consumes the builder, returning a new, initialized `Pool`.
    ///
    /// Unlike `build`, this does not wait for any connections to be established
    /// before returning.
    pub fn build_unchecked<M: ManageConnection>(self, manager: M) -> Pool<M> {
        let p = self.build_inner(manager);
        p.inner.spawn_start_connections();
        p
    }
}

/// A trait which provides connection-specific functionality.
#[async_trait]
pub trait ManageConnection: Sized + Send + Sync + 'static {
    /// The connection type this manager deals with.
    type Connection: Send + 'static;
    /// The error type returned by `Connection`s.
    type Error: error::Error + Send + Sync + 'static;

    /// Attempts to create a new connection.
    async fn connect(&self) -> Result<Self::Connection, Self::Error>;
    /// Determines if the connection is still connected to the database.
    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error>;
    /// Synchronously determine if the connection is no longer usable, if possible.
    fn has_broken(&self, conn: &mut Self::Connection) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    Present,
    Invalid,
}

/// A smart pointer wrapping a connection.
///
/// The connection goes back to the pool when this is dropped.
pub struct PooledConnection<M>
where
    M: ManageConnection,
{
    pool: PoolInner<M>,
    conn: Option<Conn<M::Connection>>,
    pub(crate) state: ConnectionState,
}

impl<M> PooledConnection<M>
where
    M: ManageConnection,
{
    pub(crate) fn new(pool: PoolInner<M>, conn: Conn<M::Connection>) -> Self {
        Self {
            pool,
            conn: Some(conn),
            state: ConnectionState::Present,
        }
    }

    fn conn(&self) -> &Conn<M::Connection> {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("connection is only taken on drop"),
        }
    }

    fn conn_mut(&mut self) -> &mut Conn<M::Connection> {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("connection is only taken on drop"),
        }
    }
}

impl<M> Deref for PooledConnection<M>
where
    M: ManageConnection,
{
    type Target = M::Connection;

    fn deref(&self) -> &M::Connection {
        &self.conn().conn
    }
}

impl<M> DerefMut for PooledConnection<M>
where
    M: ManageConnection,
{
    fn deref_mut(&mut self) -> &mut M::Connection {
        &mut self.conn_mut().conn
    }
}

impl<M> fmt::Debug for PooledConnection<M>
where
    M: ManageConnection,
    M::Connection: fmt::Debug,
{
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&self.conn().conn, fmt)
    }
}

impl<M> Drop for PooledConnection<M>
where
    M: ManageConnection,
{
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put_back(conn, self.state);
        }
    }
}
