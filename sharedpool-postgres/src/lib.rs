//! Postgres support for `sharedpool` registries.
//!
//! [`PostgresDriver`] builds a [`PostgresConnectionManager`] from a client
//! configuration, so a `Registry<PostgresProvider<_>>` can create shared
//! Postgres pools on demand.
#![deny(missing_docs, missing_debug_implementations)]

pub use sharedpool;
pub use tokio_postgres;

use std::fmt;
use std::num::NonZeroUsize;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use sharedpool::{BuiltinProvider, MakeManager, PoolConfig, PoolSettings};
use tokio_postgres::config::Config;
use tokio_postgres::tls::{MakeTlsConnect, TlsConnect};
use tokio_postgres::{Client, Error, Socket, Statement};
use tracing::warn;

/// `driver_class` values accepted by [`PostgresDriver`].
pub const DRIVER_NAMES: &[&str] = &["postgres", "postgresql", "org.postgresql.Driver"];

/// The built-in provider opening Postgres connections.
pub type PostgresProvider<Tls> = BuiltinProvider<PostgresDriver<Tls>>;

/// A `sharedpool::ManageConnection` for `tokio_postgres::Client`s.
#[derive(Clone)]
pub struct PostgresConnectionManager<Tls>
where
    Tls: MakeTlsConnect<Socket>,
{
    config: Config,
    tls: Tls,
    statement_cache_capacity: usize,
}

impl<Tls> PostgresConnectionManager<Tls>
where
    Tls: MakeTlsConnect<Socket>,
{
    /// Create a new `PostgresConnectionManager` with the specified `config`.
    pub fn new(config: Config, tls: Tls) -> PostgresConnectionManager<Tls> {
        PostgresConnectionManager {
            config,
            tls,
            statement_cache_capacity: 0,
        }
    }

    /// Create a new `PostgresConnectionManager`, parsing the config from `params`.
    pub fn new_from_stringlike<T>(
        params: T,
        tls: Tls,
    ) -> Result<PostgresConnectionManager<Tls>, Error>
    where
        T: ToString,
    {
        let stringified_params = params.to_string();
        let config = Config::from_str(&stringified_params)?;
        Ok(Self::new(config, tls))
    }

    /// Sets how many prepared statements each connection caches for
    /// `PgConnection::prepare_cached`. Zero disables caching.
    pub fn statement_cache_capacity(mut self, capacity: usize) -> Self {
        self.statement_cache_capacity = capacity;
        self
    }

    /// The connection parameters.
    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[async_trait]
impl<Tls> sharedpool::ManageConnection for PostgresConnectionManager<Tls>
where
    Tls: MakeTlsConnect<Socket> + Clone + Send + Sync + 'static,
    <Tls as MakeTlsConnect<Socket>>::Stream: Send + Sync,
    <Tls as MakeTlsConnect<Socket>>::TlsConnect: Send,
    <<Tls as MakeTlsConnect<Socket>>::TlsConnect as TlsConnect<Socket>>::Future: Send,
{
    type Connection = PgConnection;
    type Error = Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let (client, connection) = self.config.connect(self.tls.clone()).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "postgres connection closed with an error");
            }
        });
        Ok(PgConnection::new(client, self.statement_cache_capacity))
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.simple_query("").await.map(|_| ())
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.is_closed()
    }
}

impl<Tls> fmt::Debug for PostgresConnectionManager<Tls>
where
    Tls: MakeTlsConnect<Socket>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresConnectionManager")
            .field("config", &self.config)
            .field("statement_cache_capacity", &self.statement_cache_capacity)
            .finish()
    }
}

/// Builds Postgres connection managers from client configuration.
///
/// Reads `url` (a leading `jdbc:` is ignored), `user`, `password` and
/// `driver_class`, plus the pass-through keys `application_name` and
/// `connect_timeout` (seconds).
#[derive(Clone)]
pub struct PostgresDriver<Tls> {
    tls: Tls,
}

impl<Tls> PostgresDriver<Tls> {
    /// Creates a driver connecting with `tls`.
    pub fn new(tls: Tls) -> Self {
        Self { tls }
    }
}

impl<Tls> fmt::Debug for PostgresDriver<Tls> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresDriver").finish_non_exhaustive()
    }
}

impl<Tls> MakeManager for PostgresDriver<Tls>
where
    Tls: MakeTlsConnect<Socket> + Clone + Send + Sync + 'static,
    <Tls as MakeTlsConnect<Socket>>::Stream: Send + Sync,
    <Tls as MakeTlsConnect<Socket>>::TlsConnect: Send,
    <<Tls as MakeTlsConnect<Socket>>::TlsConnect as TlsConnect<Socket>>::Future: Send,
{
    type Manager = PostgresConnectionManager<Tls>;

    fn make_manager(
        &self,
        config: &PoolConfig,
        settings: &PoolSettings,
    ) -> Result<Self::Manager, sharedpool::Error> {
        if let Some(driver) = settings.driver_class.as_deref() {
            if !DRIVER_NAMES.contains(&driver) {
                return Err(sharedpool::Error::Config(format!(
                    "unsupported driver_class `{driver}`"
                )));
            }
        }

        let url = settings
            .url
            .as_deref()
            .ok_or_else(|| sharedpool::Error::Config("`url` is required".into()))?;
        let url = url.strip_prefix("jdbc:").unwrap_or(url);
        let mut pg = Config::from_str(url)
            .map_err(|e| sharedpool::Error::Config(format!("invalid url: {e}")))?;

        if let Some(user) = &settings.user {
            pg.user(user.as_str());
        }
        if let Some(password) = &settings.password {
            pg.password(password.as_str());
        }
        if let Some(name) = config.get_str("application_name") {
            pg.application_name(name);
        }
        if let Some(secs) = config.get_u64("connect_timeout") {
            pg.connect_timeout(Duration::from_secs(secs));
        }

        Ok(PostgresConnectionManager::new(pg, self.tls.clone())
            .statement_cache_capacity(settings.statement_cache_capacity()))
    }
}

/// A pooled Postgres client with a per-connection prepared statement cache.
pub struct PgConnection {
    client: Client,
    statements: StatementCache<Statement>,
}

impl PgConnection {
    fn new(client: Client, statement_cache_capacity: usize) -> Self {
        Self {
            client,
            statements: StatementCache::new(statement_cache_capacity),
        }
    }

    /// Prepares `query`, reusing the statement this connection prepared for
    /// it before if it is still cached.
    pub async fn prepare_cached(&mut self, query: &str) -> Result<Statement, Error> {
        if let Some(statement) = self.statements.get(query) {
            return Ok(statement);
        }

        let statement = self.client.prepare(query).await?;
        self.statements.insert(query.to_owned(), statement.clone());
        Ok(statement)
    }

    /// The number of statements currently cached.
    pub fn cached_statements(&self) -> usize {
        self.statements.len()
    }
}

impl Deref for PgConnection {
    type Target = Client;

    fn deref(&self) -> &Client {
        &self.client
    }
}

impl DerefMut for PgConnection {
    fn deref_mut(&mut self) -> &mut Client {
        &mut self.client
    }
}

impl fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgConnection")
            .field("closed", &self.client.is_closed())
            .field("cached_statements", &self.statements.len())
            .finish()
    }
}

/// A bounded cache keyed by query text, evicting the least recently used
/// entry when full. A capacity of zero disables caching.
#[derive(Debug)]
pub struct StatementCache<T> {
    entries: Option<LruCache<String, T>>,
}

impl<T: Clone> StatementCache<T> {
    /// Creates a cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity).map(LruCache::new),
        }
    }

    /// Returns the entry for `query`, marking it most recently used.
    pub fn get(&mut self, query: &str) -> Option<T> {
        self.entries.as_mut()?.get(query).cloned()
    }

    /// Caches `value` for `query`.
    pub fn insert(&mut self, query: String, value: T) {
        if let Some(entries) = &mut self.entries {
            entries.put(query, value);
        }
    }

    /// The number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, LruCache::len)
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_postgres::NoTls;

    fn driver() -> PostgresDriver<NoTls> {
        PostgresDriver::new(NoTls)
    }

    fn manager(config: &PoolConfig) -> Result<PostgresConnectionManager<NoTls>, sharedpool::Error> {
        let settings = config.settings()?;
        driver().make_manager(config, &settings)
    }

    #[test]
    fn jdbc_url_and_credentials() {
        let config = PoolConfig::new()
            .with("url", "jdbc:postgresql://localhost:5432/orders")
            .with("driver_class", "org.postgresql.Driver")
            .with("user", "app")
            .with("password", "secret")
            .with("application_name", "billing")
            .with("connect_timeout", 5)
            .with("max_statements_per_connection", 16);

        let manager = manager(&config).unwrap();
        let pg = manager.config();
        assert_eq!(pg.get_dbname(), Some("orders"));
        assert_eq!(pg.get_user(), Some("app"));
        assert_eq!(pg.get_password(), Some(&b"secret"[..]));
        assert_eq!(pg.get_application_name(), Some("billing"));
        assert_eq!(pg.get_connect_timeout(), Some(&Duration::from_secs(5)));
        assert_eq!(manager.statement_cache_capacity, 16);
    }

    #[test]
    fn hikari_style_keys() {
        let config = PoolConfig::new()
            .with("jdbcUrl", "postgres://localhost/app")
            .with("username", "reporter");
        let manager = manager(&config).unwrap();
        assert_eq!(manager.config().get_user(), Some("reporter"));
        assert_eq!(manager.statement_cache_capacity, 0);
    }

    #[test]
    fn config_errors() {
        let missing_url = PoolConfig::new();
        assert!(matches!(
            manager(&missing_url),
            Err(sharedpool::Error::Config(_))
        ));

        let bad_driver = PoolConfig::new()
            .with("url", "postgres://localhost/app")
            .with("driver_class", "com.mysql.jdbc.Driver");
        assert!(matches!(
            manager(&bad_driver),
            Err(sharedpool::Error::Config(_))
        ));

        let bad_url = PoolConfig::new().with("url", "postgres://localhost:notaport/app");
        assert!(matches!(
            manager(&bad_url),
            Err(sharedpool::Error::Config(_))
        ));
    }

    #[test]
    fn statement_cache_evicts_least_recently_used() {
        let mut cache = StatementCache::new(2);
        cache.insert("a".to_owned(), 1);
        cache.insert("b".to_owned(), 2);
        assert_eq!(cache.get("a"), Some(1));

        cache.insert("c".to_owned(), 3);
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("c"), Some(3));
        assert_eq!(cache.len(), 2);

        cache.insert("a".to_owned(), 10);
        assert_eq!(cache.get("a"), Some(10));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn statement_cache_disabled() {
        let mut cache = StatementCache::new(0);
        cache.insert("a".to_owned(), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.get("a"), None);
    }
}
