//! Flat key/value pool configuration.
//!
//! A [`PoolConfig`] is a JSON object. The keys listed on [`PoolSettings`] are
//! understood by the registry and the built-in provider; everything else is
//! kept as-is and handed to the provider, which may use it to configure the
//! driver.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Error;

/// Keys (and aliases) that are interpreted by [`PoolSettings`].
const RECOGNIZED_KEYS: &[&str] = &[
    "provider_class",
    "provider",
    "url",
    "jdbcUrl",
    "driver_class",
    "driverClassName",
    "user",
    "username",
    "password",
    "max_pool_size",
    "maximumPoolSize",
    "initial_pool_size",
    "min_pool_size",
    "minimumIdle",
    "max_statements",
    "max_statements_per_connection",
    "max_idle_time",
    "checkout_timeout",
    "test_connection_on_checkout",
];

/// The configuration object passed when a client is created.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolConfig {
    values: Map<String, Value>,
}

impl PoolConfig {
    /// Creates an empty configuration; every setting takes its default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a configuration from a JSON value, which must be an object.
    pub fn from_value(value: Value) -> Result<Self, Error> {
        match value {
            Value::Object(values) => Ok(Self { values }),
            other => Err(Error::Config(format!(
                "expected a JSON object, found `{other}`"
            ))),
        }
    }

    /// Sets `key` to `value`, returning the updated configuration.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Sets `key` to `value`, returning the previous value if there was one.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.values.insert(key.into(), value.into())
    }

    /// Returns the raw value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Returns the value stored under `key` if it is a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    /// Returns the value stored under `key` if it is a non-negative integer.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.values.get(key).and_then(Value::as_u64)
    }

    /// The underlying JSON object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }

    /// Iterates over the entries not interpreted by [`PoolSettings`].
    pub fn passthrough(&self) -> impl Iterator<Item = (&str, &Value)> + '_ {
        self.values
            .iter()
            .filter(|(key, _)| !RECOGNIZED_KEYS.contains(&key.as_str()))
            .map(|(key, value)| (key.as_str(), value))
    }

    /// Parses and validates the recognized settings.
    pub fn settings(&self) -> Result<PoolSettings, Error> {
        let settings: PoolSettings = serde_json::from_value(Value::Object(self.values.clone()))?;
        settings.validate()?;
        Ok(settings)
    }
}

impl From<Map<String, Value>> for PoolConfig {
    fn from(values: Map<String, Value>) -> Self {
        Self { values }
    }
}

impl FromStr for PoolConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_value(serde_json::from_str(s)?)
    }
}

/// The typed view of the recognized configuration keys.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct PoolSettings {
    /// Name of the provider expected to manage the pool.
    #[serde(alias = "provider")]
    pub provider_class: Option<String>,
    /// Connection URL for the database.
    #[serde(alias = "jdbcUrl")]
    pub url: Option<String>,
    /// Driver the provider should use.
    #[serde(alias = "driverClassName")]
    pub driver_class: Option<String>,
    /// User name to authenticate with.
    #[serde(alias = "username")]
    pub user: Option<String>,
    /// Password to authenticate with.
    pub password: Option<String>,
    /// Maximum number of connections in the pool. Defaults to 15.
    #[serde(alias = "maximumPoolSize")]
    pub max_pool_size: u32,
    /// Number of connections opened when the pool is created. Defaults to 3.
    pub initial_pool_size: u32,
    /// Minimum number of idle connections the pool maintains.
    #[serde(alias = "minimumIdle")]
    pub min_pool_size: Option<u32>,
    /// Maximum number of prepared statements cached across the pool.
    pub max_statements: u32,
    /// Maximum number of prepared statements cached per connection.
    pub max_statements_per_connection: u32,
    /// Seconds after which an idle connection is closed; 0 never expires.
    pub max_idle_time: u64,
    /// Milliseconds a checkout waits for a connection. Defaults to 30000.
    pub checkout_timeout: u64,
    /// Whether connections are validated before being handed out.
    pub test_connection_on_checkout: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            provider_class: None,
            url: None,
            driver_class: None,
            user: None,
            password: None,
            max_pool_size: 15,
            initial_pool_size: 3,
            min_pool_size: None,
            max_statements: 0,
            max_statements_per_connection: 0,
            max_idle_time: 0,
            checkout_timeout: 30_000,
            test_connection_on_checkout: true,
        }
    }
}

impl PoolSettings {
    fn validate(&self) -> Result<(), Error> {
        if self.max_pool_size == 0 {
            return Err(Error::Config(
                "max_pool_size must be greater than zero".into(),
            ));
        }
        if let Some(min) = self.min_pool_size {
            if min > self.max_pool_size {
                return Err(Error::Config(format!(
                    "min_pool_size ({min}) must not exceed max_pool_size ({})",
                    self.max_pool_size
                )));
            }
        }
        if self.initial_pool_size > self.max_pool_size {
            return Err(Error::Config(format!(
                "initial_pool_size ({}) must not exceed max_pool_size ({})",
                self.initial_pool_size, self.max_pool_size
            )));
        }
        if self.checkout_timeout == 0 {
            return Err(Error::Config(
                "checkout_timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// How long idle connections are kept, `None` if they never expire.
    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.max_idle_time {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// How long a checkout waits for a connection.
    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_millis(self.checkout_timeout)
    }

    /// Number of prepared statements a single connection may cache.
    ///
    /// The per-connection limit wins; otherwise the global limit is spread
    /// over the maximum pool size. Zero disables caching.
    pub fn statement_cache_capacity(&self) -> usize {
        if self.max_statements_per_connection > 0 {
            self.max_statements_per_connection as usize
        } else if self.max_statements > 0 {
            (self.max_statements / self.max_pool_size).max(1) as usize
        } else {
            0
        }
    }
}

impl fmt::Debug for PoolSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolSettings")
            .field("provider_class", &self.provider_class)
            .field("url", &self.url)
            .field("driver_class", &self.driver_class)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("max_pool_size", &self.max_pool_size)
            .field("initial_pool_size", &self.initial_pool_size)
            .field("min_pool_size", &self.min_pool_size)
            .field("max_statements", &self.max_statements)
            .field(
                "max_statements_per_connection",
                &self.max_statements_per_connection,
            )
            .field("max_idle_time", &self.max_idle_time)
            .field("checkout_timeout", &self.checkout_timeout)
            .field(
                "test_connection_on_checkout",
                &self.test_connection_on_checkout,
            )
            .finish()
    }
}
