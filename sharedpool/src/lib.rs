//! Reference-counted, shared asynchronous connection pools (using tokio).
//!
//! Applications usually want every component that talks to a database to
//! share one pool, instead of each opening its own. sharedpool keeps a
//! [`Registry`] of pools keyed by identifier. Creating a [`Client`] for an
//! identifier creates the pool on first use and takes a reference to it;
//! closing the client drops the reference, and the last close destroys the
//! pool.
//!
//! The pools themselves come from a [`PoolProvider`]. The
//! [`BuiltinProvider`] manages a [`Pool`] per identifier, opening connections
//! through a [`ManageConnection`] implementation built from the client
//! configuration by a [`MakeManager`] driver.
//!
//! # Example
//!
//! Using an imaginary "foodb" driver.
//!
//! ```ignore
//! #[tokio::main]
//! async fn main() {
//!     let registry = sharedpool::Registry::new(BuiltinProvider::new(foodb::Driver));
//!     let config = PoolConfig::new()
//!         .with("url", "foodb://localhost:1234")
//!         .with("max_pool_size", 20);
//!
//!     for _ in 0..4 {
//!         let registry = registry.clone();
//!         let config = config.clone();
//!         tokio::spawn(async move {
//!             // All four clients share the same pool.
//!             let client = Client::create_shared(&registry, "orders", &config).await.unwrap();
//!             let conn = client.get_connection().await.unwrap();
//!             // use the connection
//!             // it will be returned to the pool when it falls out of scope.
//!             drop(conn);
//!             client.close().await.unwrap();
//!         });
//!     }
//! }
//! ```
#![deny(missing_docs, missing_debug_implementations)]

mod api;
pub use api::{Builder, ManageConnection, Pool, PooledConnection, State};

mod client;
pub use client::{Client, ClientScope};

pub mod config;
pub use config::{PoolConfig, PoolSettings};

mod error;
pub use error::{BoxError, Error};

mod inner;
mod internals;
mod lock;

mod provider;
pub use provider::{BuiltinProvider, MakeManager, PoolProvider};

mod registry;
pub use registry::{PoolEntry, PoolId, Registry, DEFAULT_POOL_NAME};
