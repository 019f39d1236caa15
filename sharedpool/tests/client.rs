use std::time::Duration;
use std::{error, fmt};

use async_trait::async_trait;
use sharedpool::{
    BuiltinProvider, Client, ClientScope, Error, MakeManager, ManageConnection, Pool, PoolConfig,
    PoolId, PoolSettings, Registry,
};
use tokio::time::{sleep, Instant};

#[derive(Debug)]
struct ConnectError;

impl fmt::Display for ConnectError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str("connection refused")
    }
}

impl error::Error for ConnectError {}

#[derive(Debug, Default)]
struct FakeConnection;

#[derive(Debug)]
struct FakeManager {
    fail: bool,
}

#[async_trait]
impl ManageConnection for FakeManager {
    type Connection = FakeConnection;
    type Error = ConnectError;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        match self.fail {
            true => Err(ConnectError),
            false => Ok(FakeConnection),
        }
    }

    async fn is_valid(&self, _: &mut Self::Connection) -> Result<(), Self::Error> {
        Ok(())
    }

    fn has_broken(&self, _: &mut Self::Connection) -> bool {
        false
    }
}

/// Accepts `driver_class` "fake"; the pass-through key `fail_connects` makes
/// every connection attempt fail.
struct FakeDriver;

impl MakeManager for FakeDriver {
    type Manager = FakeManager;

    fn make_manager(
        &self,
        config: &PoolConfig,
        settings: &PoolSettings,
    ) -> Result<Self::Manager, Error> {
        match settings.driver_class.as_deref() {
            None | Some("fake") => {}
            Some(other) => return Err(Error::Config(format!("unknown driver `{other}`"))),
        }
        let fail = config
            .get("fail_connects")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        Ok(FakeManager { fail })
    }
}

type Provider = BuiltinProvider<FakeDriver>;

fn registry() -> Registry<Provider> {
    Registry::new(BuiltinProvider::new(FakeDriver))
}

async fn wait_for_destroy(registry: &Registry<Provider>, pool: &Pool<FakeManager>) {
    for _ in 0..100 {
        if pool.is_closed() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("pool was not destroyed, {registry:?}");
}

#[tokio::test]
async fn test_shared_clients_share_pool() {
    let registry = registry();
    let config = PoolConfig::new()
        .with("max_pool_size", 2)
        .with("initial_pool_size", 1);

    let a = Client::create_shared(&registry, "app", &config).await.unwrap();
    let b = Client::create_shared(&registry, "app", &PoolConfig::new())
        .await
        .unwrap();
    assert!(std::ptr::eq(a.entry().pool(), b.entry().pool()));
    assert_eq!(b.entry().settings().max_pool_size, 2);
    assert_eq!(registry.ref_count(a.id()).await, 2);

    a.close().await.unwrap();
    assert!(!b.entry().pool().is_closed());
    assert_eq!(registry.ref_count(b.id()).await, 1);

    b.close().await.unwrap();
    assert!(b.entry().pool().is_closed());
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let registry = registry();
    let config = PoolConfig::new();
    let a = Client::create_default(&registry, &config).await.unwrap();
    let b = Client::create_default(&registry, &config).await.unwrap();
    assert_eq!(a.id(), &PoolId::from("DEFAULT_DS"));

    a.close().await.unwrap();
    a.close().await.unwrap();
    a.clone().close().await.unwrap();
    assert!(a.is_closed());
    assert_eq!(registry.ref_count(b.id()).await, 1);
    assert!(!b.entry().pool().is_closed());
}

#[tokio::test]
async fn test_closed_client_rejects_checkout() {
    let registry = registry();
    let client = Client::create_non_shared(&registry, &PoolConfig::new())
        .await
        .unwrap();
    client.close().await.unwrap();

    assert!(matches!(
        client.get_connection().await,
        Err(Error::AlreadyClosed)
    ));
}

#[tokio::test]
async fn test_non_shared_clients_get_own_pools() {
    let registry = registry();
    let config = PoolConfig::new();
    let a = Client::create_non_shared(&registry, &config).await.unwrap();
    let b = Client::create_non_shared(&registry, &config).await.unwrap();

    assert_ne!(a.id(), b.id());
    assert!(!std::ptr::eq(a.entry().pool(), b.entry().pool()));
    assert_eq!(registry.len(), 2);
}

#[tokio::test]
async fn test_get_connection() {
    let registry = registry();
    let config = PoolConfig::new()
        .with("max_pool_size", 2)
        .with("initial_pool_size", 1);
    let client = Client::create_shared(&registry, "db", &config).await.unwrap();

    let first = client.get_connection().await.unwrap();
    let second = client.get_connection().await.unwrap();
    assert_eq!(client.entry().pool().state().connections, 2);
    drop((first, second));
    assert_eq!(client.entry().pool().state().idle_connections, 2);
}

#[tokio::test]
async fn test_get_connection_timeout() {
    let registry = registry();
    let config = PoolConfig::new()
        .with("max_pool_size", 1)
        .with("initial_pool_size", 1);
    let client = Client::create_shared(&registry, "tiny", &config).await.unwrap();
    let held = client.get_connection().await.unwrap();

    let start = Instant::now();
    let e = client
        .get_connection_timeout(Duration::from_millis(100))
        .await;
    let elapsed = start.elapsed();
    assert!(matches!(e, Err(Error::TimedOut)));
    assert!(elapsed >= Duration::from_millis(100), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(150), "{elapsed:?}");

    drop(held);
    client.get_connection().await.unwrap();
}

#[tokio::test]
async fn test_checkout_timeout_setting() {
    let registry = registry();
    let config = PoolConfig::new()
        .with("max_pool_size", 1)
        .with("initial_pool_size", 0)
        .with("checkout_timeout", 100);
    let client = Client::create_shared(&registry, "tiny", &config).await.unwrap();
    let _held = client.get_connection().await.unwrap();

    let start = Instant::now();
    assert!(matches!(
        client.get_connection().await,
        Err(Error::TimedOut)
    ));
    assert!(start.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn test_driver_error_from_checkout() {
    let registry = registry();
    let config = PoolConfig::new()
        .with("initial_pool_size", 0)
        .with("fail_connects", true);
    let client = Client::create_shared(&registry, "down", &config).await.unwrap();

    assert!(matches!(
        client.get_connection().await,
        Err(Error::Driver(_))
    ));
}

#[tokio::test]
async fn test_creation_errors() {
    let registry = registry();

    let config = PoolConfig::new().with("driver_class", "oracle");
    assert!(matches!(
        Client::create_shared(&registry, "a", &config).await,
        Err(Error::Config(_))
    ));

    let config = PoolConfig::new()
        .with("initial_pool_size", 1)
        .with("checkout_timeout", 300)
        .with("fail_connects", true);
    assert!(matches!(
        Client::create_shared(&registry, "b", &config).await,
        Err(Error::Provider(_))
    ));

    let config = PoolConfig::new().with("provider_class", "c3p0");
    assert!(matches!(
        Client::create_shared(&registry, "c", &config).await,
        Err(Error::Config(_))
    ));

    let config = PoolConfig::new().with("provider_class", "builtin");
    Client::create_shared(&registry, "d", &config).await.unwrap();
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_drop_releases() {
    let registry = registry();
    let client = Client::create_shared(&registry, "dropped", &PoolConfig::new())
        .await
        .unwrap();
    let id = client.id().clone();
    let clone = client.clone();

    drop(client);
    assert_eq!(registry.ref_count(&id).await, 1);

    let entry = clone.entry().clone();
    drop(clone);
    wait_for_destroy(&registry, entry.pool()).await;
    assert_eq!(registry.ref_count(&id).await, 0);
    assert!(!registry.contains(&id));
}

#[tokio::test]
async fn test_close_after_shutdown() {
    let registry = registry();
    let client = Client::create_shared(&registry, "gone", &PoolConfig::new())
        .await
        .unwrap();

    registry.shutdown().await.unwrap();
    assert!(client.entry().pool().is_closed());
    assert!(matches!(
        client.get_connection().await,
        Err(Error::AlreadyClosed)
    ));
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_stale_client_spares_recreated_pool() {
    let registry = registry();
    let config = PoolConfig::new();
    let closed = Client::create_shared(&registry, "db", &config).await.unwrap();
    let dropped = Client::create_shared(&registry, "db", &config).await.unwrap();
    registry.shutdown().await.unwrap();

    let fresh = Client::create_shared(&registry, "db", &config).await.unwrap();
    closed.close().await.unwrap();
    drop(dropped);
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    sleep(Duration::from_millis(20)).await;

    assert_eq!(registry.ref_count(fresh.id()).await, 1);
    assert!(!fresh.entry().pool().is_closed());
    drop(fresh.get_connection().await.unwrap());

    fresh.close().await.unwrap();
    assert!(fresh.entry().pool().is_closed());
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_with_pool() {
    let registry = registry();
    let pool = Pool::<FakeManager>::builder()
        .max_size(1)
        .initial_size(0)
        .build(FakeManager { fail: false })
        .await
        .unwrap();

    let client = Client::with_pool(&registry, pool.clone(), &PoolConfig::new()).unwrap();
    assert!(client.id().is_anonymous());
    drop(client.get_connection().await.unwrap());

    client.close().await.unwrap();
    assert!(pool.is_closed());
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_scope_close() {
    let registry = registry();
    let scope = ClientScope::new(registry.clone());
    let config = PoolConfig::new();

    let a = scope.create_shared("shared", &config).await.unwrap();
    let b = scope.create_shared("shared", &config).await.unwrap();
    let c = scope.create_non_shared(&config).await.unwrap();
    let d = scope.create_default(&config).await.unwrap();
    assert_eq!(scope.len(), 4);
    assert_eq!(registry.ref_count(a.id()).await, 2);

    // Closing a client early does not make the scope close it twice.
    b.close().await.unwrap();

    scope.close().await.unwrap();
    assert!(scope.is_empty());
    for client in [&a, &b, &c, &d] {
        assert!(client.is_closed());
    }
    assert!(registry.is_empty());

    scope.close().await.unwrap();
}

#[tokio::test]
async fn test_scope_drop() {
    let registry = registry();
    let outside = Client::create_shared(&registry, "kept", &PoolConfig::new())
        .await
        .unwrap();

    let scope = ClientScope::new(registry.clone());
    let held = scope.create_shared("kept", &PoolConfig::new()).await.unwrap();
    assert_eq!(registry.ref_count(outside.id()).await, 2);

    // The scope closes its clients even while other handles are alive.
    drop(scope);
    assert!(held.is_closed());
    for _ in 0..100 {
        if registry.ref_count(outside.id()).await == 1 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(registry.ref_count(outside.id()).await, 1);
    assert!(!outside.entry().pool().is_closed());

    outside.close().await.unwrap();
    assert!(registry.is_empty());
}
