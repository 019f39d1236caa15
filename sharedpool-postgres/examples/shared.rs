use sharedpool::{ClientScope, PoolConfig, Registry};
use sharedpool_postgres::{PostgresDriver, PostgresProvider};
use tracing_subscriber::EnvFilter;

// Share one pool between several workers, each owning a client scope.
//
// The simplest way to start the db is using Docker:
// docker run --name sharedpool-postgres -e POSTGRES_PASSWORD=mysecretpassword \
//     -p 5432:5432 -d postgres
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let registry: Registry<PostgresProvider<_>> =
        Registry::new(PostgresProvider::new(PostgresDriver::new(tokio_postgres::NoTls)));
    let config: PoolConfig = r#"{
        "url": "jdbc:postgresql://localhost:5432/postgres",
        "user": "postgres",
        "password": "mysecretpassword",
        "max_pool_size": 4,
        "initial_pool_size": 1,
        "max_statements_per_connection": 8,
        "application_name": "sharedpool-example"
    }"#
    .parse()
    .expect("invalid config");

    let workers: Vec<_> = (0..4)
        .map(|worker: i32| {
            let registry = registry.clone();
            let config = config.clone();
            tokio::spawn(async move {
                let scope = ClientScope::new(registry);
                let client = scope.create_shared("example", &config).await?;

                let mut conn = client.get_connection().await?;
                let stmt = conn
                    .prepare_cached("SELECT $1::INT4 * 2")
                    .await
                    .map_err(sharedpool::Error::driver)?;
                let row = conn
                    .query_one(&stmt, &[&worker])
                    .await
                    .map_err(sharedpool::Error::driver)?;
                println!("worker {worker}: {}", row.get::<usize, i32>(0));
                drop(conn);

                scope.close().await
            })
        })
        .collect();

    for worker in workers {
        if let Err(e) = worker.await.expect("worker panicked") {
            eprintln!("worker failed: {e}");
        }
    }

    println!("pools left: {}", registry.len());
    registry.shutdown().await.expect("shutdown failed");
}
