use chrono::{DateTime, Utc};
use curtain_core::traits::SourceStore;
use curtain_core::{FetchConfig, FetchStrategy, MonitoredSource, SourceStatus};
use curtain_db::{Database, PgStore};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

/// Spins up a PostgreSQL container, runs the migrations and returns a
/// connected pool.
///
/// The `ContainerAsync` must be kept in scope for the test duration;
/// dropping it stops the container.
pub async fn setup_test_db() -> (PgPool, ContainerAsync<GenericImage>) {
    let container = GenericImage::new("postgres", "16")
        .with_exposed_port(ContainerPort::Tcp(5432))
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .with_env_var("POSTGRES_DB", "curtain_test")
        .start()
        .await
        .expect("Failed to start PostgreSQL container");

    let host = container.get_host().await.expect("Failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get port");

    let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/curtain_test");

    // Retry connection until container is fully ready
    const MAX_RETRIES: u32 = 30;
    let mut retries = 0;
    let pool = loop {
        match PgPoolOptions::new()
            .max_connections(10)
            .connect(&connection_string)
            .await
        {
            Ok(pool) => break pool,
            Err(e) => {
                retries += 1;
                if retries >= MAX_RETRIES {
                    panic!("Failed to connect to database after {MAX_RETRIES} retries: {e}");
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    };

    Database::from_pool(pool.clone())
        .migrate()
        .await
        .expect("Failed to run migrations");

    (pool, container)
}

pub fn utc(s: &str) -> DateTime<Utc> {
    s.parse().unwrap()
}

pub fn sample_source(id: &str) -> MonitoredSource {
    let now = utc("2024-06-01T00:00:00Z");
    MonitoredSource {
        id: id.to_string(),
        label: id.replace('-', " "),
        enabled: true,
        status: SourceStatus::Active,
        fetch: FetchConfig {
            strategy: FetchStrategy::SingleUrl {
                url: format!("https://{id}.example/shows"),
            },
            params: serde_json::json!({"waitFor": 1000}),
            change_tracking: true,
        },
        created_at: now,
        updated_at: now,
    }
}

/// Store with the given sources already inserted.
pub async fn seeded_store(pool: PgPool, ids: &[&str]) -> PgStore {
    let store = PgStore::new(pool);
    for id in ids {
        store.upsert_source(&sample_source(id)).await.unwrap();
    }
    store
}
