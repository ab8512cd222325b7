//! Test harness with testcontainers for integration testing.
//!
//! One Postgres container is shared across the whole test run; each test
//! gets its own freshly-migrated database inside it, so tests that claim
//! from the backlog cannot see each other's rows.

use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result};
use sqlx::PgPool;
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared test infrastructure that persists across all tests.
struct SharedTestInfra {
    /// Server URL without a database name, e.g. `postgresql://user:pw@host:port`.
    base_url: String,
    // Keep the container alive for the entire test run
    _postgres: ContainerAsync<Postgres>,
}

/// Global shared infrastructure - initialized once, reused by all tests.
static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

static DB_COUNTER: AtomicU32 = AtomicU32::new(0);

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        // Respect RUST_LOG; try_init() because another test may have won the race.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .with_tag("16")
            .with_cmd(["-c", "max_connections=200"])
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let pg_host = postgres.get_host().await?;
        let pg_port = postgres.get_host_port_ipv4(5432).await?;
        let base_url = format!("postgresql://postgres:postgres@{}:{}", pg_host, pg_port);

        Ok(Self {
            base_url,
            _postgres: postgres,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared test infrastructure")
            })
            .await
    }
}

/// Per-test context: a dedicated, freshly-migrated database.
pub struct TestHarness {
    /// Database pool - use this for test fixtures.
    pub db_pool: PgPool,
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new().await.expect("Failed to create test harness")
    }

    async fn teardown(self) {
        // Database pool is automatically dropped; the throwaway database
        // lives until the container goes away with the test run.
    }
}

impl TestHarness {
    pub async fn new() -> Result<Self> {
        let infra = SharedTestInfra::get().await;

        let admin = PgPool::connect(&format!("{}/postgres", infra.base_url))
            .await
            .context("Failed to connect to admin database")?;
        let db_name = format!(
            "enricher_test_{}",
            DB_COUNTER.fetch_add(1, Ordering::SeqCst)
        );
        sqlx::query(&format!(r#"CREATE DATABASE "{}""#, db_name))
            .execute(&admin)
            .await
            .context("Failed to create test database")?;
        admin.close().await;

        let db_pool = PgPool::connect(&format!("{}/{}", infra.base_url, db_name))
            .await
            .context("Failed to connect to test database")?;

        sqlx::migrate!("./migrations")
            .run(&db_pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self { db_pool })
    }
}
