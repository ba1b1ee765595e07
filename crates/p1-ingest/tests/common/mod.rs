//! Shared test infrastructure for the Postgres-backed integration tests
//!
//! Each test starts its own throwaway PostgreSQL container and applies one of
//! the schema fixtures, so tests never share state. Docker must be running.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tracing::info;

/// `p1.external_readings` linked by the parent's generated id
pub const SCHEMA_GENERATED_ID: &str = include_str!("../fixtures/schema_generated_id.sql");

/// `p1.external_readings` linked by the parent's natural identifier
pub const SCHEMA_NATURAL_KEY: &str = include_str!("../fixtures/schema_natural_key.sql");

pub const SAMPLE_PAYLOAD: &str = include_str!("../fixtures/meter_sample.json");

/// PostgreSQL container with a connected pool
pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
    connection_string: String,
}

impl TestPostgres {
    /// Start a container and apply `schema`
    pub async fn start(schema: &str) -> Result<Self> {
        info!("Starting PostgreSQL test container...");

        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .context("Failed to get container port")?;

        let connection_string =
            format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        sqlx::raw_sql(schema)
            .execute(&pool)
            .await
            .context("Failed to apply schema fixture")?;

        Ok(Self {
            _container: container,
            pool,
            connection_string,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    pub async fn count(&self, sql: &str) -> i64 {
        sqlx::query_scalar(sql)
            .fetch_one(&self.pool)
            .await
            .expect("count query failed")
    }
}

/// Initialize test tracing (call once per test, later calls are no-ops)
pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,p1_ingest=debug,sqlx=warn,testcontainers=info")
        }))
        .with_test_writer()
        .try_init();
}
