//! P1 Ingest Library
//!
//! Polls a smart meter's P1 snapshot endpoint and stores the readings in
//! PostgreSQL without losing data across database outages.
//!
//! # Components
//!
//! - **[`buffer`]**: append-only journal of payloads that failed to persist,
//!   drained all-or-nothing
//! - **[`storage`]**: idempotent upsert of a reading and its external readings,
//!   plus an append-only batch path
//! - **[`runner`]**: one fetch → parse → persist cycle with buffer fallback
//! - **[`scheduler`]**: periodic loop guarded by a Postgres advisory lock so
//!   only one process runs a cycle at a time
//! - **[`csv_import`]**: historical import from 15-minute CSV exports
//!
//! # Example
//!
//! ```no_run
//! use p1_ingest::buffer::DurableBuffer;
//! use p1_ingest::meter::MeterClient;
//! use p1_ingest::runner::IngestRunner;
//! use p1_ingest::storage::PgReadingStore;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = sqlx::PgPool::connect("postgres://localhost/energy").await?;
//!     let store = PgReadingStore::connect(pool).await?;
//!     let meter = MeterClient::new("http://192.168.1.50/api/v1/data", Duration::from_secs(10))?;
//!     let runner = IngestRunner::new(meter, store, DurableBuffer::new("/tmp/p1-buffer.jsonl"));
//!
//!     runner.run_once(&CancellationToken::new(), false).await?;
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod buffer;
pub mod config;
pub mod csv_import;
pub mod db;
pub mod lock;
pub mod meter;
pub mod models;
pub mod parser;
pub mod runner;
pub mod scheduler;
pub mod storage;
