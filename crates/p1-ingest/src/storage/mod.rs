//! Persistence of readings into `p1.meter_readings` / `p1.external_readings`
//!
//! The single-row path ([`ReadingStore::persist`]) is an idempotent upsert keyed
//! by the reading's natural identifier, with the external readings replaced
//! wholesale in the same transaction. The batch path
//! ([`postgres::PgReadingStore::insert_batch`], [`render_batch_sql`]) is an
//! append-only multi-row insert for bulk historical loads.

pub mod postgres;
mod values;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::models::ParsedReading;

pub use postgres::PgReadingStore;
pub use values::{render_batch_sql, upsert_assignments, READING_COLUMNS};

/// Writing a reading failed; the transaction was rolled back
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Database write failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Persist cancelled")]
    Cancelled,

    #[error("Unsupported external_readings schema: {0}")]
    UnsupportedSchema(String),
}

/// How `p1.external_readings` rows reference their parent reading
///
/// Chosen once when the store is constructed and used for every write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkageStrategy {
    /// `meter_reading_id` column holding the parent's generated `id`
    ByGeneratedId,
    /// `meter_reading_unique_id` column holding the parent's natural identifier
    ByNaturalKey,
}

impl LinkageStrategy {
    pub fn column(self) -> &'static str {
        match self {
            LinkageStrategy::ByGeneratedId => "meter_reading_id",
            LinkageStrategy::ByNaturalKey => "meter_reading_unique_id",
        }
    }

    /// Pick a strategy from the column names present on `p1.external_readings`
    pub fn from_columns<S: AsRef<str>>(columns: &[S]) -> Result<Self, PersistError> {
        let has = |name: &str| columns.iter().any(|c| c.as_ref() == name);

        if has(LinkageStrategy::ByGeneratedId.column()) {
            Ok(LinkageStrategy::ByGeneratedId)
        } else if has(LinkageStrategy::ByNaturalKey.column()) {
            Ok(LinkageStrategy::ByNaturalKey)
        } else {
            Err(PersistError::UnsupportedSchema(
                "p1.external_readings has neither meter_reading_id nor meter_reading_unique_id"
                    .to_string(),
            ))
        }
    }
}

/// Idempotent writer for a reading and the external readings it owns
#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Upsert `parsed` and replace its external readings atomically
    async fn persist(
        &self,
        parsed: &ParsedReading,
        cancel: &CancellationToken,
    ) -> Result<(), PersistError>;
}
