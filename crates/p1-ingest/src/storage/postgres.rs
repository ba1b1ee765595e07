//! PostgreSQL implementation of [`ReadingStore`]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::values::{insert_prefix, reading_values, upsert_assignments};
use super::{LinkageStrategy, PersistError, ReadingStore};
use crate::models::{ExternalReading, ParsedReading, Reading};

/// Readings per batch statement; 35 binds each stays well under Postgres' bind limit
pub const DEFAULT_BATCH_CHUNK_SIZE: usize = 1000;

/// Parent reference written into `p1.external_readings`
#[derive(Debug, Clone, Copy)]
enum ParentLink<'a> {
    Id(i64),
    NaturalKey(&'a str),
}

impl ParentLink<'_> {
    fn column(self) -> &'static str {
        match self {
            ParentLink::Id(_) => LinkageStrategy::ByGeneratedId.column(),
            ParentLink::NaturalKey(_) => LinkageStrategy::ByNaturalKey.column(),
        }
    }
}

/// Storage handler for meter readings
#[derive(Debug, Clone)]
pub struct PgReadingStore {
    db: PgPool,
    linkage: LinkageStrategy,
    batch_chunk_size: usize,
}

impl PgReadingStore {
    /// Probe the external readings schema once and build a store for it
    pub async fn connect(db: PgPool) -> Result<Self, PersistError> {
        let columns: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT column_name::text
            FROM information_schema.columns
            WHERE table_schema = 'p1'
              AND table_name = 'external_readings'
            "#,
        )
        .fetch_all(&db)
        .await?;

        let linkage = LinkageStrategy::from_columns(&columns)?;
        info!(
            linkage = ?linkage,
            column = linkage.column(),
            "Detected external_readings linkage"
        );

        Ok(Self::with_linkage(db, linkage))
    }

    /// Build a store for a known schema without probing
    pub fn with_linkage(db: PgPool, linkage: LinkageStrategy) -> Self {
        Self {
            db,
            linkage,
            batch_chunk_size: DEFAULT_BATCH_CHUNK_SIZE,
        }
    }

    pub fn with_batch_chunk_size(mut self, batch_chunk_size: usize) -> Self {
        self.batch_chunk_size = batch_chunk_size.max(1);
        self
    }

    pub fn linkage(&self) -> LinkageStrategy {
        self.linkage
    }

    /// Append readings with multi-row inserts inside one transaction
    ///
    /// No conflict handling: submitting the same readings twice stores them
    /// twice. Returns the number of rows inserted.
    pub async fn insert_batch(&self, readings: &[Reading]) -> Result<u64, PersistError> {
        if readings.is_empty() {
            return Ok(0);
        }

        let stamp = Utc::now();
        let mut tx = self.db.begin().await?;
        let mut inserted = 0;

        for chunk in readings.chunks(self.batch_chunk_size) {
            let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(insert_prefix());

            query_builder.push_values(chunk, |mut row, reading| {
                for value in reading_values(reading, stamp) {
                    value.push_bind(&mut row);
                }
            });

            inserted += query_builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;

        info!(readings = readings.len(), rows = inserted, "Inserted reading batch");
        Ok(inserted)
    }

    async fn write(&self, parsed: &ParsedReading) -> Result<(), PersistError> {
        let stamp = Utc::now();
        let reading = &parsed.reading;
        let mut tx = self.db.begin().await?;

        let parent_id = self.upsert_reading(&mut tx, reading, stamp).await?;

        let link = match (self.linkage, parent_id) {
            (LinkageStrategy::ByGeneratedId, Some(id)) => Some(ParentLink::Id(id)),
            (LinkageStrategy::ByNaturalKey, _) if reading.has_natural_id() => {
                Some(ParentLink::NaturalKey(&reading.unique_id))
            }
            _ => None,
        };

        match link {
            Some(link) => replace_externals(&mut tx, link, &parsed.externals, stamp).await?,
            None if !parsed.externals.is_empty() => {
                warn!(
                    externals = parsed.externals.len(),
                    "Reading has no natural identifier to link external readings on, skipping them"
                );
            }
            None => {}
        }

        tx.commit().await?;

        debug!(
            unique_id = %reading.unique_id,
            externals = parsed.externals.len(),
            "Persisted reading"
        );
        Ok(())
    }

    /// Insert or update the parent row, returning its generated id when the
    /// linkage needs it
    async fn upsert_reading(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        reading: &Reading,
        stamp: DateTime<Utc>,
    ) -> Result<Option<i64>, sqlx::Error> {
        let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(insert_prefix());

        query_builder.push_values(std::iter::once(reading), |mut row, reading| {
            for value in reading_values(reading, stamp) {
                value.push_bind(&mut row);
            }
        });

        // without a natural id there is nothing to conflict on
        if reading.has_natural_id() {
            query_builder.push(" ON CONFLICT (unique_id) DO UPDATE SET ");
            query_builder.push(upsert_assignments());
        }

        match self.linkage {
            LinkageStrategy::ByGeneratedId => {
                query_builder.push(" RETURNING id");
                let id = query_builder
                    .build_query_scalar::<i64>()
                    .fetch_one(&mut **tx)
                    .await?;
                Ok(Some(id))
            }
            LinkageStrategy::ByNaturalKey => {
                query_builder.build().execute(&mut **tx).await?;
                Ok(None)
            }
        }
    }
}

/// Delete every external reading linked to the parent, then insert `externals`
async fn replace_externals(
    tx: &mut Transaction<'_, Postgres>,
    link: ParentLink<'_>,
    externals: &[ExternalReading],
    stamp: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    let column = link.column();

    let mut delete: QueryBuilder<Postgres> =
        QueryBuilder::new(format!("DELETE FROM p1.external_readings WHERE {column} = "));
    match link {
        ParentLink::Id(id) => delete.push_bind(id),
        ParentLink::NaturalKey(key) => delete.push_bind(key.to_string()),
    };
    let removed = delete.build().execute(&mut **tx).await?.rows_affected();

    if externals.is_empty() {
        debug!(removed, "Cleared external readings");
        return Ok(());
    }

    let mut insert: QueryBuilder<Postgres> = QueryBuilder::new(format!(
        "INSERT INTO p1.external_readings ({column}, created_at, unique_id, type, timestamp, value, unit) "
    ));

    insert.push_values(externals, |mut row, external| {
        match link {
            ParentLink::Id(id) => row.push_bind(id),
            ParentLink::NaturalKey(key) => row.push_bind(key.to_string()),
        };
        row.push_bind(stamp)
            .push_bind(external.unique_id.clone())
            .push_bind(external.kind.clone())
            .push_bind(external.timestamp)
            .push_bind(external.value)
            .push_bind(external.unit.clone());
    });

    insert.build().execute(&mut **tx).await?;

    debug!(removed, inserted = externals.len(), "Replaced external readings");
    Ok(())
}

#[async_trait]
impl ReadingStore for PgReadingStore {
    async fn persist(
        &self,
        parsed: &ParsedReading,
        cancel: &CancellationToken,
    ) -> Result<(), PersistError> {
        // dropping the write future drops the open transaction, which rolls back
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PersistError::Cancelled),
            result = self.write(parsed) => result,
        }
    }
}
