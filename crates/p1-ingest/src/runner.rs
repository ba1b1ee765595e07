//! One fetch → parse → persist cycle with buffer fallback
//!
//! When persisting fails the raw fetched bytes, not the parsed reading, are
//! journaled so a later drain re-runs them through the parser. If journaling
//! fails as well the reading is gone; that case is reported as
//! [`RunError::DataLoss`] and logged with `data_loss = true`.

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::{BufferError, DurableBuffer};
use crate::meter::{FetchError, MeterClient};
use crate::parser::{parse_reading, ParseError};
use crate::storage::{PersistError, ReadingStore};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("Fetch failed: {0}")]
    Fetch(#[source] FetchError),

    #[error("Parse failed: {0}")]
    Parse(#[from] ParseError),

    #[error("Persist failed: {0}")]
    Persist(#[source] PersistError),

    #[error("Reading lost: persist failed ({persist}) and buffer append failed ({buffer})")]
    DataLoss {
        persist: PersistError,
        buffer: BufferError,
    },

    #[error("Run cancelled")]
    Cancelled,
}

impl RunError {
    /// Whether a reading was dropped without being persisted or journaled
    pub fn is_data_loss(&self) -> bool {
        matches!(self, RunError::DataLoss { .. })
    }
}

impl From<FetchError> for RunError {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::Cancelled => RunError::Cancelled,
            other => RunError::Fetch(other),
        }
    }
}

/// Wires the meter, the store and the retry buffer together
pub struct IngestRunner<S> {
    meter: MeterClient,
    store: S,
    buffer: DurableBuffer,
}

impl<S: ReadingStore> IngestRunner<S> {
    pub fn new(meter: MeterClient, store: S, buffer: DurableBuffer) -> Self {
        Self {
            meter,
            store,
            buffer,
        }
    }

    /// Run one cycle
    ///
    /// With `dry_run` the payload is fetched and parsed but nothing is
    /// persisted or buffered.
    pub async fn run_once(&self, cancel: &CancellationToken, dry_run: bool) -> Result<(), RunError> {
        let payload = self.meter.fetch(cancel).await?;
        let parsed = parse_reading(&payload)?;

        if dry_run {
            info!(
                endpoint = self.meter.endpoint(),
                unique_id = %parsed.reading.unique_id,
                total_power_import_kwh = parsed.reading.total_power_import_kwh,
                active_power_w = parsed.reading.active_power_w,
                total_gas_m3 = parsed.reading.total_gas_m3,
                externals = parsed.externals.len(),
                "Dry run: reading parsed, not persisted"
            );
            debug!(reading = ?parsed, "Dry run: full parsed reading");
            return Ok(());
        }

        let persist_err = match self.store.persist(&parsed, cancel).await {
            Ok(()) => {
                info!(unique_id = %parsed.reading.unique_id, "Reading persisted");
                return Ok(());
            }
            Err(e) => e,
        };

        match self.buffer.append_payload(&payload).await {
            Ok(()) => {
                warn!(
                    error = %persist_err,
                    buffer = %self.buffer.path().display(),
                    "Persist failed, payload buffered for replay"
                );
                Err(RunError::Persist(persist_err))
            }
            Err(buffer_err) => {
                error!(
                    data_loss = true,
                    persist_error = %persist_err,
                    buffer_error = %buffer_err,
                    buffer = %self.buffer.path().display(),
                    "Reading lost: persist and buffer append both failed"
                );
                Err(RunError::DataLoss {
                    persist: persist_err,
                    buffer: buffer_err,
                })
            }
        }
    }
}

/// Replay every buffered payload through parse and persist
///
/// All-or-nothing: the journal is cleared only when every entry persisted.
/// Needs no meter, so a drain works with only the database configured.
/// Returns the number of entries replayed.
pub async fn drain_buffer<S: ReadingStore>(
    store: &S,
    buffer: &DurableBuffer,
    cancel: &CancellationToken,
) -> Result<usize, BufferError> {
    let pending = buffer.len().await?;
    info!(pending, buffer = %buffer.path().display(), "Draining buffer");

    let replayed = buffer
        .drain(cancel, |entry| async move {
            let parsed = parse_reading(&entry)?;
            store
                .persist(&parsed, cancel)
                .await
                .map_err(RunError::Persist)
        })
        .await?;

    info!(replayed, "Buffer drained");
    Ok(replayed)
}
