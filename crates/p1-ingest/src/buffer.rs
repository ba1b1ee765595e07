//! Durable retry buffer
//!
//! Newline-delimited journal of payloads that could not be persisted. Each
//! append opens the file in append/create mode and closes it again, so no file
//! handle outlives a call.
//!
//! Draining is all-or-nothing: every entry is replayed in file order and the
//! journal is truncated only when all of them succeed. A failed or cancelled
//! drain leaves the file exactly as it was, including entries that replayed
//! successfully, so replay callbacks must be idempotent.
//!
//! The internal mutex serializes appends and drains within one process only.
//! Two processes pointed at the same journal path are not coordinated.

use serde::Serialize;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Journal I/O or replay failure
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("Buffer journal I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize buffer entry: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Replay of buffered entry {entry} failed: {source}")]
    Replay {
        entry: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Buffer drain cancelled")]
    Cancelled,
}

/// Append-only journal of unpersisted payloads
#[derive(Debug)]
pub struct DurableBuffer {
    path: PathBuf,
    lock: Mutex<()>,
}

impl DurableBuffer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append any serializable value as one compact JSON line
    pub async fn append<T: Serialize + ?Sized>(&self, item: &T) -> Result<(), BufferError> {
        let mut line = serde_json::to_vec(item)?;
        line.push(b'\n');
        self.write_line(&line).await
    }

    /// Append a raw payload verbatim as one line
    ///
    /// CR and LF bytes are dropped. Valid JSON cannot contain them inside
    /// strings, so only insignificant whitespace is lost.
    pub async fn append_payload(&self, payload: &[u8]) -> Result<(), BufferError> {
        let mut line: Vec<u8> = payload
            .iter()
            .copied()
            .filter(|b| *b != b'\n' && *b != b'\r')
            .collect();
        line.push(b'\n');
        self.write_line(&line).await
    }

    async fn write_line(&self, line: &[u8]) -> Result<(), BufferError> {
        let _guard = self.lock.lock().await;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line).await?;
        file.sync_data().await?;

        debug!(path = %self.path.display(), bytes = line.len(), "Appended entry to buffer journal");
        Ok(())
    }

    /// Number of entries currently waiting in the journal
    pub async fn len(&self) -> Result<usize, BufferError> {
        let _guard = self.lock.lock().await;
        Ok(split_entries(&self.read_journal().await?).len())
    }

    /// Replay every entry through `persist`, truncating only on full success
    ///
    /// Returns the number of entries replayed. Stops at the first failure or
    /// when `cancel` fires before an entry, leaving the journal untouched.
    pub async fn drain<F, Fut, E>(
        &self,
        cancel: &CancellationToken,
        mut persist: F,
    ) -> Result<usize, BufferError>
    where
        F: FnMut(Vec<u8>) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let _guard = self.lock.lock().await;

        let contents = self.read_journal().await?;
        let entries = split_entries(&contents);
        if entries.is_empty() {
            debug!(path = %self.path.display(), "Buffer journal is empty, nothing to drain");
            return Ok(0);
        }

        info!(path = %self.path.display(), entries = entries.len(), "Draining buffer journal");

        for (index, entry) in entries.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(BufferError::Cancelled);
            }

            persist(entry.to_vec())
                .await
                .map_err(|e| BufferError::Replay {
                    entry: index + 1,
                    source: e.into(),
                })?;
        }

        let file = OpenOptions::new().write(true).open(&self.path).await?;
        file.set_len(0).await?;
        file.sync_all().await?;

        info!(path = %self.path.display(), entries = entries.len(), "Buffer journal drained");
        Ok(entries.len())
    }

    async fn read_journal(&self) -> Result<Vec<u8>, BufferError> {
        match tokio::fs::read(&self.path).await {
            Ok(contents) => Ok(contents),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

fn split_entries(contents: &[u8]) -> Vec<&[u8]> {
    contents
        .split(|b| *b == b'\n')
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn journal(dir: &TempDir) -> DurableBuffer {
        DurableBuffer::new(dir.path().join("p1-buffer.jsonl"))
    }

    #[tokio::test]
    async fn test_drain_happy_path_empties_journal() {
        let dir = TempDir::new().unwrap();
        let buffer = journal(&dir);
        buffer.append_payload(br#"{"unique_id":"a"}"#).await.unwrap();

        let calls = AtomicUsize::new(0);
        let drained = buffer
            .drain(&CancellationToken::new(), |entry| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    assert_eq!(entry, br#"{"unique_id":"a"}"#);
                    Ok::<(), std::io::Error>(())
                }
            })
            .await
            .unwrap();

        assert_eq!(drained, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::read(buffer.path()).unwrap(), b"");
    }

    #[tokio::test]
    async fn test_failed_drain_leaves_journal_untouched() {
        let dir = TempDir::new().unwrap();
        let buffer = journal(&dir);
        buffer.append_payload(br#"{"n":1}"#).await.unwrap();
        buffer.append_payload(br#"{"n":2}"#).await.unwrap();
        buffer.append_payload(br#"{"n":3}"#).await.unwrap();
        let before = std::fs::read(buffer.path()).unwrap();

        let calls = AtomicUsize::new(0);
        let err = buffer
            .drain(&CancellationToken::new(), |_entry| {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if call == 2 {
                        Err("database unavailable")
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, BufferError::Replay { entry: 2, .. }));
        // the third entry is never attempted
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(std::fs::read(buffer.path()).unwrap(), before);
        assert_eq!(buffer.len().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_drain_replays_in_file_order() {
        let dir = TempDir::new().unwrap();
        let buffer = journal(&dir);
        for n in 0..5 {
            buffer.append(&serde_json::json!({ "n": n })).await.unwrap();
        }

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        buffer
            .drain(&CancellationToken::new(), move |entry| {
                let value: serde_json::Value = serde_json::from_slice(&entry).unwrap();
                sink.lock().unwrap().push(value["n"].as_i64().unwrap());
                async { Ok::<(), std::io::Error>(()) }
            })
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_drain_missing_journal_is_noop() {
        let dir = TempDir::new().unwrap();
        let buffer = journal(&dir);

        let drained = buffer
            .drain(&CancellationToken::new(), |_entry| async {
                Err::<(), _>("must not be called")
            })
            .await
            .unwrap();

        assert_eq!(drained, 0);
        assert!(!buffer.path().exists());
    }

    #[tokio::test]
    async fn test_cancelled_drain_keeps_entries() {
        let dir = TempDir::new().unwrap();
        let buffer = journal(&dir);
        buffer.append_payload(b"{}").await.unwrap();
        buffer.append_payload(b"{}").await.unwrap();

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let err = buffer
            .drain(&cancel, move |_entry| {
                // cancel after the first replay starts
                token.cancel();
                async { Ok::<(), std::io::Error>(()) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, BufferError::Cancelled));
        assert_eq!(buffer.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_append_payload_keeps_multiline_json_on_one_line() {
        let dir = TempDir::new().unwrap();
        let buffer = journal(&dir);
        buffer
            .append_payload(b"{\r\n  \"unique_id\": \"a\",\n  \"total_gas_m3\": 1.5\n}")
            .await
            .unwrap();

        let contents = std::fs::read_to_string(buffer.path()).unwrap();
        assert_eq!(contents, "{  \"unique_id\": \"a\",  \"total_gas_m3\": 1.5}\n");
        let value: serde_json::Value = serde_json::from_str(contents.trim_end()).unwrap();
        assert_eq!(value["total_gas_m3"], 1.5);
    }

    #[tokio::test]
    async fn test_concurrent_appends_do_not_interleave() {
        let dir = TempDir::new().unwrap();
        let buffer = Arc::new(journal(&dir));

        let mut handles = Vec::new();
        for n in 0..20 {
            let buffer = buffer.clone();
            handles.push(tokio::spawn(async move {
                buffer.append(&serde_json::json!({ "n": n })).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let contents = std::fs::read_to_string(buffer.path()).unwrap();
        assert_eq!(contents.lines().count(), 20);
        for line in contents.lines() {
            serde_json::from_str::<serde_json::Value>(line).unwrap();
        }
    }

    #[tokio::test]
    async fn test_append_fails_for_unwritable_path() {
        let dir = TempDir::new().unwrap();
        let buffer = DurableBuffer::new(dir.path().join("missing-dir").join("buffer.jsonl"));

        let err = buffer.append_payload(b"{}").await.unwrap_err();
        assert!(matches!(err, BufferError::Io(_)));
    }
}
