//! Cross-process advisory locking
//!
//! [`AdvisoryLock::try_acquire`] never blocks: `Ok(None)` means another holder
//! owns the key and is not an error. The returned guard must be handed back to
//! [`AdvisoryLock::release`], whose result is always reported to the caller.

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Upper bound on a single unlock round-trip
pub const DEFAULT_RELEASE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Advisory lock query failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Advisory lock {0} was not held by this session")]
    NotHeld(i64),

    #[error("Advisory lock release timed out")]
    Timeout,
}

#[async_trait]
pub trait AdvisoryLock: Send + Sync {
    /// Proof of ownership, consumed by [`AdvisoryLock::release`]
    type Guard: Send;

    async fn try_acquire(&self, key: i64) -> Result<Option<Self::Guard>, LockError>;

    async fn release(&self, guard: Self::Guard) -> Result<(), LockError>;
}

/// Session-level `pg_try_advisory_lock` on a pooled connection
///
/// The guard keeps that connection checked out for the whole cycle, so a pool
/// shared with the store needs at least two connections.
#[derive(Debug, Clone)]
pub struct PgAdvisoryLock {
    db: PgPool,
    release_timeout: Duration,
}

impl PgAdvisoryLock {
    pub fn new(db: PgPool) -> Self {
        Self {
            db,
            release_timeout: DEFAULT_RELEASE_TIMEOUT,
        }
    }

    pub fn with_release_timeout(mut self, release_timeout: Duration) -> Self {
        self.release_timeout = release_timeout;
        self
    }
}

/// Holds the exact connection whose session owns the lock
#[derive(Debug)]
pub struct PgLockGuard {
    conn: PoolConnection<Postgres>,
    key: i64,
}

impl PgLockGuard {
    pub fn key(&self) -> i64 {
        self.key
    }
}

#[async_trait]
impl AdvisoryLock for PgAdvisoryLock {
    type Guard = PgLockGuard;

    async fn try_acquire(&self, key: i64) -> Result<Option<PgLockGuard>, LockError> {
        let mut conn = self.db.acquire().await?;

        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await?;

        debug!(lock_key = key, acquired, "Advisory lock attempt");
        Ok(acquired.then_some(PgLockGuard { conn, key }))
    }

    async fn release(&self, guard: PgLockGuard) -> Result<(), LockError> {
        let PgLockGuard { mut conn, key } = guard;

        let unlock = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(key)
            .fetch_one(&mut *conn);

        let error = match tokio::time::timeout(self.release_timeout, unlock).await {
            Ok(Ok(true)) => return Ok(()),
            Ok(Ok(false)) => return Err(LockError::NotHeld(key)),
            Ok(Err(e)) => LockError::Database(e),
            Err(_) => LockError::Timeout,
        };

        // the session may still hold the lock; ending it is the only other way
        // to drop a session lock, so it must not go back to the pool
        warn!(lock_key = key, error = %error, "Closing connection after failed unlock");
        drop(conn.detach());
        Err(error)
    }
}
