//! Advisory-lock guarded periodic loop
//!
//! Each cycle tries the lock without blocking. When another process holds it
//! the cycle is skipped; otherwise the job runs and the lock is released on
//! every exit path. Cycles never overlap within a process: the next tick is
//! only awaited after the previous release finished. Bounding the release is
//! the lock implementation's job, since only it knows how to give up a
//! half-released lock safely.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::lock::{AdvisoryLock, LockError};

/// Interval used when none (or a non-positive one) is configured
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Advisory lock check failed: {0}")]
    LockCheck(#[source] LockError),

    #[error("Scheduler cancelled")]
    Cancelled,
}

/// Result of one lock-guarded cycle
#[derive(Debug)]
pub enum CycleOutcome<E> {
    /// Another holder owns the lock; the job did not run
    Skipped,
    /// The job ran and the lock release was attempted
    Completed {
        job_error: Option<E>,
        release_error: Option<LockError>,
    },
}

impl<E> CycleOutcome<E> {
    pub fn ran(&self) -> bool {
        matches!(self, CycleOutcome::Completed { .. })
    }
}

pub struct Scheduler<L> {
    lock: L,
    lock_key: i64,
    interval: Duration,
}

impl<L: AdvisoryLock> Scheduler<L> {
    /// A zero interval falls back to [`DEFAULT_INTERVAL`]
    pub fn new(lock: L, lock_key: i64, interval: Duration) -> Self {
        Self {
            lock,
            lock_key,
            interval: if interval.is_zero() {
                DEFAULT_INTERVAL
            } else {
                interval
            },
        }
    }

    /// Run cycles immediately and then once per interval until cancelled
    ///
    /// Job failures are logged and the loop continues. A failed lock check
    /// stops the loop. Always returns an error: either the lock check failure
    /// or [`SchedulerError::Cancelled`].
    pub async fn run<F, Fut, E>(
        &self,
        cancel: &CancellationToken,
        mut job: F,
    ) -> Result<(), SchedulerError>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            lock_key = self.lock_key,
            interval_secs = self.interval.as_secs(),
            "Scheduler started"
        );

        loop {
            // the first tick completes immediately
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(lock_key = self.lock_key, "Scheduler stopped");
                    return Err(SchedulerError::Cancelled);
                }
                _ = ticker.tick() => {}
            }

            match self.run_cycle(cancel, &mut job).await? {
                CycleOutcome::Skipped => {
                    debug!(lock_key = self.lock_key, outcome = "skipped", "Lock held elsewhere, cycle skipped");
                }
                CycleOutcome::Completed {
                    job_error,
                    release_error,
                } => {
                    match job_error {
                        Some(e) => {
                            error!(lock_key = self.lock_key, outcome = "failed", error = %e, "Cycle failed")
                        }
                        None => debug!(lock_key = self.lock_key, outcome = "ok", "Cycle completed"),
                    }
                    if let Some(e) = release_error {
                        warn!(lock_key = self.lock_key, error = %e, "Advisory lock release failed");
                    }
                }
            }
        }
    }

    /// Try the lock once and, if acquired, run `job` and release
    ///
    /// The release is not bound to `cancel`, so a cancelled job still gives the
    /// lock back.
    pub async fn run_cycle<F, Fut, E>(
        &self,
        cancel: &CancellationToken,
        job: F,
    ) -> Result<CycleOutcome<E>, SchedulerError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        // acquisition is not raced against cancellation: a dropped acquire could
        // leave the lock held on a pooled session
        if cancel.is_cancelled() {
            return Err(SchedulerError::Cancelled);
        }

        let guard = match self
            .lock
            .try_acquire(self.lock_key)
            .await
            .map_err(SchedulerError::LockCheck)?
        {
            Some(guard) => guard,
            None => return Ok(CycleOutcome::Skipped),
        };

        let job_error = job(cancel.clone()).await.err();

        let release_error = self.lock.release(guard).await.err();

        Ok(CycleOutcome::Completed {
            job_error,
            release_error,
        })
    }
}

/// Interval from configured seconds; non-positive values use the default
pub fn interval_from_secs(secs: i64) -> Duration {
    u64::try_from(secs)
        .ok()
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_INTERVAL)
}
