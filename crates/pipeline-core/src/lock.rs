//! Filesystem lock guaranteeing at most one pipeline run at a time.
//!
//! The lock record is a file whose entire content is an RFC 3339 timestamp.
//! A record younger than the staleness threshold means another run is
//! active. An older (or unreadable) record belongs to a run that was killed
//! and may be reclaimed.
//!
//! The lock is advisory: every participant must go through [`PipelineLock`].

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::error::{PipelineError, Result};

/// Observed state of the lock file.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LockState {
    Free,
    Held {
        since: DateTime<Utc>,
        age_seconds: i64,
    },
    /// Abandoned record. `since` is `None` when the content was not a timestamp.
    Stale {
        since: Option<DateTime<Utc>>,
        age_seconds: Option<i64>,
    },
}

#[derive(Debug, Clone)]
pub struct PipelineLock {
    path: PathBuf,
    stale_after: Duration,
}

impl PipelineLock {
    pub fn new(path: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            path: path.into(),
            stale_after,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Classify the current lock record relative to `now`.
    pub fn inspect(&self, now: DateTime<Utc>) -> Result<LockState> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LockState::Free),
            Err(e) => return Err(e.into()),
        };

        let since = match parse_record(&content) {
            Ok(ts) => ts,
            Err(_) => {
                return Ok(LockState::Stale {
                    since: None,
                    age_seconds: None,
                })
            }
        };

        // Compare absolute age so a record from a skewed clock cannot pin the
        // lock forever.
        let age_ms = now.signed_duration_since(since).num_milliseconds();
        let threshold_ms = i64::try_from(self.stale_after.as_millis()).unwrap_or(i64::MAX);
        if age_ms.unsigned_abs() < threshold_ms.unsigned_abs() {
            Ok(LockState::Held {
                since,
                age_seconds: age_ms / 1000,
            })
        } else {
            Ok(LockState::Stale {
                since: Some(since),
                age_seconds: Some(age_ms / 1000),
            })
        }
    }

    /// Try to take the lock. Returns `false` without touching the record when
    /// another run holds it.
    pub fn try_acquire(&self) -> Result<bool> {
        self.try_acquire_at(Utc::now())
    }

    pub fn try_acquire_at(&self, now: DateTime<Utc>) -> Result<bool> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match self.inspect(now)? {
            LockState::Held { since, age_seconds } => {
                tracing::info!(
                    path = %self.path.display(),
                    since = %since,
                    age_seconds,
                    "pipeline lock held by another run"
                );
                Ok(false)
            }
            LockState::Stale { since, age_seconds } => {
                tracing::warn!(
                    path = %self.path.display(),
                    since = ?since,
                    age_seconds = ?age_seconds,
                    "reclaiming stale pipeline lock"
                );
                crate::io::atomic_write(&self.path, render_record(now).as_bytes())?;
                Ok(true)
            }
            LockState::Free => self.create_fresh(now),
        }
    }

    /// Exclusive create, so two runs racing on a free lock cannot both win.
    fn create_fresh(&self, now: DateTime<Utc>) -> Result<bool> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(mut f) => {
                f.write_all(render_record(now).as_bytes())?;
                tracing::debug!(path = %self.path.display(), "pipeline lock acquired");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                tracing::info!(path = %self.path.display(), "lost race for pipeline lock");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Acquire the lock and return a guard that releases it when dropped,
    /// including during unwinding. `None` means another run holds it.
    pub fn acquire(&self) -> Result<Option<LockGuard<'_>>> {
        if self.try_acquire()? {
            Ok(Some(LockGuard { lock: self }))
        } else {
            Ok(None)
        }
    }

    /// Delete the lock record. Idempotent; failures are logged, never raised.
    /// Returns true if a record was removed.
    pub fn release(&self) -> bool {
        match crate::io::remove_if_exists(&self.path) {
            Ok(removed) => {
                tracing::debug!(path = %self.path.display(), removed, "pipeline lock released");
                removed
            }
            Err(e) => {
                tracing::error!(path = %self.path.display(), error = %e, "failed to release pipeline lock");
                false
            }
        }
    }
}

/// Scoped ownership of the pipeline lock.
#[derive(Debug)]
pub struct LockGuard<'a> {
    lock: &'a PipelineLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

fn render_record(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_record(content: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(content.trim())
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| PipelineError::InvalidLock(e.to_string()))
}
