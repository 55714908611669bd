//! Queue driver contract
//!
//! Every backing store (SQL table, in-process queue, Redis, ...) implements
//! [`QueueDriver`]. The manager only talks to drivers through this trait.

use crate::error::{QueueError, Result};
use crate::jobs::JobPayload;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Opaque job identifier assigned by the driver on store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Persisted form of a job
///
/// Timestamps are naive UTC; they are stored and compared without an offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    /// Key the job implementation is registered under
    pub class_path: String,
    /// Serialized dispatch payload
    pub payload: JobPayload,
    pub created_at: NaiveDateTime,
    pub available_at: NaiveDateTime,
    /// Execution attempts so far; only ever increases
    pub attempts: u32,
    /// Once set, the job is never handed out again
    pub failed: bool,
    /// Last reported progress, for drivers that track it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<serde_json::Value>,
}

impl JobRecord {
    /// A job is due once `available_at` has passed and it has not failed
    pub fn is_due(&self, now: NaiveDateTime) -> bool {
        !self.failed && self.available_at <= now
    }
}

/// Options accepted by `QueueDriver::store`
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// Earliest execution time; `None` means now
    pub available_at: Option<NaiveDateTime>,
}

impl StoreOptions {
    pub fn available_at(at: DateTime<Utc>) -> Self {
        Self {
            available_at: Some(at.naive_utc()),
        }
    }
}

/// Current time as stored by drivers
pub fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

/// `now() + delay`, failing on out-of-range delays
pub fn now_plus(delay: Duration) -> Result<NaiveDateTime> {
    let delta = chrono::Duration::from_std(delay)
        .map_err(|e| QueueError::config(format!("Delay out of range: {}", e)))?;
    now()
        .checked_add_signed(delta)
        .ok_or_else(|| QueueError::config("Delay out of range"))
}

/// Backing-store contract for job storage and retrieval
///
/// A driver instance holds at most one open claim at a time. `get_next`
/// opens it; `reschedule`, `mark_failed`, `remove` and `release` close it.
/// Mutating without an open claim is an invariant violation and returns
/// `QueueError::Invariant`.
#[async_trait]
#[allow(async_fn_in_trait)] // async_trait macro handles Send/Sync bounds
pub trait QueueDriver: Send + Sync {
    /// Driver kind, for logging
    fn kind(&self) -> &'static str;

    /// Persist a job; `available_at` defaults to now
    async fn store(
        &self,
        class_path: &str,
        payload: JobPayload,
        options: StoreOptions,
    ) -> Result<JobRecord>;

    /// Claim the oldest due, non-failed job
    ///
    /// Concurrent callers never receive the same record while a claim on it
    /// is open.
    async fn get_next(&self) -> Result<Option<JobRecord>>;

    /// Point lookup without claim semantics
    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>>;

    /// Count the attempt, push `available_at` to `now + retry_after` and release the claim
    async fn reschedule(&self, job: &JobRecord, retry_after: Duration) -> Result<()>;

    /// Set `failed`, persist attempts and release the claim
    async fn mark_failed(&self, job: &JobRecord) -> Result<()>;

    /// Delete the claimed job outright and release the claim
    async fn remove(&self, id: JobId) -> Result<()>;

    /// Release an open claim without mutation; no-op when nothing is claimed
    async fn release(&self) -> Result<()>;

    /// Interval between polls; `None` for push-based drivers
    fn polling_delay(&self) -> Option<Duration>;

    /// Record progress for a claimed job
    async fn report_progress(&self, id: JobId, _progress: serde_json::Value) -> Result<()> {
        Err(QueueError::unsupported(format!(
            "{} driver does not track progress (job {})",
            self.kind(),
            id
        )))
    }

    /// Stop background activity; queued jobs are kept
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Attempts persisted by `reschedule`: one more than at claim time, never lower than the caller's count
pub(crate) fn rescheduled_attempts(job: &JobRecord, attempts_at_claim: u32) -> u32 {
    job.attempts.max(attempts_at_claim + 1)
}

/// Attempts persisted by `mark_failed`: the caller's count, never lower than at claim time
pub(crate) fn failed_attempts(job: &JobRecord, attempts_at_claim: u32) -> u32 {
    job.attempts.max(attempts_at_claim)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(attempts: u32) -> JobRecord {
        let now = now();
        JobRecord {
            id: JobId(1),
            class_path: "test".to_string(),
            payload: JobPayload::from_raw("{}"),
            created_at: now,
            available_at: now,
            attempts,
            failed: false,
            progress: None,
        }
    }

    #[test]
    fn test_is_due() {
        let mut job = record(0);
        assert!(job.is_due(now()));

        job.available_at = now_plus(Duration::from_secs(60)).unwrap();
        assert!(!job.is_due(now()));

        job.available_at = now();
        job.failed = true;
        assert!(!job.is_due(now()));
    }

    #[test]
    fn test_rescheduled_attempts_counts_once() {
        // called directly on a fresh claim
        assert_eq!(rescheduled_attempts(&record(0), 0), 1);
        // manager already counted the attempt
        assert_eq!(rescheduled_attempts(&record(1), 0), 1);
        assert_eq!(rescheduled_attempts(&record(3), 2), 3);
    }

    #[test]
    fn test_failed_attempts_never_decrease() {
        assert_eq!(failed_attempts(&record(0), 2), 2);
        assert_eq!(failed_attempts(&record(3), 2), 3);
    }

    #[test]
    fn test_now_plus() {
        let before = now();
        let later = now_plus(Duration::from_secs(2)).unwrap();
        assert!(later >= before + chrono::Duration::seconds(2));
    }
}
