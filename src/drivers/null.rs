//! Driver that discards everything it is given
//!
//! Useful for tests and for environments where background work is disabled.
//! It declares no polling delay, so `QueueManager::start` runs one pass and
//! returns.

use crate::error::{QueueError, Result};
use crate::jobs::JobPayload;
use crate::traits::driver::now;
use crate::traits::{JobId, JobRecord, QueueDriver, StoreOptions};
use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default)]
pub struct NullDriver;

impl NullDriver {
    pub fn new() -> Self {
        Self
    }
}

fn no_claim(id: JobId) -> QueueError {
    QueueError::invariant(format!("null driver holds no claim (job {})", id))
}

#[async_trait]
impl QueueDriver for NullDriver {
    fn kind(&self) -> &'static str {
        "null"
    }

    async fn store(
        &self,
        class_path: &str,
        payload: JobPayload,
        options: StoreOptions,
    ) -> Result<JobRecord> {
        let created_at = now();
        tracing::debug!(class_path = %class_path, "Null driver discarding job");
        Ok(JobRecord {
            id: JobId(0),
            class_path: class_path.to_string(),
            payload,
            created_at,
            available_at: options.available_at.unwrap_or(created_at),
            attempts: 0,
            failed: false,
            progress: None,
        })
    }

    async fn get_next(&self) -> Result<Option<JobRecord>> {
        Ok(None)
    }

    async fn get_job(&self, _id: JobId) -> Result<Option<JobRecord>> {
        Ok(None)
    }

    async fn reschedule(&self, job: &JobRecord, _retry_after: Duration) -> Result<()> {
        Err(no_claim(job.id))
    }

    async fn mark_failed(&self, job: &JobRecord) -> Result<()> {
        Err(no_claim(job.id))
    }

    async fn remove(&self, id: JobId) -> Result<()> {
        Err(no_claim(id))
    }

    async fn release(&self) -> Result<()> {
        Ok(())
    }

    fn polling_delay(&self) -> Option<Duration> {
        None
    }
}
