//! Claimed job handle
//!
//! A `JobHandle` pairs a claimed record with the driver that holds the
//! claim. Terminal operations consume the handle, so a claim obtained
//! through it is closed at most once.

use crate::error::Result;
use crate::traits::{JobId, JobRecord, QueueDriver};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub struct JobHandle {
    record: JobRecord,
    driver: Arc<dyn QueueDriver>,
}

impl JobHandle {
    pub fn new(record: JobRecord, driver: Arc<dyn QueueDriver>) -> Self {
        Self { record, driver }
    }

    /// Claim the next due job from `driver`
    pub async fn next(driver: Arc<dyn QueueDriver>) -> Result<Option<Self>> {
        Ok(driver
            .get_next()
            .await?
            .map(|record| Self::new(record, driver)))
    }

    pub fn id(&self) -> JobId {
        self.record.id
    }

    pub fn record(&self) -> &JobRecord {
        &self.record
    }

    pub fn attempts(&self) -> u32 {
        self.record.attempts
    }

    /// Count an execution attempt and return the new total
    pub fn increment_attempts(&mut self) -> u32 {
        self.record.attempts += 1;
        self.record.attempts
    }

    pub fn driver(&self) -> &Arc<dyn QueueDriver> {
        &self.driver
    }

    pub async fn report_progress<T: Serialize>(&self, progress: &T) -> Result<()> {
        let value = serde_json::to_value(progress)?;
        self.driver.report_progress(self.record.id, value).await
    }

    pub async fn reschedule(self, retry_after: Duration) -> Result<()> {
        self.driver.reschedule(&self.record, retry_after).await
    }

    pub async fn mark_failed(self) -> Result<()> {
        self.driver.mark_failed(&self.record).await
    }

    pub async fn remove(self) -> Result<()> {
        self.driver.remove(self.record.id).await
    }

    pub async fn release(self) -> Result<()> {
        self.driver.release().await
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("record", &self.record)
            .field("driver", &self.driver.kind())
            .finish()
    }
}
