//! Deferred job dispatch
//!
//! `dispatch` only captures the job. Nothing is stored until `send()` is
//! awaited, so a builder that is dropped stores nothing.

use crate::error::{QueueError, Result};
use crate::jobs::JobPayload;
use crate::manager::QueueManager;
use crate::traits::{Job, JobRecord, StoreOptions};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Builder for a pending dispatch
#[must_use = "dispatch does nothing until you call send()"]
pub struct Dispatcher<'a, J: Job> {
    manager: &'a QueueManager,
    job: J,
    queue: Option<String>,
    available_at: Option<DateTime<Utc>>,
    delay: Option<Duration>,
}

impl<'a, J: Job> Dispatcher<'a, J> {
    pub(crate) fn new(manager: &'a QueueManager, job: J) -> Self {
        Self {
            manager,
            job,
            queue: None,
            available_at: None,
            delay: None,
        }
    }

    /// Run no earlier than `at`
    pub fn delay(mut self, at: DateTime<Utc>) -> Self {
        self.available_at = Some(at);
        self.delay = None;
        self
    }

    /// Run no earlier than `delay` after `send()`
    pub fn delay_for(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self.available_at = None;
        self
    }

    /// Store on a named queue instead of the default one
    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Serialize the job and store it
    pub async fn send(self) -> Result<JobRecord> {
        let class_path = J::CLASS_PATH.trim();
        if class_path.is_empty() {
            return Err(QueueError::MissingClassPath(
                std::any::type_name::<J>().to_string(),
            ));
        }

        let available_at = match (self.available_at, self.delay) {
            (Some(at), _) => Some(at.naive_utc()),
            (None, Some(delay)) => Some(crate::traits::driver::now_plus(delay)?),
            (None, None) => None,
        };

        let payload = JobPayload::dispatch(class_path, &self.job)?;
        let record = self
            .manager
            .store_on(
                self.queue.as_deref(),
                class_path,
                payload,
                StoreOptions { available_at },
            )
            .await?;

        tracing::debug!(
            job_id = %record.id,
            class_path = %class_path,
            available_at = %record.available_at,
            "Job dispatched"
        );
        Ok(record)
    }
}

/// Adds `job.dispatch(&manager)` to every job type
pub trait JobExt: Job + Sized {
    fn dispatch(self, manager: &QueueManager) -> Dispatcher<'_, Self> {
        Dispatcher::new(manager, self)
    }
}

impl<J: Job> JobExt for J {}
