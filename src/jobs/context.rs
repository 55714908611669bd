use crate::app::AppContext;
use crate::error::Result;
use crate::manager::QueueManager;
use crate::traits::{JobId, QueueDriver};
use serde::Serialize;
use std::sync::Arc;

/// Execution context passed to `Job::handle`
///
/// Gives the running job its identity, the shared application context and
/// the queue manager (for dispatching follow-up jobs).
#[derive(Clone)]
pub struct JobContext {
    job_id: JobId,
    class_path: String,
    attempt: u32,
    queue: String,
    driver: Arc<dyn QueueDriver>,
    manager: QueueManager,
}

impl JobContext {
    pub(crate) fn new(
        job_id: JobId,
        class_path: String,
        attempt: u32,
        queue: String,
        driver: Arc<dyn QueueDriver>,
        manager: QueueManager,
    ) -> Self {
        Self {
            job_id,
            class_path,
            attempt,
            queue,
            driver,
            manager,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn class_path(&self) -> &str {
        &self.class_path
    }

    /// 1-based number of the current execution attempt
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Name of the queue the job was claimed from
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn app(&self) -> &Arc<AppContext> {
        self.manager.app()
    }

    pub fn queue_manager(&self) -> &QueueManager {
        &self.manager
    }

    /// Report progress, for drivers that track it
    pub async fn report_progress<T: Serialize>(&self, progress: &T) -> Result<()> {
        let value = serde_json::to_value(progress)?;
        self.driver.report_progress(self.job_id, value).await
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("class_path", &self.class_path)
            .field("attempt", &self.attempt)
            .field("queue", &self.queue)
            .finish()
    }
}
