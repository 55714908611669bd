//! Queue manager
//!
//! Resolves queue names to driver instances (created lazily, one per name,
//! cached for the manager's lifetime) and runs the execution state machine:
//!
//! ```text
//! get_next ─┬─ none ─────────────────────────────────────────▶ Empty
//!           └─ claimed ─▶ resolve + decode ─┬─ error ─▶ mark_failed ─▶ Failed
//!                                           └─ handle ─┬─ ok ─▶ remove ─▶ Completed
//!                                                      └─ err ─┬─ budget left ─▶ reschedule ─▶ Rescheduled
//!                                                              └─ exhausted ───▶ mark_failed ─▶ Failed
//! ```

use crate::app::AppContext;
use crate::config::QueueConfig;
use crate::drivers::DriverRegistry;
use crate::error::{QueueError, Result};
use crate::jobs::{Dispatcher, ErasedJob, JobContext, JobHandle, JobPayload, JobRegistry, RetryPolicy};
use crate::traits::{Job, JobId, JobRecord, QueueDriver, StoreOptions};
use dashmap::DashMap;
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Result of one `QueueManager::execute` pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteOutcome {
    /// No job was due
    Empty,
    /// The handler succeeded and the job was removed
    Completed(JobId),
    /// The handler failed and the job will run again
    Rescheduled(JobId),
    /// The job was marked failed and stays in storage for inspection
    Failed(JobId),
}

impl ExecuteOutcome {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::Empty => None,
            Self::Completed(id) | Self::Rescheduled(id) | Self::Failed(id) => Some(*id),
        }
    }
}

struct ManagerInner {
    config: QueueConfig,
    drivers: Arc<DriverRegistry>,
    jobs: JobRegistry,
    app: Arc<AppContext>,
    cache: DashMap<String, Arc<dyn QueueDriver>>,
}

/// Entry point for storing and executing jobs
///
/// Cheap to clone; clones share the driver cache.
///
/// ```rust,ignore
/// let manager = QueueManager::new(
///     QueueConfig::from_env(),
///     Arc::new(DriverRegistry::with_builtin_drivers()),
///     jobs,
///     Arc::new(app),
/// );
///
/// SendWelcomeEmail { user_id: 42 }.dispatch(&manager).send().await?;
/// manager.start(None).await?;
/// ```
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<ManagerInner>,
}

impl QueueManager {
    pub fn new(
        config: QueueConfig,
        drivers: Arc<DriverRegistry>,
        jobs: JobRegistry,
        app: Arc<AppContext>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                drivers,
                jobs,
                app,
                cache: DashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.inner.jobs
    }

    pub fn app(&self) -> &Arc<AppContext> {
        &self.inner.app
    }

    fn queue_name<'a>(&'a self, queue: Option<&'a str>) -> &'a str {
        queue.unwrap_or(&self.inner.config.default)
    }

    /// Resolve a queue name (default queue when `None`) to its driver
    pub fn use_queue(&self, queue: Option<&str>) -> Result<Arc<dyn QueueDriver>> {
        let name = self.queue_name(queue);
        if let Some(driver) = self.inner.cache.get(name) {
            return Ok(driver.value().clone());
        }

        let mapping = self.inner.config.mapping(name)?;
        let driver = self
            .inner
            .cache
            .entry(name.to_string())
            .or_try_insert_with(|| {
                tracing::debug!(queue = %name, driver = %mapping.driver, "Creating queue driver");
                self.inner
                    .drivers
                    .create(&mapping.driver, &mapping.config, &self.inner.app)
            })?;
        Ok(driver.value().clone())
    }

    /// Run a queue
    ///
    /// Drivers with a polling delay loop forever: execute, then sleep. A
    /// failing iteration is logged and the loop carries on. Drivers without
    /// one get a single pass. Configuration errors are returned before the
    /// loop starts.
    pub async fn start(&self, queue: Option<&str>) -> Result<()> {
        let name = self.queue_name(queue).to_string();
        let driver = self.use_queue(Some(&name))?;

        let Some(delay) = driver.polling_delay() else {
            if let Err(e) = self.execute(Some(&name)).await {
                tracing::error!(queue = %name, error = %e, "Queue execution failed");
            }
            return Ok(());
        };

        tracing::info!(
            queue = %name,
            driver = driver.kind(),
            polling_delay = ?delay,
            "Queue started"
        );

        loop {
            if let Err(e) = self.execute(Some(&name)).await {
                tracing::error!(queue = %name, error = %e, "Queue execution failed");
            }
            tokio::time::sleep(delay).await;
        }
    }

    /// Claim and run the next due job on a queue
    ///
    /// Handler errors and panics are absorbed into the outcome. Storage,
    /// configuration and invariant errors are returned.
    pub async fn execute(&self, queue: Option<&str>) -> Result<ExecuteOutcome> {
        let name = self.queue_name(queue).to_string();
        let driver = self.use_queue(Some(&name))?;

        let Some(mut handle) = JobHandle::next(driver.clone()).await? else {
            tracing::debug!(queue = %name, "No jobs in queue");
            return Ok(ExecuteOutcome::Empty);
        };

        let id = handle.id();
        let class_path = handle.record().class_path.clone();
        tracing::debug!(
            job_id = %id,
            class_path = %class_path,
            queue = %name,
            attempts = handle.attempts(),
            "Execution started"
        );

        let (policy, job) = match self.instantiate(handle.record()).await {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::error!(
                    job_id = %id,
                    class_path = %class_path,
                    error = %e,
                    "Job cannot be instantiated, marking failed"
                );
                handle.mark_failed().await?;
                return Ok(ExecuteOutcome::Failed(id));
            }
        };

        let attempt = handle.increment_attempts();
        let ctx = JobContext::new(
            id,
            class_path.clone(),
            attempt,
            name.clone(),
            driver,
            self.clone(),
        );

        let result = match AssertUnwindSafe(job.run(&ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(QueueError::job(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };

        match result {
            Ok(()) => {
                handle.remove().await?;
                tracing::debug!(job_id = %id, class_path = %class_path, "Executed successfully");
                Ok(ExecuteOutcome::Completed(id))
            }
            Err(e) => {
                tracing::error!(
                    job_id = %id,
                    class_path = %class_path,
                    attempts = attempt,
                    error = %e,
                    "Job execution failed"
                );

                if policy.is_exhausted(attempt) {
                    tracing::error!(
                        job_id = %id,
                        class_path = %class_path,
                        retries = policy.retries,
                        "Job failed for last time after {} retries",
                        policy.retries
                    );
                    handle.mark_failed().await?;
                    return Ok(ExecuteOutcome::Failed(id));
                }

                handle.reschedule(policy.retry_after).await?;
                Ok(ExecuteOutcome::Rescheduled(id))
            }
        }
    }

    async fn instantiate(
        &self,
        record: &JobRecord,
    ) -> Result<(RetryPolicy, Box<dyn ErasedJob>)> {
        let registered = self.inner.jobs.resolve(&record.class_path).await?;
        let job = registered.instantiate(&record.payload)?;
        Ok((registered.policy(), job))
    }

    /// Store a serialized job on the default queue
    pub async fn store(
        &self,
        class_path: &str,
        payload: JobPayload,
        options: StoreOptions,
    ) -> Result<JobRecord> {
        self.store_on(None, class_path, payload, options).await
    }

    /// Store a serialized job on a named queue
    pub async fn store_on(
        &self,
        queue: Option<&str>,
        class_path: &str,
        payload: JobPayload,
        options: StoreOptions,
    ) -> Result<JobRecord> {
        self.use_queue(queue)?
            .store(class_path, payload, options)
            .await
    }

    /// Start building a dispatch for `job`
    pub fn dispatch<J: Job>(&self, job: J) -> Dispatcher<'_, J> {
        Dispatcher::new(self, job)
    }

    /// Close every driver created so far
    ///
    /// All drivers are closed even if one fails; the first error is returned.
    pub async fn close_all(&self) -> Result<()> {
        let drivers: Vec<(String, Arc<dyn QueueDriver>)> = self
            .inner
            .cache
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut first_error = None;
        for (name, driver) in drivers {
            if let Err(e) = driver.close().await {
                tracing::error!(queue = %name, error = %e, "Failed to close queue driver");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueManager")
            .field("default", &self.inner.config.default)
            .field("queues", &self.inner.config.queues.keys().collect::<Vec<_>>())
            .field("drivers", &self.inner.drivers.driver_names())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}
