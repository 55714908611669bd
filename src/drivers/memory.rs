//! In-memory queue driver
//!
//! Jobs live in process memory, ordered by `available_at`. The driver works
//! in two modes that share one in-flight slot:
//!
//! - pull: the manager claims jobs through `get_next` like any other driver
//! - push: `process()` registers a processor callback and a background poller
//!   hands it due jobs one at a time
//!
//! Suitable for development, tests and single-instance deployments. Nothing
//! survives a restart.

use crate::config::MemoryDriverConfig;
use crate::error::{QueueError, Result};
use crate::jobs::JobPayload;
use crate::traits::driver::{failed_attempts, now, now_plus, rescheduled_attempts};
use crate::traits::{JobId, JobRecord, QueueDriver, StoreOptions};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

/// Class path given to jobs added with `MemoryDriver::add`
pub const ANONYMOUS_CLASS_PATH: &str = "anonymous";

/// Callback invoked by the poller for each due job
pub type Processor = Arc<dyn Fn(MemoryJob) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct Claim {
    job_id: JobId,
    attempts: u32,
    /// Held by the push-mode poller rather than a `get_next` caller
    pushed: bool,
}

enum Poll {
    Claimed(JobRecord),
    Busy,
    Until(NaiveDateTime),
    Idle,
}

#[derive(Default)]
struct State {
    /// Queued, in-flight and failed jobs
    jobs: HashMap<JobId, JobRecord>,
    /// Queued jobs ordered by `(available_at, id)`
    due: BTreeSet<(NaiveDateTime, JobId)>,
    claim: Option<Claim>,
    /// Bounded history of jobs completed by the processor (oldest removed when full)
    completed: VecDeque<JobRecord>,
}

impl State {
    fn enqueue(&mut self, record: JobRecord) {
        self.due.insert((record.available_at, record.id));
        self.jobs.insert(record.id, record);
    }

    fn poll(&mut self, now: NaiveDateTime, pushed: bool) -> Poll {
        if self.claim.is_some() {
            return Poll::Busy;
        }

        while let Some(&(available_at, id)) = self.due.first() {
            if available_at > now {
                return Poll::Until(available_at);
            }
            self.due.remove(&(available_at, id));

            if let Some(record) = self.jobs.get(&id) {
                self.claim = Some(Claim {
                    job_id: id,
                    attempts: record.attempts,
                    pushed,
                });
                return Poll::Claimed(record.clone());
            }
        }

        Poll::Idle
    }

    /// Close the pull-mode claim on `id`
    fn take_claim(&mut self, id: JobId) -> Result<Claim> {
        match self.claim {
            Some(claim) if claim.job_id == id && !claim.pushed => {
                self.claim = None;
                Ok(claim)
            }
            Some(claim) if claim.job_id == id => Err(QueueError::invariant(format!(
                "job {} is held by the processor",
                id
            ))),
            Some(claim) => Err(QueueError::invariant(format!(
                "job {} is not claimed (open claim is job {})",
                id, claim.job_id
            ))),
            None => Err(QueueError::invariant(format!("no open claim for job {}", id))),
        }
    }

    fn push_to_bounded_history(&mut self, record: JobRecord, max_size: usize) {
        if max_size == 0 {
            return;
        }
        if self.completed.len() >= max_size {
            self.completed.pop_front();
        }
        self.completed.push_back(record);
    }
}

struct Inner {
    config: MemoryDriverConfig,
    next_id: AtomicI64,
    state: Mutex<State>,
    processor: Mutex<Option<Processor>>,
    poller: Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// Bumped by `close()`; a poller exits once it sees a newer epoch
    epoch: AtomicU64,
    wake: Arc<Notify>,
}

impl Inner {
    async fn set_progress(&self, id: JobId, progress: serde_json::Value) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.claim {
            Some(claim) if claim.job_id == id => {}
            _ => {
                return Err(QueueError::invariant(format!(
                    "cannot report progress for job {}: it is not running",
                    id
                )));
            }
        }
        if let Some(record) = state.jobs.get_mut(&id) {
            record.progress = Some(progress);
        }
        Ok(())
    }
}

/// A job handed to the processor callback
pub struct MemoryJob {
    record: JobRecord,
    inner: Arc<Inner>,
}

impl MemoryJob {
    pub fn id(&self) -> JobId {
        self.record.id
    }

    pub fn record(&self) -> &JobRecord {
        &self.record
    }

    /// Decode the data passed to `add`
    pub fn data<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(self.record.payload.decode_dispatch::<T>()?.data)
    }

    /// Publish progress; visible through `get_job` while the job runs and after it completes
    pub async fn report_progress<T: Serialize>(&self, progress: &T) -> Result<()> {
        let value = serde_json::to_value(progress)?;
        self.inner.set_progress(self.record.id, value).await
    }
}

impl std::fmt::Debug for MemoryJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryJob").field("record", &self.record).finish()
    }
}

/// In-memory queue driver
///
/// # Shutdown
///
/// `close()` stops the poller and keeps queued jobs. The next `add()` or
/// `process()` starts it again.
#[derive(Clone)]
pub struct MemoryDriver {
    inner: Arc<Inner>,
}

impl MemoryDriver {
    pub fn new(config: MemoryDriverConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                next_id: AtomicI64::new(1),
                state: Mutex::new(State::default()),
                processor: Mutex::new(None),
                poller: Mutex::new(None),
                epoch: AtomicU64::new(0),
                wake: Arc::new(Notify::new()),
            }),
        }
    }

    /// Queue `data` for immediate processing
    pub async fn add<T: Serialize>(&self, data: &T) -> Result<JobRecord> {
        self.add_with(data, StoreOptions::default()).await
    }

    /// Queue `data` to be processed no earlier than `at`
    pub async fn add_delayed<T: Serialize>(&self, data: &T, at: DateTime<Utc>) -> Result<JobRecord> {
        self.add_with(data, StoreOptions::available_at(at)).await
    }

    async fn add_with<T: Serialize>(&self, data: &T, options: StoreOptions) -> Result<JobRecord> {
        let payload = JobPayload::dispatch(ANONYMOUS_CLASS_PATH, data)?;
        let record = self.store(ANONYMOUS_CLASS_PATH, payload, options).await?;
        self.ensure_polling().await;
        Ok(record)
    }

    /// Register the processor and start polling
    ///
    /// A processor error or panic re-queues the job with one more attempt,
    /// due after the polling delay.
    pub async fn process<F, Fut>(&self, processor: F)
    where
        F: Fn(MemoryJob) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let processor: Processor = Arc::new(move |job| processor(job).boxed());
        *self.inner.processor.lock().await = Some(processor);
        self.ensure_polling().await;
    }

    /// Number of queued jobs (due or delayed)
    pub async fn pending(&self) -> usize {
        self.inner.state.lock().await.due.len()
    }

    async fn ensure_polling(&self) {
        if self.inner.processor.lock().await.is_none() {
            return;
        }

        let mut poller = self.inner.poller.lock().await;
        if poller.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let epoch = self.inner.epoch.load(Ordering::Acquire);
        let inner = Arc::downgrade(&self.inner);
        *poller = Some(tokio::spawn(run_poller(inner, epoch)));
        tracing::debug!(epoch, "In-memory queue poller started");
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new(MemoryDriverConfig::default())
    }
}

/// Background loop feeding the processor
///
/// Holds only a weak reference while idle, so dropping every driver handle
/// ends the loop.
async fn run_poller(weak: Weak<Inner>, epoch: u64) {
    loop {
        let Some(inner) = weak.upgrade() else {
            break;
        };

        let Some(processor) = inner.processor.lock().await.clone() else {
            break;
        };

        let polled = {
            let mut state = inner.state.lock().await;
            if inner.epoch.load(Ordering::Acquire) != epoch {
                break;
            }
            state.poll(now(), true)
        };

        let wait = match polled {
            Poll::Claimed(record) => {
                run_one(&inner, processor, record).await;
                continue;
            }
            Poll::Until(at) => (at - now()).to_std().unwrap_or(Duration::ZERO),
            Poll::Busy | Poll::Idle => inner.config.polling_delay(),
        };

        let wake = inner.wake.clone();
        drop(inner);
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = wake.notified() => {}
        }
    }

    tracing::debug!(epoch, "In-memory queue poller stopped");
}

async fn run_one(inner: &Arc<Inner>, processor: Processor, record: JobRecord) {
    let id = record.id;
    let job = MemoryJob {
        record,
        inner: inner.clone(),
    };

    tracing::debug!(job_id = %id, "Processing in-memory job");
    // the callback itself runs inside the task so a panic before it yields a future is caught
    let outcome = match tokio::spawn(async move { processor(job).await }).await {
        Ok(result) => result,
        Err(join_err) => Err(QueueError::job(format!("processor panicked: {}", join_err))),
    };

    let mut state = inner.state.lock().await;
    let claim = state.claim.take();

    match outcome {
        Ok(()) => {
            if let Some(record) = state.jobs.remove(&id) {
                state.push_to_bounded_history(record, inner.config.max_history_size);
            }
            tracing::debug!(job_id = %id, "In-memory job completed");
        }
        Err(e) => {
            let attempts = claim.map(|c| c.attempts + 1).unwrap_or(1);
            let retry_at = now_plus(inner.config.polling_delay()).unwrap_or_else(|_| now());
            if let Some(mut record) = state.jobs.remove(&id) {
                record.attempts = record.attempts.max(attempts);
                record.available_at = retry_at;
                state.enqueue(record);
            }
            tracing::error!(job_id = %id, attempts, error = %e, "In-memory job failed, re-queued");
        }
    }
}

#[async_trait]
impl QueueDriver for MemoryDriver {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn store(
        &self,
        class_path: &str,
        payload: JobPayload,
        options: StoreOptions,
    ) -> Result<JobRecord> {
        let created_at = now();
        let record = JobRecord {
            id: JobId(self.inner.next_id.fetch_add(1, Ordering::Relaxed)),
            class_path: class_path.to_string(),
            payload,
            created_at,
            available_at: options.available_at.unwrap_or(created_at),
            attempts: 0,
            failed: false,
            progress: None,
        };

        self.inner.state.lock().await.enqueue(record.clone());
        self.inner.wake.notify_one();
        Ok(record)
    }

    async fn get_next(&self) -> Result<Option<JobRecord>> {
        let mut state = self.inner.state.lock().await;
        match state.poll(now(), false) {
            Poll::Claimed(record) => Ok(Some(record)),
            Poll::Busy | Poll::Until(_) | Poll::Idle => Ok(None),
        }
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>> {
        let state = self.inner.state.lock().await;
        if let Some(record) = state.jobs.get(&id) {
            return Ok(Some(record.clone()));
        }
        Ok(state.completed.iter().rev().find(|r| r.id == id).cloned())
    }

    async fn reschedule(&self, job: &JobRecord, retry_after: Duration) -> Result<()> {
        let available_at = now_plus(retry_after)?;
        let mut state = self.inner.state.lock().await;
        let claim = state.take_claim(job.id)?;

        if let Some(mut record) = state.jobs.remove(&job.id) {
            record.attempts = rescheduled_attempts(job, claim.attempts);
            record.available_at = available_at;
            state.enqueue(record);
        }
        drop(state);

        self.inner.wake.notify_one();
        Ok(())
    }

    async fn mark_failed(&self, job: &JobRecord) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let claim = state.take_claim(job.id)?;

        if let Some(record) = state.jobs.get_mut(&job.id) {
            record.attempts = failed_attempts(job, claim.attempts);
            record.failed = true;
        }
        Ok(())
    }

    async fn remove(&self, id: JobId) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        state.take_claim(id)?;
        state.jobs.remove(&id);
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let Some(claim) = state.claim else {
            return Ok(());
        };
        if claim.pushed {
            return Ok(());
        }

        state.claim = None;
        if let Some(record) = state.jobs.remove(&claim.job_id) {
            state.enqueue(record);
        }
        drop(state);

        self.inner.wake.notify_one();
        Ok(())
    }

    fn polling_delay(&self) -> Option<Duration> {
        Some(self.inner.config.polling_delay())
    }

    async fn report_progress(&self, id: JobId, progress: serde_json::Value) -> Result<()> {
        self.inner.set_progress(id, progress).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.epoch.fetch_add(1, Ordering::AcqRel);
        self.inner.wake.notify_one();

        let handle = self.inner.poller.lock().await.take();
        if let Some(handle) = handle {
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(_) => tracing::debug!("In-memory queue poller stopped cleanly"),
                Err(_) => tracing::warn!("In-memory queue poller did not stop within timeout"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    fn fast_driver() -> MemoryDriver {
        MemoryDriver::new(MemoryDriverConfig {
            polling_delay_ms: 20,
            max_history_size: 2,
        })
    }

    async fn store(driver: &MemoryDriver, class_path: &str) -> JobRecord {
        driver
            .store(class_path, JobPayload::encode(&json!({})).unwrap(), StoreOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_get_next_serves_oldest_due_first() {
        let driver = fast_driver();
        let later = driver
            .store(
                "later",
                JobPayload::encode(&json!({})).unwrap(),
                StoreOptions::available_at(Utc::now() + chrono::Duration::seconds(60)),
            )
            .await
            .unwrap();
        let first = store(&driver, "first").await;
        let second = store(&driver, "second").await;

        let claimed = driver.get_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        driver.remove(claimed.id).await.unwrap();

        let claimed = driver.get_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, second.id);
        driver.remove(claimed.id).await.unwrap();

        assert!(driver.get_next().await.unwrap().is_none());
        assert!(driver.get_job(later.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_single_in_flight_claim() {
        let driver = fast_driver();
        store(&driver, "a").await;
        store(&driver, "b").await;

        let claimed = driver.get_next().await.unwrap().unwrap();
        assert!(driver.get_next().await.unwrap().is_none());

        driver.release().await.unwrap();
        let again = driver.get_next().await.unwrap().unwrap();
        assert_eq!(again.id, claimed.id);
        driver.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_mutation_without_claim_is_invariant_error() {
        let driver = fast_driver();
        let job = store(&driver, "a").await;

        assert!(driver.remove(job.id).await.unwrap_err().is_invariant());
        assert!(driver.mark_failed(&job).await.unwrap_err().is_invariant());
        assert!(
            driver
                .reschedule(&job, Duration::from_secs(1))
                .await
                .unwrap_err()
                .is_invariant()
        );

        // release without a claim is a no-op
        driver.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_reschedule_and_mark_failed() {
        let driver = fast_driver();
        let job = store(&driver, "a").await;

        let claimed = driver.get_next().await.unwrap().unwrap();
        driver.reschedule(&claimed, Duration::from_secs(60)).await.unwrap();

        let stored = driver.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 1);
        assert!(stored.available_at > now());
        assert!(driver.get_next().await.unwrap().is_none());

        let job = store(&driver, "b").await;
        let mut claimed = driver.get_next().await.unwrap().unwrap();
        claimed.attempts = 1;
        driver.mark_failed(&claimed).await.unwrap();

        let stored = driver.get_job(job.id).await.unwrap().unwrap();
        assert!(stored.failed);
        assert_eq!(stored.attempts, 1);
        assert!(driver.get_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_processor_receives_added_job() {
        let driver = fast_driver();
        let seen = Arc::new(AtomicBool::new(false));

        driver.add(&json!({ "to": "a@example.com" })).await.unwrap();
        let flag = seen.clone();
        driver
            .process(move |job| {
                let flag = flag.clone();
                async move {
                    let data: serde_json::Value = job.data()?;
                    assert_eq!(data["to"], "a@example.com");
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(seen.load(Ordering::SeqCst));
        assert_eq!(driver.pending().await, 0);
        driver.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_processor_error_requeues_with_attempt() {
        let driver = fast_driver();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        driver
            .process(move |_job| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Err(QueueError::job("first run fails"));
                    }
                    Ok(())
                }
            })
            .await;
        let job = driver.add(&json!({})).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let done = driver.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.attempts, 1);
        driver.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_processor_panic_does_not_stop_poller() {
        let driver = fast_driver();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        driver
            .process(move |_job| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        panic!("processor bug");
                    }
                    Ok(())
                }
            })
            .await;
        driver.add(&json!({})).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(driver.pending().await, 0);
        driver.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_processor_panic_before_future_does_not_stop_poller() {
        let driver = fast_driver();
        let completed = Arc::new(AtomicUsize::new(0));

        let counter = completed.clone();
        driver
            .process(move |job| {
                let counter = counter.clone();
                let _value: u32 = job.data().unwrap();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        let bad = driver.add(&"not a number").await.unwrap();
        driver.add(&2u32).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(completed.load(Ordering::SeqCst), 1);

        // the bad job is re-queued with a counted attempt
        let requeued = driver.get_job(bad.id).await.unwrap().unwrap();
        assert!(requeued.attempts >= 1);
        assert!(!requeued.failed);

        driver.add(&3u32).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(completed.load(Ordering::SeqCst), 2);
        driver.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_completed_history_is_bounded() {
        let driver = fast_driver();
        driver.process(|_job| async { Ok(()) }).await;

        let first = driver.add(&json!(1)).await.unwrap();
        let second = driver.add(&json!(2)).await.unwrap();
        let third = driver.add(&json!(3)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(driver.get_job(first.id).await.unwrap().is_none());
        assert!(driver.get_job(second.id).await.unwrap().is_some());
        assert!(driver.get_job(third.id).await.unwrap().is_some());
        driver.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_progress_requires_running_job() {
        let driver = fast_driver();
        let job = store(&driver, "a").await;

        let err = driver.report_progress(job.id, json!(10)).await.unwrap_err();
        assert!(err.is_invariant());

        driver.get_next().await.unwrap();
        driver.report_progress(job.id, json!(10)).await.unwrap();
        let stored = driver.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.progress, Some(json!(10)));
        driver.release().await.unwrap();
    }
}
