//! Job registry for mapping class paths to job types
//!
//! Workers cannot load code by path, so every job type is registered under
//! its `Job::CLASS_PATH` before the run loop starts. The registry rebuilds
//! the job from its stored payload and carries the type's retry policy.

use crate::error::{QueueError, Result};
use crate::jobs::{JobContext, JobPayload};
use crate::traits::Job;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Retry policy declared by a job type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after which a failing job is marked failed
    pub retries: u32,
    /// Delay before a failed job becomes due again
    pub retry_after: Duration,
}

impl RetryPolicy {
    pub fn of<J: Job>() -> Self {
        Self {
            retries: J::RETRIES,
            retry_after: J::RETRY_AFTER,
        }
    }

    /// True when a job that has used `attempts` executions should not run again
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.retries
    }
}

/// Object-safe view of a deserialized job
#[async_trait]
pub(crate) trait ErasedJob: Send + Sync + Debug {
    async fn run(&self, ctx: &JobContext) -> Result<()>;
}

#[async_trait]
impl<J: Job> ErasedJob for J {
    async fn run(&self, ctx: &JobContext) -> Result<()> {
        <J as Job>::handle(self, ctx).await
    }
}

type JobFactory = Arc<dyn Fn(&JobPayload) -> Result<Box<dyn ErasedJob>> + Send + Sync>;

/// A registered job type
#[derive(Clone)]
pub(crate) struct RegisteredJob {
    policy: RetryPolicy,
    factory: JobFactory,
}

impl RegisteredJob {
    pub(crate) fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Rebuild the job from its dispatch payload
    pub(crate) fn instantiate(&self, payload: &JobPayload) -> Result<Box<dyn ErasedJob>> {
        (self.factory)(payload)
    }
}

/// Registry for mapping class paths to job types
///
/// The registry is thread-safe and can be shared across workers.
#[derive(Clone)]
pub struct JobRegistry {
    jobs: Arc<tokio::sync::RwLock<HashMap<String, RegisteredJob>>>,
}

impl JobRegistry {
    /// Create a new empty job registry
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
        }
    }

    /// Register a job type under its `CLASS_PATH`
    ///
    /// Re-registering a class path replaces the previous entry.
    ///
    /// ```rust,ignore
    /// registry.register::<SendWelcomeEmail>().await?;
    /// ```
    pub async fn register<J: Job>(&self) -> Result<()> {
        let class_path = J::CLASS_PATH.trim();
        if class_path.is_empty() {
            return Err(QueueError::MissingClassPath(
                std::any::type_name::<J>().to_string(),
            ));
        }

        let factory: JobFactory = Arc::new(|payload: &JobPayload| -> Result<Box<dyn ErasedJob>> {
            let dispatched = payload.decode_dispatch::<J>()?;
            Ok(Box::new(dispatched.data) as Box<dyn ErasedJob>)
        });

        let entry = RegisteredJob {
            policy: RetryPolicy::of::<J>(),
            factory,
        };

        let mut jobs = self.jobs.write().await;
        if jobs.insert(class_path.to_string(), entry).is_some() {
            tracing::warn!(class_path = %class_path, "Job class path registered twice, replacing");
        }
        Ok(())
    }

    /// Look up a registered job type
    pub(crate) async fn resolve(&self, class_path: &str) -> Result<RegisteredJob> {
        let jobs = self.jobs.read().await;
        jobs.get(class_path)
            .cloned()
            .ok_or_else(|| QueueError::UnknownJob(class_path.to_string()))
    }

    /// Check if a class path is registered
    pub async fn is_registered(&self, class_path: &str) -> bool {
        let jobs = self.jobs.read().await;
        jobs.contains_key(class_path)
    }

    /// Retry policy of a registered job type
    pub async fn retry_policy(&self, class_path: &str) -> Option<RetryPolicy> {
        let jobs = self.jobs.read().await;
        jobs.get(class_path).map(RegisteredJob::policy)
    }

    /// Get all registered class paths
    pub async fn registered_types(&self) -> Vec<String> {
        let jobs = self.jobs.read().await;
        jobs.keys().cloned().collect()
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct ResizeImage {
        path: String,
        width: u32,
    }

    #[async_trait]
    impl Job for ResizeImage {
        const CLASS_PATH: &'static str = "media/resize_image";
        const RETRIES: u32 = 3;
        const RETRY_AFTER: Duration = Duration::from_secs(30);

        async fn handle(&self, _ctx: &JobContext) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Unnamed;

    #[async_trait]
    impl Job for Unnamed {
        const CLASS_PATH: &'static str = "  ";

        async fn handle(&self, _ctx: &JobContext) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_register_and_resolve() {
        let registry = JobRegistry::new();
        registry.register::<ResizeImage>().await.unwrap();

        assert!(registry.is_registered("media/resize_image").await);
        assert_eq!(registry.registered_types().await, vec!["media/resize_image".to_string()]);

        let policy = registry.retry_policy("media/resize_image").await.unwrap();
        assert_eq!(policy.retries, 3);
        assert_eq!(policy.retry_after, Duration::from_secs(30));

        let entry = registry.resolve("media/resize_image").await.unwrap();
        let payload = JobPayload::dispatch(
            "media/resize_image",
            &ResizeImage {
                path: "a.png".to_string(),
                width: 640,
            },
        )
        .unwrap();
        let job = entry.instantiate(&payload).unwrap();
        assert!(format!("{:?}", job).contains("a.png"));
    }

    #[tokio::test]
    async fn test_unregistered_class_path() {
        let registry = JobRegistry::new();
        let err = registry.resolve("missing").await.err().unwrap();
        assert!(matches!(err, QueueError::UnknownJob(ref path) if path == "missing"));
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_blank_class_path_rejected() {
        let registry = JobRegistry::new();
        let err = registry.register::<Unnamed>().await.unwrap_err();
        assert!(matches!(err, QueueError::MissingClassPath(_)));
    }

    #[tokio::test]
    async fn test_instantiate_rejects_mismatched_payload() {
        let registry = JobRegistry::new();
        registry.register::<ResizeImage>().await.unwrap();

        let entry = registry.resolve("media/resize_image").await.unwrap();
        let payload = JobPayload::dispatch("media/resize_image", &serde_json::json!({ "path": 1 }))
            .unwrap();
        assert!(entry.instantiate(&payload).is_err());
    }

    #[test]
    fn test_retry_policy_exhaustion() {
        let policy = RetryPolicy {
            retries: 2,
            retry_after: Duration::from_secs(5),
        };
        assert!(!policy.is_exhausted(1));
        assert!(policy.is_exhausted(2));

        let no_retries = RetryPolicy {
            retries: 0,
            retry_after: Duration::from_secs(5),
        };
        assert!(no_retries.is_exhausted(1));
    }
}
