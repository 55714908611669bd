//! Job authoring trait
//!
//! A job is a serializable struct whose fields are its constructor
//! arguments. Dispatching stores those fields; a worker rebuilds the struct
//! from the registry entry for `CLASS_PATH` and calls `handle`.

use crate::error::Result;
use crate::jobs::JobContext;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::time::Duration;

/// A background job that can be dispatched and executed by a worker
///
/// # Example
///
/// ```rust,no_run
/// use async_trait::async_trait;
/// use serde::{Deserialize, Serialize};
/// use tideway_queue::{Job, JobContext, Result};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct SendWelcomeEmail {
///     user_id: i64,
/// }
///
/// #[async_trait]
/// impl Job for SendWelcomeEmail {
///     const CLASS_PATH: &'static str = "emails/send_welcome";
///     const RETRIES: u32 = 3;
///
///     async fn handle(&self, ctx: &JobContext) -> Result<()> {
///         tracing::info!(user_id = self.user_id, attempt = ctx.attempt(), "Sending welcome email");
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
#[allow(async_fn_in_trait)] // async_trait macro handles Send/Sync bounds
pub trait Job: Serialize + DeserializeOwned + Send + Sync + Debug + 'static {
    /// Key this job is registered and stored under
    ///
    /// Must be non-empty; dispatching a job without one fails.
    const CLASS_PATH: &'static str;

    /// Retry budget: the job is marked failed once a failed execution
    /// brings its attempts to this count (0 fails on the first error)
    const RETRIES: u32 = 0;

    /// Delay before a failed job becomes due again
    const RETRY_AFTER: Duration = Duration::from_secs(5);

    /// Execute the job
    async fn handle(&self, ctx: &JobContext) -> Result<()>;
}
