//! Testing utilities for queue drivers and jobs
//!
//! - [`TestDb`]: SQLite in-memory or PostgreSQL database with a jobs table
//! - [`manager_with`]: a `QueueManager` over a single driver instance
//!
//! # Example
//!
//! ```rust,ignore
//! use tideway_queue::testing;
//!
//! #[tokio::test]
//! async fn test_job_runs() {
//!     let jobs = JobRegistry::new();
//!     jobs.register::<SendWelcomeEmail>().await.unwrap();
//!
//!     let manager = testing::manager_with(Arc::new(MemoryDriver::default()), jobs);
//!     SendWelcomeEmail { user_id: 1 }.dispatch(&manager).send().await.unwrap();
//!
//!     let outcome = manager.execute(None).await.unwrap();
//!     assert!(matches!(outcome, ExecuteOutcome::Completed(_)));
//! }
//! ```

#[cfg(feature = "database")]
mod database;

#[cfg(feature = "database")]
pub use database::TestDb;

use crate::app::AppContext;
use crate::config::QueueConfig;
use crate::drivers::DriverRegistry;
use crate::jobs::JobRegistry;
use crate::manager::QueueManager;
use crate::traits::QueueDriver;
use std::sync::Arc;

/// Queue name used by [`manager_with`]
pub const TEST_QUEUE: &str = "test";

/// Manager whose default queue is backed by `driver`
///
/// Every resolution of the queue returns this same instance, so the test
/// can keep inspecting it directly.
pub fn manager_with(driver: Arc<dyn QueueDriver>, jobs: JobRegistry) -> QueueManager {
    manager_with_context(driver, jobs, AppContext::new())
}

/// Like [`manager_with`], with a custom application context
pub fn manager_with_context(
    driver: Arc<dyn QueueDriver>,
    jobs: JobRegistry,
    app: AppContext,
) -> QueueManager {
    let mut drivers = DriverRegistry::new();
    drivers.extend(TEST_QUEUE, move |_config, _ctx| Ok(driver.clone()));

    let config = QueueConfig::builder()
        .default_queue(TEST_QUEUE)
        .queue(TEST_QUEUE, TEST_QUEUE, serde_json::Value::Null)
        .build();

    QueueManager::new(config, Arc::new(drivers), jobs, Arc::new(app))
}
