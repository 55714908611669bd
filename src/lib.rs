//! Tideway Queue - background jobs for Tideway applications
//!
//! Jobs are dispatched to named queues, persisted by a driver and executed
//! by a polling worker that retries or fails them according to each job
//! type's retry policy.
//!
//! # Features
//!
//! - **Drivers**: SQL table with `SKIP LOCKED` claims (`database`, default),
//!   in-memory, Redis (`redis`) and a discarding null driver
//! - **Registries**: driver kinds by name, job types by class path
//! - **Dispatch**: typed jobs with delayed and per-queue dispatch
//! - **Workers**: poll loops with graceful shutdown
//! - **Testing**: SQLite/PostgreSQL test databases and single-driver managers
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//! use tideway_queue::{
//!     AppContext, DriverRegistry, Job, JobContext, JobExt, JobRegistry, QueueConfig,
//!     QueueManager, Result,
//! };
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct SendWelcomeEmail {
//!     user_id: i64,
//! }
//!
//! #[async_trait]
//! impl Job for SendWelcomeEmail {
//!     const CLASS_PATH: &'static str = "emails/send_welcome";
//!
//!     async fn handle(&self, _ctx: &JobContext) -> Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     tideway_queue::init_tracing();
//!
//!     let jobs = JobRegistry::new();
//!     jobs.register::<SendWelcomeEmail>().await?;
//!
//!     let manager = QueueManager::new(
//!         QueueConfig::from_env(),
//!         Arc::new(DriverRegistry::with_builtin_drivers()),
//!         jobs,
//!         Arc::new(AppContext::new()),
//!     );
//!
//!     SendWelcomeEmail { user_id: 42 }.dispatch(&manager).send().await?;
//!     manager.start(None).await
//! }
//! ```

#![allow(async_fn_in_trait)] // async_trait macro handles Send/Sync bounds properly

mod app;
mod config;
#[cfg(feature = "database")]
pub mod database;
pub mod drivers;
mod error;
pub mod jobs;
mod manager;
pub mod testing;
pub mod traits;
mod utils;
mod worker;

// Re-exports for public API
pub use app::{AppContext, AppContextBuilder};
pub use config::{
    DatabaseDriverConfig, MemoryDriverConfig, QueueConfig, QueueConfigBuilder, QueueMapping,
    RedisDriverConfig,
};
#[cfg(feature = "database")]
pub use database::DatabaseConfig;
#[cfg(feature = "database")]
pub use drivers::DatabaseDriver;
#[cfg(feature = "redis")]
pub use drivers::RedisDriver;
pub use drivers::{DriverFactory, DriverRegistry, MemoryDriver, MemoryJob, NullDriver};
pub use error::{QueueError, Result};
pub use jobs::{
    DispatchPayload, Dispatcher, JobContext, JobExt, JobHandle, JobPayload, JobRegistry,
    RetryPolicy,
};
pub use manager::{ExecuteOutcome, QueueManager};
pub use traits::{Job, JobId, JobRecord, QueueDriver, StoreOptions};
pub use worker::{QueueWorker, WorkerPool};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging with sensible defaults
///
/// This should be called early in your worker binary, typically in main().
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "debug", "tideway_queue=debug")
/// - `TIDEWAY_LOG_JSON`: Set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = utils::get_env_with_prefix("LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
