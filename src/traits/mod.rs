//! Trait definitions for extensible components
//!
//! These traits allow users to plug in their own backing stores and jobs.

pub mod driver;
pub mod job;

pub use driver::{JobId, JobRecord, QueueDriver, StoreOptions};
pub use job::Job;
