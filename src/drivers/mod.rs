//! Queue drivers
//!
//! Each driver implements [`crate::QueueDriver`] for one backing store.
//! Drivers are usually built by name through the [`DriverRegistry`] from a
//! queue mapping, but can also be constructed directly.

#[cfg(feature = "database")]
mod database;
mod memory;
mod null;
#[cfg(feature = "redis")]
mod redis;
mod registry;

#[cfg(feature = "database")]
pub use database::DatabaseDriver;
pub use memory::{ANONYMOUS_CLASS_PATH, MemoryDriver, MemoryJob, Processor};
pub use null::NullDriver;
#[cfg(feature = "redis")]
pub use redis::RedisDriver;
pub use registry::{DriverFactory, DriverRegistry};
