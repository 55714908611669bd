//! Named driver factories
//!
//! The registry is owned by the composition root and handed to the
//! `QueueManager`, so independent configurations can coexist in one
//! process. Host applications add their own driver kinds with `extend`.

use crate::app::AppContext;
use crate::config::{MemoryDriverConfig, QueueMapping};
use crate::drivers::{MemoryDriver, NullDriver};
use crate::error::{QueueError, Result};
use crate::traits::QueueDriver;
use std::collections::HashMap;
use std::sync::Arc;

/// Builds a driver from its mapping config
pub type DriverFactory =
    Arc<dyn Fn(&serde_json::Value, &AppContext) -> Result<Arc<dyn QueueDriver>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct DriverRegistry {
    factories: HashMap<String, DriverFactory>,
}

impl DriverRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every driver compiled into this crate
    ///
    /// Always `memory` and `null`; `database` and `redis` when their
    /// features are enabled.
    pub fn with_builtin_drivers() -> Self {
        let mut registry = Self::new();

        registry
            .extend("memory", |config, _ctx| {
                let config: MemoryDriverConfig = QueueMapping::parse(config)?;
                Ok(Arc::new(MemoryDriver::new(config)))
            })
            .extend("null", |_config, _ctx| Ok(Arc::new(NullDriver::new())));

        #[cfg(feature = "database")]
        registry.extend("database", |config, ctx| {
            let config: crate::config::DatabaseDriverConfig = QueueMapping::parse(config)?;
            let db = ctx.database()?.clone();
            Ok(Arc::new(crate::drivers::DatabaseDriver::new(db, config)?))
        });

        #[cfg(feature = "redis")]
        registry.extend("redis", |config, _ctx| {
            let config: crate::config::RedisDriverConfig = QueueMapping::parse(config)?;
            Ok(Arc::new(crate::drivers::RedisDriver::new(config)?))
        });

        registry
    }

    /// Register a factory for a driver kind, replacing any existing one
    ///
    /// ```rust,ignore
    /// registry.extend("sqs", |config, _ctx| {
    ///     let config: SqsConfig = QueueMapping::parse(config)?;
    ///     Ok(Arc::new(SqsDriver::new(config)?))
    /// });
    /// ```
    pub fn extend<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&serde_json::Value, &AppContext) -> Result<Arc<dyn QueueDriver>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    /// Build a driver of kind `name`
    pub fn create(
        &self,
        name: &str,
        config: &serde_json::Value,
        ctx: &AppContext,
    ) -> Result<Arc<dyn QueueDriver>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| QueueError::UnknownDriver(name.to_string()))?;
        factory(config, ctx)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered driver kinds, sorted
    pub fn driver_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}
