//! Configuration for queues and their drivers

use crate::error::{QueueError, Result};
use crate::utils::{get_env_with_prefix, parse_env_with_prefix};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Queue configuration: a default queue name plus named driver mappings
///
/// ```json
/// {
///   "default": "emails",
///   "queues": {
///     "emails": { "driver": "database", "config": { "table_name": "jobs" } },
///     "local": { "driver": "memory" }
///   }
/// }
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Queue used when no name is given
    #[serde(default = "default_queue_name")]
    pub default: String,

    /// Named queue mappings
    #[serde(default)]
    pub queues: HashMap<String, QueueMapping>,
}

/// Binds a logical queue name to a driver kind and its driver config
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueMapping {
    /// Driver kind, as registered in the `DriverRegistry`
    pub driver: String,

    /// Driver-specific configuration
    #[serde(default)]
    pub config: serde_json::Value,
}

impl QueueMapping {
    pub fn new(driver: impl Into<String>, config: serde_json::Value) -> Self {
        Self {
            driver: driver.into(),
            config,
        }
    }

    /// Parse the driver config into a typed struct
    ///
    /// A missing (`null`) config parses as the struct's defaults.
    pub fn parse<T: DeserializeOwned + Default>(config: &serde_json::Value) -> Result<T> {
        if config.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(config.clone())
            .map_err(|e| QueueError::config(format!("Invalid driver config: {}", e)))
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        let mut queues = HashMap::new();
        queues.insert(
            default_queue_name(),
            QueueMapping::new("memory", serde_json::Value::Null),
        );
        Self {
            default: default_queue_name(),
            queues,
        }
    }
}

impl QueueConfig {
    pub fn builder() -> QueueConfigBuilder {
        QueueConfigBuilder::new()
    }

    /// Load queue configuration from environment variables
    ///
    /// - `QUEUE_DEFAULT`: default queue name
    /// - `QUEUE_DRIVER`: driver kind for the default queue
    /// - `QUEUE_TABLE`: table name for the database driver
    /// - `QUEUE_POLLING_DELAY_MS`: polling delay for the default queue
    /// - `QUEUE_REDIS_URL`: connection URL for the redis driver
    ///
    /// Each variable may carry the `TIDEWAY_` prefix.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(name) = get_env_with_prefix("QUEUE_DEFAULT") {
            if let Some(mapping) = config.queues.remove(&config.default) {
                config.queues.insert(name.clone(), mapping);
            }
            config.default = name;
        }

        let Some(mapping) = config.queues.get_mut(&config.default) else {
            return config;
        };

        if let Some(driver) = get_env_with_prefix("QUEUE_DRIVER") {
            mapping.driver = driver.to_lowercase();
        }

        let mut driver_config = serde_json::Map::new();
        if let Some(table) = get_env_with_prefix("QUEUE_TABLE") {
            driver_config.insert("table_name".to_string(), table.into());
        }
        if let Some(delay) = parse_env_with_prefix::<u64>("QUEUE_POLLING_DELAY_MS") {
            driver_config.insert("polling_delay_ms".to_string(), delay.into());
        }
        if let Some(url) = get_env_with_prefix("QUEUE_REDIS_URL") {
            driver_config.insert("url".to_string(), url.into());
        }
        if !driver_config.is_empty() {
            mapping.config = serde_json::Value::Object(driver_config);
        }

        config
    }

    /// Look up a queue mapping by name
    pub fn mapping(&self, name: &str) -> Result<&QueueMapping> {
        self.queues
            .get(name)
            .ok_or_else(|| QueueError::UnknownQueue(name.to_string()))
    }
}

/// Builder for `QueueConfig`
#[must_use = "builder does nothing until you call build()"]
pub struct QueueConfigBuilder {
    config: QueueConfig,
}

impl QueueConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: QueueConfig {
                default: default_queue_name(),
                queues: HashMap::new(),
            },
        }
    }

    pub fn from_env(mut self) -> Self {
        self.config = QueueConfig::from_env();
        self
    }

    pub fn default_queue(mut self, name: impl Into<String>) -> Self {
        self.config.default = name.into();
        self
    }

    pub fn queue(
        mut self,
        name: impl Into<String>,
        driver: impl Into<String>,
        config: serde_json::Value,
    ) -> Self {
        self.config
            .queues
            .insert(name.into(), QueueMapping::new(driver, config));
        self
    }

    pub fn build(self) -> QueueConfig {
        self.config
    }
}

impl Default for QueueConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the database driver
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseDriverConfig {
    /// Table holding job rows
    #[serde(default = "default_table_name")]
    pub table_name: String,

    /// Delay between polls in milliseconds
    #[serde(default = "default_database_polling_delay_ms")]
    pub polling_delay_ms: u64,
}

impl DatabaseDriverConfig {
    pub fn polling_delay(&self) -> Duration {
        Duration::from_millis(self.polling_delay_ms)
    }
}

impl Default for DatabaseDriverConfig {
    fn default() -> Self {
        Self {
            table_name: default_table_name(),
            polling_delay_ms: default_database_polling_delay_ms(),
        }
    }
}

/// Configuration for the in-memory driver
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MemoryDriverConfig {
    /// Delay between polls in milliseconds
    #[serde(default = "default_memory_polling_delay_ms")]
    pub polling_delay_ms: u64,

    /// Completed jobs kept for `get_job` lookups (oldest dropped first)
    #[serde(default = "default_max_history_size")]
    pub max_history_size: usize,
}

impl MemoryDriverConfig {
    pub fn polling_delay(&self) -> Duration {
        Duration::from_millis(self.polling_delay_ms)
    }
}

impl Default for MemoryDriverConfig {
    fn default() -> Self {
        Self {
            polling_delay_ms: default_memory_polling_delay_ms(),
            max_history_size: default_max_history_size(),
        }
    }
}

/// Configuration for the Redis driver
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisDriverConfig {
    /// Redis connection URL (e.g., "redis://127.0.0.1:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Key prefix; each queue should use its own
    #[serde(default = "default_redis_prefix")]
    pub prefix: String,

    /// Delay between polls in milliseconds
    #[serde(default = "default_redis_polling_delay_ms")]
    pub polling_delay_ms: u64,

    /// How long a claim may stay open before another worker requeues it
    #[serde(default = "default_redis_lease_ms")]
    pub lease_ms: u64,
}

impl RedisDriverConfig {
    pub fn polling_delay(&self) -> Duration {
        Duration::from_millis(self.polling_delay_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }
}

impl Default for RedisDriverConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            prefix: default_redis_prefix(),
            polling_delay_ms: default_redis_polling_delay_ms(),
            lease_ms: default_redis_lease_ms(),
        }
    }
}

fn default_queue_name() -> String {
    "default".to_string()
}

fn default_table_name() -> String {
    "jobs".to_string()
}

fn default_database_polling_delay_ms() -> u64 {
    2000
}

fn default_memory_polling_delay_ms() -> u64 {
    500
}

fn default_max_history_size() -> usize {
    10_000
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_redis_prefix() -> String {
    "tideway:queue".to_string()
}

fn default_redis_polling_delay_ms() -> u64 {
    2000
}

fn default_redis_lease_ms() -> u64 {
    300_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_config_has_memory_queue() {
        let config = QueueConfig::default();
        assert_eq!(config.default, "default");
        assert_eq!(config.mapping("default").unwrap().driver, "memory");
    }

    #[test]
    fn test_unknown_mapping_is_configuration_error() {
        let config = QueueConfig::default();
        let err = config.mapping("emails").unwrap_err();
        assert!(matches!(err, QueueError::UnknownQueue(ref name) if name == "emails"));
    }

    #[test]
    fn test_deserialize_from_json() {
        let config: QueueConfig = serde_json::from_value(json!({
            "default": "db",
            "queues": {
                "db": { "driver": "database", "config": { "table_name": "queue_jobs" } },
                "mem": { "driver": "memory" }
            }
        }))
        .unwrap();

        assert_eq!(config.default, "db");
        let db: DatabaseDriverConfig = QueueMapping::parse(&config.queues["db"].config).unwrap();
        assert_eq!(db.table_name, "queue_jobs");
        assert_eq!(db.polling_delay(), Duration::from_millis(2000));

        let mem: MemoryDriverConfig = QueueMapping::parse(&config.queues["mem"].config).unwrap();
        assert_eq!(mem.polling_delay_ms, 500);
        assert_eq!(mem.max_history_size, 10_000);
    }

    #[test]
    fn test_invalid_driver_config() {
        let err = QueueMapping::parse::<DatabaseDriverConfig>(&json!({ "polling_delay_ms": "fast" }))
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_builder() {
        let config = QueueConfig::builder()
            .default_queue("local")
            .queue("local", "memory", json!({ "polling_delay_ms": 10 }))
            .queue("db", "database", serde_json::Value::Null)
            .build();

        assert_eq!(config.default, "local");
        assert_eq!(config.queues.len(), 2);
        assert_eq!(config.mapping("db").unwrap().driver, "database");
    }

    #[test]
    fn test_from_env() {
        unsafe {
            std::env::set_var("TIDEWAY_QUEUE_DEFAULT", "background");
            std::env::set_var("TIDEWAY_QUEUE_DRIVER", "Database");
            std::env::set_var("TIDEWAY_QUEUE_TABLE", "background_jobs");
            std::env::set_var("TIDEWAY_QUEUE_POLLING_DELAY_MS", "750");
        }

        let config = QueueConfig::from_env();

        unsafe {
            std::env::remove_var("TIDEWAY_QUEUE_DEFAULT");
            std::env::remove_var("TIDEWAY_QUEUE_DRIVER");
            std::env::remove_var("TIDEWAY_QUEUE_TABLE");
            std::env::remove_var("TIDEWAY_QUEUE_POLLING_DELAY_MS");
        }

        assert_eq!(config.default, "background");
        let mapping = config.mapping("background").unwrap();
        assert_eq!(mapping.driver, "database");
        let db: DatabaseDriverConfig = QueueMapping::parse(&mapping.config).unwrap();
        assert_eq!(db.table_name, "background_jobs");
        assert_eq!(db.polling_delay_ms, 750);
    }
}
