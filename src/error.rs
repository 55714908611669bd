/// The main error type for Tideway queues
///
/// Variants fall into four groups: configuration errors (fail fast, never
/// retried), storage errors (propagate to the run loop, which logs and keeps
/// polling), invariant violations (run-loop bugs) and job handler errors
/// (converted by the manager into a reschedule-or-fail decision).
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue not defined: \"{0}\"")]
    UnknownQueue(String),

    #[error("Unknown queue driver \"{0}\". Make sure the driver is registered")]
    UnknownDriver(String),

    #[error("Job class path missing in {0}")]
    MissingClassPath(String),

    #[error("No job registered for class path: {0}")]
    UnknownJob(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Job failed: {0}")]
    Job(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl QueueError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    pub fn job(msg: impl Into<String>) -> Self {
        Self::Job(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Configuration errors are surfaced synchronously and never retried
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::UnknownQueue(_)
                | Self::UnknownDriver(_)
                | Self::MissingClassPath(_)
                | Self::UnknownJob(_)
                | Self::Config(_)
        )
    }

    /// Storage errors come from the backing store (connection loss, lock timeout)
    pub fn is_storage(&self) -> bool {
        match self {
            Self::Storage(_) => true,
            #[cfg(feature = "database")]
            Self::Database(_) => true,
            _ => false,
        }
    }

    /// Invariant violations mean the run loop mutated a job it does not hold
    pub fn is_invariant(&self) -> bool {
        matches!(self, Self::Invariant(_))
    }
}

/// Result type alias for queue operations
pub type Result<T> = std::result::Result<T, QueueError>;

#[cfg(feature = "redis")]
impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::Storage(format!("Redis error: {}", err))
    }
}
