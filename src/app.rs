use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

#[cfg(feature = "database")]
use sea_orm::DatabaseConnection;

/// Application context for dependency injection and shared state
///
/// Driver factories resolve their collaborators from it (the database driver
/// takes its connection from here) and jobs reach it through
/// `JobContext::app()`. Anything else the application shares with its jobs
/// goes into the typed extensions.
#[derive(Clone)]
pub struct AppContext {
    #[cfg(feature = "database")]
    pub database: Option<DatabaseConnection>,

    extensions: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl AppContext {
    pub fn new() -> Self {
        Self {
            #[cfg(feature = "database")]
            database: None,
            extensions: HashMap::new(),
        }
    }

    /// Builder pattern for constructing AppContext
    pub fn builder() -> AppContextBuilder {
        AppContextBuilder::new()
    }

    /// Get the database connection, returning an error if not configured
    #[cfg(feature = "database")]
    pub fn database(&self) -> crate::error::Result<&DatabaseConnection> {
        self.database
            .as_ref()
            .ok_or_else(|| crate::error::QueueError::config("Database connection not configured"))
    }

    /// Get the database connection as an Option
    #[cfg(feature = "database")]
    pub fn database_opt(&self) -> Option<&DatabaseConnection> {
        self.database.as_ref()
    }

    /// Get a shared extension by type
    ///
    /// # Example
    /// ```ignore
    /// if let Some(mailer) = ctx.app().extension_opt::<SmtpMailer>() {
    ///     mailer.send(message).await?;
    /// }
    /// ```
    pub fn extension_opt<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.extensions
            .get(&TypeId::of::<T>())
            .and_then(|ext| ext.downcast_ref::<T>())
    }

    /// Get a shared extension, returning an error if it was never added
    pub fn extension<T: Send + Sync + 'static>(&self) -> crate::error::Result<&T> {
        self.extension_opt::<T>().ok_or_else(|| {
            crate::error::QueueError::config(format!(
                "Extension not configured: {}",
                std::any::type_name::<T>()
            ))
        })
    }
}

impl Default for AppContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for AppContext with fluent API
#[must_use = "builder does nothing until you call build()"]
pub struct AppContextBuilder {
    #[cfg(feature = "database")]
    database: Option<DatabaseConnection>,

    extensions: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl AppContextBuilder {
    pub fn new() -> Self {
        Self {
            #[cfg(feature = "database")]
            database: None,
            extensions: HashMap::new(),
        }
    }

    /// Set the database connection
    #[cfg(feature = "database")]
    pub fn with_database(mut self, connection: DatabaseConnection) -> Self {
        self.database = Some(connection);
        self
    }

    /// Add a shared extension; a later value of the same type replaces it
    ///
    /// # Example
    /// ```ignore
    /// let context = AppContext::builder()
    ///     .with_extension(Arc::new(SmtpMailer::from_env()?))
    ///     .build();
    /// ```
    pub fn with_extension<T: Send + Sync + 'static>(mut self, extension: Arc<T>) -> Self {
        self.extensions
            .insert(TypeId::of::<T>(), extension as Arc<dyn Any + Send + Sync>);
        self
    }

    pub fn build(self) -> AppContext {
        AppContext {
            #[cfg(feature = "database")]
            database: self.database,
            extensions: self.extensions,
        }
    }
}

impl Default for AppContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}
