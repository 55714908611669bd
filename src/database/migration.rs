use crate::database::schema::{due_index_statement, jobs_table_statement};
use crate::error::{QueueError, Result};
use async_trait::async_trait;
use sea_orm::DbErr;
use sea_orm::sea_query::{Alias, Table};
use sea_orm_migration::{MigrationName, MigrationTrait, MigratorTrait, SchemaManager};

/// Migration creating a jobs table
///
/// ```rust,ignore
/// #[async_trait::async_trait]
/// impl MigratorTrait for Migrator {
///     fn migrations() -> Vec<Box<dyn MigrationTrait>> {
///         vec![
///             Box::new(m20250101_create_users::Migration),
///             Box::new(CreateJobsTable::new("background_jobs")),
///         ]
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CreateJobsTable {
    table: String,
}

impl CreateJobsTable {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }
}

impl Default for CreateJobsTable {
    fn default() -> Self {
        Self::new("jobs")
    }
}

impl MigrationName for CreateJobsTable {
    fn name(&self) -> &str {
        "m20250101_000001_create_jobs_table"
    }
}

#[async_trait]
impl MigrationTrait for CreateJobsTable {
    async fn up(&self, manager: &SchemaManager) -> std::result::Result<(), DbErr> {
        manager.create_table(jobs_table_statement(&self.table)).await?;
        manager.create_index(due_index_statement(&self.table)).await
    }

    async fn down(&self, manager: &SchemaManager) -> std::result::Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Alias::new(&self.table)).if_exists().to_owned())
            .await
    }
}

/// Migrator for the default `jobs` table
pub struct JobsMigrator;

#[async_trait]
impl MigratorTrait for JobsMigrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(CreateJobsTable::default())]
    }
}

/// Run pending migrations
///
/// ```rust,ignore
/// use tideway_queue::database::{JobsMigrator, run_migrations};
///
/// run_migrations::<JobsMigrator>(&db).await?;
/// ```
pub async fn run_migrations<M: MigratorTrait>(db: &sea_orm::DatabaseConnection) -> Result<()> {
    M::up(db, None)
        .await
        .map_err(|e| QueueError::storage(format!("Migration failed: {}", e)))?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}

/// Rollback the last migration
pub async fn rollback_migration<M: MigratorTrait>(
    db: &sea_orm::DatabaseConnection,
    steps: Option<u32>,
) -> Result<()> {
    M::down(db, steps)
        .await
        .map_err(|e| QueueError::storage(format!("Rollback failed: {}", e)))?;

    tracing::info!("Rolled back {} migration(s)", steps.unwrap_or(1));
    Ok(())
}

/// Create a jobs table outside the migrator, e.g. for a queue with its own table
pub async fn create_jobs_table(db: &sea_orm::DatabaseConnection, table: &str) -> Result<()> {
    let manager = SchemaManager::new(db);
    CreateJobsTable::new(table)
        .up(&manager)
        .await
        .map_err(|e| QueueError::storage(format!("Failed to create jobs table \"{}\": {}", table, e)))?;

    tracing::debug!(table = %table, "Jobs table ready");
    Ok(())
}
