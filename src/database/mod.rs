//! Database connection setup and the jobs table schema.
//!
//! Backs the `database` queue driver. Connections are plain SeaORM
//! `DatabaseConnection` pools.

mod config;
mod migration;
pub(crate) mod schema;

pub use config::{DatabaseConfig, connect, redact_database_url};
pub use migration::{
    CreateJobsTable, JobsMigrator, create_jobs_table, rollback_migration, run_migrations,
};
pub use schema::{due_index_statement, jobs_table_statement};
pub use sea_orm;
