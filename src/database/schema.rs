//! Jobs table layout
//!
//! The table name is configurable per queue, so statements take it as an
//! `Alias` and only the column identifiers are fixed.

use sea_orm::DeriveIden;
use sea_orm::sea_query::{Alias, ColumnDef, Expr, Index, IndexCreateStatement, Table, TableCreateStatement};

#[derive(DeriveIden, Clone, Copy)]
pub(crate) enum JobColumn {
    Id,
    ClassPath,
    Payload,
    CreatedAt,
    AvailableAt,
    Attempts,
    Failed,
}

impl JobColumn {
    pub(crate) const ALL: [JobColumn; 7] = [
        JobColumn::Id,
        JobColumn::ClassPath,
        JobColumn::Payload,
        JobColumn::CreatedAt,
        JobColumn::AvailableAt,
        JobColumn::Attempts,
        JobColumn::Failed,
    ];
}

/// `CREATE TABLE IF NOT EXISTS` for a jobs table named `table`
pub fn jobs_table_statement(table: &str) -> TableCreateStatement {
    Table::create()
        .table(Alias::new(table))
        .if_not_exists()
        .col(
            ColumnDef::new(JobColumn::Id)
                .big_integer()
                .not_null()
                .auto_increment()
                .primary_key(),
        )
        .col(ColumnDef::new(JobColumn::ClassPath).string().not_null())
        .col(ColumnDef::new(JobColumn::Payload).text().not_null())
        .col(
            ColumnDef::new(JobColumn::CreatedAt)
                .timestamp()
                .not_null()
                .default(Expr::current_timestamp()),
        )
        .col(
            ColumnDef::new(JobColumn::AvailableAt)
                .timestamp()
                .not_null()
                .default(Expr::current_timestamp()),
        )
        .col(ColumnDef::new(JobColumn::Attempts).integer().not_null().default(0))
        .col(ColumnDef::new(JobColumn::Failed).boolean().not_null().default(false))
        .to_owned()
}

/// Index backing the due-job scan
pub fn due_index_statement(table: &str) -> IndexCreateStatement {
    Index::create()
        .name(format!("idx_{}_due", table))
        .table(Alias::new(table))
        .col(JobColumn::Failed)
        .col(JobColumn::AvailableAt)
        .col(JobColumn::Id)
        .if_not_exists()
        .to_owned()
}
