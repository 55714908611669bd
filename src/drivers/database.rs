//! SQL-backed queue driver
//!
//! A claim is a row lock inside an open transaction:
//!
//! 1. `get_next` begins a transaction and selects the oldest due row with
//!    `FOR UPDATE SKIP LOCKED`, so concurrent pollers pass over rows another
//!    worker already holds instead of queueing behind them
//! 2. the transaction stays open while the job runs
//! 3. `reschedule`, `mark_failed`, `remove` or `release` writes through that
//!    transaction and commits it
//!
//! If the connection dies mid-claim the transaction rolls back and the row
//! becomes claimable again. No recovery bookkeeping is kept.
//!
//! Each driver instance holds at most one claim. Run one instance per
//! concurrent worker.

use crate::config::DatabaseDriverConfig;
use crate::database::schema::JobColumn;
use crate::error::{QueueError, Result};
use crate::jobs::JobPayload;
use crate::traits::driver::{failed_attempts, now, now_plus, rescheduled_attempts};
use crate::traits::{JobId, JobRecord, QueueDriver, StoreOptions};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use sea_orm::sea_query::{Alias, Expr, LockBehavior, LockType, Order, Query, SelectStatement};
use sea_orm::{
    ConnectionTrait, DatabaseConnection, DatabaseTransaction, FromQueryResult, StatementBuilder,
    TransactionTrait,
};
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, FromQueryResult)]
struct JobRow {
    id: i64,
    class_path: String,
    payload: String,
    created_at: NaiveDateTime,
    available_at: NaiveDateTime,
    attempts: i32,
    failed: bool,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = QueueError;

    fn try_from(row: JobRow) -> Result<Self> {
        let attempts = u32::try_from(row.attempts).map_err(|_| {
            QueueError::storage(format!(
                "Job {} has an invalid attempt count: {}",
                row.id, row.attempts
            ))
        })?;

        Ok(JobRecord {
            id: JobId(row.id),
            class_path: row.class_path,
            payload: JobPayload::from_raw(row.payload),
            created_at: row.created_at,
            available_at: row.available_at,
            attempts,
            failed: row.failed,
            progress: None,
        })
    }
}

struct Claim {
    txn: DatabaseTransaction,
    job_id: JobId,
    attempts: u32,
}

fn to_db_attempts(attempts: u32) -> i32 {
    i32::try_from(attempts).unwrap_or(i32::MAX)
}

/// Queue driver storing jobs in a SQL table
pub struct DatabaseDriver {
    db: DatabaseConnection,
    table: String,
    polling_delay: Duration,
    claim: Mutex<Option<Claim>>,
}

impl DatabaseDriver {
    pub fn new(db: DatabaseConnection, config: DatabaseDriverConfig) -> Result<Self> {
        if config.table_name.trim().is_empty() {
            return Err(QueueError::config("Database driver table_name must not be empty"));
        }

        Ok(Self {
            db,
            polling_delay: config.polling_delay(),
            table: config.table_name,
            claim: Mutex::new(None),
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    fn table(&self) -> Alias {
        Alias::new(&self.table)
    }

    fn select_columns(&self) -> SelectStatement {
        Query::select()
            .columns(JobColumn::ALL)
            .from(self.table())
            .to_owned()
    }

    fn build<S: StatementBuilder>(&self, statement: &S) -> sea_orm::Statement {
        self.db.get_database_backend().build(statement)
    }

    /// Close the claim on `id`, handing back its transaction
    fn take_claim(slot: &mut Option<Claim>, id: JobId) -> Result<Claim> {
        match slot.take() {
            Some(claim) if claim.job_id == id => Ok(claim),
            Some(claim) => {
                let open = claim.job_id;
                *slot = Some(claim);
                Err(QueueError::invariant(format!(
                    "job {} is not claimed (open claim is job {})",
                    id, open
                )))
            }
            None => Err(QueueError::invariant(format!("no open claim for job {}", id))),
        }
    }
}

#[async_trait]
impl QueueDriver for DatabaseDriver {
    fn kind(&self) -> &'static str {
        "database"
    }

    async fn store(
        &self,
        class_path: &str,
        payload: JobPayload,
        options: StoreOptions,
    ) -> Result<JobRecord> {
        let created_at = now();
        let available_at = options.available_at.unwrap_or(created_at);

        let mut insert = Query::insert();
        insert
            .into_table(self.table())
            .columns([
                JobColumn::ClassPath,
                JobColumn::Payload,
                JobColumn::CreatedAt,
                JobColumn::AvailableAt,
                JobColumn::Attempts,
                JobColumn::Failed,
            ])
            .values([
                class_path.into(),
                payload.into_string().into(),
                created_at.into(),
                available_at.into(),
                0i32.into(),
                false.into(),
            ])
            .map_err(|e| QueueError::storage(format!("Failed to build insert: {}", e)))?
            .returning_all();

        let row = JobRow::find_by_statement(self.build(&insert))
            .one(&self.db)
            .await?
            .ok_or_else(|| QueueError::storage("Insert returned no row"))?;

        let record = JobRecord::try_from(row)?;
        tracing::debug!(
            job_id = %record.id,
            class_path = %record.class_path,
            table = %self.table,
            "Job stored"
        );
        Ok(record)
    }

    async fn get_next(&self) -> Result<Option<JobRecord>> {
        let mut slot = self.claim.lock().await;
        if let Some(open) = slot.as_ref() {
            return Err(QueueError::invariant(format!(
                "claim on job {} is still open",
                open.job_id
            )));
        }

        let select = self
            .select_columns()
            .and_where(Expr::col(JobColumn::AvailableAt).lte(now()))
            .and_where(Expr::col(JobColumn::Failed).eq(false))
            .order_by(JobColumn::AvailableAt, Order::Asc)
            .order_by(JobColumn::Id, Order::Asc)
            .limit(1)
            .lock_with_behavior(LockType::Update, LockBehavior::SkipLocked)
            .to_owned();

        let txn = self.db.begin().await?;
        let row = JobRow::find_by_statement(self.build(&select))
            .one(&txn)
            .await?;

        let Some(row) = row else {
            txn.commit().await?;
            return Ok(None);
        };

        let record = match JobRecord::try_from(row) {
            Ok(record) => record,
            Err(e) => {
                txn.rollback().await?;
                return Err(e);
            }
        };
        *slot = Some(Claim {
            txn,
            job_id: record.id,
            attempts: record.attempts,
        });
        Ok(Some(record))
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>> {
        let select = self
            .select_columns()
            .and_where(Expr::col(JobColumn::Id).eq(id.0))
            .to_owned();
        let statement = self.build(&select);

        // reads go through the open transaction while a claim is held
        let slot = self.claim.lock().await;
        let row = match slot.as_ref() {
            Some(claim) => JobRow::find_by_statement(statement).one(&claim.txn).await?,
            None => JobRow::find_by_statement(statement).one(&self.db).await?,
        };
        row.map(JobRecord::try_from).transpose()
    }

    async fn reschedule(&self, job: &JobRecord, retry_after: Duration) -> Result<()> {
        let available_at = now_plus(retry_after)?;
        let mut slot = self.claim.lock().await;
        let claim = Self::take_claim(&mut slot, job.id)?;
        let attempts = rescheduled_attempts(job, claim.attempts);

        let update = Query::update()
            .table(self.table())
            .values([
                (JobColumn::Attempts, to_db_attempts(attempts).into()),
                (JobColumn::AvailableAt, available_at.into()),
            ])
            .and_where(Expr::col(JobColumn::Id).eq(job.id.0))
            .to_owned();

        claim.txn.execute(self.build(&update)).await?;
        claim.txn.commit().await?;

        tracing::debug!(job_id = %job.id, attempts, available_at = %available_at, "Job rescheduled");
        Ok(())
    }

    async fn mark_failed(&self, job: &JobRecord) -> Result<()> {
        let mut slot = self.claim.lock().await;
        let claim = Self::take_claim(&mut slot, job.id)?;
        let attempts = failed_attempts(job, claim.attempts);

        let update = Query::update()
            .table(self.table())
            .values([
                (JobColumn::Attempts, to_db_attempts(attempts).into()),
                (JobColumn::Failed, true.into()),
            ])
            .and_where(Expr::col(JobColumn::Id).eq(job.id.0))
            .to_owned();

        claim.txn.execute(self.build(&update)).await?;
        claim.txn.commit().await?;
        Ok(())
    }

    async fn remove(&self, id: JobId) -> Result<()> {
        let mut slot = self.claim.lock().await;
        let claim = Self::take_claim(&mut slot, id)?;

        let delete = Query::delete()
            .from_table(self.table())
            .and_where(Expr::col(JobColumn::Id).eq(id.0))
            .to_owned();

        claim.txn.execute(self.build(&delete)).await?;
        claim.txn.commit().await?;
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        let claim = self.claim.lock().await.take();
        if let Some(claim) = claim {
            let job_id = claim.job_id;
            claim.txn.commit().await?;
            tracing::debug!(job_id = %job_id, "Claim released");
        }
        Ok(())
    }

    fn polling_delay(&self) -> Option<Duration> {
        Some(self.polling_delay)
    }

    async fn close(&self) -> Result<()> {
        // An open claim is rolled back so the row becomes claimable again
        let claim = self.claim.lock().await.take();
        if let Some(claim) = claim {
            tracing::warn!(job_id = %claim.job_id, "Closing driver with an open claim, rolling back");
            claim.txn.rollback().await?;
        }
        Ok(())
    }
}
