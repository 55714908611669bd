//! Redis-backed queue driver
//!
//! Uses Redis data structures under a per-queue prefix:
//! - `{prefix}:id` - counter for job ids
//! - `{prefix}:job:{id}` - hash holding the job record
//! - `{prefix}:due` - sorted set of queued job ids (score = `available_at` in ms)
//! - `{prefix}:processing` - sorted set of claimed job ids (score = lease deadline in ms)
//!
//! A claim atomically moves the oldest due id into the processing set. Claims
//! whose lease ran out (the worker died) go back to the due set on the next
//! claim attempt. Failed jobs stay behind as hashes with `failed = 1`.

use crate::config::RedisDriverConfig;
use crate::error::{QueueError, Result};
use crate::jobs::JobPayload;
use crate::traits::driver::{failed_attempts, now, now_plus, rescheduled_attempts};
use crate::traits::{JobId, JobRecord, QueueDriver, StoreOptions};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime};
use redis::Script;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

/// KEYS[1] = due set, KEYS[2] = processing set
/// ARGV[1] = now (ms), ARGV[2] = lease deadline (ms)
const CLAIM_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[2], id)
  redis.call('ZADD', KEYS[1], ARGV[1], id)
end
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #ids == 0 then
  return false
end
redis.call('ZREM', KEYS[1], ids[1])
redis.call('ZADD', KEYS[2], ARGV[2], ids[1])
return ids[1]
"#;

#[derive(Debug, Clone, Copy)]
struct Claim {
    job_id: JobId,
    attempts: u32,
    available_at: NaiveDateTime,
}

fn score(at: NaiveDateTime) -> i64 {
    at.and_utc().timestamp_millis()
}

fn from_millis(ms: i64) -> Result<NaiveDateTime> {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.naive_utc())
        .ok_or_else(|| QueueError::storage(format!("Invalid timestamp in job hash: {}", ms)))
}

fn open_claim(slot: &Option<Claim>, id: JobId) -> Result<Claim> {
    match *slot {
        Some(claim) if claim.job_id == id => Ok(claim),
        Some(claim) => Err(QueueError::invariant(format!(
            "job {} is not claimed (open claim is job {})",
            id, claim.job_id
        ))),
        None => Err(QueueError::invariant(format!("no open claim for job {}", id))),
    }
}

/// Queue driver storing jobs in Redis
pub struct RedisDriver {
    client: redis::Client,
    prefix: String,
    polling_delay: Duration,
    lease: Duration,
    claim_script: Script,
    claim: Mutex<Option<Claim>>,
}

impl RedisDriver {
    /// Create a new Redis queue driver
    ///
    /// The connection is opened lazily on first use.
    pub fn new(config: RedisDriverConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| QueueError::config(format!("Invalid Redis URL: {}", e)))?;
        if config.lease_ms == 0 {
            return Err(QueueError::config("Redis lease_ms must be greater than zero"));
        }

        Ok(Self {
            client,
            polling_delay: config.polling_delay(),
            lease: config.lease(),
            prefix: config.prefix,
            claim_script: Script::new(CLAIM_SCRIPT),
            claim: Mutex::new(None),
        })
    }

    /// Get a Redis connection
    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::storage(format!("Failed to get Redis connection: {}", e)))
    }

    fn id_key(&self) -> String {
        format!("{}:id", self.prefix)
    }

    fn due_key(&self) -> String {
        format!("{}:due", self.prefix)
    }

    fn processing_key(&self) -> String {
        format!("{}:processing", self.prefix)
    }

    fn job_key(&self, id: JobId) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    async fn load(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        id: JobId,
    ) -> Result<Option<JobRecord>> {
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.job_key(id))
            .query_async(conn)
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }

        let field = |name: &str| {
            fields
                .get(name)
                .cloned()
                .ok_or_else(|| QueueError::storage(format!("Job {} hash is missing {}", id, name)))
        };
        let number = |name: &str| -> Result<i64> {
            field(name)?
                .parse()
                .map_err(|_| QueueError::storage(format!("Job {} has a malformed {}", id, name)))
        };

        let progress = match fields.get("progress") {
            Some(raw) => Some(serde_json::from_str(raw)?),
            None => None,
        };
        let attempts = number("attempts")?;
        let attempts = u32::try_from(attempts).map_err(|_| {
            QueueError::storage(format!("Job {} has an invalid attempt count: {}", id, attempts))
        })?;

        Ok(Some(JobRecord {
            id,
            class_path: field("class_path")?,
            payload: JobPayload::from_raw(field("payload")?),
            created_at: from_millis(number("created_at")?)?,
            available_at: from_millis(number("available_at")?)?,
            attempts,
            failed: number("failed")? != 0,
            progress,
        }))
    }
}

#[async_trait]
impl QueueDriver for RedisDriver {
    fn kind(&self) -> &'static str {
        "redis"
    }

    async fn store(
        &self,
        class_path: &str,
        payload: JobPayload,
        options: StoreOptions,
    ) -> Result<JobRecord> {
        let mut conn = self.get_connection().await?;
        let id: i64 = redis::cmd("INCR")
            .arg(self.id_key())
            .query_async(&mut conn)
            .await?;

        let created_at = now();
        let record = JobRecord {
            id: JobId(id),
            class_path: class_path.to_string(),
            payload,
            created_at,
            available_at: options.available_at.unwrap_or(created_at),
            attempts: 0,
            failed: false,
            progress: None,
        };

        let _: () = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(self.job_key(record.id))
            .arg("class_path")
            .arg(&record.class_path)
            .arg("payload")
            .arg(record.payload.as_str())
            .arg("created_at")
            .arg(score(record.created_at))
            .arg("available_at")
            .arg(score(record.available_at))
            .arg("attempts")
            .arg(0)
            .arg("failed")
            .arg(0)
            .ignore()
            .cmd("ZADD")
            .arg(self.due_key())
            .arg(score(record.available_at))
            .arg(record.id.0)
            .ignore()
            .query_async(&mut conn)
            .await?;

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

        let mut conn = self.get_connection().await?;

        loop {
            let lease_until = now_plus(self.lease)?;
            let claimed: Option<String> = self
                .claim_script
                .key(self.due_key())
                .key(self.processing_key())
                .arg(score(now()))
                .arg(score(lease_until))
                .invoke_async(&mut conn)
                .await?;

            let Some(raw) = claimed else {
                return Ok(None);
            };
            let id = JobId(raw.parse().map_err(|_| {
                QueueError::storage(format!("Malformed job id in due set: {}", raw))
            })?);

            match self.load(&mut conn, id).await? {
                Some(record) => {
                    *slot = Some(Claim {
                        job_id: id,
                        attempts: record.attempts,
                        available_at: record.available_at,
                    });
                    return Ok(Some(record));
                }
                None => {
                    tracing::warn!(job_id = %id, "Due job has no hash, skipping");
                    let _: () = redis::cmd("ZREM")
                        .arg(self.processing_key())
                        .arg(id.0)
                        .query_async(&mut conn)
                        .await?;
                }
            }
        }
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>> {
        let mut conn = self.get_connection().await?;
        self.load(&mut conn, id).await
    }

    async fn reschedule(&self, job: &JobRecord, retry_after: Duration) -> Result<()> {
        let available_at = now_plus(retry_after)?;
        let mut slot = self.claim.lock().await;
        let claim = open_claim(&slot, job.id)?;
        let attempts = rescheduled_attempts(job, claim.attempts);

        let mut conn = self.get_connection().await?;
        let _: () = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(self.job_key(job.id))
            .arg("attempts")
            .arg(attempts)
            .arg("available_at")
            .arg(score(available_at))
            .ignore()
            .cmd("ZREM")
            .arg(self.processing_key())
            .arg(job.id.0)
            .ignore()
            .cmd("ZADD")
            .arg(self.due_key())
            .arg(score(available_at))
            .arg(job.id.0)
            .ignore()
            .query_async(&mut conn)
            .await?;

        *slot = None;
        Ok(())
    }

    async fn mark_failed(&self, job: &JobRecord) -> Result<()> {
        let mut slot = self.claim.lock().await;
        let claim = open_claim(&slot, job.id)?;
        let attempts = failed_attempts(job, claim.attempts);

        let mut conn = self.get_connection().await?;
        let _: () = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(self.job_key(job.id))
            .arg("attempts")
            .arg(attempts)
            .arg("failed")
            .arg(1)
            .ignore()
            .cmd("ZREM")
            .arg(self.processing_key())
            .arg(job.id.0)
            .ignore()
            .query_async(&mut conn)
            .await?;

        *slot = None;
        Ok(())
    }

    async fn remove(&self, id: JobId) -> Result<()> {
        let mut slot = self.claim.lock().await;
        open_claim(&slot, id)?;

        let mut conn = self.get_connection().await?;
        let _: () = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(self.job_key(id))
            .ignore()
            .cmd("ZREM")
            .arg(self.processing_key())
            .arg(id.0)
            .ignore()
            .query_async(&mut conn)
            .await?;

        *slot = None;
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        let mut slot = self.claim.lock().await;
        let Some(claim) = *slot else {
            return Ok(());
        };

        let mut conn = self.get_connection().await?;
        let _: () = redis::pipe()
            .atomic()
            .cmd("ZREM")
            .arg(self.processing_key())
            .arg(claim.job_id.0)
            .ignore()
            .cmd("ZADD")
            .arg(self.due_key())
            .arg(score(claim.available_at))
            .arg(claim.job_id.0)
            .ignore()
            .query_async(&mut conn)
            .await?;

        *slot = None;
        Ok(())
    }

    fn polling_delay(&self) -> Option<Duration> {
        Some(self.polling_delay)
    }

    /// Store progress and extend the lease on the claim
    async fn report_progress(&self, id: JobId, progress: serde_json::Value) -> Result<()> {
        let slot = self.claim.lock().await;
        if open_claim(&slot, id).is_err() {
            return Err(QueueError::invariant(format!(
                "cannot report progress for job {}: it is not claimed",
                id
            )));
        }

        let lease_until = now_plus(self.lease)?;
        let mut conn = self.get_connection().await?;
        let _: () = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(self.job_key(id))
            .arg("progress")
            .arg(serde_json::to_string(&progress)?)
            .ignore()
            .cmd("ZADD")
            .arg(self.processing_key())
            .arg("XX")
            .arg(score(lease_until))
            .arg(id.0)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // An open claim goes back to the due set
        self.release().await
    }
}
