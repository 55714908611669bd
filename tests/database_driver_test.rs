#![cfg(feature = "database")]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use sea_orm::ConnectionTrait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tideway_queue::testing::{self, TestDb};
use tideway_queue::{
    DatabaseDriver, ExecuteOutcome, Job, JobContext, JobExt, JobId, JobPayload, JobRegistry,
    QueueDriver, QueueError, Result, StoreOptions,
};

async fn sqlite_driver() -> (TestDb, DatabaseDriver) {
    let db = TestDb::sqlite().await.expect("Failed to create test database");
    let driver = db.driver(Duration::from_millis(50)).unwrap();
    (db, driver)
}

fn payload(to: &str) -> JobPayload {
    JobPayload::dispatch("emails/send", &json!({ "to": to })).unwrap()
}

#[tokio::test]
async fn test_store_then_claim_returns_fresh_job() {
    let (_db, driver) = sqlite_driver().await;

    let stored = driver
        .store("emails/send", payload("a@example.com"), StoreOptions::default())
        .await
        .unwrap();
    assert_eq!(stored.attempts, 0);
    assert!(!stored.failed);

    let claimed = driver.get_next().await.unwrap().expect("job should be due");
    assert_eq!(claimed.id, stored.id);
    assert_eq!(claimed.class_path, "emails/send");
    assert_eq!(claimed.attempts, 0);

    driver.release().await.unwrap();

    let found = driver.get_job(stored.id).await.unwrap().unwrap();
    let decoded = found.payload.decode_dispatch::<serde_json::Value>().unwrap();
    assert_eq!(decoded.class_path, "emails/send");
    assert_eq!(decoded.data, json!({ "to": "a@example.com" }));
}

#[tokio::test]
async fn test_claims_oldest_due_job_first() {
    let (_db, driver) = sqlite_driver().await;

    let later = driver
        .store(
            "emails/send",
            payload("later@example.com"),
            StoreOptions::available_at(Utc::now() - ChronoDuration::seconds(10)),
        )
        .await
        .unwrap();
    let earlier = driver
        .store(
            "emails/send",
            payload("earlier@example.com"),
            StoreOptions::available_at(Utc::now() - ChronoDuration::seconds(60)),
        )
        .await
        .unwrap();

    let first = driver.get_next().await.unwrap().unwrap();
    assert_eq!(first.id, earlier.id);
    driver.remove(first.id).await.unwrap();

    let second = driver.get_next().await.unwrap().unwrap();
    assert_eq!(second.id, later.id);
    driver.release().await.unwrap();
}

#[tokio::test]
async fn test_delayed_job_is_not_due() {
    let (_db, driver) = sqlite_driver().await;

    driver
        .store(
            "emails/send",
            payload("a@example.com"),
            StoreOptions::available_at(Utc::now() + ChronoDuration::hours(1)),
        )
        .await
        .unwrap();

    assert!(driver.get_next().await.unwrap().is_none());
}

#[tokio::test]
async fn test_reschedule_delays_and_counts_attempt() {
    let (_db, driver) = sqlite_driver().await;

    let stored = driver
        .store("emails/send", payload("a@example.com"), StoreOptions::default())
        .await
        .unwrap();

    let claimed = driver.get_next().await.unwrap().unwrap();
    driver
        .reschedule(&claimed, Duration::from_secs(2))
        .await
        .unwrap();

    assert!(driver.get_next().await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(2100)).await;

    let again = driver.get_next().await.unwrap().expect("job should be due again");
    assert_eq!(again.id, stored.id);
    assert_eq!(again.attempts, 1);
    driver.release().await.unwrap();
}

#[tokio::test]
async fn test_reschedule_keeps_higher_attempt_count() {
    let (_db, driver) = sqlite_driver().await;

    driver
        .store("emails/send", payload("a@example.com"), StoreOptions::default())
        .await
        .unwrap();

    let mut claimed = driver.get_next().await.unwrap().unwrap();
    claimed.attempts = 4;
    driver.reschedule(&claimed, Duration::ZERO).await.unwrap();

    let found = driver.get_job(claimed.id).await.unwrap().unwrap();
    assert_eq!(found.attempts, 4);
}

#[tokio::test]
async fn test_mark_failed_hides_job() {
    let (_db, driver) = sqlite_driver().await;

    let stored = driver
        .store("emails/send", payload("a@example.com"), StoreOptions::default())
        .await
        .unwrap();

    let mut claimed = driver.get_next().await.unwrap().unwrap();
    claimed.attempts = 1;
    driver.mark_failed(&claimed).await.unwrap();

    assert!(driver.get_next().await.unwrap().is_none());

    let found = driver.get_job(stored.id).await.unwrap().unwrap();
    assert!(found.failed);
    assert_eq!(found.attempts, 1);
}

#[tokio::test]
async fn test_remove_deletes_row() {
    let (_db, driver) = sqlite_driver().await;

    let stored = driver
        .store("emails/send", payload("a@example.com"), StoreOptions::default())
        .await
        .unwrap();

    let claimed = driver.get_next().await.unwrap().unwrap();
    driver.remove(claimed.id).await.unwrap();

    assert!(driver.get_job(stored.id).await.unwrap().is_none());
    assert!(driver.get_next().await.unwrap().is_none());
}

#[tokio::test]
async fn test_dates_round_trip() {
    let (_db, driver) = sqlite_driver().await;

    let at = Utc::now() - ChronoDuration::minutes(5);
    let stored = driver
        .store(
            "emails/send",
            payload("a@example.com"),
            StoreOptions::available_at(at),
        )
        .await
        .unwrap();

    let found = driver.get_job(stored.id).await.unwrap().unwrap();
    assert_eq!(found.available_at, stored.available_at);
    assert_eq!(found.created_at, stored.created_at);
    assert!(found.created_at > found.available_at);
}

#[tokio::test]
async fn test_release_without_claim_is_noop() {
    let (_db, driver) = sqlite_driver().await;
    driver.release().await.unwrap();
    driver.release().await.unwrap();
}

#[tokio::test]
async fn test_mutation_without_claim_is_invariant_error() {
    let (_db, driver) = sqlite_driver().await;

    let stored = driver
        .store("emails/send", payload("a@example.com"), StoreOptions::default())
        .await
        .unwrap();

    let err = driver.remove(stored.id).await.unwrap_err();
    assert!(err.is_invariant());

    let err = driver
        .reschedule(&stored, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(err.is_invariant());

    let err = driver.mark_failed(&stored).await.unwrap_err();
    assert!(err.is_invariant());

    // the job is untouched
    let found = driver.get_job(stored.id).await.unwrap().unwrap();
    assert_eq!(found.attempts, 0);
    assert!(!found.failed);
}

#[tokio::test]
async fn test_second_claim_on_same_instance_is_invariant_error() {
    let (_db, driver) = sqlite_driver().await;

    for to in ["a@example.com", "b@example.com"] {
        driver
            .store("emails/send", payload(to), StoreOptions::default())
            .await
            .unwrap();
    }

    let claimed = driver.get_next().await.unwrap().unwrap();
    let err = driver.get_next().await.unwrap_err();
    assert!(err.is_invariant());

    let err = driver.remove(JobId(claimed.id.0 + 1)).await.unwrap_err();
    assert!(err.is_invariant());

    driver.remove(claimed.id).await.unwrap();
}

#[tokio::test]
async fn test_close_rolls_back_open_claim() {
    let (_db, driver) = sqlite_driver().await;

    let stored = driver
        .store("emails/send", payload("a@example.com"), StoreOptions::default())
        .await
        .unwrap();

    driver.get_next().await.unwrap().unwrap();
    driver.close().await.unwrap();

    let again = driver.get_next().await.unwrap().unwrap();
    assert_eq!(again.id, stored.id);
    assert_eq!(again.attempts, 0);
    driver.release().await.unwrap();
}

#[tokio::test]
async fn test_empty_table_name_is_rejected() {
    let db = TestDb::sqlite().await.unwrap();
    let mut config = db.driver_config(Duration::from_millis(50));
    config.table_name = String::new();

    let err = DatabaseDriver::new(db.connection(), config)
        .err()
        .expect("empty table name should be rejected");
    assert!(err.is_configuration());
}

#[tokio::test]
async fn test_negative_attempts_is_storage_error() {
    let (db, driver) = sqlite_driver().await;

    let stored = driver
        .store("emails/send", payload("a@example.com"), StoreOptions::default())
        .await
        .unwrap();
    db.connection
        .execute_unprepared("UPDATE jobs SET attempts = -1")
        .await
        .unwrap();

    assert!(driver.get_job(stored.id).await.unwrap_err().is_storage());
    assert!(driver.get_next().await.unwrap_err().is_storage());

    // the failed claim is not left open
    assert!(driver.get_next().await.unwrap_err().is_storage());
}

#[derive(Debug, Serialize, Deserialize)]
struct Bounces {
    to: String,
}

#[async_trait]
impl Job for Bounces {
    const CLASS_PATH: &'static str = "emails/bounces";
    const RETRIES: u32 = 3;
    const RETRY_AFTER: Duration = Duration::ZERO;

    async fn handle(&self, _ctx: &JobContext) -> Result<()> {
        Err(QueueError::job(format!("mailbox {} rejected", self.to)))
    }
}

#[tokio::test]
async fn test_manager_retries_then_fails_on_sqlite() {
    let (_db, driver) = sqlite_driver().await;
    let driver = Arc::new(driver);
    let jobs = JobRegistry::new();
    jobs.register::<Bounces>().await.unwrap();
    let manager = testing::manager_with(driver.clone(), jobs);

    let record = Bounces {
        to: "nobody@bounce.test".to_string(),
    }
    .dispatch(&manager)
    .send()
    .await
    .unwrap();

    for expected in [1, 2] {
        assert_eq!(
            manager.execute(None).await.unwrap(),
            ExecuteOutcome::Rescheduled(record.id)
        );
        let stored = driver.get_job(record.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, expected);
        assert!(!stored.failed);
    }

    assert_eq!(
        manager.execute(None).await.unwrap(),
        ExecuteOutcome::Failed(record.id)
    );
    let stored = driver.get_job(record.id).await.unwrap().unwrap();
    assert_eq!(stored.attempts, 3);
    assert!(stored.failed);

    assert_eq!(manager.execute(None).await.unwrap(), ExecuteOutcome::Empty);
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_concurrent_claims_skip_locked_rows() {
    let db = TestDb::postgres().await.unwrap();
    let first = db.driver(Duration::from_millis(50)).unwrap();
    let second = db.driver(Duration::from_millis(50)).unwrap();

    let a = first
        .store("emails/send", payload("a@example.com"), StoreOptions::default())
        .await
        .unwrap();
    let b = first
        .store("emails/send", payload("b@example.com"), StoreOptions::default())
        .await
        .unwrap();

    let claimed_first = first.get_next().await.unwrap().unwrap();
    let claimed_second = second.get_next().await.unwrap().unwrap();
    assert_eq!(claimed_first.id, a.id);
    assert_eq!(claimed_second.id, b.id);

    // a third instance finds nothing while both rows are locked
    let third = db.driver(Duration::from_millis(50)).unwrap();
    assert!(third.get_next().await.unwrap().is_none());

    first.release().await.unwrap();
    let reclaimed = third.get_next().await.unwrap().unwrap();
    assert_eq!(reclaimed.id, a.id);

    third.remove(reclaimed.id).await.unwrap();
    second.remove(claimed_second.id).await.unwrap();
    db.drop_table().await.unwrap();
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_concurrent_workers_never_share_a_job() {
    let db = TestDb::postgres().await.unwrap();
    let driver = db.driver(Duration::from_millis(50)).unwrap();

    for i in 0..20 {
        driver
            .store(
                "emails/send",
                payload(&format!("user{}@example.com", i)),
                StoreOptions::default(),
            )
            .await
            .unwrap();
    }

    let mut workers = Vec::new();
    for _ in 0..4 {
        let worker = db.driver(Duration::from_millis(50)).unwrap();
        workers.push(tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(job) = worker.get_next().await.unwrap() {
                seen.push(job.id);
                tokio::time::sleep(Duration::from_millis(5)).await;
                worker.remove(job.id).await.unwrap();
            }
            seen
        }));
    }

    let mut all = Vec::new();
    for worker in workers {
        all.extend(worker.await.unwrap());
    }
    let total = all.len();
    all.sort();
    all.dedup();
    assert_eq!(all.len(), total);
    assert_eq!(total, 20);

    db.drop_table().await.unwrap();
}
