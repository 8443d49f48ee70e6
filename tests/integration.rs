//! End-to-end tests for the job queue and the dual-tier cache against a
//! real SQLite database on disk (via tempfile).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use jobmill::{
    CacheClient, CacheStore, DispatchOutcome, Dispatcher, HandlerRegistry, JobQueue, JobStatus,
    JobStore, MaintenanceConfig, NewJob, QueueError, SqliteStorage, VolatileConfig,
};

async fn open_storage(dir: &tempfile::TempDir) -> Arc<SqliteStorage> {
    let path = dir.path().join("jobs.db");
    let url = format!("sqlite://{}?mode=rwc", path.display());
    Arc::new(SqliteStorage::new(&url).await.unwrap())
}

async fn open_queue(dir: &tempfile::TempDir) -> JobQueue {
    let path = dir.path().join("queue.db");
    let url = format!("sqlite://{}?mode=rwc", path.display());
    JobQueue::new(&url)
        .await
        .unwrap()
        .with_poll_interval(Duration::from_millis(20))
}

// ─── claim protocol ──────────────────────────────────────────────────

#[tokio::test]
async fn enqueue_claim_complete_walkthrough() {
    let dir = tempfile::tempdir().unwrap();
    let storage = open_storage(&dir).await;

    let id = storage
        .enqueue(NewJob::new("send_email", json!({"to": "a@x.com"})))
        .await
        .unwrap();
    assert_eq!(id.0, 1);

    let job = storage.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.priority, 5);
    assert_eq!(job.attempts, 0);

    let claimed = storage.claim_next().await.unwrap().unwrap();
    assert_eq!(claimed.id, id);
    assert_eq!(claimed.status, JobStatus::Processing);
    assert_eq!(claimed.attempts, 1);
    assert!(claimed.started_at.is_some());

    storage.complete(id).await.unwrap();
    let done = storage.get_job(id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert!(done.completed_at.is_some());

    // Completing a terminal job is a no-op, not an error.
    storage.complete(id).await.unwrap();
    let still_done = storage.get_job(id).await.unwrap().unwrap();
    assert_eq!(still_done.status, JobStatus::Completed);
}

#[tokio::test]
async fn claim_never_returns_future_scheduled_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let storage = open_storage(&dir).await;

    storage
        .enqueue(
            NewJob::new("generate_report", json!({"month": "07"}))
                .scheduled_at(Utc::now() + chrono::Duration::hours(1)),
        )
        .await
        .unwrap();

    assert!(storage.claim_next().await.unwrap().is_none());

    // A past scheduled_at is immediately eligible.
    let due = storage
        .enqueue(
            NewJob::new("generate_report", json!({"month": "06"}))
                .scheduled_at(Utc::now() - chrono::Duration::minutes(1)),
        )
        .await
        .unwrap();

    let claimed = storage.claim_next().await.unwrap().unwrap();
    assert_eq!(claimed.id, due);
}

#[tokio::test]
async fn concurrent_claims_have_a_single_winner() {
    let dir = tempfile::tempdir().unwrap();
    let storage = open_storage(&dir).await;

    storage
        .enqueue(NewJob::new("auto_payout", json!({"amount": 100})))
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        tokio::spawn({
            let storage = Arc::clone(&storage);
            async move { storage.claim_next().await.unwrap() }
        }),
        tokio::spawn({
            let storage = Arc::clone(&storage);
            async move { storage.claim_next().await.unwrap() }
        }),
    );

    let wins = [a.unwrap(), b.unwrap()]
        .iter()
        .filter(|r| r.is_some())
        .count();
    assert_eq!(wins, 1);
}

#[tokio::test]
async fn higher_priority_is_served_first() {
    let dir = tempfile::tempdir().unwrap();
    let storage = open_storage(&dir).await;

    let low = storage
        .enqueue(NewJob::new("send_notification", json!({})).with_priority(1))
        .await
        .unwrap();
    let high = storage
        .enqueue(NewJob::new("send_notification", json!({})).with_priority(9))
        .await
        .unwrap();

    assert_eq!(storage.claim_next().await.unwrap().unwrap().id, high);
    assert_eq!(storage.claim_next().await.unwrap().unwrap().id, low);
}

#[tokio::test]
async fn equal_priority_is_fifo() {
    let dir = tempfile::tempdir().unwrap();
    let storage = open_storage(&dir).await;

    let first = storage
        .enqueue(NewJob::new("update_kpi", json!({"n": 1})))
        .await
        .unwrap();
    let second = storage
        .enqueue(NewJob::new("update_kpi", json!({"n": 2})))
        .await
        .unwrap();

    assert_eq!(storage.claim_next().await.unwrap().unwrap().id, first);
    assert_eq!(storage.claim_next().await.unwrap().unwrap().id, second);
}

// ─── failure, retry, exhaustion ──────────────────────────────────────

#[tokio::test]
async fn retry_exhaustion_after_max_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let storage = open_storage(&dir).await;

    let id = storage
        .enqueue(NewJob::new("send_email", json!({})).with_max_attempts(3))
        .await
        .unwrap();

    for round in 1..=3u32 {
        let claimed = storage.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.attempts, round);

        let status = storage.fail(id, "x").await.unwrap().unwrap();
        if round < 3 {
            assert_eq!(status, JobStatus::Pending);
        } else {
            assert_eq!(status, JobStatus::Failed);
        }
    }

    // Exhausted: never claimable again.
    assert!(storage.claim_next().await.unwrap().is_none());

    let job = storage.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_message.as_deref(), Some("x"));
    assert!(job.completed_at.is_some());
}

#[tokio::test]
async fn manual_retry_resets_a_failed_job() {
    let dir = tempfile::tempdir().unwrap();
    let storage = open_storage(&dir).await;

    let id = storage
        .enqueue(NewJob::new("auto_payout", json!({})).with_max_attempts(1))
        .await
        .unwrap();

    storage.claim_next().await.unwrap().unwrap();
    assert_eq!(
        storage.fail(id, "gateway down").await.unwrap(),
        Some(JobStatus::Failed)
    );

    assert!(storage.retry(id).await.unwrap());

    let job = storage.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 0);
    assert!(job.error_message.is_none());

    // Claimable again.
    assert_eq!(storage.claim_next().await.unwrap().unwrap().id, id);
}

#[tokio::test]
async fn retry_rejects_non_failed_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let storage = open_storage(&dir).await;

    let id = storage
        .enqueue(NewJob::new("send_email", json!({})))
        .await
        .unwrap();

    assert!(!storage.retry(id).await.unwrap());
}

#[tokio::test]
async fn fail_on_a_non_processing_job_is_not_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let storage = open_storage(&dir).await;

    let id = storage
        .enqueue(NewJob::new("send_email", json!({})))
        .await
        .unwrap();

    assert!(storage.fail(id, "x").await.unwrap().is_none());

    let job = storage.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.error_message.is_none());
}

// ─── sweep & stats ───────────────────────────────────────────────────

#[tokio::test]
async fn sweep_removes_only_old_terminal_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let storage = open_storage(&dir).await;

    let completed = storage
        .enqueue(NewJob::new("send_email", json!({})))
        .await
        .unwrap();
    storage.claim_next().await.unwrap();
    storage.complete(completed).await.unwrap();

    let failed = storage
        .enqueue(NewJob::new("send_email", json!({})).with_max_attempts(1))
        .await
        .unwrap();
    storage.claim_next().await.unwrap();
    storage.fail(failed, "x").await.unwrap();

    let pending = storage
        .enqueue(NewJob::new("send_email", json!({})))
        .await
        .unwrap();
    let processing = storage
        .enqueue(NewJob::new("send_email", json!({})))
        .await
        .unwrap();
    storage.claim_next().await.unwrap();

    // Fresh terminal jobs survive a 30-day retention sweep.
    assert_eq!(storage.sweep(30).await.unwrap(), 0);

    // A zero-day cutoff removes the terminal jobs and nothing else.
    assert_eq!(storage.sweep(0).await.unwrap(), 2);
    assert!(storage.get_job(completed).await.unwrap().is_none());
    assert!(storage.get_job(failed).await.unwrap().is_none());
    assert!(storage.get_job(pending).await.unwrap().is_some());
    assert!(storage.get_job(processing).await.unwrap().is_some());
}

#[tokio::test]
async fn stats_default_absent_statuses_to_zero() {
    let dir = tempfile::tempdir().unwrap();
    let storage = open_storage(&dir).await;

    let stats = storage.stats().await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.processing, 0);
    assert_eq!(stats.completed, 0);
    assert_eq!(stats.failed, 0);

    storage
        .enqueue(NewJob::new("send_email", json!({})))
        .await
        .unwrap();
    let done = storage
        .enqueue(NewJob::new("send_email", json!({})))
        .await
        .unwrap();
    storage.claim_next().await.unwrap();
    storage.complete(done).await.unwrap();

    let stats = storage.stats().await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.processing, 0);
}

// ─── dispatcher ──────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct EmailArgs {
    to: String,
}

#[tokio::test]
async fn dispatch_success_completes_the_job() {
    let dir = tempfile::tempdir().unwrap();
    let storage = open_storage(&dir).await;

    let registry = Arc::new(HandlerRegistry::new());
    registry.register("send_email", |_args: EmailArgs| async { Ok(()) });

    let id = storage
        .enqueue(NewJob::new("send_email", json!({"to": "a@x.com"})))
        .await
        .unwrap();

    let dispatcher = Dispatcher::new(Arc::clone(&storage) as Arc<dyn JobStore>, registry);
    let job = storage.claim_next().await.unwrap().unwrap();

    let outcome = dispatcher.dispatch(&job).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Completed);
    assert_eq!(
        storage.get_job(id).await.unwrap().unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test]
async fn unsupported_job_type_consumes_an_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let storage = open_storage(&dir).await;

    let registry = Arc::new(HandlerRegistry::new());
    let dispatcher = Dispatcher::new(Arc::clone(&storage) as Arc<dyn JobStore>, registry);

    let id = storage
        .enqueue(NewJob::new("mystery", json!({})).with_max_attempts(2))
        .await
        .unwrap();

    let job = storage.claim_next().await.unwrap().unwrap();
    let outcome = dispatcher.dispatch(&job).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Requeued);

    let record = storage.get_job(id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Pending);
    assert_eq!(record.attempts, 1);
    assert!(record
        .error_message
        .as_deref()
        .unwrap()
        .contains("no handler"));

    // Second attempt exhausts it through the same path.
    let job = storage.claim_next().await.unwrap().unwrap();
    let outcome = dispatcher.dispatch(&job).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Failed);
}

#[tokio::test]
async fn failing_handler_requeues_then_exhausts() {
    let dir = tempfile::tempdir().unwrap();
    let storage = open_storage(&dir).await;

    let registry = Arc::new(HandlerRegistry::new());
    registry.register("send_email", |_args: EmailArgs| async {
        Err("smtp unreachable".to_string())
    });

    let dispatcher = Dispatcher::new(Arc::clone(&storage) as Arc<dyn JobStore>, registry);

    let id = storage
        .enqueue(NewJob::new("send_email", json!({"to": "a@x.com"})).with_max_attempts(2))
        .await
        .unwrap();

    let job = storage.claim_next().await.unwrap().unwrap();
    assert_eq!(
        dispatcher.dispatch(&job).await.unwrap(),
        DispatchOutcome::Requeued
    );

    let job = storage.claim_next().await.unwrap().unwrap();
    assert_eq!(
        dispatcher.dispatch(&job).await.unwrap(),
        DispatchOutcome::Failed
    );

    let record = storage.get_job(id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert!(record
        .error_message
        .as_deref()
        .unwrap()
        .contains("smtp unreachable"));
}

// ─── queue front door ────────────────────────────────────────────────

#[tokio::test]
async fn enqueue_rejects_empty_job_type() {
    let dir = tempfile::tempdir().unwrap();
    let queue = open_queue(&dir).await;

    let err = queue.enqueue(NewJob::new("", json!({}))).await.unwrap_err();
    assert!(matches!(err, QueueError::EmptyJobType));
}

#[tokio::test]
async fn enqueue_validates_registered_payload_schemas() {
    let dir = tempfile::tempdir().unwrap();
    let queue = open_queue(&dir).await;

    queue.register("send_email", |_args: EmailArgs| async { Ok(()) }, 3);

    // Wrong shape for a registered type fails at enqueue time.
    let err = queue
        .enqueue(NewJob::new("send_email", json!({"subject": 42})))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::InvalidPayload { .. }));

    // A matching payload and an unregistered type both pass.
    queue
        .enqueue(NewJob::new("send_email", json!({"to": "a@x.com"})))
        .await
        .unwrap();
    queue
        .enqueue(NewJob::new("imported_elsewhere", json!({"whatever": true})))
        .await
        .unwrap();
}

#[tokio::test]
async fn workers_process_typed_jobs_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let mut queue = open_queue(&dir).await;

    let sent = Arc::new(AtomicU32::new(0));
    let send_email = queue.register(
        "send_email",
        {
            let sent = Arc::clone(&sent);
            move |args: EmailArgs| {
                let sent = Arc::clone(&sent);
                async move {
                    assert!(!args.to.is_empty());
                    sent.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        },
        3,
    );

    queue.start(2);

    let id = send_email
        .enqueue(EmailArgs {
            to: "user@example.com".to_string(),
        })
        .await
        .unwrap();

    let mut completed = false;
    for _ in 0..100 {
        if queue.get_job(id).await.unwrap().unwrap().status == JobStatus::Completed {
            completed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(completed);
    assert_eq!(sent.load(Ordering::SeqCst), 1);

    queue.shutdown().await;
}

#[tokio::test]
async fn scheduled_jobs_run_after_their_delay() {
    let dir = tempfile::tempdir().unwrap();
    let mut queue = open_queue(&dir).await;

    let send_email = queue.register("send_email", |_args: EmailArgs| async { Ok(()) }, 3);
    queue.start(1);

    let id = send_email
        .schedule(
            EmailArgs {
                to: "later@example.com".to_string(),
            },
            Duration::from_millis(200),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(
        queue.get_job(id).await.unwrap().unwrap().status,
        JobStatus::Pending
    );

    let mut completed = false;
    for _ in 0..100 {
        if queue.get_job(id).await.unwrap().unwrap().status == JobStatus::Completed {
            completed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(completed);

    queue.shutdown().await;
}

// ─── cache layer ─────────────────────────────────────────────────────

#[tokio::test]
async fn cache_round_trip_with_ttl_expiry() {
    let dir = tempfile::tempdir().unwrap();
    let storage = open_storage(&dir).await;
    let cache = CacheClient::new(storage as Arc<dyn CacheStore>, Some(VolatileConfig::default()));

    cache
        .set("k", &json!({"a": 1}), Some(Duration::from_millis(150)))
        .await
        .unwrap();

    let hit: Option<serde_json::Value> = cache.get("k").await.unwrap();
    assert_eq!(hit, Some(json!({"a": 1})));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let miss: Option<serde_json::Value> = cache.get("k").await.unwrap();
    assert_eq!(miss, None);
}

#[tokio::test]
async fn cache_works_without_a_volatile_tier() {
    let dir = tempfile::tempdir().unwrap();
    let storage = open_storage(&dir).await;
    let cache = CacheClient::new(storage as Arc<dyn CacheStore>, None);

    assert!(!cache.is_accelerated());

    cache
        .set("k", &json!({"a": 1}), Some(Duration::from_secs(60)))
        .await
        .unwrap();

    let hit: Option<serde_json::Value> = cache.get("k").await.unwrap();
    assert_eq!(hit, Some(json!({"a": 1})));

    cache.delete("k").await.unwrap();
    let miss: Option<serde_json::Value> = cache.get("k").await.unwrap();
    assert_eq!(miss, None);
}

#[tokio::test]
async fn volatile_tier_survives_reads_after_durable_loss() {
    // The volatile tier is an accelerator: a value deleted straight
    // from the durable store may still be served until it expires.
    let dir = tempfile::tempdir().unwrap();
    let storage = open_storage(&dir).await;
    let cache = CacheClient::new(Arc::clone(&storage) as Arc<dyn CacheStore>, Some(VolatileConfig::default()));

    cache.set("k", &json!(1), None).await.unwrap();
    jobmill::CacheStore::delete_entry(storage.as_ref(), "k")
        .await
        .unwrap();

    let hit: Option<serde_json::Value> = cache.get("k").await.unwrap();
    assert_eq!(hit, Some(json!(1)));
}

#[tokio::test]
async fn clear_applies_pattern_to_both_tiers() {
    let dir = tempfile::tempdir().unwrap();
    let storage = open_storage(&dir).await;
    let cache = CacheClient::new(storage as Arc<dyn CacheStore>, Some(VolatileConfig::default()));

    cache.set("user:1", &json!(1), None).await.unwrap();
    cache.set("user:2", &json!(2), None).await.unwrap();
    cache.set("session:1", &json!(3), None).await.unwrap();

    let removed = cache.clear("user:*").await.unwrap();
    assert_eq!(removed, 2);

    let u1: Option<serde_json::Value> = cache.get("user:1").await.unwrap();
    let s1: Option<serde_json::Value> = cache.get("session:1").await.unwrap();
    assert_eq!(u1, None);
    assert_eq!(s1, Some(json!(3)));

    assert_eq!(cache.clear("*").await.unwrap(), 1);
    let s1: Option<serde_json::Value> = cache.get("session:1").await.unwrap();
    assert_eq!(s1, None);
}

#[tokio::test]
async fn remember_or_compute_invokes_the_producer_once() {
    let dir = tempfile::tempdir().unwrap();
    let storage = open_storage(&dir).await;
    let cache = CacheClient::new(storage as Arc<dyn CacheStore>, Some(VolatileConfig::default()));

    let calls = Arc::new(AtomicU32::new(0));

    for _ in 0..2 {
        let calls = Arc::clone(&calls);
        let value: u32 = cache
            .remember_or_compute("expensive", Some(Duration::from_secs(60)), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                42u32
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn expire_sweep_purges_only_expired_rows() {
    let dir = tempfile::tempdir().unwrap();
    let storage = open_storage(&dir).await;
    let cache = CacheClient::new(storage as Arc<dyn CacheStore>, None);

    cache
        .set("short", &json!(1), Some(Duration::from_millis(50)))
        .await
        .unwrap();
    cache
        .set("long", &json!(2), Some(Duration::from_secs(300)))
        .await
        .unwrap();
    cache.set("forever", &json!(3), None).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(cache.expire_sweep().await.unwrap(), 1);
    assert_eq!(cache.expire_sweep().await.unwrap(), 0);

    let long: Option<serde_json::Value> = cache.get("long").await.unwrap();
    let forever: Option<serde_json::Value> = cache.get("forever").await.unwrap();
    assert_eq!(long, Some(json!(2)));
    assert_eq!(forever, Some(json!(3)));
}

// ─── maintenance link ────────────────────────────────────────────────

#[tokio::test]
async fn maintenance_runs_cache_sweep_through_the_queue() {
    let dir = tempfile::tempdir().unwrap();
    let mut queue = open_queue(&dir).await;

    let cache = queue.cache(None);
    cache
        .set("stale", &json!(1), Some(Duration::from_millis(20)))
        .await
        .unwrap();

    queue.register_cache_sweep(cache.clone());
    queue.start(1);
    queue.start_maintenance(MaintenanceConfig {
        tick_interval: Duration::from_millis(50),
        job_retention_days: 30,
    });

    tokio::time::sleep(Duration::from_millis(60)).await;

    // The sweep job goes through the normal claim/dispatch path and
    // completes.
    let mut swept = false;
    for _ in 0..100 {
        let stats = queue.stats().await.unwrap();
        if stats.completed >= 1 {
            swept = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(swept);

    queue.shutdown().await;
}
