//! Integration tests for the PostgreSQL job queue.
//!
//! Exercises `JobRepo` and `PgJobQueue` against a real database to verify:
//! - Skip-locked claims never hand one job to two robots
//! - Lease extension keeps ownership; a lapsed lease is reclaimable
//! - Terminal transitions are idempotent
//! - Release returns a job to pending

use assert_matches::assert_matches;
use fleet_core::job::{Job, NewJob};
use fleet_core::queue::{JobQueue, QueueError, TerminalTransition};
use fleet_core::status::JobStatus;
use fleet_db::queue::PgJobQueue;
use fleet_db::repositories::JobRepo;
use serde_json::json;
use sqlx::PgPool;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn new_job(name: &str, priority: i32) -> NewJob {
    NewJob::new(name, json!({"nodes": [{"id": "start"}]}))
        .with_priority(priority)
        .with_visibility_timeout(30)
}

async fn enqueue(pool: &PgPool, name: &str, priority: i32) -> Job {
    let row = JobRepo::enqueue(pool, &new_job(name, priority)).await.unwrap();
    Job::try_from(row).unwrap()
}

/// Backdate a claim so its lease has already lapsed, as if the owning
/// robot crashed and stopped heartbeating.
async fn expire_lease(pool: &PgPool, job_id: i64) {
    sqlx::query(
        "UPDATE robot_jobs \
         SET claimed_at = NOW() - make_interval(secs => visibility_timeout_secs + 1) \
         WHERE id = $1",
    )
    .bind(job_id)
    .execute(pool)
    .await
    .unwrap();
}

async fn status_of(pool: &PgPool, job_id: i64) -> JobStatus {
    let id = JobRepo::find_status(pool, job_id).await.unwrap().unwrap();
    JobStatus::from_id(id).unwrap()
}

// ---------------------------------------------------------------------------
// Test: schema seeds the status lookup table
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "./migrations")]
async fn test_status_lookup_matches_enum(pool: PgPool) {
    let rows: Vec<(i16, String)> = sqlx::query_as("SELECT id, name FROM job_statuses ORDER BY id")
        .fetch_all(&pool)
        .await
        .unwrap();

    assert_eq!(rows.len(), 5);
    for (id, name) in rows {
        let status = JobStatus::from_id(id).expect("seeded id should map to an enum variant");
        assert_eq!(status.as_str(), name);
    }
}

// ---------------------------------------------------------------------------
// Test: claim ordering
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "./migrations")]
async fn test_claim_orders_by_priority(pool: PgPool) {
    let low = enqueue(&pool, "low", 1).await;
    let high = enqueue(&pool, "high", 9).await;
    let robot = PgJobQueue::new(pool.clone(), "robot-a");

    let first = robot.claim_job().await.unwrap().unwrap();
    assert_eq!(first.job_id, high.job_id);
    assert_eq!(first.status, JobStatus::Claimed);
    assert_eq!(first.claimed_by.as_deref(), Some("robot-a"));
    assert!(first.claimed_at.is_some());
    assert_eq!(first.attempts, 1);

    let second = robot.claim_job().await.unwrap().unwrap();
    assert_eq!(second.job_id, low.job_id);

    assert!(robot.claim_job().await.unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Test: a held job is invisible to other robots
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "./migrations")]
async fn test_second_robot_cannot_claim_held_job(pool: PgPool) {
    let j1 = enqueue(&pool, "J1", 5).await;
    let a = PgJobQueue::new(pool.clone(), "robot-a");
    let b = PgJobQueue::new(pool.clone(), "robot-b");

    assert_eq!(a.claim_job().await.unwrap().unwrap().job_id, j1.job_id);
    assert!(b.claim_job().await.unwrap().is_none());

    assert!(a.extend_lease(j1.job_id, 30).await.unwrap());
    assert!(a.extend_lease(j1.job_id, 30).await.unwrap());
    assert!(b.claim_job().await.unwrap().is_none());

    assert_eq!(
        a.complete_job(j1.job_id, &json!({"success": true})).await.unwrap(),
        TerminalTransition::Applied
    );
    assert!(b.claim_job().await.unwrap().is_none());
    assert!(a.claim_job().await.unwrap().is_none());
    assert_eq!(status_of(&pool, j1.job_id).await, JobStatus::Completed);
}

// ---------------------------------------------------------------------------
// Test: concurrent claims never double-dispatch
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "./migrations")]
async fn test_concurrent_claims_are_exclusive(pool: PgPool) {
    for i in 0..5 {
        enqueue(&pool, &format!("job-{i}"), 0).await;
    }

    let claims = futures::future::join_all((0..10).map(|i| {
        let robot = PgJobQueue::new(pool.clone(), format!("robot-{i}"));
        async move { robot.claim_job().await.unwrap() }
    }))
    .await;

    let mut claimed: Vec<i64> = claims.into_iter().flatten().map(|j| j.job_id).collect();
    assert_eq!(claimed.len(), 5, "every job claimed exactly once");
    claimed.sort_unstable();
    claimed.dedup();
    assert_eq!(claimed.len(), 5, "no job handed to two robots");
}

// ---------------------------------------------------------------------------
// Test: a crashed robot's job becomes reclaimable
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "./migrations")]
async fn test_lapsed_lease_is_reclaimed(pool: PgPool) {
    let j2 = enqueue(&pool, "J2", 0).await;
    let a = PgJobQueue::new(pool.clone(), "robot-a");
    let b = PgJobQueue::new(pool.clone(), "robot-b");

    a.claim_job().await.unwrap().unwrap();
    assert!(a.start_job(j2.job_id).await.unwrap());
    assert!(b.claim_job().await.unwrap().is_none());

    expire_lease(&pool, j2.job_id).await;
    let expired = JobRepo::list_expired(&pool).await.unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].id, j2.job_id);

    let reclaimed = b.claim_job().await.unwrap().unwrap();
    assert_eq!(reclaimed.job_id, j2.job_id);
    assert_eq!(reclaimed.claimed_by.as_deref(), Some("robot-b"));
    assert_eq!(reclaimed.status, JobStatus::Claimed);
    assert_eq!(reclaimed.attempts, 2);
    assert!(reclaimed.started_at.is_none());

    // The crashed robot, if it comes back, has lost the job.
    assert!(!a.extend_lease(j2.job_id, 30).await.unwrap());
    assert!(!a.start_job(j2.job_id).await.unwrap());
    assert_matches!(
        a.fail_job(j2.job_id, "late").await,
        Err(QueueError::OwnershipLost { job_id }) if job_id == j2.job_id
    );
}

// ---------------------------------------------------------------------------
// Test: an extended lease is not reclaimable
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "./migrations")]
async fn test_extension_refreshes_deadline(pool: PgPool) {
    let job = enqueue(&pool, "long", 0).await;
    let a = PgJobQueue::new(pool.clone(), "robot-a");
    let b = PgJobQueue::new(pool.clone(), "robot-b");

    a.claim_job().await.unwrap().unwrap();
    expire_lease(&pool, job.job_id).await;
    assert!(a.extend_lease(job.job_id, 60).await.unwrap());

    assert!(b.claim_job().await.unwrap().is_none());
    let row = JobRepo::find_by_id(&pool, job.job_id).await.unwrap().unwrap();
    assert_eq!(row.visibility_timeout_secs, 60);
    assert!(JobRepo::list_expired(&pool).await.unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Test: terminal transitions are idempotent
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "./migrations")]
async fn test_complete_and_fail_are_idempotent(pool: PgPool) {
    let job = enqueue(&pool, "once", 0).await;
    let a = PgJobQueue::new(pool.clone(), "robot-a");
    a.claim_job().await.unwrap().unwrap();

    assert_eq!(
        a.fail_job(job.job_id, "selector not found").await.unwrap(),
        TerminalTransition::Applied
    );
    let first = JobRepo::find_by_id(&pool, job.job_id).await.unwrap().unwrap();

    assert_eq!(
        a.fail_job(job.job_id, "selector not found").await.unwrap(),
        TerminalTransition::AlreadyTerminal
    );
    assert_eq!(
        a.complete_job(job.job_id, &json!({})).await.unwrap(),
        TerminalTransition::AlreadyTerminal
    );

    let second = JobRepo::find_by_id(&pool, job.job_id).await.unwrap().unwrap();
    assert_eq!(second.status_id, JobStatus::Failed.id());
    assert_eq!(second.error_message.as_deref(), Some("selector not found"));
    assert_eq!(second.completed_at, first.completed_at);
}

#[sqlx::test(migrations = "./migrations")]
async fn test_terminal_call_on_missing_job(pool: PgPool) {
    let a = PgJobQueue::new(pool.clone(), "robot-a");
    assert_matches!(
        a.complete_job(999_999, &json!({})).await,
        Err(QueueError::NotFound(999_999))
    );
}

// ---------------------------------------------------------------------------
// Test: release returns the job to pending
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "./migrations")]
async fn test_release_makes_job_claimable(pool: PgPool) {
    let job = enqueue(&pool, "resumable", 0).await;
    let a = PgJobQueue::new(pool.clone(), "robot-a");
    let b = PgJobQueue::new(pool.clone(), "robot-b");
    a.claim_job().await.unwrap().unwrap();

    assert!(!b.release_job(job.job_id).await.unwrap());
    assert!(a.release_job(job.job_id).await.unwrap());
    assert_eq!(status_of(&pool, job.job_id).await, JobStatus::Pending);
    assert_eq!(
        JobRepo::count_by_status(&pool, JobStatus::Pending).await.unwrap(),
        1
    );

    let reclaimed = b.claim_job().await.unwrap().unwrap();
    assert_eq!(reclaimed.job_id, job.job_id);
}
