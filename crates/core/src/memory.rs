//! In-process queue backend.
//!
//! [`InMemoryJobStore`] holds the job table; each robot gets its own
//! [`InMemoryJobQueue`] consumer from [`InMemoryJobStore::consumer`]. A
//! single mutex plays the part of the store's locking read, so at most
//! one consumer inspects the table at a time and no claim can overlap.
//!
//! Lease deadlines are measured on the tokio clock, which lets tests
//! simulate a crashed robot with `tokio::time::pause` / `advance`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;

use crate::job::{Job, NewJob};
use crate::queue::{JobQueue, QueueError, TerminalTransition};
use crate::status::JobStatus;
use crate::types::{DbId, RobotId};

struct Entry {
    job: Job,
    lease_deadline: Option<Instant>,
}

impl Entry {
    fn is_claimable(&self, now: Instant) -> bool {
        match self.job.status {
            JobStatus::Pending => true,
            JobStatus::Claimed | JobStatus::Running => {
                self.lease_deadline.is_some_and(|deadline| deadline <= now)
            }
            JobStatus::Completed | JobStatus::Failed => false,
        }
    }
}

#[derive(Default)]
struct StoreInner {
    jobs: BTreeMap<DbId, Entry>,
    next_id: DbId,
    unavailable: bool,
}

/// Shared job table. Cheap to clone.
#[derive(Clone, Default)]
pub struct InMemoryJobStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        // A panic while holding the lock cannot leave a half-written entry:
        // every mutation is a single assignment.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert a pending job and return it.
    pub fn enqueue(&self, new_job: NewJob) -> Job {
        let mut inner = self.lock();
        inner.next_id += 1;
        let visibility_timeout_secs = new_job.visibility_timeout();
        let job = Job {
            job_id: inner.next_id,
            workflow_id: new_job.workflow_id,
            workflow_name: new_job.workflow_name,
            workflow_definition: new_job.workflow_definition,
            variables: new_job.variables,
            priority: new_job.priority,
            status: JobStatus::Pending,
            claimed_by: None,
            claimed_at: None,
            visibility_timeout_secs,
            attempts: 0,
            result: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        inner.jobs.insert(
            job.job_id,
            Entry {
                job: job.clone(),
                lease_deadline: None,
            },
        );
        job
    }

    /// Snapshot of a job row.
    pub fn get(&self, job_id: DbId) -> Option<Job> {
        self.lock().jobs.get(&job_id).map(|e| e.job.clone())
    }

    /// Number of jobs in `status`.
    pub fn count_by_status(&self, status: JobStatus) -> usize {
        self.lock()
            .jobs
            .values()
            .filter(|e| e.job.status == status)
            .count()
    }

    /// IDs of held jobs whose lease has run out.
    pub fn expired_job_ids(&self) -> Vec<DbId> {
        let now = Instant::now();
        self.lock()
            .jobs
            .values()
            .filter(|e| e.job.status.is_held() && e.is_claimable(now))
            .map(|e| e.job.job_id)
            .collect()
    }

    /// Simulate a store outage: every operation fails with
    /// [`QueueError::Unavailable`] until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// A consumer bound to `robot_id`.
    pub fn consumer(&self, robot_id: impl Into<RobotId>) -> InMemoryJobQueue {
        InMemoryJobQueue {
            store: self.clone(),
            robot_id: robot_id.into(),
        }
    }

    fn guarded(&self) -> Result<MutexGuard<'_, StoreInner>, QueueError> {
        let inner = self.lock();
        if inner.unavailable {
            return Err(QueueError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(inner)
    }
}

/// [`JobQueue`] over an [`InMemoryJobStore`], scoped to one robot.
#[derive(Clone)]
pub struct InMemoryJobQueue {
    store: InMemoryJobStore,
    robot_id: RobotId,
}

impl InMemoryJobQueue {
    pub fn store(&self) -> &InMemoryJobStore {
        &self.store
    }

    fn terminal(
        &self,
        job_id: DbId,
        status: JobStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<TerminalTransition, QueueError> {
        let mut inner = self.store.guarded()?;
        let entry = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueError::NotFound(job_id))?;

        if entry.job.status.is_terminal() {
            return Ok(TerminalTransition::AlreadyTerminal);
        }
        if !entry.job.is_held_by(&self.robot_id) {
            return Err(QueueError::OwnershipLost { job_id });
        }

        entry.job.status = status;
        entry.job.result = result;
        entry.job.error_message = error;
        entry.job.completed_at = Some(Utc::now());
        entry.lease_deadline = None;
        Ok(TerminalTransition::Applied)
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    fn robot_id(&self) -> &str {
        &self.robot_id
    }

    async fn claim_job(&self) -> Result<Option<Job>, QueueError> {
        let mut inner = self.store.guarded()?;
        let now = Instant::now();

        // Highest priority first, then oldest (lowest id).
        let candidate = inner
            .jobs
            .values()
            .filter(|e| e.is_claimable(now))
            .max_by(|a, b| {
                a.job
                    .priority
                    .cmp(&b.job.priority)
                    .then_with(|| b.job.job_id.cmp(&a.job.job_id))
            })
            .map(|e| e.job.job_id);

        let Some(job_id) = candidate else {
            return Ok(None);
        };
        let Some(entry) = inner.jobs.get_mut(&job_id) else {
            return Ok(None);
        };

        if let Some(previous) = entry.job.claimed_by.as_deref() {
            tracing::warn!(
                job_id,
                previous_owner = %previous,
                robot_id = %self.robot_id,
                "Reclaiming job with expired lease",
            );
        }

        let visibility = Duration::from_secs(entry.job.visibility_timeout_secs.max(0) as u64);
        entry.job.status = JobStatus::Claimed;
        entry.job.claimed_by = Some(self.robot_id.clone());
        entry.job.claimed_at = Some(Utc::now());
        entry.job.attempts += 1;
        entry.lease_deadline = Some(now + visibility);
        Ok(Some(entry.job.clone()))
    }

    async fn start_job(&self, job_id: DbId) -> Result<bool, QueueError> {
        let mut inner = self.store.guarded()?;
        let entry = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueError::NotFound(job_id))?;
        if !entry.job.is_held_by(&self.robot_id) {
            return Ok(false);
        }
        entry.job.status = JobStatus::Running;
        entry.job.started_at = Some(Utc::now());
        Ok(true)
    }

    async fn extend_lease(&self, job_id: DbId, extension_secs: i32) -> Result<bool, QueueError> {
        let mut inner = self.store.guarded()?;
        let Some(entry) = inner.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if !entry.job.is_held_by(&self.robot_id) {
            return Ok(false);
        }
        entry.job.claimed_at = Some(Utc::now());
        entry.job.visibility_timeout_secs = extension_secs;
        entry.lease_deadline =
            Some(Instant::now() + Duration::from_secs(extension_secs.max(0) as u64));
        Ok(true)
    }

    async fn complete_job(
        &self,
        job_id: DbId,
        result: &serde_json::Value,
    ) -> Result<TerminalTransition, QueueError> {
        self.terminal(job_id, JobStatus::Completed, Some(result.clone()), None)
    }

    async fn fail_job(&self, job_id: DbId, error: &str) -> Result<TerminalTransition, QueueError> {
        self.terminal(job_id, JobStatus::Failed, None, Some(error.to_string()))
    }

    async fn release_job(&self, job_id: DbId) -> Result<bool, QueueError> {
        let mut inner = self.store.guarded()?;
        let Some(entry) = inner.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if !entry.job.is_held_by(&self.robot_id) {
            return Ok(false);
        }
        entry.job.status = JobStatus::Pending;
        entry.job.claimed_by = None;
        entry.job.claimed_at = None;
        entry.job.started_at = None;
        entry.lease_deadline = None;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn job(priority: i32, visibility: i32) -> NewJob {
        NewJob::new("wf", json!({"nodes": []}))
            .with_priority(priority)
            .with_visibility_timeout(visibility)
    }

    // -----------------------------------------------------------------------
    // Claim ordering and exclusion
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn claims_highest_priority_then_oldest() {
        let store = InMemoryJobStore::new();
        let low = store.enqueue(job(1, 30));
        let high_old = store.enqueue(job(9, 30));
        let high_new = store.enqueue(job(9, 30));
        let robot = store.consumer("robot-a");

        assert_eq!(robot.claim_job().await.unwrap().unwrap().job_id, high_old.job_id);
        assert_eq!(robot.claim_job().await.unwrap().unwrap().job_id, high_new.job_id);
        assert_eq!(robot.claim_job().await.unwrap().unwrap().job_id, low.job_id);
        assert!(robot.claim_job().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn held_job_is_invisible_to_other_robots() {
        let store = InMemoryJobStore::new();
        let j1 = store.enqueue(job(5, 30));
        let a = store.consumer("robot-a");
        let b = store.consumer("robot-b");

        let claimed = a.claim_job().await.unwrap().unwrap();
        assert_eq!(claimed.job_id, j1.job_id);
        assert_eq!(claimed.status, JobStatus::Claimed);
        assert_eq!(claimed.claimed_by.as_deref(), Some("robot-a"));
        assert_eq!(claimed.attempts, 1);

        assert!(b.claim_job().await.unwrap().is_none());
    }

    // -----------------------------------------------------------------------
    // Leases
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn extending_at_half_timeout_keeps_ownership() {
        let store = InMemoryJobStore::new();
        let j1 = store.enqueue(job(5, 30));
        let a = store.consumer("robot-a");
        let b = store.consumer("robot-b");
        a.claim_job().await.unwrap().unwrap();

        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(15)).await;
            assert!(a.extend_lease(j1.job_id, 30).await.unwrap());
            assert!(b.claim_job().await.unwrap().is_none());
        }

        assert_eq!(
            a.complete_job(j1.job_id, &json!({"success": true})).await.unwrap(),
            TerminalTransition::Applied
        );
        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(b.claim_job().await.unwrap().is_none());
        assert!(a.claim_job().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn crashed_robot_job_becomes_claimable_after_timeout() {
        let store = InMemoryJobStore::new();
        let j2 = store.enqueue(job(0, 30));
        let a = store.consumer("robot-a");
        let b = store.consumer("robot-b");
        a.claim_job().await.unwrap().unwrap();

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(b.claim_job().await.unwrap().is_none());
        assert!(store.expired_job_ids().is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.expired_job_ids(), vec![j2.job_id]);
        let reclaimed = b.claim_job().await.unwrap().unwrap();
        assert_eq!(reclaimed.job_id, j2.job_id);
        assert_eq!(reclaimed.claimed_by.as_deref(), Some("robot-b"));
        assert_eq!(reclaimed.attempts, 2);

        // The original robot has lost the job for good.
        assert!(!a.extend_lease(j2.job_id, 30).await.unwrap());
        assert_matches!(
            a.complete_job(j2.job_id, &json!({})).await,
            Err(QueueError::OwnershipLost { .. })
        );
    }

    // -----------------------------------------------------------------------
    // Terminal transitions
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn terminal_transitions_are_idempotent() {
        let store = InMemoryJobStore::new();
        let j = store.enqueue(job(0, 30));
        let a = store.consumer("robot-a");
        a.claim_job().await.unwrap().unwrap();
        assert!(a.start_job(j.job_id).await.unwrap());

        assert_eq!(
            a.complete_job(j.job_id, &json!({"rows": 1})).await.unwrap(),
            TerminalTransition::Applied
        );
        let after_first = store.get(j.job_id).unwrap();

        assert_eq!(
            a.complete_job(j.job_id, &json!({"rows": 2})).await.unwrap(),
            TerminalTransition::AlreadyTerminal
        );
        assert_eq!(
            a.fail_job(j.job_id, "late failure").await.unwrap(),
            TerminalTransition::AlreadyTerminal
        );
        assert_eq!(store.get(j.job_id).unwrap(), after_first);
        assert_eq!(after_first.status, JobStatus::Completed);
        assert_eq!(after_first.result, Some(json!({"rows": 1})));
    }

    #[tokio::test]
    async fn release_returns_job_to_pending() {
        let store = InMemoryJobStore::new();
        let j = store.enqueue(job(0, 30));
        let a = store.consumer("robot-a");
        let b = store.consumer("robot-b");
        a.claim_job().await.unwrap().unwrap();

        assert!(!b.release_job(j.job_id).await.unwrap());
        assert!(a.release_job(j.job_id).await.unwrap());
        assert_eq!(store.get(j.job_id).unwrap().status, JobStatus::Pending);
        assert_eq!(b.claim_job().await.unwrap().unwrap().job_id, j.job_id);
    }

    #[tokio::test]
    async fn outage_surfaces_as_retryable_error() {
        let store = InMemoryJobStore::new();
        store.enqueue(job(0, 30));
        let a = store.consumer("robot-a");

        store.set_unavailable(true);
        let err = a.claim_job().await.unwrap_err();
        assert!(err.is_retryable());

        store.set_unavailable(false);
        assert!(a.claim_job().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unknown_job_is_not_found_for_terminal_calls() {
        let store = InMemoryJobStore::new();
        let a = store.consumer("robot-a");
        assert_matches!(a.complete_job(77, &json!({})).await, Err(QueueError::NotFound(77)));
        assert!(!a.extend_lease(77, 30).await.unwrap());
    }
}
