//! The queue contract consumed by robots.
//!
//! Any backing store that offers a non-blocking locking read can
//! implement [`JobQueue`]. A queue instance is bound to one robot
//! identity; every ownership check compares against it.

use async_trait::async_trait;

use crate::job::Job;
use crate::types::DbId;

/// Outcome of a terminal transition (`complete_job` / `fail_job`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalTransition {
    /// The job moved from claimed/running to a terminal status.
    Applied,
    /// The job was already terminal; nothing changed.
    AlreadyTerminal,
}

/// Error taxonomy for queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The store could not be reached. Retry with backoff.
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    /// The job is held by another robot or was returned to pending.
    #[error("Ownership of job {job_id} lost")]
    OwnershipLost { job_id: DbId },

    /// The job does not exist.
    #[error("Job {0} not found")]
    NotFound(DbId),

    /// The store rejected the operation.
    #[error("Queue storage error: {0}")]
    Storage(String),
}

impl QueueError {
    /// Transient conditions that the poll loop retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Thin client over a job table, scoped to a single robot.
///
/// Calls on one instance are serialized by the owning agent except for
/// `extend_lease`, which the heartbeat loop issues concurrently.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Identity this consumer claims jobs under.
    fn robot_id(&self) -> &str;

    /// Claim the highest-priority available job, skipping rows another
    /// consumer has locked. `Ok(None)` when nothing is available.
    async fn claim_job(&self) -> Result<Option<Job>, QueueError>;

    /// Move a claimed job to running. `Ok(false)` if ownership was lost.
    async fn start_job(&self, job_id: DbId) -> Result<bool, QueueError>;

    /// Push the claim deadline `extension_secs` into the future.
    /// `Ok(false)` means the job no longer belongs to this robot.
    async fn extend_lease(&self, job_id: DbId, extension_secs: i32) -> Result<bool, QueueError>;

    /// Record success. Idempotent once terminal.
    async fn complete_job(
        &self,
        job_id: DbId,
        result: &serde_json::Value,
    ) -> Result<TerminalTransition, QueueError>;

    /// Record failure. Idempotent once terminal.
    async fn fail_job(&self, job_id: DbId, error: &str) -> Result<TerminalTransition, QueueError>;

    /// Voluntarily return a held job to pending. `Ok(false)` if this robot
    /// did not hold it.
    async fn release_job(&self, job_id: DbId) -> Result<bool, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unavailable_is_retryable() {
        assert!(QueueError::Unavailable("refused".into()).is_retryable());
        assert!(!QueueError::OwnershipLost { job_id: 1 }.is_retryable());
        assert!(!QueueError::Storage("syntax".into()).is_retryable());
        assert!(!QueueError::NotFound(9).is_retryable());
    }

    #[test]
    fn display_ownership_lost() {
        let err = QueueError::OwnershipLost { job_id: 42 };
        assert_eq!(err.to_string(), "Ownership of job 42 lost");
    }
}
