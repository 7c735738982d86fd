//! PostgreSQL-backed [`JobQueue`] for a single robot.

use async_trait::async_trait;
use fleet_core::job::Job;
use fleet_core::queue::{JobQueue, QueueError, TerminalTransition};
use fleet_core::status::JobStatus;
use fleet_core::types::{DbId, RobotId};
use sqlx::PgPool;

use crate::repositories::JobRepo;

/// SQLSTATE classes that mean the server or link went away rather than
/// the statement being wrong.
const CONNECTION_EXCEPTION_CLASS: &str = "08";
const ADMIN_SHUTDOWN: &str = "57P01";
const CRASH_SHUTDOWN: &str = "57P02";
const CANNOT_CONNECT_NOW: &str = "57P03";

/// Queue consumer bound to one robot identity.
#[derive(Clone)]
pub struct PgJobQueue {
    pool: PgPool,
    robot_id: RobotId,
}

impl PgJobQueue {
    pub fn new(pool: PgPool, robot_id: impl Into<RobotId>) -> Self {
        Self {
            pool,
            robot_id: robot_id.into(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Resolve a no-op terminal update into its cause.
    async fn explain_noop(&self, job_id: DbId) -> Result<TerminalTransition, QueueError> {
        let status = JobRepo::find_status(&self.pool, job_id)
            .await
            .map_err(map_sqlx_error)?
            .ok_or(QueueError::NotFound(job_id))?;

        match JobStatus::from_id(status) {
            Some(s) if s.is_terminal() => Ok(TerminalTransition::AlreadyTerminal),
            _ => Err(QueueError::OwnershipLost { job_id }),
        }
    }
}

/// Classify a sqlx error as retryable (`Unavailable`) or not (`Storage`).
pub fn map_sqlx_error(e: sqlx::Error) -> QueueError {
    match &e {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => QueueError::Unavailable(e.to_string()),
        sqlx::Error::Database(db) => {
            let transient = db.code().is_some_and(|code| {
                code.starts_with(CONNECTION_EXCEPTION_CLASS)
                    || code == ADMIN_SHUTDOWN
                    || code == CRASH_SHUTDOWN
                    || code == CANNOT_CONNECT_NOW
            });
            if transient {
                QueueError::Unavailable(e.to_string())
            } else {
                QueueError::Storage(e.to_string())
            }
        }
        _ => QueueError::Storage(e.to_string()),
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    fn robot_id(&self) -> &str {
        &self.robot_id
    }

    async fn claim_job(&self) -> Result<Option<Job>, QueueError> {
        let Some(claimed) = JobRepo::claim_next(&self.pool, &self.robot_id)
            .await
            .map_err(map_sqlx_error)?
        else {
            return Ok(None);
        };

        if let Some(previous) = claimed.previous_owner.as_deref() {
            tracing::warn!(
                job_id = claimed.job.id,
                previous_owner = %previous,
                robot_id = %self.robot_id,
                attempts = claimed.job.attempts,
                "Reclaimed job with expired lease",
            );
        }

        Job::try_from(claimed.job)
            .map(Some)
            .map_err(|e| QueueError::Storage(e.to_string()))
    }

    async fn start_job(&self, job_id: DbId) -> Result<bool, QueueError> {
        JobRepo::mark_started(&self.pool, job_id, &self.robot_id)
            .await
            .map_err(map_sqlx_error)
    }

    async fn extend_lease(&self, job_id: DbId, extension_secs: i32) -> Result<bool, QueueError> {
        JobRepo::extend_lease(&self.pool, job_id, &self.robot_id, extension_secs)
            .await
            .map_err(map_sqlx_error)
    }

    async fn complete_job(
        &self,
        job_id: DbId,
        result: &serde_json::Value,
    ) -> Result<TerminalTransition, QueueError> {
        let applied = JobRepo::complete(&self.pool, job_id, &self.robot_id, result)
            .await
            .map_err(map_sqlx_error)?;
        if applied {
            Ok(TerminalTransition::Applied)
        } else {
            self.explain_noop(job_id).await
        }
    }

    async fn fail_job(&self, job_id: DbId, error: &str) -> Result<TerminalTransition, QueueError> {
        let applied = JobRepo::fail(&self.pool, job_id, &self.robot_id, error)
            .await
            .map_err(map_sqlx_error)?;
        if applied {
            Ok(TerminalTransition::Applied)
        } else {
            self.explain_noop(job_id).await
        }
    }

    async fn release_job(&self, job_id: DbId) -> Result<bool, QueueError> {
        JobRepo::release(&self.pool, job_id, &self.robot_id)
            .await
            .map_err(map_sqlx_error)
    }
}
