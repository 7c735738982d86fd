//! Repository for the `robot_jobs` table.
//!
//! Uses `JobStatus` from `fleet_core::status` for all status transitions.
//! Every ownership-sensitive statement filters on `claimed_by` and a held
//! status, so a robot that lost its lease can never overwrite the row.

use fleet_core::job::NewJob;
use fleet_core::status::{JobStatus, StatusId};
use fleet_core::types::DbId;
use sqlx::PgPool;

use crate::models::job::{ClaimedRow, JobRow};

/// Column list for `robot_jobs` queries.
const COLUMNS: &str = "\
    id, workflow_id, workflow_name, workflow_definition, variables, \
    priority, status_id, claimed_by, claimed_at, visibility_timeout_secs, \
    attempts, result, error_message, \
    created_at, started_at, completed_at, updated_at";

/// A row is claimable when pending, or held with a lapsed lease.
const CLAIMABLE_PREDICATE: &str = "\
    status_id = $3 \
    OR (status_id IN ($2, $4) \
        AND claimed_at + make_interval(secs => visibility_timeout_secs) <= NOW())";

/// Provides queue operations for robot jobs.
pub struct JobRepo;

impl JobRepo {
    /// Insert a new pending job.
    pub async fn enqueue(pool: &PgPool, input: &NewJob) -> Result<JobRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO robot_jobs \
                 (workflow_id, workflow_name, workflow_definition, variables, \
                  priority, status_id, visibility_timeout_secs) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(&input.workflow_id)
            .bind(&input.workflow_name)
            .bind(&input.workflow_definition)
            .bind(serde_json::Value::Object(input.variables.clone()))
            .bind(input.priority)
            .bind(JobStatus::Pending.id())
            .bind(input.visibility_timeout())
            .fetch_one(pool)
            .await
    }

    /// Atomically claim the next available job for a robot.
    ///
    /// Uses `SELECT FOR UPDATE SKIP LOCKED` so concurrent robots never
    /// block on, or double-claim, a row another robot is inspecting.
    /// Rows whose lease has lapsed are taken over and their previous
    /// owner is returned for logging.
    pub async fn claim_next(
        pool: &PgPool,
        robot_id: &str,
    ) -> Result<Option<ClaimedRow>, sqlx::Error> {
        let query = format!(
            "WITH candidate AS ( \
                 SELECT id AS candidate_id, claimed_by AS previous_owner \
                 FROM robot_jobs \
                 WHERE {CLAIMABLE_PREDICATE} \
                 ORDER BY priority DESC, created_at ASC, id ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE robot_jobs \
             SET status_id = $2, claimed_by = $1, claimed_at = NOW(), \
                 started_at = NULL, attempts = attempts + 1 \
             FROM candidate \
             WHERE robot_jobs.id = candidate.candidate_id \
             RETURNING {COLUMNS}, candidate.previous_owner"
        );
        sqlx::query_as::<_, ClaimedRow>(&query)
            .bind(robot_id)
            .bind(JobStatus::Claimed.id())
            .bind(JobStatus::Pending.id())
            .bind(JobStatus::Running.id())
            .fetch_optional(pool)
            .await
    }

    /// Move a claimed job to running and stamp `started_at`.
    ///
    /// Returns `false` if `robot_id` no longer holds the job.
    pub async fn mark_started(
        pool: &PgPool,
        job_id: DbId,
        robot_id: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE robot_jobs \
             SET status_id = $3, started_at = COALESCE(started_at, NOW()) \
             WHERE id = $1 AND claimed_by = $2 AND status_id IN ($4, $3)",
        )
        .bind(job_id)
        .bind(robot_id)
        .bind(JobStatus::Running.id())
        .bind(JobStatus::Claimed.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Restart the lease clock: the job stays owned for another
    /// `extension_secs` from now.
    pub async fn extend_lease(
        pool: &PgPool,
        job_id: DbId,
        robot_id: &str,
        extension_secs: i32,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE robot_jobs \
             SET claimed_at = NOW(), visibility_timeout_secs = $3 \
             WHERE id = $1 AND claimed_by = $2 AND status_id IN ($4, $5)",
        )
        .bind(job_id)
        .bind(robot_id)
        .bind(extension_secs)
        .bind(JobStatus::Claimed.id())
        .bind(JobStatus::Running.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Mark a held job completed with its result payload.
    ///
    /// Returns `false` when nothing changed; call [`Self::find_status`]
    /// to tell an already-terminal job from a lost one.
    pub async fn complete(
        pool: &PgPool,
        job_id: DbId,
        robot_id: &str,
        result: &serde_json::Value,
    ) -> Result<bool, sqlx::Error> {
        let outcome = sqlx::query(
            "UPDATE robot_jobs \
             SET status_id = $3, result = $4, error_message = NULL, completed_at = NOW() \
             WHERE id = $1 AND claimed_by = $2 AND status_id IN ($5, $6)",
        )
        .bind(job_id)
        .bind(robot_id)
        .bind(JobStatus::Completed.id())
        .bind(result)
        .bind(JobStatus::Claimed.id())
        .bind(JobStatus::Running.id())
        .execute(pool)
        .await?;
        Ok(outcome.rows_affected() > 0)
    }

    /// Mark a held job failed with an error message.
    ///
    /// No automatic retry is performed.
    pub async fn fail(
        pool: &PgPool,
        job_id: DbId,
        robot_id: &str,
        error: &str,
    ) -> Result<bool, sqlx::Error> {
        let outcome = sqlx::query(
            "UPDATE robot_jobs \
             SET status_id = $3, error_message = $4, completed_at = NOW() \
             WHERE id = $1 AND claimed_by = $2 AND status_id IN ($5, $6)",
        )
        .bind(job_id)
        .bind(robot_id)
        .bind(JobStatus::Failed.id())
        .bind(error)
        .bind(JobStatus::Claimed.id())
        .bind(JobStatus::Running.id())
        .execute(pool)
        .await?;
        Ok(outcome.rows_affected() > 0)
    }

    /// Return a held job to pending so any robot can claim it.
    pub async fn release(pool: &PgPool, job_id: DbId, robot_id: &str) -> Result<bool, sqlx::Error> {
        let outcome = sqlx::query(
            "UPDATE robot_jobs \
             SET status_id = $3, claimed_by = NULL, claimed_at = NULL, started_at = NULL \
             WHERE id = $1 AND claimed_by = $2 AND status_id IN ($4, $5)",
        )
        .bind(job_id)
        .bind(robot_id)
        .bind(JobStatus::Pending.id())
        .bind(JobStatus::Claimed.id())
        .bind(JobStatus::Running.id())
        .execute(pool)
        .await?;
        Ok(outcome.rows_affected() > 0)
    }

    /// Current status of a job, or `None` if it does not exist.
    pub async fn find_status(pool: &PgPool, job_id: DbId) -> Result<Option<StatusId>, sqlx::Error> {
        sqlx::query_scalar::<_, StatusId>("SELECT status_id FROM robot_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(pool)
            .await
    }

    /// Find a job by its ID.
    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<JobRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM robot_jobs WHERE id = $1");
        sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Count jobs in a given status.
    pub async fn count_by_status(pool: &PgPool, status: JobStatus) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM robot_jobs WHERE status_id = $1")
            .bind(status.id())
            .fetch_one(pool)
            .await
    }

    /// Held jobs whose lease has lapsed, oldest deadline first.
    ///
    /// Expiry is derived, never stored; this is the audit view of it.
    pub async fn list_expired(pool: &PgPool) -> Result<Vec<JobRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM robot_jobs \
             WHERE status_id IN ($1, $2) \
               AND claimed_at + make_interval(secs => visibility_timeout_secs) <= NOW() \
             ORDER BY claimed_at + make_interval(secs => visibility_timeout_secs) ASC"
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(JobStatus::Claimed.id())
            .bind(JobStatus::Running.id())
            .fetch_all(pool)
            .await
    }
}
