//! Row model for the `robot_jobs` table.

use fleet_core::job::Job;
use fleet_core::status::{JobStatus, StatusId};
use fleet_core::types::{DbId, Timestamp};
use sqlx::FromRow;

/// A row from the `robot_jobs` table.
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: DbId,
    pub workflow_id: String,
    pub workflow_name: String,
    pub workflow_definition: serde_json::Value,
    pub variables: serde_json::Value,
    pub priority: i32,
    pub status_id: StatusId,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<Timestamp>,
    pub visibility_timeout_secs: i32,
    pub attempts: i32,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub updated_at: Timestamp,
}

/// A freshly claimed row plus whoever held it before, when the claim
/// took over a lapsed lease.
#[derive(Debug, Clone, FromRow)]
pub struct ClaimedRow {
    #[sqlx(flatten)]
    pub job: JobRow,
    pub previous_owner: Option<String>,
}

impl TryFrom<JobRow> for Job {
    type Error = sqlx::Error;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::from_id(row.status_id).ok_or_else(|| {
            sqlx::Error::Decode(format!("Unknown job status id {}", row.status_id).into())
        })?;
        let variables = match row.variables {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                return Err(sqlx::Error::Decode(
                    format!("Job {} variables must be a JSON object, got {other}", row.id).into(),
                ))
            }
        };

        Ok(Job {
            job_id: row.id,
            workflow_id: row.workflow_id,
            workflow_name: row.workflow_name,
            workflow_definition: row.workflow_definition,
            variables,
            priority: row.priority,
            status,
            claimed_by: row.claimed_by,
            claimed_at: row.claimed_at,
            visibility_timeout_secs: row.visibility_timeout_secs,
            attempts: row.attempts,
            result: row.result,
            error_message: row.error_message,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}
