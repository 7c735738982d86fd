//! Robot job entity and lease arithmetic.
//!
//! A lease is not stored as its own row: it is the pair
//! (`claimed_at`, `visibility_timeout_secs`) kept fresh by periodic
//! extend calls from the owning robot.

use serde::{Deserialize, Serialize};

use crate::status::JobStatus;
use crate::types::{DbId, RobotId, Timestamp};

/// Default visibility timeout for newly enqueued jobs.
pub const DEFAULT_VISIBILITY_TIMEOUT_SECS: i32 = 30;

/// A unit of automation work as seen by a robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: DbId,
    pub workflow_id: String,
    pub workflow_name: String,
    /// Opaque to this crate; interpreted only by the executor.
    pub workflow_definition: serde_json::Value,
    pub variables: serde_json::Map<String, serde_json::Value>,
    pub priority: i32,
    pub status: JobStatus,
    pub claimed_by: Option<RobotId>,
    pub claimed_at: Option<Timestamp>,
    pub visibility_timeout_secs: i32,
    /// Number of times the job has been claimed, including reclaims after
    /// an expired lease.
    pub attempts: i32,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
}

impl Job {
    /// Instant after which the current claim lapses, if the job is held.
    pub fn lease_deadline(&self) -> Option<Timestamp> {
        if !self.status.is_held() {
            return None;
        }
        self.claimed_at
            .map(|at| at + chrono::Duration::seconds(i64::from(self.visibility_timeout_secs)))
    }

    /// Held, but the lease ran out without an extension.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.lease_deadline().is_some_and(|deadline| deadline <= now)
    }

    /// Whether a robot may claim this job at `now`.
    pub fn is_claimable(&self, now: Timestamp) -> bool {
        self.status == JobStatus::Pending || self.is_expired(now)
    }

    /// Whether `robot_id` currently owns the job.
    pub fn is_held_by(&self, robot_id: &str) -> bool {
        self.status.is_held() && self.claimed_by.as_deref() == Some(robot_id)
    }
}

/// DTO for enqueueing a job.
#[derive(Debug, Clone, Deserialize)]
pub struct NewJob {
    pub workflow_id: String,
    pub workflow_name: String,
    pub workflow_definition: serde_json::Value,
    #[serde(default)]
    pub variables: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub priority: i32,
    pub visibility_timeout_secs: Option<i32>,
}

impl NewJob {
    /// Minimal job with an empty variable map and default priority.
    pub fn new(workflow_id: impl Into<String>, workflow_definition: serde_json::Value) -> Self {
        let workflow_id = workflow_id.into();
        Self {
            workflow_name: workflow_id.clone(),
            workflow_id,
            workflow_definition,
            variables: serde_json::Map::new(),
            priority: 0,
            visibility_timeout_secs: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_visibility_timeout(mut self, secs: i32) -> Self {
        self.visibility_timeout_secs = Some(secs);
        self
    }

    pub fn with_variables(mut self, variables: serde_json::Map<String, serde_json::Value>) -> Self {
        self.variables = variables;
        self
    }

    /// Visibility timeout to persist, falling back to the default.
    pub fn visibility_timeout(&self) -> i32 {
        self.visibility_timeout_secs
            .unwrap_or(DEFAULT_VISIBILITY_TIMEOUT_SECS)
    }
}
