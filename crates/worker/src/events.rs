//! Lifecycle state and events emitted by a [`RobotAgent`](crate::agent::RobotAgent).
//!
//! Events are broadcast to any number of subscribers. A lagging or
//! absent subscriber never slows the agent down.

use std::fmt;

use fleet_core::types::DbId;
use serde::Serialize;

/// Coarse lifecycle of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl AgentState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that happened inside the agent's loops.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    StateChanged { state: AgentState },

    /// A job was claimed and is about to execute.
    JobClaimed { job_id: DbId, attempts: i32 },

    /// The executor finished and the job was marked completed.
    JobCompleted { job_id: DbId },

    /// The job was marked failed.
    JobFailed { job_id: DbId, error: String },

    /// The heartbeat loop pushed the lease deadline forward.
    LeaseExtended { job_id: DbId },

    /// Another robot took the job over, or it was returned to pending.
    OwnershipLost { job_id: DbId },

    /// The job was handed back to the queue during shutdown.
    JobReleased { job_id: DbId },

    /// The job was left claimed at shutdown; its lease will expire.
    JobAbandoned { job_id: DbId },

    /// A queue call failed with a transient error. The agent retries
    /// after `retry_in_ms`.
    QueueUnavailable { error: String, retry_in_ms: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_value(AgentEvent::JobFailed {
            job_id: 7,
            error: "timeout".into(),
        })
        .unwrap();
        assert_eq!(json["event"], "job_failed");
        assert_eq!(json["job_id"], 7);
    }

    #[test]
    fn state_display() {
        assert_eq!(AgentState::Stopping.to_string(), "stopping");
    }
}
