//! Tunnel wire protocol.
//!
//! Every frame is one JSON object in a WebSocket text message, tagged by
//! its `"type"` field. Robot-to-plane frames are [`OutboundMessage`];
//! plane-to-robot frames are [`InboundMessage`]. Unknown fields are
//! ignored so either side can add fields without breaking the other.

use chrono::{DateTime, Utc};
use fleet_core::capabilities::RobotCapabilities;
use serde::{Deserialize, Serialize};

/// Upper bound of a progress report.
pub const MAX_PROGRESS: u8 = 100;

/// Frames sent by the robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Register {
        robot_id: String,
        robot_name: String,
        capabilities: RobotCapabilities,
        timestamp: DateTime<Utc>,
    },
    Heartbeat {
        robot_id: String,
        timestamp: DateTime<Utc>,
    },
    JobAccept {
        job_id: String,
        robot_id: String,
        timestamp: DateTime<Utc>,
    },
    JobReject {
        job_id: String,
        robot_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    JobProgress {
        job_id: String,
        robot_id: String,
        progress: u8,
        message: String,
        timestamp: DateTime<Utc>,
    },
    JobComplete {
        job_id: String,
        robot_id: String,
        result: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
    JobFailed {
        job_id: String,
        robot_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    StatusUpdate {
        robot_id: String,
        status: RobotStatus,
        metadata: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
}

impl OutboundMessage {
    /// The `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Heartbeat { .. } => "heartbeat",
            Self::JobAccept { .. } => "job_accept",
            Self::JobReject { .. } => "job_reject",
            Self::JobProgress { .. } => "job_progress",
            Self::JobComplete { .. } => "job_complete",
            Self::JobFailed { .. } => "job_failed",
            Self::StatusUpdate { .. } => "status_update",
        }
    }

    /// Build a progress frame, clamping `progress` to 0..=100.
    pub fn job_progress(
        job_id: impl Into<String>,
        robot_id: impl Into<String>,
        progress: u8,
        message: impl Into<String>,
    ) -> Self {
        Self::JobProgress {
            job_id: job_id.into(),
            robot_id: robot_id.into(),
            progress: progress.min(MAX_PROGRESS),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Robot availability reported in `status_update` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotStatus {
    Idle,
    Busy,
    Paused,
    Error,
}

/// Frames sent by the control plane.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    RegisterAck {
        #[serde(default = "default_true")]
        success: bool,
        #[serde(default)]
        message: Option<String>,
    },
    HeartbeatAck {
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
    JobAssign(JobAssignment),
    Error {
        message: String,
        #[serde(default)]
        code: Option<String>,
    },
}

fn default_true() -> bool {
    true
}

/// Payload of a `job_assign` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAssignment {
    pub job_id: String,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub workflow_name: Option<String>,
    /// Opaque workflow definition handed to the executor.
    #[serde(alias = "workflow_definition")]
    pub workflow: serde_json::Value,
    #[serde(default)]
    pub variables: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub priority: i32,
}

impl JobAssignment {
    /// Workflow id for the executor, falling back to the job id.
    pub fn workflow_id(&self) -> &str {
        self.workflow_id.as_deref().unwrap_or(&self.job_id)
    }
}

/// Parse one inbound text frame.
///
/// Returns `Err` for malformed JSON or an unknown `type`.
pub fn parse_inbound(text: &str) -> Result<InboundMessage, serde_json::Error> {
    serde_json::from_str(text)
}

/// Serialize one outbound frame.
pub fn encode(message: &OutboundMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}
