//! Job-assignment callback contract and the reporting handle it gets.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use fleet_core::types::RobotId;
use futures::future::BoxFuture;
use futures::stream::SplitSink;
use futures::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::TunnelError;
use crate::protocol::{encode, JobAssignment, OutboundMessage, RobotStatus};

/// Reason sent back when an assignment arrives and no handler is set.
pub const NO_HANDLER_REASON: &str = "No job handler registered";

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub(crate) type WsSink = SplitSink<WsStream, Message>;

/// Work to run once an assignment has been accepted.
pub type JobWork = BoxFuture<'static, ()>;

/// A handler's answer to a `job_assign` frame.
pub enum JobDecision {
    /// Reply `job_accept`, then spawn the work, if any. The work is
    /// dropped unrun when the accept frame cannot be sent.
    Accept(Option<JobWork>),
    /// Reply `job_reject` with `reason`.
    Reject { reason: String },
}

impl JobDecision {
    /// Accept without follow-up work.
    pub fn accept() -> Self {
        Self::Accept(None)
    }

    /// Accept and run `work` after the accept frame is on the wire.
    pub fn accept_with(work: impl Future<Output = ()> + Send + 'static) -> Self {
        Self::Accept(Some(Box::pin(work)))
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Reject {
            reason: reason.into(),
        }
    }

    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept(_))
    }
}

impl fmt::Debug for JobDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accept(work) => f
                .debug_tuple("Accept")
                .field(&work.as_ref().map(|_| "<work>"))
                .finish(),
            Self::Reject { reason } => f.debug_struct("Reject").field("reason", reason).finish(),
        }
    }
}

/// Callback invoked for each `job_assign` frame.
///
/// Runs on the tunnel's receive loop, so it must decide quickly. Long
/// work goes in the future returned through [`JobDecision::accept_with`],
/// which can use `reporter` to send progress and the final outcome.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn on_job_assigned(&self, assignment: JobAssignment, reporter: Reporter) -> JobDecision;
}

/// Sends frames over the tunnel's current transport.
///
/// Cheap to clone. Sends made while disconnected fail with
/// [`TunnelError::NotConnected`]; the `report_*` helpers are best-effort
/// and only log such failures.
#[derive(Clone)]
pub struct Reporter {
    robot_id: RobotId,
    sink: Arc<Mutex<Option<WsSink>>>,
}

impl Reporter {
    pub(crate) fn new(robot_id: RobotId) -> Self {
        Self {
            robot_id,
            sink: Arc::new(Mutex::new(None)),
        }
    }

    pub fn robot_id(&self) -> &str {
        &self.robot_id
    }

    pub(crate) async fn attach(&self, sink: WsSink) {
        *self.sink.lock().await = Some(sink);
    }

    /// Drop the transport, sending a close frame first if it is still up.
    pub(crate) async fn detach(&self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.close().await;
        }
    }

    /// Send one frame. Frames from concurrent callers never interleave
    /// within a message.
    pub async fn send(&self, message: &OutboundMessage) -> Result<(), TunnelError> {
        let text = encode(message).map_err(|e| TunnelError::Protocol(e.to_string()))?;
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(TunnelError::NotConnected)?;
        sink.send(Message::Text(text))
            .await
            .map_err(|e| TunnelError::Transport(e.to_string()))?;
        tracing::trace!(kind = message.kind(), "Frame sent");
        Ok(())
    }

    async fn send_best_effort(&self, message: OutboundMessage) -> bool {
        match self.send(&message).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(kind = message.kind(), error = %e, "Failed to send report");
                false
            }
        }
    }

    /// Report progress (clamped to 0..=100). Returns whether it was sent.
    pub async fn report_job_progress(&self, job_id: &str, progress: u8, message: &str) -> bool {
        self.send_best_effort(OutboundMessage::job_progress(
            job_id,
            self.robot_id.clone(),
            progress,
            message,
        ))
        .await
    }

    pub async fn report_job_complete(&self, job_id: &str, result: serde_json::Value) -> bool {
        self.send_best_effort(OutboundMessage::JobComplete {
            job_id: job_id.to_string(),
            robot_id: self.robot_id.clone(),
            result,
            timestamp: Utc::now(),
        })
        .await
    }

    pub async fn report_job_failed(&self, job_id: &str, error: &str) -> bool {
        self.send_best_effort(OutboundMessage::JobFailed {
            job_id: job_id.to_string(),
            robot_id: self.robot_id.clone(),
            error: error.to_string(),
            timestamp: Utc::now(),
        })
        .await
    }

    pub async fn send_status_update(&self, status: RobotStatus, metadata: serde_json::Value) -> bool {
        self.send_best_effort(OutboundMessage::StatusUpdate {
            robot_id: self.robot_id.clone(),
            status,
            metadata,
            timestamp: Utc::now(),
        })
        .await
    }
}
