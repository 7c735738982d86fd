//! [`JobHandler`] that runs assignments through a [`WorkflowExecutor`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use fleet_core::executor::{ExecutorError, WorkflowExecutor};
use tokio::sync::Semaphore;

use crate::handler::{JobDecision, JobHandler, Reporter};
use crate::protocol::JobAssignment;

pub const AT_CAPACITY_REASON: &str = "Robot at capacity";
pub const SHUTTING_DOWN_REASON: &str = "Robot shutting down";

/// Accepts assignments while fewer than `max_concurrent` are running and
/// reports each outcome back over the tunnel.
pub struct ExecutorJobHandler {
    executor: Arc<dyn WorkflowExecutor>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
}

impl ExecutorJobHandler {
    pub fn new(executor: Arc<dyn WorkflowExecutor>, max_concurrent: usize) -> Self {
        Self {
            executor,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            closed: AtomicBool::new(false),
        }
    }

    /// Reject every later assignment. Running jobs are unaffected.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }
}

#[async_trait]
impl JobHandler for ExecutorJobHandler {
    async fn on_job_assigned(&self, assignment: JobAssignment, reporter: Reporter) -> JobDecision {
        if self.closed.load(Ordering::SeqCst) {
            return JobDecision::reject(SHUTTING_DOWN_REASON);
        }
        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            return JobDecision::reject(AT_CAPACITY_REASON);
        };

        let executor = Arc::clone(&self.executor);
        JobDecision::accept_with(async move {
            let _permit = permit;
            let job_id = assignment.job_id.clone();
            reporter.report_job_progress(&job_id, 0, "started").await;

            let workflow_id = assignment.workflow_id().to_string();
            let run = tokio::spawn(async move {
                executor
                    .execute(&assignment.workflow, &workflow_id, &assignment.variables)
                    .await
            });
            let outcome = match run.await {
                Ok(outcome) => outcome,
                Err(e) => Err(ExecutorError::Panicked(e.to_string())),
            };

            match outcome {
                Ok(outcome) if outcome.success => {
                    tracing::info!(job_id = %job_id, "Job completed");
                    reporter.report_job_progress(&job_id, 100, "completed").await;
                    let result = outcome.result.unwrap_or_else(|| serde_json::json!({}));
                    reporter.report_job_complete(&job_id, result).await;
                }
                Ok(outcome) => {
                    let error = outcome.error_message();
                    tracing::warn!(job_id = %job_id, error = %error, "Job failed");
                    reporter.report_job_failed(&job_id, &error).await;
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Executor error");
                    reporter.report_job_failed(&job_id, &e.to_string()).await;
                }
            }
        })
    }
}
