//! `RobotAgent` over `PgJobQueue`: the pool belongs to the caller and
//! outlives a stop, so the agent can be started again on it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::executor::{ExecutionOutcome, ExecutorError, WorkflowExecutor};
use fleet_core::job::NewJob;
use fleet_core::status::JobStatus;
use fleet_db::queue::PgJobQueue;
use fleet_db::repositories::JobRepo;
use fleet_worker::agent::RobotAgent;
use fleet_worker::config::AgentConfig;
use fleet_worker::events::AgentEvent;
use serde_json::json;
use sqlx::PgPool;

struct InstantExecutor;

#[async_trait]
impl WorkflowExecutor for InstantExecutor {
    async fn execute(
        &self,
        _workflow_definition: &serde_json::Value,
        _workflow_id: &str,
        _initial_variables: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        Ok(ExecutionOutcome::succeeded(json!({"success": true})))
    }
}

fn config() -> AgentConfig {
    AgentConfig {
        robot_id: "robot-pg".to_string(),
        poll_interval: Duration::from_millis(50),
        heartbeat_interval: Duration::from_secs(5),
        visibility_timeout_secs: 30,
        grace_period: Duration::from_secs(5),
        release_on_shutdown: true,
        max_outage_backoff: Duration::from_secs(1),
    }
}

#[sqlx::test(migrations = "../db/migrations")]
async fn test_agent_restarts_on_the_same_pool(pool: PgPool) {
    let queue = PgJobQueue::new(pool.clone(), "robot-pg");
    let agent = RobotAgent::new(config(), Arc::new(queue), Arc::new(InstantExecutor)).unwrap();

    agent.start().await.unwrap();
    agent.stop(true).await;
    assert!(!pool.is_closed());

    // The caller can still use the pool after a stop.
    let new_job = NewJob::new("after-restart", json!({"nodes": [{"id": "start"}]}))
        .with_visibility_timeout(30);
    let row = JobRepo::enqueue(&pool, &new_job).await.unwrap();

    let mut events = agent.subscribe();
    agent.start().await.unwrap();
    let completed = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(AgentEvent::JobCompleted { job_id }) => break job_id,
                Ok(AgentEvent::QueueUnavailable { error, .. }) => {
                    panic!("queue unavailable after restart: {error}")
                }
                Ok(_) => continue,
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    })
    .await
    .expect("job was not completed after restart");
    assert_eq!(completed, row.id);

    let status = JobRepo::find_status(&pool, row.id).await.unwrap().unwrap();
    assert_eq!(JobStatus::from_id(status), Some(JobStatus::Completed));
    agent.stop(true).await;
}
