//! `fleet-worker` -- robot agent daemon with direct queue access.
//!
//! Claims jobs from PostgreSQL, runs each through an external executor
//! command and records the outcome. See [`WorkerConfig::from_env`] for
//! the environment variables it reads.

use std::sync::Arc;

use anyhow::Context;
use fleet_core::executor::CommandExecutor;
use fleet_core::runtime::{init_tracing, shutdown_signal};
use fleet_db::queue::PgJobQueue;
use fleet_worker::agent::RobotAgent;
use fleet_worker::config::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing("fleet_worker=info,fleet_db=info,fleet_core=info");

    let config = WorkerConfig::from_env().unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid worker configuration");
        std::process::exit(1);
    });

    let executor = CommandExecutor::from_command_line(&config.executor_command)
        .context("EXECUTOR_COMMAND is empty")?
        .with_timeout(config.executor_timeout);

    let pool = fleet_db::create_pool(&config.database_url, config.db_max_connections)
        .await
        .context("Failed to connect to database")?;
    fleet_db::health_check(&pool)
        .await
        .context("Database health check failed")?;
    fleet_db::run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;

    tracing::info!(
        robot_id = %config.agent.robot_id,
        executor = %executor.program(),
        "Worker starting",
    );

    let queue = PgJobQueue::new(pool.clone(), config.agent.robot_id.clone());
    let agent = RobotAgent::new(config.agent, Arc::new(queue), Arc::new(executor))?;
    agent.start().await?;

    shutdown_signal().await;
    agent.stop(true).await;
    pool.close().await;

    tracing::info!("Worker shut down");
    Ok(())
}
