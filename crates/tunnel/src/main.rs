//! `fleet-tunnel` -- robot daemon that takes jobs from the control plane.
//!
//! Keeps a registered tunnel open, runs assignments through the executor
//! command and reports results back. Reads the variables documented on
//! [`TunnelConfig::from_env`] plus:
//!
//! | Env Var                 | Default    |
//! |-------------------------|------------|
//! | `EXECUTOR_COMMAND`      | required   |
//! | `EXECUTOR_TIMEOUT_SECS` | `3600`     |
//! | `GRACE_PERIOD_SECS`     | `60`       |

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use fleet_core::env;
use fleet_core::executor::{CommandExecutor, DEFAULT_EXECUTOR_TIMEOUT};
use fleet_core::runtime::{init_tracing, shutdown_signal};
use fleet_tunnel::runner::ExecutorJobHandler;
use fleet_tunnel::{AgentTunnel, TunnelConfig};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing("fleet_tunnel=info,fleet_core=info");

    let config = TunnelConfig::from_env().unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid tunnel configuration");
        std::process::exit(1);
    });

    let executor_timeout = Duration::from_secs(env::parse_or(
        "EXECUTOR_TIMEOUT_SECS",
        DEFAULT_EXECUTOR_TIMEOUT.as_secs(),
    )?);
    let grace_period = Duration::from_secs(env::parse_or("GRACE_PERIOD_SECS", 60)?);
    let executor = CommandExecutor::from_command_line(&env::require("EXECUTOR_COMMAND")?)
        .context("EXECUTOR_COMMAND is empty")?
        .with_timeout(executor_timeout);

    tracing::info!(
        robot_id = %config.robot_id,
        robot_name = %config.robot_name,
        url = %config.control_plane_url,
        executor = %executor.program(),
        "Tunnel agent starting",
    );

    let max_jobs = config.capabilities.max_concurrent_jobs as usize;
    let runner = Arc::new(ExecutorJobHandler::new(Arc::new(executor), max_jobs));
    let tunnel = AgentTunnel::new(config)?;
    tunnel.set_job_handler(runner.clone());
    tunnel.on_error(|message| tracing::error!(message = %message, "Control plane error"));

    let cancel = CancellationToken::new();
    let run = tokio::spawn({
        let tunnel = tunnel.clone();
        let cancel = cancel.clone();
        async move { tunnel.run_forever(cancel).await }
    });

    shutdown_signal().await;
    tracing::info!(active_jobs = tunnel.active_jobs(), "Shutting down");

    runner.close();
    if !tunnel.wait_for_jobs(grace_period).await {
        tracing::warn!(
            active_jobs = tunnel.active_jobs(),
            "Grace period elapsed with jobs still running",
        );
    }
    cancel.cancel();
    run.await.context("Tunnel task failed")?;

    tracing::info!("Tunnel agent shut down");
    Ok(())
}
