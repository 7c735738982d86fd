//! Robot agent configuration loaded from environment variables.

use std::time::Duration;

use fleet_core::env;
use fleet_core::error::CoreError;
use fleet_core::executor::DEFAULT_EXECUTOR_TIMEOUT;
use fleet_core::types::{generate_robot_id, RobotId};

/// Outage retry ceiling used unless the poll interval is longer.
pub const DEFAULT_MAX_OUTAGE_BACKOFF: Duration = Duration::from_secs(30);

/// Timing and shutdown behaviour of a [`RobotAgent`](crate::agent::RobotAgent).
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Identity used for claims. Informational here; the queue consumer
    /// carries the identity it claims under.
    pub robot_id: RobotId,
    /// Sleep after a claim miss.
    pub poll_interval: Duration,
    /// How often the heartbeat loop extends the current lease.
    pub heartbeat_interval: Duration,
    /// Seconds each extension pushes the lease deadline forward.
    pub visibility_timeout_secs: i32,
    /// How long `stop(true)` waits for an in-flight job.
    pub grace_period: Duration,
    /// Return an unfinished job to pending when the grace period runs
    /// out, instead of leaving it to expire.
    pub release_on_shutdown: bool,
    /// Upper bound for the queue-outage retry delay.
    pub max_outage_backoff: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            robot_id: generate_robot_id(),
            poll_interval: Duration::from_millis(1000),
            heartbeat_interval: Duration::from_secs(10),
            visibility_timeout_secs: 30,
            grace_period: Duration::from_secs(60),
            release_on_shutdown: false,
            max_outage_backoff: DEFAULT_MAX_OUTAGE_BACKOFF,
        }
    }
}

impl AgentConfig {
    /// Check the lease invariant: extensions must arrive strictly more
    /// often than the visibility timeout.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.poll_interval.is_zero() {
            return Err(CoreError::Validation(
                "Poll interval must be greater than zero".to_string(),
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(CoreError::Validation(
                "Heartbeat interval must be greater than zero".to_string(),
            ));
        }
        if self.visibility_timeout_secs <= 0 {
            return Err(CoreError::Validation(
                "Visibility timeout must be greater than zero".to_string(),
            ));
        }
        if self.heartbeat_interval >= self.visibility_timeout() {
            return Err(CoreError::Validation(format!(
                "Heartbeat interval ({}s) must be shorter than the visibility timeout ({}s)",
                self.heartbeat_interval.as_secs_f64(),
                self.visibility_timeout_secs,
            )));
        }
        if self.max_outage_backoff < self.poll_interval {
            return Err(CoreError::Validation(
                "Maximum outage backoff must not be below the poll interval".to_string(),
            ));
        }
        Ok(())
    }

    /// Outage ceiling for `poll_interval` when none is configured. Never
    /// below the poll interval, so slow pollers stay valid.
    pub fn default_outage_backoff(poll_interval: Duration) -> Duration {
        DEFAULT_MAX_OUTAGE_BACKOFF.max(poll_interval)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs.max(0) as u64)
    }
}

/// Everything the `fleet-worker` binary needs.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    /// Command line of the subprocess executor.
    pub executor_command: String,
    pub executor_timeout: Duration,
    pub agent: AgentConfig,
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// | Env Var                   | Default        |
    /// |---------------------------|----------------|
    /// | `DATABASE_URL`            | required       |
    /// | `DB_MAX_CONNECTIONS`      | `5`            |
    /// | `EXECUTOR_COMMAND`        | required       |
    /// | `EXECUTOR_TIMEOUT_SECS`   | `3600`         |
    /// | `ROBOT_ID`                | generated UUID |
    /// | `POLL_INTERVAL_MS`        | `1000`         |
    /// | `HEARTBEAT_INTERVAL_SECS` | `10`           |
    /// | `VISIBILITY_TIMEOUT_SECS` | `30`           |
    /// | `GRACE_PERIOD_SECS`       | `60`           |
    /// | `RELEASE_ON_SHUTDOWN`     | `false`        |
    /// | `MAX_OUTAGE_BACKOFF_SECS` | `max(30s, poll interval)` |
    pub fn from_env() -> Result<Self, CoreError> {
        let defaults = AgentConfig::default();

        let poll_interval = Duration::from_millis(env::parse_or(
            "POLL_INTERVAL_MS",
            defaults.poll_interval.as_millis() as u64,
        )?);
        let max_outage_backoff = match env::optional("MAX_OUTAGE_BACKOFF_SECS") {
            Some(_) => Duration::from_secs(env::parse_or("MAX_OUTAGE_BACKOFF_SECS", 0)?),
            None => AgentConfig::default_outage_backoff(poll_interval),
        };

        let agent = AgentConfig {
            robot_id: env::optional("ROBOT_ID").unwrap_or(defaults.robot_id),
            poll_interval,
            heartbeat_interval: Duration::from_secs(env::parse_or(
                "HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval.as_secs(),
            )?),
            visibility_timeout_secs: env::parse_or(
                "VISIBILITY_TIMEOUT_SECS",
                defaults.visibility_timeout_secs,
            )?,
            grace_period: Duration::from_secs(env::parse_or(
                "GRACE_PERIOD_SECS",
                defaults.grace_period.as_secs(),
            )?),
            release_on_shutdown: env::flag_or("RELEASE_ON_SHUTDOWN", defaults.release_on_shutdown)?,
            max_outage_backoff,
        };
        agent.validate()?;

        Ok(Self {
            database_url: env::require("DATABASE_URL")?,
            db_max_connections: env::parse_or(
                "DB_MAX_CONNECTIONS",
                fleet_db::DEFAULT_MAX_CONNECTIONS,
            )?,
            executor_command: env::require("EXECUTOR_COMMAND")?,
            executor_timeout: Duration::from_secs(env::parse_or(
                "EXECUTOR_TIMEOUT_SECS",
                DEFAULT_EXECUTOR_TIMEOUT.as_secs(),
            )?),
            agent,
        })
    }
}
