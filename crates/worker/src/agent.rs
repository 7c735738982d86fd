//! The robot agent: one queue consumer, one executor, two loops.
//!
//! While running, a poll loop claims and executes jobs one at a time and
//! a heartbeat loop extends the lease of whichever job is in flight.
//! The loops share `current_job`, a watch channel the poll loop writes
//! and the heartbeat loop reads, which doubles as the completion signal
//! for [`RobotAgent::stop`]. Each job also gets a lease token: the
//! heartbeat loop cancels it when an extension is refused, and the poll
//! loop then abandons the execution.
//!
//! Shutdown uses two cancellation tokens:
//! - `accepting` stops new claims (first step of `stop`),
//! - `halt` ends both loops once the grace period is over.
//!
//! A crashed process needs no unwind: the job's lease simply stops being
//! extended and the queue hands it to another robot after the
//! visibility timeout.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use fleet_core::backoff::{Backoff, BackoffConfig};
use fleet_core::error::CoreError;
use fleet_core::executor::{ExecutionOutcome, ExecutorError, WorkflowExecutor};
use fleet_core::job::Job;
use fleet_core::queue::{JobQueue, QueueError, TerminalTransition};
use fleet_core::types::DbId;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::events::{AgentEvent, AgentState};

/// How long `stop` waits for the loops to notice cancellation before
/// aborting them. In-flight queue calls normally finish well inside it.
const CANCEL_WINDOW: Duration = Duration::from_secs(5);

/// Attempts at recording a terminal transition while the queue is
/// unavailable. The lease keeps being extended in between.
const TERMINAL_ATTEMPTS: u32 = 3;

/// Capacity of the event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Agent is already running")]
    AlreadyRunning,

    #[error("Invalid agent configuration: {0}")]
    InvalidConfig(#[from] CoreError),
}

/// State shared between the agent handle and its loops.
struct Shared {
    config: AgentConfig,
    queue: Arc<dyn JobQueue>,
    executor: Arc<dyn WorkflowExecutor>,
    state: watch::Sender<AgentState>,
    current_job: watch::Sender<Option<Job>>,
    lease: StdMutex<Option<(DbId, CancellationToken)>>,
    events: broadcast::Sender<AgentEvent>,
}

impl Shared {
    fn emit(&self, event: AgentEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: AgentState) {
        self.state.send_replace(state);
        tracing::debug!(robot_id = %self.queue.robot_id(), state = %state, "Agent state changed");
        self.emit(AgentEvent::StateChanged { state });
    }

    fn current_job_id(&self) -> Option<DbId> {
        self.current_job.borrow().as_ref().map(|job| job.job_id)
    }

    /// Publish `job` as in flight and return its lease token.
    fn begin_job(&self, job: &Job) -> CancellationToken {
        let token = CancellationToken::new();
        *self.lease_slot() = Some((job.job_id, token.clone()));
        self.current_job.send_replace(Some(job.clone()));
        token
    }

    fn end_job(&self) {
        self.lease_slot().take();
        self.current_job.send_replace(None);
    }

    /// Cancel the lease token of `job_id` if it is still in flight.
    /// Returns `false` when it was already cancelled or has finished.
    fn lease_lost(&self, job_id: DbId) -> bool {
        match self.lease_slot().as_ref() {
            Some((id, token)) if *id == job_id && !token.is_cancelled() => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    fn lease_slot(&self) -> std::sync::MutexGuard<'_, Option<(DbId, CancellationToken)>> {
        self.lease.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct LoopHandles {
    accepting: CancellationToken,
    halt: CancellationToken,
    poll: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

/// A robot that claims jobs from a [`JobQueue`] and runs them through a
/// [`WorkflowExecutor`].
///
/// Constructed and owned by the caller; several agents may run in one
/// process, each with its own consumer.
pub struct RobotAgent {
    shared: Arc<Shared>,
    tasks: Mutex<Option<LoopHandles>>,
}

impl RobotAgent {
    pub fn new(
        config: AgentConfig,
        queue: Arc<dyn JobQueue>,
        executor: Arc<dyn WorkflowExecutor>,
    ) -> Result<Self, AgentError> {
        config.validate()?;
        let (state, _) = watch::channel(AgentState::Stopped);
        let (current_job, _) = watch::channel(None);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                queue,
                executor,
                state,
                current_job,
                lease: StdMutex::new(None),
                events,
            }),
            tasks: Mutex::new(None),
        })
    }

    /// Identity the agent claims jobs under.
    pub fn robot_id(&self) -> &str {
        self.shared.queue.robot_id()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.shared.config
    }

    pub fn state(&self) -> AgentState {
        *self.shared.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == AgentState::Running
    }

    /// Snapshot of the job currently being executed.
    pub fn current_job(&self) -> Option<Job> {
        self.shared.current_job.borrow().clone()
    }

    /// Subscribe to agent events. Events sent before subscribing are not
    /// replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.shared.events.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<AgentState> {
        self.shared.state.subscribe()
    }

    /// Spawn the poll and heartbeat loops.
    pub async fn start(&self) -> Result<(), AgentError> {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_some() {
            return Err(AgentError::AlreadyRunning);
        }

        self.shared.set_state(AgentState::Starting);

        let accepting = CancellationToken::new();
        let halt = CancellationToken::new();
        let poll = tokio::spawn(poll_loop(
            Arc::clone(&self.shared),
            accepting.clone(),
            halt.clone(),
        ));
        let heartbeat = tokio::spawn(heartbeat_loop(Arc::clone(&self.shared), halt.clone()));

        *tasks = Some(LoopHandles {
            accepting,
            halt,
            poll,
            heartbeat,
        });

        tracing::info!(
            robot_id = %self.robot_id(),
            poll_interval_ms = self.shared.config.poll_interval.as_millis() as u64,
            heartbeat_interval_secs = self.shared.config.heartbeat_interval.as_secs(),
            visibility_timeout_secs = self.shared.config.visibility_timeout_secs,
            "Robot agent started",
        );
        self.shared.set_state(AgentState::Running);
        Ok(())
    }

    /// Stop claiming, optionally wait up to the grace period for the job
    /// in flight, then end both loops. The queue stays open, so the agent
    /// can be started again; its owner closes it.
    ///
    /// A job still running when the grace period expires is either
    /// released or left claimed, per `release_on_shutdown`. Either way it
    /// is never lost. Stopping a stopped agent is a no-op.
    pub async fn stop(&self, wait_for_completion: bool) {
        let Some(handles) = self.tasks.lock().await.take() else {
            return;
        };

        self.shared.set_state(AgentState::Stopping);
        handles.accepting.cancel();

        if wait_for_completion {
            let mut current = self.shared.current_job.subscribe();
            if let Some(job_id) = self.shared.current_job_id() {
                tracing::info!(
                    job_id,
                    grace_period_secs = self.shared.config.grace_period.as_secs(),
                    "Waiting for in-flight job before stopping",
                );
            }
            let drained = tokio::time::timeout(
                self.shared.config.grace_period,
                current.wait_for(|job| job.is_none()),
            )
            .await
            .is_ok_and(|seen| seen.is_ok());
            if !drained {
                tracing::warn!(
                    job_id = ?self.shared.current_job_id(),
                    "Grace period expired with job still in flight",
                );
            }
        }

        handles.halt.cancel();
        join_bounded("poll", handles.poll).await;
        join_bounded("heartbeat", handles.heartbeat).await;

        self.shared.set_state(AgentState::Stopped);
        tracing::info!(robot_id = %self.robot_id(), "Robot agent stopped");
    }
}

/// Await a loop task, aborting it if it does not finish within
/// [`CANCEL_WINDOW`].
async fn join_bounded(name: &str, mut handle: JoinHandle<()>) {
    match tokio::time::timeout(CANCEL_WINDOW, &mut handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(task = name, error = %e, "Agent loop ended abnormally"),
        Err(_) => {
            tracing::warn!(task = name, "Agent loop did not stop in time, aborting");
            handle.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Poll loop
// ---------------------------------------------------------------------------

async fn poll_loop(shared: Arc<Shared>, accepting: CancellationToken, halt: CancellationToken) {
    let mut outage = Backoff::new(BackoffConfig {
        initial_delay: shared.config.poll_interval,
        max_delay: shared.config.max_outage_backoff,
        multiplier: 2.0,
    });

    while !accepting.is_cancelled() {
        let delay = match shared.queue.claim_job().await {
            Ok(Some(job)) => {
                outage.reset();
                let job_id = job.job_id;
                let lease = shared.begin_job(&job);

                if accepting.is_cancelled() {
                    // Stop raced the claim; the job never started.
                    release(&shared, job_id).await;
                    shared.end_job();
                    break;
                }

                run_job(&shared, job, &lease, &halt).await;
                shared.end_job();
                continue;
            }
            Ok(None) => {
                outage.reset();
                shared.config.poll_interval
            }
            Err(e) => {
                let delay = outage.fail();
                if e.is_retryable() {
                    tracing::warn!(
                        error = %e,
                        failures = outage.failures(),
                        retry_in_ms = delay.as_millis() as u64,
                        "Queue unavailable, backing off",
                    );
                } else {
                    tracing::error!(error = %e, retry_in_ms = delay.as_millis() as u64, "Claim failed");
                }
                shared.emit(AgentEvent::QueueUnavailable {
                    error: e.to_string(),
                    retry_in_ms: delay.as_millis() as u64,
                });
                delay
            }
        };

        tokio::select! {
            _ = accepting.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    tracing::debug!(robot_id = %shared.queue.robot_id(), "Poll loop exited");
}

/// Execute one claimed job and record its outcome.
async fn run_job(shared: &Shared, job: Job, lease: &CancellationToken, halt: &CancellationToken) {
    let job_id = job.job_id;
    tracing::info!(
        job_id,
        workflow_id = %job.workflow_id,
        priority = job.priority,
        attempts = job.attempts,
        "Job claimed",
    );
    shared.emit(AgentEvent::JobClaimed {
        job_id,
        attempts: job.attempts,
    });

    match shared.queue.start_job(job_id).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::warn!(job_id, "Job was taken over before it started");
            shared.emit(AgentEvent::OwnershipLost { job_id });
            return;
        }
        // The lease is still ours; the status just stays `claimed`.
        Err(e) => tracing::warn!(job_id, error = %e, "Failed to mark job running"),
    }

    // Run the executor on its own task so a panic surfaces as a JoinError
    // instead of unwinding the poll loop.
    let executor = Arc::clone(&shared.executor);
    let Job {
        workflow_id,
        workflow_definition,
        variables,
        ..
    } = job;
    let mut execution = tokio::spawn(async move {
        executor
            .execute(&workflow_definition, &workflow_id, &variables)
            .await
    });

    let joined = tokio::select! {
        joined = &mut execution => joined,
        _ = lease.cancelled() => {
            execution.abort();
            tracing::warn!(job_id, "Lease lost, abandoning execution");
            shared.emit(AgentEvent::OwnershipLost { job_id });
            return;
        }
        _ = halt.cancelled() => {
            execution.abort();
            abandon(shared, job_id).await;
            return;
        }
    };

    let outcome = joined.unwrap_or_else(|e| Err(ExecutorError::Panicked(e.to_string())));
    match outcome {
        Ok(ExecutionOutcome {
            success: true,
            result,
            ..
        }) => {
            let result = result.unwrap_or_else(|| serde_json::json!({}));
            record(shared, job_id, Terminal::Complete(result), halt).await;
        }
        Ok(outcome) => {
            record(shared, job_id, Terminal::Fail(outcome.error_message()), halt).await;
        }
        Err(e) => {
            tracing::error!(job_id, error = %e, "Executor failed");
            record(shared, job_id, Terminal::Fail(e.to_string()), halt).await;
        }
    }
}

enum Terminal {
    Complete(serde_json::Value),
    Fail(String),
}

/// Record a terminal transition, retrying while the queue is unavailable.
async fn record(shared: &Shared, job_id: DbId, terminal: Terminal, halt: &CancellationToken) {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let outcome = match &terminal {
            Terminal::Complete(result) => shared.queue.complete_job(job_id, result).await,
            Terminal::Fail(error) => shared.queue.fail_job(job_id, error).await,
        };

        match outcome {
            Ok(TerminalTransition::Applied) => {
                match terminal {
                    Terminal::Complete(_) => {
                        tracing::info!(job_id, "Job completed");
                        shared.emit(AgentEvent::JobCompleted { job_id });
                    }
                    Terminal::Fail(error) => {
                        tracing::warn!(job_id, error = %error, "Job failed");
                        shared.emit(AgentEvent::JobFailed { job_id, error });
                    }
                }
                return;
            }
            Ok(TerminalTransition::AlreadyTerminal) => {
                tracing::info!(job_id, "Job already terminal, nothing recorded");
                return;
            }
            Err(QueueError::OwnershipLost { .. }) => {
                tracing::warn!(job_id, "Job ownership lost before outcome was recorded");
                shared.emit(AgentEvent::OwnershipLost { job_id });
                return;
            }
            Err(e) if e.is_retryable() && attempt < TERMINAL_ATTEMPTS => {
                tracing::warn!(job_id, attempt, error = %e, "Failed to record job outcome, retrying");
                tokio::select! {
                    _ = halt.cancelled() => {
                        abandon(shared, job_id).await;
                        return;
                    }
                    _ = tokio::time::sleep(shared.config.poll_interval) => {}
                }
            }
            Err(e) => {
                tracing::error!(
                    job_id,
                    attempt,
                    error = %e,
                    "Failed to record job outcome, leaving it to lease expiry",
                );
                return;
            }
        }
    }
}

/// The grace period ran out with the job still in flight.
async fn abandon(shared: &Shared, job_id: DbId) {
    if shared.config.release_on_shutdown {
        release(shared, job_id).await;
    } else {
        tracing::warn!(
            job_id,
            visibility_timeout_secs = shared.config.visibility_timeout_secs,
            "Leaving job claimed; it becomes claimable once its lease expires",
        );
        shared.emit(AgentEvent::JobAbandoned { job_id });
    }
}

async fn release(shared: &Shared, job_id: DbId) {
    match shared.queue.release_job(job_id).await {
        Ok(true) => {
            tracing::info!(job_id, "Job released back to the queue");
            shared.emit(AgentEvent::JobReleased { job_id });
        }
        Ok(false) => {
            tracing::warn!(job_id, "Job was no longer held, nothing to release");
            shared.emit(AgentEvent::OwnershipLost { job_id });
        }
        Err(e) => {
            tracing::warn!(job_id, error = %e, "Failed to release job, leaving it to lease expiry");
            shared.emit(AgentEvent::JobAbandoned { job_id });
        }
    }
}

// ---------------------------------------------------------------------------
// Heartbeat loop
// ---------------------------------------------------------------------------

async fn heartbeat_loop(shared: Arc<Shared>, halt: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; a fresh claim needs no extension.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = halt.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(job_id) = shared.current_job_id() else {
            continue;
        };

        match shared
            .queue
            .extend_lease(job_id, shared.config.visibility_timeout_secs)
            .await
        {
            Ok(true) => {
                tracing::debug!(job_id, "Lease extended");
                shared.emit(AgentEvent::LeaseExtended { job_id });
            }
            // No-op if the job finished between the read and the call.
            Ok(false) => {
                if shared.lease_lost(job_id) {
                    tracing::warn!(job_id, "Lease extension refused, job no longer held");
                }
            }
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Lease extension failed, retrying next cycle");
            }
        }
    }

    tracing::debug!(robot_id = %shared.queue.robot_id(), "Heartbeat loop exited");
}
