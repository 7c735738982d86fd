//! Persistent outbound connection to the control plane.
//!
//! [`AgentTunnel`] dials the control plane over (mutually authenticated)
//! WebSocket, registers the robot, then runs two loops per session:
//! - the receive loop owns the read half and dispatches inbound frames,
//! - the heartbeat loop sends a `heartbeat` frame every interval.
//!
//! The write half sits behind the [`Reporter`], shared by the heartbeat
//! loop, assignment replies and application `report_*` calls. Each frame
//! is sent whole under its lock.
//!
//! [`AgentTunnel::run_forever`] keeps a session alive across failures
//! with exponential backoff that resets after each registration.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, RwLock, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use fleet_core::backoff::Backoff;
use fleet_core::error::CoreError;
use futures::stream::SplitStream;
use futures::{FutureExt, StreamExt};
use rustls::ClientConfig;
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::connect_async_tls_with_config;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::TunnelConfig;
use crate::error::TunnelError;
use crate::handler::{JobDecision, JobHandler, Reporter, WsStream, NO_HANDLER_REASON};
use crate::protocol::{parse_inbound, InboundMessage, JobAssignment, OutboundMessage, RobotStatus};
use crate::state::{TunnelEvent, TunnelState};
use crate::tls;

/// Malformed frames tolerated in a row before the session is dropped.
pub const MAX_CONSECUTIVE_PROTOCOL_ERRORS: u32 = 10;

/// Bound on waiting for session tasks and the close handshake.
const CANCEL_WINDOW: Duration = Duration::from_secs(5);

const EVENT_CHANNEL_CAPACITY: usize = 256;

type ErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Outcome of `register`, forwarded from the receive loop to `connect`.
struct RegisterAck {
    success: bool,
    message: Option<String>,
}

/// Tasks belonging to one live connection.
struct Session {
    cancel: CancellationToken,
    receive: JoinHandle<()>,
    heartbeat: Option<JoinHandle<()>>,
}

struct Inner {
    config: TunnelConfig,
    tls: Option<Arc<ClientConfig>>,
    reporter: Reporter,
    state: watch::Sender<TunnelState>,
    events: broadcast::Sender<TunnelEvent>,
    session: Mutex<Option<Session>>,
    pending_ack: StdMutex<Option<oneshot::Sender<RegisterAck>>>,
    job_handler: RwLock<Option<Arc<dyn JobHandler>>>,
    error_callback: RwLock<Option<ErrorCallback>>,
    jobs: TaskTracker,
}

/// Robot side of the control-plane tunnel. Cheap to clone; clones share
/// one connection.
#[derive(Clone)]
pub struct AgentTunnel {
    inner: Arc<Inner>,
}

impl AgentTunnel {
    /// Validate `config` and load TLS material. Does not connect.
    pub fn new(config: TunnelConfig) -> Result<Self, TunnelError> {
        config.validate()?;
        let tls = tls::for_endpoint(&config)?;
        let (state, _) = watch::channel(TunnelState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let reporter = Reporter::new(config.robot_id.clone());

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                tls,
                reporter,
                state,
                events,
                session: Mutex::new(None),
                pending_ack: StdMutex::new(None),
                job_handler: RwLock::new(None),
                error_callback: RwLock::new(None),
                jobs: TaskTracker::new(),
            }),
        })
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.inner.config
    }

    pub fn robot_id(&self) -> &str {
        &self.inner.config.robot_id
    }

    pub fn state(&self) -> TunnelState {
        *self.inner.state.borrow()
    }

    pub fn is_registered(&self) -> bool {
        self.state() == TunnelState::Registered
    }

    pub fn watch_state(&self) -> watch::Receiver<TunnelState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.inner.events.subscribe()
    }

    /// Handle for sending reports from other tasks.
    pub fn reporter(&self) -> Reporter {
        self.inner.reporter.clone()
    }

    /// Register the callback for `job_assign` frames, replacing any
    /// previous one.
    pub fn set_job_handler(&self, handler: Arc<dyn JobHandler>) {
        *write(&self.inner.job_handler) = Some(handler);
    }

    /// Remove the job callback; later assignments are rejected.
    pub fn clear_job_handler(&self) {
        *write(&self.inner.job_handler) = None;
    }

    /// Register a callback for control-plane `error` frames. The same
    /// errors are also broadcast as [`TunnelEvent::ControlPlaneError`].
    pub fn on_error(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        *write(&self.inner.error_callback) = Some(Arc::new(callback));
    }

    /// Accepted jobs whose work is still running.
    pub fn active_jobs(&self) -> usize {
        self.inner.jobs.len()
    }

    /// Wait until all accepted work has finished, up to `timeout`.
    /// Returns `false` on timeout.
    pub async fn wait_for_jobs(&self, timeout: Duration) -> bool {
        self.inner.jobs.close();
        let drained = tokio::time::timeout(timeout, self.inner.jobs.wait())
            .await
            .is_ok();
        self.inner.jobs.reopen();
        drained
    }

    /// Connect, register and start the session loops.
    ///
    /// Succeeds only once the control plane has acknowledged
    /// registration. A no-op when already registered.
    pub async fn connect(&self) -> Result<(), TunnelError> {
        let mut session = self.inner.session.lock().await;
        if session.is_some() {
            if self.is_registered() {
                return Ok(());
            }
            if let Some(stale) = session.take() {
                self.inner.close_session(stale).await;
            }
        }

        match Inner::open_session(&self.inner).await {
            Ok(opened) => {
                *session = Some(opened);
                Ok(())
            }
            Err(e) => {
                self.inner.set_state(TunnelState::Error);
                Err(e)
            }
        }
    }

    /// Stop both loops and close the transport.
    pub async fn disconnect(&self) {
        let session = self.inner.session.lock().await.take();
        if let Some(session) = session {
            self.inner.close_session(session).await;
            tracing::info!(robot_id = %self.robot_id(), "Disconnected from control plane");
            self.inner.emit(TunnelEvent::Disconnected {
                reason: "disconnect requested".to_string(),
            });
        }
        self.inner.set_state(TunnelState::Disconnected);
    }

    /// Keep the tunnel registered until `cancel` fires, reconnecting with
    /// exponential backoff. Gives up on errors no retry can fix (see
    /// [`TunnelError::is_retryable`]). Disconnects before returning.
    pub async fn run_forever(&self, cancel: CancellationToken) {
        let mut backoff = Backoff::new(self.inner.config.reconnect.clone());

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.connect().await {
                Ok(()) => {
                    backoff.reset();
                    let mut state = self.watch_state();
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = state.wait_for(|s| *s != TunnelState::Registered) => {}
                    }
                    let session = self.inner.session.lock().await.take();
                    if let Some(session) = session {
                        self.inner.close_session(session).await;
                    }
                }
                Err(e) if !e.is_retryable() => {
                    tracing::error!(
                        error = %e,
                        url = %self.inner.config.control_plane_url,
                        "Tunnel cannot be established, giving up",
                    );
                    self.inner.set_state(TunnelState::Error);
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        url = %self.inner.config.control_plane_url,
                        "Failed to establish tunnel",
                    );
                }
            }

            let delay = backoff.fail();
            let delay_ms = delay.as_millis() as u64;
            self.inner.set_state(TunnelState::Reconnecting);
            tracing::info!(
                attempt = backoff.failures(),
                delay_ms,
                "Reconnecting to control plane",
            );
            self.inner.emit(TunnelEvent::Reconnecting {
                attempt: backoff.failures(),
                delay_ms,
            });
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.disconnect().await;
    }

    /// Best-effort progress report; `progress` is clamped to 0..=100.
    pub async fn report_job_progress(&self, job_id: &str, progress: u8, message: &str) -> bool {
        self.inner.reporter.report_job_progress(job_id, progress, message).await
    }

    pub async fn report_job_complete(&self, job_id: &str, result: serde_json::Value) -> bool {
        self.inner.reporter.report_job_complete(job_id, result).await
    }

    pub async fn report_job_failed(&self, job_id: &str, error: &str) -> bool {
        self.inner.reporter.report_job_failed(job_id, error).await
    }

    pub async fn send_status_update(&self, status: RobotStatus, metadata: serde_json::Value) -> bool {
        self.inner.reporter.send_status_update(status, metadata).await
    }
}

impl Inner {
    fn emit(&self, event: TunnelEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: TunnelState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "Tunnel state changed");
            self.emit(TunnelEvent::StateChanged { state });
        }
    }

    async fn open_session(this: &Arc<Self>) -> Result<Session, TunnelError> {
        let url = this.config.control_plane_url.as_str();
        this.set_state(TunnelState::Connecting);
        tracing::info!(url = %url, robot_id = %this.config.robot_id, "Connecting to control plane");

        let connector = tls::connector(this.tls.as_ref());
        let (ws, _response) = tokio::time::timeout(
            this.config.connect_timeout,
            connect_async_tls_with_config(url, None, false, connector),
        )
        .await
        .map_err(|_| TunnelError::Transport(format!("Connection to {url} timed out")))?
        .map_err(|e| match e {
            WsError::Url(_) | WsError::HttpFormat(_) => TunnelError::InvalidConfig(
                CoreError::Validation(format!("Control plane URL {url} is unusable: {e}")),
            ),
            e => TunnelError::Transport(format!("Failed to connect to {url}: {e}")),
        })?;
        this.set_state(TunnelState::Connected);

        let (sink, stream) = ws.split();
        this.reporter.attach(sink).await;

        let (ack_tx, ack_rx) = oneshot::channel();
        *lock(&this.pending_ack) = Some(ack_tx);

        let cancel = CancellationToken::new();
        let receive = tokio::spawn(receive_loop(Arc::clone(this), stream, cancel.clone()));
        let mut session = Session {
            cancel,
            receive,
            heartbeat: None,
        };

        match this.register(ack_rx).await {
            Ok(()) => {
                session.heartbeat = Some(tokio::spawn(heartbeat_loop(
                    Arc::clone(this),
                    session.cancel.clone(),
                )));
                Ok(session)
            }
            Err(e) => {
                this.close_session(session).await;
                Err(e)
            }
        }
    }

    /// Send `register` and wait for the ack the receive loop forwards.
    async fn register(&self, ack: oneshot::Receiver<RegisterAck>) -> Result<(), TunnelError> {
        self.set_state(TunnelState::Authenticating);
        self.reporter
            .send(&OutboundMessage::Register {
                robot_id: self.config.robot_id.clone(),
                robot_name: self.config.robot_name.clone(),
                capabilities: self.config.capabilities.clone(),
                timestamp: Utc::now(),
            })
            .await?;

        let timeout = self.config.registration_timeout;
        let ack = match tokio::time::timeout(timeout, ack).await {
            Err(_) => {
                return Err(TunnelError::RegistrationTimeout {
                    secs: timeout.as_secs(),
                })
            }
            Ok(Err(_)) => {
                return Err(TunnelError::Transport(
                    "Connection closed during registration".to_string(),
                ))
            }
            Ok(Ok(ack)) => ack,
        };

        if ack.success {
            Ok(())
        } else {
            Err(TunnelError::RegistrationRejected(
                ack.message.unwrap_or_else(|| "no reason given".to_string()),
            ))
        }
    }

    /// Cancel the session loops and close the transport, within
    /// [`CANCEL_WINDOW`].
    async fn close_session(&self, session: Session) {
        session.cancel.cancel();
        lock(&self.pending_ack).take();
        if tokio::time::timeout(CANCEL_WINDOW, self.reporter.detach())
            .await
            .is_err()
        {
            tracing::warn!("Close handshake timed out");
        }
        join_bounded("receive", session.receive).await;
        if let Some(heartbeat) = session.heartbeat {
            join_bounded("heartbeat", heartbeat).await;
        }
    }

    /// The transport died underneath a session. Ends the session's loops
    /// and publishes the new state unless someone else already did.
    fn connection_lost(&self, cancel: &CancellationToken, state: TunnelState, reason: String) {
        if cancel.is_cancelled() {
            return;
        }
        cancel.cancel();
        lock(&self.pending_ack).take();
        tracing::warn!(state = %state, reason = %reason, "Tunnel connection lost");
        self.set_state(state);
        self.emit(TunnelEvent::Disconnected { reason });
    }

    async fn dispatch(&self, message: InboundMessage) {
        match message {
            InboundMessage::RegisterAck { success, message } => {
                let Some(pending) = lock(&self.pending_ack).take() else {
                    tracing::debug!("Ignoring unsolicited register_ack");
                    return;
                };
                if success {
                    self.set_state(TunnelState::Registered);
                    tracing::info!(
                        robot_id = %self.config.robot_id,
                        robot_name = %self.config.robot_name,
                        "Registered with control plane",
                    );
                    self.emit(TunnelEvent::Registered {
                        robot_id: self.config.robot_id.clone(),
                    });
                } else {
                    tracing::warn!(reason = ?message, "Registration rejected by control plane");
                }
                let _ = pending.send(RegisterAck { success, message });
            }
            InboundMessage::HeartbeatAck { .. } => {
                tracing::trace!("Heartbeat acknowledged");
            }
            InboundMessage::JobAssign(assignment) => self.handle_assignment(assignment).await,
            InboundMessage::Error { message, code } => {
                tracing::warn!(message = %message, code = ?code, "Control plane reported an error");
                self.emit(TunnelEvent::ControlPlaneError {
                    message: message.clone(),
                });
                if let Some(callback) = read(&self.error_callback) {
                    callback(&message);
                }
            }
        }
    }

    async fn handle_assignment(&self, assignment: JobAssignment) {
        let job_id = assignment.job_id.clone();
        tracing::info!(job_id = %job_id, workflow_id = %assignment.workflow_id(), "Job assigned");
        self.emit(TunnelEvent::JobAssigned {
            job_id: job_id.clone(),
        });

        let handler = read(&self.job_handler).clone();
        let decision = match handler {
            Some(handler) => {
                let call = handler.on_job_assigned(assignment, self.reporter.clone());
                match AssertUnwindSafe(call).catch_unwind().await {
                    Ok(decision) => decision,
                    Err(panic) => {
                        let reason = format!("Job handler failed: {}", panic_message(&*panic));
                        tracing::error!(job_id = %job_id, reason = %reason, "Job handler panicked");
                        JobDecision::reject(reason)
                    }
                }
            }
            None => JobDecision::reject(NO_HANDLER_REASON),
        };

        let robot_id = self.config.robot_id.clone();
        match decision {
            JobDecision::Accept(work) => {
                let accept = OutboundMessage::JobAccept {
                    job_id: job_id.clone(),
                    robot_id,
                    timestamp: Utc::now(),
                };
                match self.reporter.send(&accept).await {
                    Ok(()) => {
                        tracing::info!(job_id = %job_id, "Job accepted");
                        if let Some(work) = work {
                            self.jobs.spawn(work);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, error = %e, "Failed to accept job, dropping it");
                    }
                }
            }
            JobDecision::Reject { reason } => {
                tracing::warn!(job_id = %job_id, reason = %reason, "Job rejected");
                let reject = OutboundMessage::JobReject {
                    job_id: job_id.clone(),
                    robot_id,
                    reason: reason.clone(),
                    timestamp: Utc::now(),
                };
                if let Err(e) = self.reporter.send(&reject).await {
                    tracing::warn!(job_id = %job_id, error = %e, "Failed to send job rejection");
                }
                self.emit(TunnelEvent::JobRejected { job_id, reason });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Session loops
// ---------------------------------------------------------------------------

async fn receive_loop(
    inner: Arc<Inner>,
    mut stream: SplitStream<WsStream>,
    cancel: CancellationToken,
) {
    let mut protocol_errors: u32 = 0;

    let (state, reason) = loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = stream.next() => frame,
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            // Not part of the protocol; parses as malformed.
            Some(Ok(Message::Binary(_))) => String::new(),
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
            Some(Ok(Message::Close(frame))) => {
                let reason = frame
                    .map(|f| format!("closed by control plane: {} {}", f.code, f.reason))
                    .unwrap_or_else(|| "closed by control plane".to_string());
                break (TunnelState::Disconnected, reason);
            }
            Some(Err(e)) => break (TunnelState::Error, format!("receive failed: {e}")),
            None => break (TunnelState::Disconnected, "connection ended".to_string()),
        };

        match parse_inbound(&text) {
            Ok(message) => {
                protocol_errors = 0;
                inner.dispatch(message).await;
            }
            Err(e) => {
                protocol_errors += 1;
                tracing::warn!(
                    error = %e,
                    consecutive = protocol_errors,
                    "Dropping malformed frame",
                );
                if protocol_errors >= MAX_CONSECUTIVE_PROTOCOL_ERRORS {
                    break (
                        TunnelState::Error,
                        format!("{protocol_errors} consecutive malformed frames"),
                    );
                }
            }
        }
    };

    inner.connection_lost(&cancel, state, reason);
}

async fn heartbeat_loop(inner: Arc<Inner>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Registration itself proved liveness; skip the immediate tick.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let heartbeat = OutboundMessage::Heartbeat {
            robot_id: inner.config.robot_id.clone(),
            timestamp: Utc::now(),
        };
        if let Err(e) = inner.reporter.send(&heartbeat).await {
            inner.connection_lost(&cancel, TunnelState::Error, format!("heartbeat failed: {e}"));
            break;
        }
        tracing::trace!("Heartbeat sent");
    }
}

async fn join_bounded(name: &str, mut handle: JoinHandle<()>) {
    match tokio::time::timeout(CANCEL_WINDOW, &mut handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_cancelled() => {}
        Ok(Err(e)) => tracing::error!(task = name, error = %e, "Tunnel loop ended abnormally"),
        Err(_) => {
            tracing::warn!(task = name, "Tunnel loop did not stop in time, aborting");
            handle.abort();
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("panic")
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T: Clone>(rw: &RwLock<T>) -> T {
    rw.read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

fn write<T>(rw: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rw.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
