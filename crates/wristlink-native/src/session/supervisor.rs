//! Session supervisor.
//!
//! The supervisor owns the device session state machine:
//!
//! ```text
//!          PAIR            paired
//!   Idle -------> Pairing --------+
//!    ^  \                         v        (connect ok,
//!    |   +-------- START ----> Connecting --subscribed)--> Active
//!    |                          |    ^                       |
//!    |                          |    +----- link lost -------+
//!    +------------ Stopping <---+----------- STOP / ALERT ---+
//! ```
//!
//! It runs as a single task that handles one message at a time, so every
//! state transition is serialized without locks. Background work of a
//! session (connect loop, notification enables, heart-rate poll loop,
//! battery reads) lives in a `JoinSet` owned by the session and is aborted
//! as a whole on `STOP`. Sample inserts are not part of that set: they go
//! through the ingest queue, whose worker outlives individual sessions.
//!
//! When the driver reports that an established link went away, the session
//! drops back to `Connecting`, retries the connect with no cap and redoes
//! the subscription steps once the link is back. The wake lock stays held
//! while it reconnects.
//!
//! Persisted state and the host restart timer are blocking I/O; both run on
//! tokio's blocking pool and never on the supervisor task itself.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use futures::future;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{AbortHandle, JoinError, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

use wristlink_core::{now_ms, ActionKind, DeviceAddress, Sample, StreamKind};

use crate::bridge::{LinkDriver, LinkEvent, LinkListener};
use crate::store::{RunFlag, SampleSink, StateStore, StateWrite, StateWriter};

use super::config::SupervisorConfig;
use super::guard::{GuardError, LifecycleGuard, RestartScheduler, WakeLock};
use super::ingest::{spawn_ingest_worker, stream_handler, IngestQueue, StreamGate};
use super::{SessionError, SessionResult};

/// Streams whose notifications must be switched on at the device.
const NOTIFY_STREAMS: [StreamKind; 2] = [StreamKind::Steps, StreamKind::Motion];

// ============================================================================
// Public types
// ============================================================================

/// Session lifecycle state.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No session
    Idle,
    /// Pairing before the first connect
    Pairing,
    /// Retrying connect until the device answers
    Connecting,
    /// Subscribed and polling
    Active,
    /// Tearing the session down
    Stopping,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Pairing => "pairing",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Validated command for the supervisor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Pair, then connect and start a session
    Pair(DeviceAddress),
    /// Connect and start a session (no-op if one exists)
    Start(DeviceAddress),
    /// Tear the session down (no-op when idle)
    Stop,
    /// Read the battery and persist the snapshot
    BatteryRequest,
    /// Haptic alert, lock-enforcement hand-off, then stop
    Alert,
    /// No payload: the host relaunched the service; re-register listeners only
    Restart,
}

impl Command {
    /// Wire name of the command.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Pair(_) => "PAIR",
            Self::Start(_) => "START",
            Self::Stop => "STOP",
            Self::BatteryRequest => "BATTERY_REQUEST",
            Self::Alert => "ALERT",
            Self::Restart => "RESTART",
        }
    }
}

/// Observable supervisor events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// State machine moved
    StateChanged {
        /// Previous state
        from: SessionState,
        /// New state
        to: SessionState,
    },
    /// Stream listeners were (re-)registered with the driver
    ListenersRegistered,
    /// Haptic alert requests were issued
    AlertDispatched,
    /// A host-level self-restart was armed
    RestartScheduled {
        /// Delay until relaunch
        delay: Duration,
    },
}

/// Point-in-time view of the supervisor.
#[derive(Clone, Debug, Serialize)]
pub struct SessionSnapshot {
    /// Lifecycle state
    pub state: SessionState,
    /// Target device of the current session
    pub device: Option<DeviceAddress>,
    /// Streams with an enabled subscription
    pub active_streams: BTreeSet<StreamKind>,
    /// Session start (ms since Unix epoch)
    pub started_at_ms: Option<u64>,
    /// Whether the lifecycle guard holds the wake lock
    pub guard_held: bool,
    /// Whether the heart-rate poll loop is scheduled
    pub poll_loop_running: bool,
    /// Samples waiting for the sink
    pub samples_pending: usize,
    /// Samples dropped by the ingest queue
    pub samples_dropped: u64,
}

/// Sibling service that enforces the app lock after an alert.
pub trait LockEnforcer: Send + Sync {
    /// Ask the lock-enforcement service to start.
    fn request_start(&self);
}

/// External collaborators injected into the supervisor.
pub struct Collaborators {
    /// Persistence for decoded samples
    pub sink: Arc<dyn SampleSink>,
    /// Shared service state
    pub store: Arc<dyn StateStore>,
    /// Host wake lock held while a session is active
    pub wake_lock: Box<dyn WakeLock>,
    /// Host timer used after an abrupt teardown
    pub restart: Arc<dyn RestartScheduler>,
    /// Receiver of the alert hand-off
    pub lock_enforcer: Arc<dyn LockEnforcer>,
}

// ============================================================================
// Handle
// ============================================================================

enum Envelope {
    Command(Command),
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Teardown(oneshot::Sender<bool>),
}

/// Messages from the session's own background tasks.
enum Internal {
    Paired { generation: u64 },
    Connected { generation: u64, attempts: u32 },
    Subscribed { generation: u64 },
    LinkLost { generation: u64, reason: Option<String> },
}

/// Cloneable handle to a running supervisor.
#[derive(Clone, Debug)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<Envelope>,
    events: broadcast::Sender<SessionEvent>,
}

impl SupervisorHandle {
    /// Queue a command. Commands are processed strictly in order.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::SupervisorGone`] after shutdown.
    pub async fn send(&self, command: Command) -> SessionResult<()> {
        self.tx
            .send(Envelope::Command(command))
            .await
            .map_err(|_| SessionError::SupervisorGone)
    }

    /// Current state of the supervisor.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::SupervisorGone`] after shutdown.
    pub async fn snapshot(&self) -> SessionResult<SessionSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Envelope::Snapshot(reply))
            .await
            .map_err(|_| SessionError::SupervisorGone)?;
        rx.await.map_err(|_| SessionError::SupervisorGone)
    }

    /// The host is removing the process: abandon the session, arm the
    /// self-restart if a session was live, and stop the supervisor.
    ///
    /// Returns whether a restart was scheduled.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::SupervisorGone`] after shutdown.
    pub async fn teardown(&self) -> SessionResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Envelope::Teardown(reply))
            .await
            .map_err(|_| SessionError::SupervisorGone)?;
        rx.await.map_err(|_| SessionError::SupervisorGone)
    }

    /// Subscribe to supervisor events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command(command) => write!(f, "Command({})", command.name()),
            Self::Snapshot(_) => f.write_str("Snapshot"),
            Self::Teardown(_) => f.write_str("Teardown"),
        }
    }
}

// ============================================================================
// Supervisor
// ============================================================================

/// One run of the connect -> subscribe -> poll -> teardown lifecycle.
struct Session {
    device: DeviceAddress,
    started_at_ms: u64,
    /// Bumped on every relink so reports from a dead link are ignored
    generation: u64,
    linked: bool,
    tasks: JoinSet<()>,
    poll_loop: Option<AbortHandle>,
}

/// Device session supervisor. See the module docs for the state machine.
pub struct Supervisor<D: LinkDriver> {
    driver: Arc<D>,
    config: SupervisorConfig,
    state_writer: StateWriter,
    state_worker: JoinHandle<()>,
    restart: Arc<dyn RestartScheduler>,
    lock_enforcer: Arc<dyn LockEnforcer>,
    guard: LifecycleGuard,
    gate: Arc<StreamGate>,
    queue: Arc<IngestQueue>,
    ingest_worker: JoinHandle<()>,
    state: SessionState,
    session: Option<Session>,
    generation: u64,
    restart_scheduled: bool,
    last_teardown: Option<JoinHandle<()>>,
    rx: mpsc::Receiver<Envelope>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    events: broadcast::Sender<SessionEvent>,
}

impl<D: LinkDriver> Supervisor<D> {
    /// Start a supervisor on the current tokio runtime.
    ///
    /// The returned join handle completes after [`SupervisorHandle::teardown`]
    /// or once every handle is dropped, when queued samples have been flushed
    /// to the sink.
    pub fn spawn(
        driver: Arc<D>,
        collaborators: Collaborators,
        config: SupervisorConfig,
    ) -> (SupervisorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.command_queue.max(1));
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);

        let queue = Arc::new(IngestQueue::new(config.ingest_capacity, config.overflow));
        let ingest_worker = spawn_ingest_worker(Arc::clone(&queue), collaborators.sink);
        let (state_writer, state_worker) = StateWriter::spawn(collaborators.store);

        let supervisor = Self {
            driver,
            config,
            state_writer,
            state_worker,
            restart: collaborators.restart,
            lock_enforcer: collaborators.lock_enforcer,
            guard: LifecycleGuard::new(collaborators.wake_lock),
            gate: Arc::new(StreamGate::new()),
            queue,
            ingest_worker,
            state: SessionState::Idle,
            session: None,
            generation: 0,
            restart_scheduled: false,
            last_teardown: None,
            rx,
            internal_tx,
            internal_rx,
            events: events.clone(),
        };

        let join = tokio::spawn(supervisor.run());
        (SupervisorHandle { tx, events }, join)
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                envelope = self.rx.recv() => {
                    let Some(envelope) = envelope else {
                        tracing::debug!("all supervisor handles dropped");
                        self.abandon_session();
                        break;
                    };
                    if self.handle(envelope).await.is_break() {
                        break;
                    }
                }
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal),
                Some(joined) = next_finished(&mut self.session) => reap(joined),
            }
        }

        self.queue.close();
        if let Err(e) = (&mut self.ingest_worker).await {
            tracing::error!("ingest worker failed: {}", e);
        }

        // Flush pending state writes
        drop(self.state_writer);
        if let Err(e) = self.state_worker.await {
            tracing::error!("state writer failed: {}", e);
        }
        tracing::debug!("supervisor stopped");
    }

    async fn handle(&mut self, envelope: Envelope) -> ControlFlow<()> {
        match envelope {
            Envelope::Command(command) => self.handle_command(command).await,
            Envelope::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Envelope::Teardown(reply) => {
                let scheduled = self.teardown().await;
                let _ = reply.send(scheduled);
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn handle_command(&mut self, command: Command) {
        tracing::debug!("handling {} in state {}", command.name(), self.state);
        match command {
            Command::Start(device) => self.begin_session(device, false),
            Command::Pair(device) => self.begin_session(device, true),
            Command::Stop => self.stop_session(),
            Command::BatteryRequest => self.read_battery(),
            Command::Alert => self.alert().await,
            Command::Restart => {
                tracing::info!("relaunched without a command, re-registering listeners");
                self.register_listeners();
            }
        }
    }

    fn handle_internal(&mut self, internal: Internal) {
        let current = self.session.as_ref().map(|s| s.generation);
        match internal {
            Internal::Paired { generation } if current == Some(generation) => {
                if self.state == SessionState::Pairing {
                    self.set_state(SessionState::Connecting);
                }
            }
            Internal::Connected { generation, attempts } if current == Some(generation) => {
                if self.state == SessionState::Connecting {
                    tracing::debug!("link up after {} connect attempt(s)", attempts);
                    self.subscribe_streams();
                }
            }
            Internal::Subscribed { generation } if current == Some(generation) => {
                if self.state == SessionState::Connecting {
                    self.enter_active();
                }
            }
            Internal::LinkLost { generation, reason } if current == Some(generation) => {
                self.relink(reason.as_deref());
            }
            Internal::Paired { .. }
            | Internal::Connected { .. }
            | Internal::Subscribed { .. }
            | Internal::LinkLost { .. } => {
                tracing::debug!("ignoring report from a finished session or link");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------------

    fn begin_session(&mut self, device: DeviceAddress, pair: bool) {
        if let Some(session) = &self.session {
            tracing::debug!(
                "session for {} already started ({}), ignoring",
                session.device,
                self.state
            );
            return;
        }

        self.state_writer.submit(StateWrite::LastDevice(device.clone()));
        self.state_writer.submit(StateWrite::RunFlag(RunFlag::Started));

        self.generation += 1;
        let generation = self.generation;
        let mut tasks = JoinSet::new();

        let driver = Arc::clone(&self.driver);
        let internal = self.internal_tx.clone();
        let retry_delay = self.config.connect_retry_delay;
        let previous_teardown = self.last_teardown.take();
        let target = device.clone();

        tasks.spawn(async move {
            // Let the previous session's unsubscribe finish before relinking
            if let Some(teardown) = previous_teardown {
                let _ = teardown.await;
            }

            if pair {
                match driver.pair(&target).await {
                    Ok(()) => tracing::info!("paired with {}", target),
                    Err(e) => tracing::warn!("pairing with {} failed: {}", target, e),
                }
                let _ = internal.send(Internal::Paired { generation });
            }

            let attempts = connect_until_linked(driver.as_ref(), &target, retry_delay).await;
            let _ = internal.send(Internal::Connected { generation, attempts });
        });

        self.session = Some(Session {
            device,
            started_at_ms: now_ms(),
            generation,
            linked: false,
            tasks,
            poll_loop: None,
        });
        self.set_state(if pair { SessionState::Pairing } else { SessionState::Connecting });
    }

    /// Link is up: (a) listeners, then (b) device-side notifications.
    fn subscribe_streams(&mut self) {
        self.register_listeners();
        for stream in StreamKind::ALL {
            self.gate.enable(stream);
        }

        let internal = self.internal_tx.clone();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.linked = true;
        let generation = session.generation;
        self.driver.set_link_listener(Some(link_listener(internal.clone(), generation)));

        let driver = Arc::clone(&self.driver);
        session.tasks.spawn(async move {
            for stream in NOTIFY_STREAMS {
                if let Err(e) = driver.enable_notify(stream).await {
                    tracing::warn!("enabling {} notifications failed: {}", stream, e);
                }
            }
            let _ = internal.send(Internal::Subscribed { generation });
        });
    }

    /// Subscribed: (c) stay awake, then (d) the heart-rate poll loop.
    fn enter_active(&mut self) {
        if let Err(e) = self.guard.acquire() {
            tracing::warn!("could not acquire lifecycle guard: {}", e);
        }

        let Some(session) = self.session.as_mut() else {
            return;
        };

        let driver = Arc::clone(&self.driver);
        let period = self.config.poll_interval.max(Duration::from_millis(1));
        let poll = session.tasks.spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = driver.start_action(ActionKind::HeartRateScan).await {
                    tracing::debug!("heart-rate scan failed: {}", e);
                }
            }
        });
        session.poll_loop = Some(poll);

        let device = session.device.clone();
        self.set_state(SessionState::Active);
        tracing::info!("session active on {}", device);
    }

    /// The established link went away: poll loop off, connect again.
    fn relink(&mut self, reason: Option<&str>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session.linked {
            return;
        }

        tracing::warn!(
            "link to {} lost ({}), reconnecting",
            session.device,
            reason.unwrap_or("no reason given")
        );
        session.linked = false;
        if let Some(poll) = session.poll_loop.take() {
            poll.abort();
        }
        self.gate.disable_all();

        self.generation += 1;
        let generation = self.generation;
        session.generation = generation;

        let driver = Arc::clone(&self.driver);
        let internal = self.internal_tx.clone();
        let retry_delay = self.config.connect_retry_delay;
        let target = session.device.clone();
        session.tasks.spawn(async move {
            let attempts = connect_until_linked(driver.as_ref(), &target, retry_delay).await;
            let _ = internal.send(Internal::Connected { generation, attempts });
        });

        self.set_state(SessionState::Connecting);
    }

    fn stop_session(&mut self) {
        let Some(mut session) = self.session.take() else {
            tracing::debug!("stop requested while idle");
            self.release_guard();
            return;
        };

        self.set_state(SessionState::Stopping);
        self.release_guard();
        self.gate.disable_all();
        self.driver.set_link_listener(None);
        for stream in StreamKind::ALL {
            self.driver.set_listener(stream, None);
        }

        // In-flight driver calls are abandoned, not awaited
        session.tasks.abort_all();

        let driver = Arc::clone(&self.driver);
        self.last_teardown = Some(tokio::spawn(async move {
            for stream in NOTIFY_STREAMS {
                if let Err(e) = driver.disable_notify(stream).await {
                    tracing::debug!("disabling {} notifications failed: {}", stream, e);
                }
            }
        }));

        self.state_writer.submit(StateWrite::RunFlag(RunFlag::Stopped));
        self.set_state(SessionState::Idle);
        tracing::info!("session on {} stopped", session.device);
    }

    async fn alert(&mut self) {
        if self.state != SessionState::Active {
            tracing::debug!("alert ignored while {}", self.state);
            return;
        }

        let driver = Arc::clone(&self.driver);
        let mut haptic = Box::pin(async move {
            let (start, stop) = future::join(
                driver.start_action(ActionKind::Vibrate),
                driver.start_action(ActionKind::StopVibrate),
            )
            .await;
            for (action, result) in [(ActionKind::Vibrate, start), (ActionKind::StopVibrate, stop)] {
                if let Err(e) = result {
                    tracing::warn!("alert {} failed: {}", action, e);
                }
            }
        });

        // One poll issues both requests in order; completion is not awaited
        if futures::poll!(haptic.as_mut()).is_pending() {
            tokio::spawn(haptic);
        }
        self.emit(SessionEvent::AlertDispatched);

        self.lock_enforcer.request_start();
        self.stop_session();
    }

    fn read_battery(&mut self) {
        if self.state != SessionState::Active {
            tracing::debug!("battery request ignored while {}", self.state);
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };

        let driver = Arc::clone(&self.driver);
        let state_writer = self.state_writer.clone();
        let queue = Arc::clone(&self.queue);
        session.tasks.spawn(async move {
            match driver.read_battery_info().await {
                Ok(info) => {
                    state_writer.submit(StateWrite::LastBattery(info.clone()));
                    queue.push(Sample::Battery(info));
                }
                Err(e) => tracing::warn!("battery read failed: {}", e),
            }
        });
    }

    async fn teardown(&mut self) -> bool {
        let mut scheduled = false;
        if self.session.is_some() && !self.restart_scheduled {
            let delay = self.config.restart_delay;
            let restart = Arc::clone(&self.restart);
            let armed = tokio::task::spawn_blocking(move || restart.schedule_restart(delay))
                .await
                .unwrap_or_else(|e| Err(GuardError::Host(format!("restart task failed: {e}"))));
            match armed {
                Ok(()) => {
                    self.restart_scheduled = true;
                    scheduled = true;
                    tracing::info!("host teardown, service relaunch scheduled in {:?}", delay);
                    self.emit(SessionEvent::RestartScheduled { delay });
                }
                Err(e) => tracing::error!("failed to schedule relaunch: {}", e),
            }
        } else {
            tracing::info!("host teardown while {}", self.state);
        }

        self.abandon_session();
        scheduled
    }

    /// Drop the session without touching persisted state, so a relaunch can
    /// resume it.
    fn abandon_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.tasks.abort_all();
        }
        self.driver.set_link_listener(None);
        self.gate.disable_all();
        self.release_guard();
        self.set_state(SessionState::Idle);
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn register_listeners(&self) {
        for stream in StreamKind::ALL {
            let handler = stream_handler(stream, Arc::clone(&self.gate), Arc::clone(&self.queue));
            self.driver.set_listener(stream, Some(handler));
        }
        self.emit(SessionEvent::ListenersRegistered);
    }

    fn release_guard(&mut self) {
        if let Err(e) = self.guard.release() {
            tracing::warn!("lifecycle guard release failed: {}", e);
        }
    }

    fn set_state(&mut self, to: SessionState) {
        let from = self.state;
        if from != to {
            self.state = to;
            tracing::debug!("session {} -> {}", from, to);
            self.emit(SessionEvent::StateChanged { from, to });
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            device: self.session.as_ref().map(|s| s.device.clone()),
            active_streams: self.gate.enabled(),
            started_at_ms: self.session.as_ref().map(|s| s.started_at_ms),
            guard_held: self.guard.is_held(),
            poll_loop_running: self.session.as_ref().is_some_and(|s| s.poll_loop.is_some()),
            samples_pending: self.queue.len(),
            samples_dropped: self.queue.dropped(),
        }
    }
}

/// Link listener that reports a lost link of `generation` to the supervisor.
fn link_listener(internal: mpsc::UnboundedSender<Internal>, generation: u64) -> LinkListener {
    Arc::new(move |event: LinkEvent| match event {
        LinkEvent::Disconnected { reason } => {
            let _ = internal.send(Internal::LinkLost { generation, reason });
        }
    })
}

/// Retry `connect` until the driver reports a link. Returns the attempt count.
async fn connect_until_linked<D: LinkDriver>(driver: &D, device: &DeviceAddress, retry_delay: Duration) -> u32 {
    let mut attempts: u32 = 0;
    loop {
        attempts = attempts.saturating_add(1);
        match driver.connect(device).await {
            Ok(true) => return attempts,
            Ok(false) => tracing::debug!("connect to {} declined (attempt {})", device, attempts),
            Err(e) => tracing::debug!("connect to {} failed (attempt {}): {}", device, attempts, e),
        }

        if retry_delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(retry_delay).await;
        }
    }
}

async fn next_finished(session: &mut Option<Session>) -> Option<Result<(), JoinError>> {
    match session {
        Some(session) => session.tasks.join_next().await,
        None => std::future::pending().await,
    }
}

fn reap(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            tracing::error!("session task panicked: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RunFlag;
    use crate::testing::{eventually, DriverCall, Harness, RecordingDriver};
    use wristlink_core::NotifyPayload;

    fn device() -> DeviceAddress {
        DeviceAddress::new("C8:0F:10:00:00:01").unwrap()
    }

    fn config() -> SupervisorConfig {
        SupervisorConfig::default()
    }

    async fn start_active(harness: &mut Harness) {
        harness.handle.send(Command::Start(device())).await.unwrap();
        harness.wait_for_state(SessionState::Active).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_start_is_idempotent() {
        let mut harness = Harness::spawn(RecordingDriver::new(), config());

        for _ in 0..3 {
            harness.handle.send(Command::Start(device())).await.unwrap();
        }
        harness.wait_for_state(SessionState::Active).await;
        harness.handle.send(Command::Start(device())).await.unwrap();

        // Three poll periods
        tokio::time::sleep(Duration::from_secs(95)).await;

        let driver = &harness.driver;
        assert_eq!(driver.connects(), 1);
        assert_eq!(driver.count(&DriverCall::EnableNotify(StreamKind::Steps)), 1);
        assert_eq!(driver.count(&DriverCall::EnableNotify(StreamKind::Motion)), 1);
        assert_eq!(driver.count(&DriverCall::Action(ActionKind::HeartRateScan)), 3);
        assert_eq!(harness.wake_lock.acquires.load(std::sync::atomic::Ordering::SeqCst), 1);

        let snapshot = harness.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, SessionState::Active);
        assert_eq!(snapshot.device, Some(device()));
        assert_eq!(snapshot.active_streams.len(), 3);
        assert!(snapshot.guard_held);
        assert!(snapshot.poll_loop_running);
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_harmless() {
        let harness = Harness::spawn(RecordingDriver::new(), config());

        harness.handle.send(Command::Stop).await.unwrap();
        harness.handle.send(Command::Stop).await.unwrap();

        let snapshot = harness.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, SessionState::Idle);
        assert!(!snapshot.guard_held);
        assert_eq!(harness.wake_lock.releases.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert!(harness.driver.calls().is_empty());
    }

    #[tokio::test]
    async fn test_double_stop_releases_once() {
        let mut harness = Harness::spawn(RecordingDriver::new(), config());
        start_active(&mut harness).await;

        harness.handle.send(Command::Stop).await.unwrap();
        harness.handle.send(Command::Stop).await.unwrap();

        let snapshot = harness.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, SessionState::Idle);
        assert!(snapshot.active_streams.is_empty());
        assert!(!snapshot.poll_loop_running);
        assert_eq!(harness.wake_lock.releases.load(std::sync::atomic::Ordering::SeqCst), 1);
        for stream in StreamKind::ALL {
            assert!(!harness.driver.has_listener(stream));
        }
        assert!(!harness.driver.drop_link());

        let store = Arc::clone(&harness.store);
        eventually(move || matches!(store.run_flag(), Ok(RunFlag::Stopped))).await;

        let driver = Arc::clone(&harness.driver);
        eventually(move || {
            driver.count(&DriverCall::DisableNotify(StreamKind::Steps)) == 1
                && driver.count(&DriverCall::DisableNotify(StreamKind::Motion)) == 1
        })
        .await;
    }

    #[tokio::test]
    async fn test_connect_retries_until_linked() {
        let mut harness = Harness::spawn(RecordingDriver::new().with_connect_failures(4), config());
        harness.handle.send(Command::Start(device())).await.unwrap();
        harness.wait_for_state(SessionState::Connecting).await;
        harness.wait_for_state(SessionState::Active).await;

        assert_eq!(harness.driver.connects(), 5);
        let store = Arc::clone(&harness.store);
        eventually(move || {
            matches!(store.run_flag(), Ok(RunFlag::Started)) && matches!(store.last_device(), Ok(Some(_)))
        })
        .await;
        assert_eq!(harness.store.last_device().unwrap(), Some(device()));
    }

    #[tokio::test]
    async fn test_pair_then_connect() {
        let mut harness = Harness::spawn(RecordingDriver::new(), config());
        harness.handle.send(Command::Pair(device())).await.unwrap();
        harness.wait_for_state(SessionState::Pairing).await;
        harness.wait_for_state(SessionState::Connecting).await;
        harness.wait_for_state(SessionState::Active).await;

        let calls = harness.driver.calls();
        assert_eq!(calls[0], DriverCall::Pair(device()));
        assert_eq!(calls[1], DriverCall::Connect(device()));
        assert_eq!(harness.driver.connects(), 1);
        assert_eq!(harness.driver.count(&DriverCall::EnableNotify(StreamKind::Steps)), 1);

        let store = Arc::clone(&harness.store);
        eventually(move || matches!(store.last_device(), Ok(Some(_)))).await;
        assert_eq!(harness.store.last_device().unwrap(), Some(device()));
    }

    #[tokio::test]
    async fn test_failed_pair_still_connects() {
        let mut harness = Harness::spawn(RecordingDriver::new().failing_pair(), config());
        harness.handle.send(Command::Pair(device())).await.unwrap();
        harness.wait_for_state(SessionState::Pairing).await;
        harness.wait_for_state(SessionState::Connecting).await;
        harness.wait_for_state(SessionState::Active).await;

        let calls = harness.driver.calls();
        assert_eq!(calls[0], DriverCall::Pair(device()));
        assert_eq!(calls[1], DriverCall::Connect(device()));
    }

    #[tokio::test]
    async fn test_active_entry_subscribes_before_guard() {
        let mut harness = Harness::spawn(RecordingDriver::new(), config());
        start_active(&mut harness).await;

        assert_eq!(harness.journal.entries(), vec!["enable_notify", "enable_notify", "acquire"]);

        let calls = harness.driver.calls();
        let registered = calls
            .iter()
            .position(|c| matches!(c, DriverCall::SetListener(_, true)))
            .unwrap();
        let enabled = calls
            .iter()
            .position(|c| matches!(c, DriverCall::EnableNotify(_)))
            .unwrap();
        assert!(registered < enabled);

        let snapshot = harness.handle.snapshot().await.unwrap();
        assert!(snapshot.guard_held);
        assert!(snapshot.poll_loop_running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_poll_loop() {
        let mut harness = Harness::spawn(RecordingDriver::new(), config());
        start_active(&mut harness).await;

        tokio::time::sleep(Duration::from_secs(65)).await;
        let scans = harness.driver.count(&DriverCall::Action(ActionKind::HeartRateScan));
        assert_eq!(scans, 2);

        harness.handle.send(Command::Stop).await.unwrap();
        harness.wait_for_state(SessionState::Idle).await;

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(harness.driver.count(&DriverCall::Action(ActionKind::HeartRateScan)), scans);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_reconnects_and_resubscribes() {
        let mut harness = Harness::spawn(RecordingDriver::new(), config());
        start_active(&mut harness).await;
        assert!(harness.driver.has_link_listener());

        assert!(harness.driver.drop_link());
        harness.wait_for_state(SessionState::Connecting).await;
        harness.wait_for_state(SessionState::Active).await;

        let driver = &harness.driver;
        assert_eq!(driver.connects(), 2);
        assert_eq!(driver.count(&DriverCall::EnableNotify(StreamKind::Steps)), 2);
        assert_eq!(driver.count(&DriverCall::EnableNotify(StreamKind::Motion)), 2);
        // Guard stays held across the reconnect
        assert_eq!(harness.wake_lock.acquires.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(harness.wake_lock.releases.load(std::sync::atomic::Ordering::SeqCst), 0);

        // Only the new poll loop ticks
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(harness.driver.count(&DriverCall::Action(ActionKind::HeartRateScan)), 1);

        let snapshot = harness.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, SessionState::Active);
        assert_eq!(snapshot.active_streams.len(), 3);
        assert!(snapshot.guard_held);
    }

    #[tokio::test]
    async fn test_repeated_link_loss_reports_reconnect_once() {
        let mut harness = Harness::spawn(RecordingDriver::new(), config());
        start_active(&mut harness).await;

        harness.driver.drop_link();
        harness.driver.drop_link();
        harness.wait_for_state(SessionState::Active).await;

        // The second report belongs to the link that was already lost
        harness.handle.snapshot().await.unwrap();
        assert_eq!(harness.driver.connects(), 2);
    }

    #[tokio::test]
    async fn test_stop_while_connecting_abandons_connect_loop() {
        let mut harness = Harness::spawn(RecordingDriver::new().with_connect_failures(u32::MAX), config());
        harness.handle.send(Command::Start(device())).await.unwrap();
        harness.wait_for_state(SessionState::Connecting).await;

        let driver = Arc::clone(&harness.driver);
        eventually(move || driver.connects() > 3).await;

        harness.handle.send(Command::Stop).await.unwrap();
        harness.wait_for_state(SessionState::Idle).await;

        let settled = harness.driver.connects();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(harness.driver.connects(), settled);
        assert_eq!(harness.wake_lock.acquires.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_alert_vibrates_before_teardown() {
        let mut harness = Harness::spawn(RecordingDriver::new(), config());
        start_active(&mut harness).await;

        harness.handle.send(Command::Alert).await.unwrap();
        harness.wait_for(|e| *e == SessionEvent::AlertDispatched).await;
        harness.wait_for_state(SessionState::Idle).await;

        assert_eq!(
            harness.journal.entries(),
            vec![
                "enable_notify",
                "enable_notify",
                "acquire",
                "vibrate",
                "stop_vibrate",
                "lock_enforcer",
                "release"
            ]
        );
        assert_eq!(harness.enforcer.starts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_alert_does_not_wait_for_vibration() {
        let mut harness = Harness::spawn(RecordingDriver::new().holding_vibrate(), config());
        start_active(&mut harness).await;

        harness.handle.send(Command::Alert).await.unwrap();
        harness.wait_for_state(SessionState::Idle).await;

        assert_eq!(
            harness.journal.entries(),
            vec![
                "enable_notify",
                "enable_notify",
                "acquire",
                "vibrate",
                "stop_vibrate",
                "lock_enforcer",
                "release"
            ]
        );
    }

    #[tokio::test]
    async fn test_alert_ignored_when_idle() {
        let harness = Harness::spawn(RecordingDriver::new(), config());
        harness.handle.send(Command::Alert).await.unwrap();
        harness.handle.snapshot().await.unwrap();

        assert!(harness.journal.entries().is_empty());
        assert_eq!(harness.enforcer.starts.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_teardown_schedules_single_restart() {
        let mut harness = Harness::spawn(RecordingDriver::new(), config());
        start_active(&mut harness).await;

        assert!(harness.handle.teardown().await.unwrap());
        (&mut harness.join).await.unwrap();

        assert_eq!(harness.scheduler.delays(), vec![Duration::from_secs(1)]);
        // Persisted state is left for the relaunch
        assert_eq!(harness.store.run_flag().unwrap(), RunFlag::Started);
        assert_eq!(harness.wake_lock.releases.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(matches!(
            harness.handle.teardown().await,
            Err(SessionError::SupervisorGone)
        ));
    }

    #[tokio::test]
    async fn test_teardown_when_idle_does_not_restart() {
        let harness = Harness::spawn(RecordingDriver::new(), config());
        assert!(!harness.handle.teardown().await.unwrap());
        assert!(harness.scheduler.delays().is_empty());
    }

    #[tokio::test]
    async fn test_restart_command_only_registers_listeners() {
        let mut harness = Harness::spawn(RecordingDriver::new(), config());
        harness.handle.send(Command::Restart).await.unwrap();
        harness.wait_for(|e| *e == SessionEvent::ListenersRegistered).await;

        assert_eq!(harness.driver.connects(), 0);
        for stream in StreamKind::ALL {
            assert!(harness.driver.has_listener(stream));
        }
        let snapshot = harness.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, SessionState::Idle);
        assert!(!snapshot.guard_held);

        // Listeners stay quiet until a session subscribes
        harness.driver.emit(StreamKind::Steps, NotifyPayload::Value(5));
        assert_eq!(harness.handle.snapshot().await.unwrap().samples_pending, 0);
    }

    #[tokio::test]
    async fn test_samples_reach_sink_in_order() {
        let mut harness = Harness::spawn(RecordingDriver::new(), config());
        start_active(&mut harness).await;

        for steps in 1..=5 {
            harness.driver.emit(StreamKind::Steps, NotifyPayload::Value(steps)).unwrap().unwrap();
        }
        harness
            .driver
            .emit(StreamKind::Motion, NotifyPayload::Bytes(vec![1, 0, 0x10, 0, 0x20, 0, 0x30, 0]))
            .unwrap()
            .unwrap();
        harness.driver.emit(StreamKind::HeartRate, NotifyPayload::Value(72)).unwrap().unwrap();

        harness.handle.teardown().await.unwrap();
        (&mut harness.join).await.unwrap();

        let samples = harness.sink.samples();
        let steps: Vec<i32> = samples
            .iter()
            .filter_map(|s| match s {
                Sample::Steps(s) => Some(s.steps),
                _ => None,
            })
            .collect();
        assert_eq!(steps, vec![1, 2, 3, 4, 5]);
        assert!(samples
            .iter()
            .any(|s| matches!(s, Sample::Motion(m) if m.sequence_index == 1 && m.axis_z == 48)));
        assert!(samples
            .iter()
            .any(|s| matches!(s, Sample::HeartRate(h) if h.beats_per_minute == 72)));
    }

    #[tokio::test]
    async fn test_malformed_motion_is_reported_to_driver() {
        let mut harness = Harness::spawn(RecordingDriver::new(), config());
        start_active(&mut harness).await;

        let result = harness
            .driver
            .emit(StreamKind::Motion, NotifyPayload::Bytes(vec![1, 0, 2]))
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_battery_read_is_persisted() {
        let mut harness = Harness::spawn(RecordingDriver::new(), config());
        start_active(&mut harness).await;

        harness.handle.send(Command::BatteryRequest).await.unwrap();
        let store = Arc::clone(&harness.store);
        eventually(move || matches!(store.last_battery(), Ok(Some(_)))).await;

        assert_eq!(harness.store.last_battery().unwrap().unwrap().raw, vec![42, 0]);
        let sink = Arc::clone(&harness.sink);
        eventually(move || sink.samples().iter().any(|s| matches!(s, Sample::Battery(_)))).await;
    }

    #[tokio::test]
    async fn test_battery_failure_is_not_fatal() {
        let mut harness = Harness::spawn(RecordingDriver::new().failing_battery(), config());
        start_active(&mut harness).await;

        harness.handle.send(Command::BatteryRequest).await.unwrap();
        let driver = Arc::clone(&harness.driver);
        eventually(move || driver.count(&DriverCall::ReadBattery) == 1).await;

        assert_eq!(harness.handle.snapshot().await.unwrap().state, SessionState::Active);
        assert!(harness.store.last_battery().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_battery_request_ignored_when_idle() {
        let harness = Harness::spawn(RecordingDriver::new(), config());
        harness.handle.send(Command::BatteryRequest).await.unwrap();
        harness.handle.snapshot().await.unwrap();

        assert_eq!(harness.driver.count(&DriverCall::ReadBattery), 0);
    }

    #[tokio::test]
    async fn test_restart_session_after_stop() {
        let mut harness = Harness::spawn(RecordingDriver::new(), config());
        start_active(&mut harness).await;
        harness.handle.send(Command::Stop).await.unwrap();
        harness.wait_for_state(SessionState::Idle).await;
        start_active(&mut harness).await;

        let driver = Arc::clone(&harness.driver);
        eventually(move || driver.count(&DriverCall::EnableNotify(StreamKind::Motion)) == 2).await;

        // Previous unsubscribe completes before the new link comes up
        let calls = harness.driver.calls();
        let last_disable = calls
            .iter()
            .rposition(|c| matches!(c, DriverCall::DisableNotify(_)))
            .unwrap();
        let second_connect = calls
            .iter()
            .enumerate()
            .filter(|(_, c)| matches!(c, DriverCall::Connect(_)))
            .nth(1)
            .map(|(i, _)| i)
            .unwrap();
        assert!(last_disable < second_connect);
        assert_eq!(harness.wake_lock.acquires.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
