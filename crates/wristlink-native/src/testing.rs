//! Recording collaborators for supervisor tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use wristlink_core::{now_ms, ActionKind, BatteryInfo, DecodeError, DeviceAddress, NotifyPayload, StreamKind};

use crate::bridge::{DriverError, DriverResult, LinkDriver, LinkEvent, LinkListener, StreamHandler};
use crate::session::guard::{GuardResult, RestartScheduler, WakeLock};
use crate::session::{
    Collaborators, LockEnforcer, SessionEvent, SessionState, Supervisor, SupervisorConfig, SupervisorHandle,
};
use crate::store::{MemorySink, MemoryStateStore};

/// Shared, ordered log of side effects across collaborators.
#[derive(Clone, Debug, Default)]
pub struct Journal(Arc<Mutex<Vec<&'static str>>>);

impl Journal {
    pub fn record(&self, entry: &'static str) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<&'static str> {
        self.0.lock().unwrap().clone()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DriverCall {
    Connect(DeviceAddress),
    Pair(DeviceAddress),
    SetListener(StreamKind, bool),
    EnableNotify(StreamKind),
    DisableNotify(StreamKind),
    Action(ActionKind),
    ReadBattery,
}

/// Driver that records every call and lets tests inject notifications.
#[derive(Default)]
pub struct RecordingDriver {
    calls: Mutex<Vec<DriverCall>>,
    listeners: RwLock<HashMap<StreamKind, StreamHandler>>,
    link_listener: RwLock<Option<LinkListener>>,
    connect_failures: u32,
    attempts: AtomicU32,
    hold_vibrate: bool,
    fail_pair: bool,
    fail_battery: bool,
    journal: Journal,
}

impl RecordingDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer the first `n` connects negatively. `u32::MAX` never links.
    pub fn with_connect_failures(mut self, n: u32) -> Self {
        self.connect_failures = n;
        self
    }

    /// Vibrate never completes.
    pub fn holding_vibrate(mut self) -> Self {
        self.hold_vibrate = true;
        self
    }

    pub fn failing_pair(mut self) -> Self {
        self.fail_pair = true;
        self
    }

    pub fn failing_battery(mut self) -> Self {
        self.fail_battery = true;
        self
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &DriverCall) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == call).count()
    }

    pub fn connects(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| matches!(c, DriverCall::Connect(_)))
            .count()
    }

    pub fn has_listener(&self, stream: StreamKind) -> bool {
        self.listeners.read().unwrap().contains_key(&stream)
    }

    /// Deliver a notification to the registered listener, if any.
    pub fn emit(&self, stream: StreamKind, payload: NotifyPayload) -> Option<Result<(), DecodeError>> {
        let handler = self.listeners.read().unwrap().get(&stream).cloned();
        handler.map(|handler| handler(payload))
    }

    pub fn has_link_listener(&self) -> bool {
        self.link_listener.read().unwrap().is_some()
    }

    /// Report a lost link. Returns whether anyone was listening.
    pub fn drop_link(&self) -> bool {
        let listener = self.link_listener.read().unwrap().clone();
        listener
            .map(|listener| {
                listener(LinkEvent::Disconnected {
                    reason: Some("out of range".to_string()),
                })
            })
            .is_some()
    }

    fn record(&self, call: DriverCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl LinkDriver for RecordingDriver {
    async fn connect(&self, device: &DeviceAddress) -> DriverResult<bool> {
        self.record(DriverCall::Connect(device.clone()));
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        if self.connect_failures == u32::MAX || attempt <= self.connect_failures {
            // Alternate the two failure shapes
            if attempt % 2 == 0 {
                return Err(DriverError::ConnectionFailed("out of range".to_string()));
            }
            return Ok(false);
        }
        Ok(true)
    }

    async fn pair(&self, device: &DeviceAddress) -> DriverResult<()> {
        self.record(DriverCall::Pair(device.clone()));
        if self.fail_pair {
            return Err(DriverError::Transport("pairing rejected".to_string()));
        }
        Ok(())
    }

    fn set_listener(&self, stream: StreamKind, handler: Option<StreamHandler>) {
        self.record(DriverCall::SetListener(stream, handler.is_some()));
        let mut listeners = self.listeners.write().unwrap();
        match handler {
            Some(handler) => {
                listeners.insert(stream, handler);
            }
            None => {
                listeners.remove(&stream);
            }
        }
    }

    fn set_link_listener(&self, listener: Option<LinkListener>) {
        *self.link_listener.write().unwrap() = listener;
    }

    async fn enable_notify(&self, stream: StreamKind) -> DriverResult<()> {
        self.record(DriverCall::EnableNotify(stream));
        self.journal.record("enable_notify");
        Ok(())
    }

    async fn disable_notify(&self, stream: StreamKind) -> DriverResult<()> {
        self.record(DriverCall::DisableNotify(stream));
        Ok(())
    }

    async fn start_action(&self, action: ActionKind) -> DriverResult<()> {
        self.record(DriverCall::Action(action));
        match action {
            ActionKind::Vibrate => {
                self.journal.record("vibrate");
                if self.hold_vibrate {
                    std::future::pending::<()>().await;
                }
            }
            ActionKind::StopVibrate => self.journal.record("stop_vibrate"),
            ActionKind::HeartRateScan => {}
        }
        Ok(())
    }

    async fn read_battery_info(&self) -> DriverResult<BatteryInfo> {
        self.record(DriverCall::ReadBattery);
        if self.fail_battery {
            return Err(DriverError::NotConnected);
        }
        Ok(BatteryInfo::new(now_ms(), vec![42, 0]))
    }
}

#[derive(Clone, Default)]
pub struct RecordingWakeLock {
    pub acquires: Arc<AtomicU32>,
    pub releases: Arc<AtomicU32>,
    journal: Journal,
}

impl WakeLock for RecordingWakeLock {
    fn acquire(&mut self) -> GuardResult<()> {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        self.journal.record("acquire");
        Ok(())
    }

    fn release(&mut self) -> GuardResult<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.journal.record("release");
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingScheduler {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingScheduler {
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap().clone()
    }
}

impl RestartScheduler for RecordingScheduler {
    fn schedule_restart(&self, delay: Duration) -> GuardResult<()> {
        self.delays.lock().unwrap().push(delay);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingEnforcer {
    pub starts: AtomicU32,
    journal: Journal,
}

impl LockEnforcer for RecordingEnforcer {
    fn request_start(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.journal.record("lock_enforcer");
    }
}

/// A supervisor wired to recording collaborators.
pub struct Harness {
    pub driver: Arc<RecordingDriver>,
    pub sink: Arc<MemorySink>,
    pub store: Arc<MemoryStateStore>,
    pub wake_lock: RecordingWakeLock,
    pub scheduler: Arc<RecordingScheduler>,
    pub enforcer: Arc<RecordingEnforcer>,
    pub journal: Journal,
    pub handle: SupervisorHandle,
    pub join: JoinHandle<()>,
    events: broadcast::Receiver<SessionEvent>,
}

impl Harness {
    pub fn spawn(driver: RecordingDriver, config: SupervisorConfig) -> Self {
        let journal = driver.journal();
        let driver = Arc::new(driver);
        let sink = Arc::new(MemorySink::new());
        let store = Arc::new(MemoryStateStore::new());
        let wake_lock = RecordingWakeLock {
            journal: journal.clone(),
            ..Default::default()
        };
        let scheduler = Arc::new(RecordingScheduler::default());
        let enforcer = Arc::new(RecordingEnforcer {
            journal: journal.clone(),
            ..Default::default()
        });

        let collaborators = Collaborators {
            sink: sink.clone(),
            store: store.clone(),
            wake_lock: Box::new(wake_lock.clone()),
            restart: scheduler.clone(),
            lock_enforcer: enforcer.clone(),
        };
        let (handle, join) = Supervisor::spawn(Arc::clone(&driver), collaborators, config);
        let events = handle.subscribe();

        Self {
            driver,
            sink,
            store,
            wake_lock,
            scheduler,
            enforcer,
            journal,
            handle,
            join,
            events,
        }
    }

    /// Wait for the first event matching `pred`.
    pub async fn wait_for(&mut self, pred: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
        let events = &mut self.events;
        tokio::time::timeout(Duration::from_secs(5), async move {
            loop {
                match events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => panic!("supervisor stopped while waiting"),
                }
            }
        })
        .await
        .expect("timed out waiting for supervisor event")
    }

    pub async fn wait_for_state(&mut self, state: SessionState) {
        self.wait_for(|event| matches!(event, SessionEvent::StateChanged { to, .. } if *to == state))
            .await;
    }
}

/// Poll `check` until it holds or a second passes.
pub async fn eventually(check: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}
