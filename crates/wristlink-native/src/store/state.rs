//! Shared service state store.
//!
//! The supervisor, the restart path and external readers (lock enforcement,
//! UI) exchange a handful of values that must survive process restarts.
//! Instead of ambient global flags they all go through an injected
//! [`StateStore`] with a closed set of keys.
//!
//! Stores are synchronous. Async callers hand writes to a [`StateWriter`],
//! which applies them in order on tokio's blocking pool.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use wristlink_core::{BatteryInfo, DeviceAddress};

use super::{StoreError, StoreResult};

/// Keys understood by every [`StateStore`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StateKey {
    /// `STARTED` / `STOPPED`
    ServiceRunning,
    /// Address of the last device a session was started for
    LastDeviceId,
    /// JSON-encoded [`BatteryInfo`] from the last successful read
    LastBatteryInfo,
}

impl StateKey {
    /// Storage name of the key.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ServiceRunning => "service_running",
            Self::LastDeviceId => "last_device_id",
            Self::LastBatteryInfo => "last_battery_info",
        }
    }
}

/// Whether the service should be running.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RunFlag {
    /// A session was requested and not stopped
    Started,
    /// No session requested
    Stopped,
}

impl RunFlag {
    /// Stored representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Started => "STARTED",
            Self::Stopped => "STOPPED",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "STARTED" => Some(Self::Started),
            "STOPPED" => Some(Self::Stopped),
            _ => None,
        }
    }
}

/// Key/value store for service state shared across components and restarts.
pub trait StateStore: Send + Sync {
    /// Read a raw value.
    ///
    /// # Errors
    ///
    /// Backend failure.
    fn get(&self, key: StateKey) -> StoreResult<Option<String>>;

    /// Write a raw value.
    ///
    /// # Errors
    ///
    /// Backend failure.
    fn set(&self, key: StateKey, value: &str) -> StoreResult<()>;

    /// Run flag; absent or unreadable values count as stopped.
    ///
    /// # Errors
    ///
    /// Backend failure.
    fn run_flag(&self) -> StoreResult<RunFlag> {
        Ok(self
            .get(StateKey::ServiceRunning)?
            .as_deref()
            .and_then(RunFlag::parse)
            .unwrap_or(RunFlag::Stopped))
    }

    /// Persist the run flag.
    ///
    /// # Errors
    ///
    /// Backend failure.
    fn set_run_flag(&self, flag: RunFlag) -> StoreResult<()> {
        self.set(StateKey::ServiceRunning, flag.as_str())
    }

    /// Last device a session was started for.
    ///
    /// # Errors
    ///
    /// Backend failure or a stored blank address.
    fn last_device(&self) -> StoreResult<Option<DeviceAddress>> {
        self.get(StateKey::LastDeviceId)?
            .map(|raw| DeviceAddress::new(raw).map_err(|e| StoreError::Corrupt(e.to_string())))
            .transpose()
    }

    /// Persist the last device.
    ///
    /// # Errors
    ///
    /// Backend failure.
    fn set_last_device(&self, device: &DeviceAddress) -> StoreResult<()> {
        self.set(StateKey::LastDeviceId, device.as_str())
    }

    /// Last battery snapshot.
    ///
    /// # Errors
    ///
    /// Backend failure or undecodable JSON.
    fn last_battery(&self) -> StoreResult<Option<BatteryInfo>> {
        self.get(StateKey::LastBatteryInfo)?
            .map(|raw| serde_json::from_str(&raw).map_err(StoreError::from))
            .transpose()
    }

    /// Persist a battery snapshot.
    ///
    /// # Errors
    ///
    /// Backend failure.
    fn set_last_battery(&self, info: &BatteryInfo) -> StoreResult<()> {
        self.set(StateKey::LastBatteryInfo, &serde_json::to_string(info)?)
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Volatile store, for tests and for hosts that persist elsewhere.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    values: RwLock<HashMap<StateKey, String>>,
}

impl MemoryStateStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, key: StateKey) -> StoreResult<Option<String>> {
        let values = self.values.read().map_err(|_| StoreError::Locked)?;
        Ok(values.get(&key).cloned())
    }

    fn set(&self, key: StateKey, value: &str) -> StoreResult<()> {
        let mut values = self.values.write().map_err(|_| StoreError::Locked)?;
        values.insert(key, value.to_string());
        Ok(())
    }
}

// ============================================================================
// JSON file store
// ============================================================================

/// File-backed store. Every write replaces the file atomically.
#[derive(Debug)]
pub struct JsonStateStore {
    path: PathBuf,
    values: RwLock<HashMap<String, String>>,
}

impl JsonStateStore {
    /// Open the store at `path`, creating it lazily on first write.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let values = match fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => HashMap::new(),
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::debug!("state store opened at {} ({} keys)", path.display(), values.len());

        Ok(Self {
            path,
            values: RwLock::new(values),
        })
    }

    /// Location of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, values: &HashMap<String, String>) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(serde_json::to_string_pretty(values)?.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl StateStore for JsonStateStore {
    fn get(&self, key: StateKey) -> StoreResult<Option<String>> {
        let values = self.values.read().map_err(|_| StoreError::Locked)?;
        Ok(values.get(key.as_str()).cloned())
    }

    fn set(&self, key: StateKey, value: &str) -> StoreResult<()> {
        let mut values = self.values.write().map_err(|_| StoreError::Locked)?;
        values.insert(key.as_str().to_string(), value.to_string());
        self.flush(&values)
    }
}

// ============================================================================
// Ordered writer
// ============================================================================

/// One typed write for a [`StateWriter`].
#[derive(Clone, Debug, PartialEq)]
pub enum StateWrite {
    /// Persist the run flag
    RunFlag(RunFlag),
    /// Persist the last device
    LastDevice(DeviceAddress),
    /// Persist a battery snapshot
    LastBattery(BatteryInfo),
}

impl StateWrite {
    fn apply(&self, store: &dyn StateStore) -> StoreResult<()> {
        match self {
            Self::RunFlag(flag) => store.set_run_flag(*flag),
            Self::LastDevice(device) => store.set_last_device(device),
            Self::LastBattery(info) => store.set_last_battery(info),
        }
    }

    const fn key(&self) -> StateKey {
        match self {
            Self::RunFlag(_) => StateKey::ServiceRunning,
            Self::LastDevice(_) => StateKey::LastDeviceId,
            Self::LastBattery(_) => StateKey::LastBatteryInfo,
        }
    }
}

/// Applies [`StateWrite`]s in submission order off the async workers.
///
/// Submitting never blocks. The worker returned by [`StateWriter::spawn`]
/// finishes once every clone of the writer is dropped and the backlog is
/// written.
#[derive(Clone, Debug)]
pub struct StateWriter {
    tx: mpsc::UnboundedSender<StateWrite>,
}

impl StateWriter {
    /// Start the writer task for `store` on the current runtime.
    pub fn spawn(store: Arc<dyn StateStore>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<StateWrite>();

        let worker = tokio::spawn(async move {
            while let Some(write) = rx.recv().await {
                let key = write.key();
                let store = Arc::clone(&store);
                match tokio::task::spawn_blocking(move || write.apply(store.as_ref())).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!("failed to persist {}: {}", key.as_str(), e),
                    Err(e) => tracing::error!("state write for {} did not finish: {}", key.as_str(), e),
                }
            }
            tracing::debug!("state writer stopped");
        });

        (Self { tx }, worker)
    }

    /// Queue a write.
    pub fn submit(&self, write: StateWrite) {
        if self.tx.send(write).is_err() {
            tracing::warn!("state writer stopped, write lost");
        }
    }
}
