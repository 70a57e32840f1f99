//! In-process simulated wearable.
//!
//! Stands in for the radio when no hardware is around. While a stream is
//! enabled the simulator emits payloads in the same shapes a real driver
//! would: running step counts as integers, motion as the 8-byte raw record,
//! heart rate as an integer shortly after each heart-rate scan.

use std::collections::HashMap;
use std::f32::consts::PI;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;

use wristlink_core::{now_ms, ActionKind, BatteryInfo, DeviceAddress, NotifyPayload, StreamKind};

use super::driver::{DriverError, DriverResult, LinkDriver, LinkEvent, LinkListener, StreamHandler};

/// Configuration for [`SimulatedDriver`].
#[derive(Clone, Debug)]
pub struct SimulatedConfig {
    /// Delay before each connect attempt resolves
    pub connect_latency: Duration,
    /// Number of initial connect attempts answered negatively
    pub fail_first_connects: u32,
    /// Period between realtime step notifications
    pub step_interval: Duration,
    /// Period between raw motion notifications
    pub motion_interval: Duration,
    /// Delay between a heart-rate scan and its reading
    pub scan_latency: Duration,
    /// Centre of the simulated heart rate
    pub resting_bpm: i32,
    /// Reported battery percentage
    pub battery_percent: u8,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            connect_latency: Duration::from_millis(300),
            fail_first_connects: 0,
            step_interval: Duration::from_secs(1),
            motion_interval: Duration::from_millis(100),
            scan_latency: Duration::from_millis(500),
            resting_bpm: 68,
            battery_percent: 87,
        }
    }
}

type Listeners = Arc<RwLock<HashMap<StreamKind, StreamHandler>>>;

/// Simulated wearable implementing [`LinkDriver`].
pub struct SimulatedDriver {
    config: SimulatedConfig,
    listeners: Listeners,
    link_listener: RwLock<Option<LinkListener>>,
    connected: AtomicBool,
    connect_attempts: AtomicU32,
    scans: AtomicU32,
    steps: Arc<AtomicI32>,
    generators: Mutex<HashMap<StreamKind, JoinHandle<()>>>,
}

impl SimulatedDriver {
    /// Create a simulator with default timing.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(SimulatedConfig::default())
    }

    /// Create a simulator with custom timing.
    #[must_use]
    pub fn with_config(config: SimulatedConfig) -> Self {
        Self {
            config,
            listeners: Arc::new(RwLock::new(HashMap::new())),
            link_listener: RwLock::new(None),
            connected: AtomicBool::new(false),
            connect_attempts: AtomicU32::new(0),
            scans: AtomicU32::new(0),
            steps: Arc::new(AtomicI32::new(0)),
            generators: Mutex::new(HashMap::new()),
        }
    }

    /// Number of connect attempts seen so far.
    #[must_use]
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Drop the link as if the wearable went out of range.
    ///
    /// Generators stop, calls fail with [`DriverError::NotConnected`] until
    /// the next successful connect, and the link listener is told.
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Ok(mut generators) = self.generators.lock() {
            for (_, handle) in generators.drain() {
                handle.abort();
            }
        }

        let listener = self.link_listener.read().ok().and_then(|l| l.clone());
        if let Some(listener) = listener {
            listener(LinkEvent::Disconnected {
                reason: Some("simulated link loss".to_string()),
            });
        }
    }

    fn ensure_connected(&self) -> DriverResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DriverError::NotConnected)
        }
    }

    fn spawn_generator(&self, stream: StreamKind) -> JoinHandle<()> {
        let listeners = Arc::clone(&self.listeners);
        let steps = Arc::clone(&self.steps);
        let period = match stream {
            StreamKind::Motion => self.config.motion_interval,
            _ => self.config.step_interval,
        };

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            let mut sequence: u16 = 0;
            loop {
                ticker.tick().await;
                let payload = match stream {
                    StreamKind::Steps => {
                        // Roughly walking pace: 0-2 steps per tick
                        let stride = i32::from(sequence % 3 != 0) + i32::from(sequence % 5 == 0);
                        NotifyPayload::Value(steps.fetch_add(stride, Ordering::SeqCst) + stride)
                    }
                    StreamKind::Motion => NotifyPayload::Bytes(motion_record(sequence)),
                    StreamKind::HeartRate => continue,
                };
                sequence = sequence.wrapping_add(1);
                deliver(&listeners, stream, payload);
            }
        })
    }
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SimulatedDriver {
    fn drop(&mut self) {
        if let Ok(mut generators) = self.generators.lock() {
            for (_, handle) in generators.drain() {
                handle.abort();
            }
        }
    }
}

impl LinkDriver for SimulatedDriver {
    async fn connect(&self, device: &DeviceAddress) -> DriverResult<bool> {
        let attempt = self.connect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.config.connect_latency).await;

        if attempt <= self.config.fail_first_connects {
            tracing::debug!("simulated {} out of range (attempt {})", device, attempt);
            return Ok(false);
        }

        self.connected.store(true, Ordering::SeqCst);
        tracing::debug!("simulated {} connected after {} attempt(s)", device, attempt);
        Ok(true)
    }

    async fn pair(&self, device: &DeviceAddress) -> DriverResult<()> {
        tokio::time::sleep(self.config.connect_latency).await;
        tracing::debug!("simulated {} paired", device);
        Ok(())
    }

    fn set_listener(&self, stream: StreamKind, handler: Option<StreamHandler>) {
        let Ok(mut listeners) = self.listeners.write() else {
            tracing::error!("simulated listener table poisoned");
            return;
        };
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
        match self.link_listener.write() {
            Ok(mut slot) => *slot = listener,
            Err(_) => tracing::error!("simulated link listener slot poisoned"),
        }
    }

    async fn enable_notify(&self, stream: StreamKind) -> DriverResult<()> {
        self.ensure_connected()?;
        if stream == StreamKind::HeartRate {
            // Heart rate only arrives as the answer to a scan
            return Ok(());
        }

        let mut generators = self
            .generators
            .lock()
            .map_err(|_| DriverError::Transport("generator table poisoned".to_string()))?;
        if !generators.contains_key(&stream) {
            generators.insert(stream, self.spawn_generator(stream));
        }
        Ok(())
    }

    async fn disable_notify(&self, stream: StreamKind) -> DriverResult<()> {
        let mut generators = self
            .generators
            .lock()
            .map_err(|_| DriverError::Transport("generator table poisoned".to_string()))?;
        if let Some(handle) = generators.remove(&stream) {
            handle.abort();
        }
        Ok(())
    }

    async fn start_action(&self, action: ActionKind) -> DriverResult<()> {
        self.ensure_connected()?;
        match action {
            ActionKind::Vibrate | ActionKind::StopVibrate => {
                tracing::info!("simulated haptic: {}", action);
            }
            ActionKind::HeartRateScan => {
                let scan = self.scans.fetch_add(1, Ordering::SeqCst);
                #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
                let bpm = self.config.resting_bpm + (8.0 * (scan as f32 * 0.7).sin()) as i32;
                let listeners = Arc::clone(&self.listeners);
                let latency = self.config.scan_latency;
                tokio::spawn(async move {
                    tokio::time::sleep(latency).await;
                    deliver(&listeners, StreamKind::HeartRate, NotifyPayload::Value(bpm));
                });
            }
        }
        Ok(())
    }

    async fn read_battery_info(&self) -> DriverResult<BatteryInfo> {
        self.ensure_connected()?;
        // [percent, charging flag]
        Ok(BatteryInfo::new(now_ms(), vec![self.config.battery_percent, 0x00]))
    }
}

/// Hand a payload to the listener of `stream`, if any.
fn deliver(listeners: &Listeners, stream: StreamKind, payload: NotifyPayload) {
    let handler = match listeners.read() {
        Ok(listeners) => listeners.get(&stream).cloned(),
        Err(_) => None,
    };

    if let Some(handler) = handler {
        if let Err(e) = handler(payload) {
            tracing::error!("simulated {} listener rejected payload: {}", stream, e);
        }
    }
}

/// Build one raw motion record: a slow wrist swing on X/Y plus gravity on Z.
#[allow(clippy::cast_possible_truncation)]
fn motion_record(sequence: u16) -> Vec<u8> {
    let t = f32::from(sequence) * 0.1;
    let x = (1200.0 * (2.0 * PI * 0.5 * t).sin()) as i16;
    let y = (800.0 * (2.0 * PI * 0.5 * t + 0.5).cos()) as i16;
    let z = 4096_i16;

    let mut record = Vec::with_capacity(wristlink_core::MOTION_PAYLOAD_LEN);
    record.extend_from_slice(&sequence.to_le_bytes());
    record.extend_from_slice(&x.to_le_bytes());
    record.extend_from_slice(&y.to_le_bytes());
    record.extend_from_slice(&z.to_le_bytes());
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use wristlink_core::{decode_motion, DecodeError};

    fn fast_config() -> SimulatedConfig {
        SimulatedConfig {
            connect_latency: Duration::ZERO,
            step_interval: Duration::from_millis(10),
            motion_interval: Duration::from_millis(10),
            scan_latency: Duration::from_millis(5),
            ..Default::default()
        }
    }

    #[test]
    fn test_motion_record_decodes() {
        let record = motion_record(7);
        let sample = decode_motion(&record, 0).unwrap();
        assert_eq!(sample.sequence_index, 7);
        assert_eq!(sample.axis_z, 4096);
    }

    #[tokio::test]
    async fn test_fail_first_connects() {
        let driver = SimulatedDriver::with_config(SimulatedConfig {
            fail_first_connects: 2,
            ..fast_config()
        });
        let device = DeviceAddress::new("SIM").unwrap();

        assert!(!driver.connect(&device).await.unwrap());
        assert!(!driver.connect(&device).await.unwrap());
        assert!(driver.connect(&device).await.unwrap());
        assert_eq!(driver.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_actions_need_connection() {
        let driver = SimulatedDriver::with_config(fast_config());
        assert!(matches!(
            driver.start_action(ActionKind::Vibrate).await,
            Err(DriverError::NotConnected)
        ));
        assert!(driver.read_battery_info().await.is_err());
    }

    #[tokio::test]
    async fn test_heart_rate_scan_reaches_listener() {
        let driver = SimulatedDriver::with_config(fast_config());
        driver.connect(&DeviceAddress::new("SIM").unwrap()).await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        driver.set_listener(
            StreamKind::HeartRate,
            Some(Arc::new(move |payload: NotifyPayload| -> Result<(), DecodeError> {
                let _ = tx.send(payload);
                Ok(())
            })),
        );

        driver.start_action(ActionKind::HeartRateScan).await.unwrap();
        let payload = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(payload, NotifyPayload::Value(bpm) if (60..=76).contains(&bpm)));
    }

    #[tokio::test]
    async fn test_step_stream_is_monotonic() {
        let driver = SimulatedDriver::with_config(fast_config());
        driver.connect(&DeviceAddress::new("SIM").unwrap()).await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        driver.set_listener(
            StreamKind::Steps,
            Some(Arc::new(move |payload: NotifyPayload| -> Result<(), DecodeError> {
                let _ = tx.send(payload);
                Ok(())
            })),
        );
        driver.enable_notify(StreamKind::Steps).await.unwrap();

        let mut last = -1;
        for _ in 0..5 {
            let payload = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            let NotifyPayload::Value(steps) = payload else {
                panic!("steps must be integers");
            };
            assert!(steps >= last);
            last = steps;
        }

        driver.disable_notify(StreamKind::Steps).await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_link_notifies_and_disconnects() {
        let driver = SimulatedDriver::with_config(fast_config());
        let device = DeviceAddress::new("SIM").unwrap();
        driver.connect(&device).await.unwrap();
        driver.enable_notify(StreamKind::Motion).await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        driver.set_link_listener(Some(Arc::new(move |event: LinkEvent| {
            let _ = tx.send(event);
        })));

        driver.drop_link();
        assert!(matches!(rx.recv().await, Some(LinkEvent::Disconnected { .. })));
        assert!(driver.generators.lock().unwrap().is_empty());
        assert!(matches!(
            driver.read_battery_info().await,
            Err(DriverError::NotConnected)
        ));

        // Reconnecting brings the link back
        assert!(driver.connect(&device).await.unwrap());
        assert!(driver.read_battery_info().await.is_ok());

        driver.set_link_listener(None);
        driver.drop_link();
        assert!(rx.try_recv().is_err());
    }
}
