//! BLE driver for the wristband
//!
//! Talks to the wearable over Bluetooth Low Energy through btleplug.
//!
//! # Characteristics
//!
//! Standard GATT:
//! - `00002a37-...` - Heart Rate Measurement (notify)
//! - `00002a39-...` - Heart Rate Control Point (write)
//! - `00002a06-...` - Alert Level (write, Immediate Alert service)
//! - `00002a19-...` - Battery Level (read)
//!
//! Vendor service:
//! - `00000007-0000-3512-2118-0009af100700` - Realtime steps (notify)
//! - `00000002-0000-3512-2118-0009af100700` - Raw sensor data (notify)
//!
//! Heart-rate notifications are subscribed on demand by the first
//! heart-rate scan; steps and motion follow `enable_notify`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use uuid::Uuid;

use wristlink_core::{now_ms, ActionKind, BatteryInfo, DeviceAddress, NotifyPayload, StreamKind};

use super::driver::{DriverError, DriverResult, LinkDriver, LinkEvent, LinkListener, StreamHandler};

/// Heart Rate Measurement characteristic (notify)
pub const HEART_RATE_MEASUREMENT_UUID: Uuid = Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);

/// Heart Rate Control Point characteristic (write)
pub const HEART_RATE_CONTROL_UUID: Uuid = Uuid::from_u128(0x00002a39_0000_1000_8000_00805f9b34fb);

/// Alert Level characteristic (write)
pub const ALERT_LEVEL_UUID: Uuid = Uuid::from_u128(0x00002a06_0000_1000_8000_00805f9b34fb);

/// Battery Level characteristic (read)
pub const BATTERY_LEVEL_UUID: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

/// Realtime steps characteristic (notify)
pub const REALTIME_STEPS_UUID: Uuid = Uuid::from_u128(0x00000007_0000_3512_2118_0009af100700);

/// Raw sensor data characteristic (notify)
pub const SENSOR_DATA_UUID: Uuid = Uuid::from_u128(0x00000002_0000_3512_2118_0009af100700);

/// One-shot heart-rate measurement request.
const HR_SCAN_COMMAND: [u8; 3] = [0x15, 0x02, 0x01];

/// Alert level payloads.
const ALERT_VIBRATE: [u8; 1] = [0x02];
const ALERT_OFF: [u8; 1] = [0x00];

/// BLE scan result
#[derive(Clone, Debug)]
pub struct BleDevice {
    /// Device address
    pub address: String,
    /// Device name (from advertisement)
    pub name: Option<String>,
    /// Signal strength (RSSI in dBm)
    pub rssi: Option<i16>,
}

type Listeners = Arc<RwLock<HashMap<StreamKind, StreamHandler>>>;
type LinkListenerSlot = Arc<RwLock<Option<LinkListener>>>;

/// Established link to one peripheral.
struct BleLink {
    peripheral: Peripheral,
    characteristics: HashMap<Uuid, Characteristic>,
    heart_rate_subscribed: bool,
}

impl BleLink {
    fn characteristic(&self, uuid: Uuid) -> DriverResult<&Characteristic> {
        self.characteristics
            .get(&uuid)
            .ok_or_else(|| DriverError::Unsupported(format!("characteristic {uuid} not offered")))
    }
}

/// btleplug-backed [`LinkDriver`].
pub struct BleDriver {
    adapter: Adapter,
    scan_duration: Duration,
    link: tokio::sync::Mutex<Option<BleLink>>,
    listeners: Listeners,
    link_listener: LinkListenerSlot,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl BleDriver {
    /// Open the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns error if Bluetooth is not available
    pub async fn new() -> DriverResult<Self> {
        let manager = Manager::new().await.map_err(transport)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(transport)?
            .into_iter()
            .next()
            .ok_or_else(|| DriverError::Transport("No Bluetooth adapter found".to_string()))?;

        Ok(Self {
            adapter,
            scan_duration: Duration::from_secs(5),
            link: tokio::sync::Mutex::new(None),
            listeners: Arc::new(RwLock::new(HashMap::new())),
            link_listener: Arc::new(RwLock::new(None)),
            pump: Mutex::new(None),
        })
    }

    /// Set scan duration
    pub fn set_scan_duration(&mut self, duration: Duration) {
        self.scan_duration = duration;
    }

    /// Scan for nearby peripherals.
    ///
    /// # Errors
    ///
    /// Adapter failure.
    pub async fn scan(&self) -> DriverResult<Vec<BleDevice>> {
        tracing::info!("Starting BLE scan...");
        self.adapter.start_scan(ScanFilter::default()).await.map_err(transport)?;
        tokio::time::sleep(self.scan_duration).await;
        self.adapter.stop_scan().await.map_err(transport)?;

        let mut devices = Vec::new();
        for peripheral in self.adapter.peripherals().await.map_err(transport)? {
            let properties = peripheral.properties().await.map_err(transport)?;
            devices.push(BleDevice {
                address: peripheral.address().to_string(),
                name: properties.as_ref().and_then(|p| p.local_name.clone()),
                rssi: properties.as_ref().and_then(|p| p.rssi),
            });
        }

        tracing::info!("Scan complete: found {} devices", devices.len());
        Ok(devices)
    }

    async fn find_peripheral(&self, device: &DeviceAddress) -> DriverResult<Option<Peripheral>> {
        let matches = |p: &Peripheral| p.address().to_string().eq_ignore_ascii_case(device.as_str());

        let known = self.adapter.peripherals().await.map_err(transport)?;
        if let Some(peripheral) = known.into_iter().find(|p| matches(p)) {
            return Ok(Some(peripheral));
        }

        // Not cached by the adapter yet
        self.adapter.start_scan(ScanFilter::default()).await.map_err(transport)?;
        tokio::time::sleep(self.scan_duration).await;
        self.adapter.stop_scan().await.map_err(transport)?;
        let found = self.adapter.peripherals().await.map_err(transport)?;
        Ok(found.into_iter().find(|p| matches(p)))
    }

    async fn spawn_notification_pump(&self, peripheral: &Peripheral) -> DriverResult<()> {
        let mut notifications = peripheral.notifications().await.map_err(transport)?;
        let listeners = Arc::clone(&self.listeners);
        let link_listener = Arc::clone(&self.link_listener);
        let address = peripheral.address().to_string();

        let pump = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                let Some(stream) = stream_for_characteristic(notification.uuid) else {
                    continue;
                };
                match notify_payload(stream, &notification.value) {
                    Some(payload) => deliver(&listeners, stream, payload),
                    None => tracing::debug!("undersized {} notification ignored", stream),
                }
            }

            // Stream ended, device disconnected
            tracing::info!("BLE notification stream for {} ended", address);
            let listener = link_listener.read().ok().and_then(|l| l.clone());
            if let Some(listener) = listener {
                listener(LinkEvent::Disconnected {
                    reason: Some("Notification stream ended".to_string()),
                });
            }
        });

        if let Ok(mut slot) = self.pump.lock() {
            if let Some(previous) = slot.replace(pump) {
                previous.abort();
            }
        }
        Ok(())
    }

    async fn write(&self, uuid: Uuid, value: &[u8], write_type: WriteType) -> DriverResult<()> {
        let link = self.link.lock().await;
        let link = link.as_ref().ok_or(DriverError::NotConnected)?;
        let characteristic = link.characteristic(uuid)?;
        link.peripheral
            .write(characteristic, value, write_type)
            .await
            .map_err(transport)
    }
}

impl LinkDriver for BleDriver {
    async fn connect(&self, device: &DeviceAddress) -> DriverResult<bool> {
        let mut link = self.link.lock().await;
        if let Some(existing) = link.as_ref() {
            if existing.peripheral.is_connected().await.unwrap_or(false) {
                return Ok(true);
            }
        }

        let Some(peripheral) = self.find_peripheral(device).await? else {
            return Ok(false);
        };

        peripheral
            .connect()
            .await
            .map_err(|e| DriverError::ConnectionFailed(e.to_string()))?;
        peripheral.discover_services().await.map_err(transport)?;

        let characteristics = peripheral
            .characteristics()
            .into_iter()
            .map(|c| (c.uuid, c))
            .collect::<HashMap<_, _>>();
        tracing::info!(
            "Connected to {} ({} characteristics)",
            device,
            characteristics.len()
        );

        self.spawn_notification_pump(&peripheral).await?;
        *link = Some(BleLink {
            peripheral,
            characteristics,
            heart_rate_subscribed: false,
        });
        Ok(true)
    }

    async fn pair(&self, device: &DeviceAddress) -> DriverResult<()> {
        Err(DriverError::Unsupported(format!(
            "pairing {device} is left to the host Bluetooth stack"
        )))
    }

    fn set_listener(&self, stream: StreamKind, handler: Option<StreamHandler>) {
        let Ok(mut listeners) = self.listeners.write() else {
            tracing::error!("listener table poisoned");
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
            Err(_) => tracing::error!("link listener slot poisoned"),
        }
    }

    async fn enable_notify(&self, stream: StreamKind) -> DriverResult<()> {
        let link = self.link.lock().await;
        let link = link.as_ref().ok_or(DriverError::NotConnected)?;
        let characteristic = link.characteristic(characteristic_for_stream(stream))?;
        link.peripheral.subscribe(characteristic).await.map_err(transport)?;
        tracing::debug!("Subscribed to {} notifications", stream);
        Ok(())
    }

    async fn disable_notify(&self, stream: StreamKind) -> DriverResult<()> {
        let link = self.link.lock().await;
        let link = link.as_ref().ok_or(DriverError::NotConnected)?;
        let characteristic = link.characteristic(characteristic_for_stream(stream))?;
        link.peripheral.unsubscribe(characteristic).await.map_err(transport)?;
        tracing::debug!("Unsubscribed from {} notifications", stream);
        Ok(())
    }

    async fn start_action(&self, action: ActionKind) -> DriverResult<()> {
        let failed = |e: DriverError| DriverError::ActionFailed {
            action,
            reason: e.to_string(),
        };

        match action {
            ActionKind::Vibrate => self
                .write(ALERT_LEVEL_UUID, &ALERT_VIBRATE, WriteType::WithoutResponse)
                .await
                .map_err(failed),
            ActionKind::StopVibrate => self
                .write(ALERT_LEVEL_UUID, &ALERT_OFF, WriteType::WithoutResponse)
                .await
                .map_err(failed),
            ActionKind::HeartRateScan => {
                {
                    let mut link = self.link.lock().await;
                    let link = link.as_mut().ok_or(DriverError::NotConnected)?;
                    if !link.heart_rate_subscribed {
                        let measurement = link.characteristic(HEART_RATE_MEASUREMENT_UUID).map_err(failed)?;
                        link.peripheral
                            .subscribe(measurement)
                            .await
                            .map_err(|e| failed(transport(e)))?;
                        link.heart_rate_subscribed = true;
                    }
                }
                self.write(HEART_RATE_CONTROL_UUID, &HR_SCAN_COMMAND, WriteType::WithResponse)
                    .await
                    .map_err(failed)
            }
        }
    }

    async fn read_battery_info(&self) -> DriverResult<BatteryInfo> {
        let link = self.link.lock().await;
        let link = link.as_ref().ok_or(DriverError::NotConnected)?;
        let characteristic = link.characteristic(BATTERY_LEVEL_UUID)?;
        let raw = link.peripheral.read(characteristic).await.map_err(transport)?;
        Ok(BatteryInfo::new(now_ms(), raw))
    }
}

impl Drop for BleDriver {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.pump.lock() {
            if let Some(pump) = slot.take() {
                pump.abort();
            }
        }
    }
}

fn transport(e: btleplug::Error) -> DriverError {
    DriverError::Transport(e.to_string())
}

fn deliver(listeners: &Listeners, stream: StreamKind, payload: NotifyPayload) {
    let handler = listeners.read().ok().and_then(|l| l.get(&stream).cloned());
    if let Some(handler) = handler {
        if let Err(e) = handler(payload) {
            tracing::debug!("{} listener rejected payload: {}", stream, e);
        }
    }
}

/// Characteristic carrying notifications for `stream`.
pub fn characteristic_for_stream(stream: StreamKind) -> Uuid {
    match stream {
        StreamKind::HeartRate => HEART_RATE_MEASUREMENT_UUID,
        StreamKind::Steps => REALTIME_STEPS_UUID,
        StreamKind::Motion => SENSOR_DATA_UUID,
    }
}

/// Stream fed by notifications from `uuid`, if any.
pub fn stream_for_characteristic(uuid: Uuid) -> Option<StreamKind> {
    StreamKind::ALL
        .into_iter()
        .find(|stream| characteristic_for_stream(*stream) == uuid)
}

/// Convert a raw notification into the payload shape of `stream`.
///
/// Heart rate follows the GATT measurement layout (flag bit 0 selects a
/// 16-bit value). Steps are a little-endian u16 after one header byte.
/// Motion records are passed through for the decoder.
pub fn notify_payload(stream: StreamKind, value: &[u8]) -> Option<NotifyPayload> {
    match stream {
        StreamKind::HeartRate => {
            let flags = *value.first()?;
            let bpm = if flags & 0x01 == 0 {
                i32::from(*value.get(1)?)
            } else {
                i32::from(u16::from_le_bytes([*value.get(1)?, *value.get(2)?]))
            };
            Some(NotifyPayload::Value(bpm))
        }
        StreamKind::Steps => {
            let steps = u16::from_le_bytes([*value.get(1)?, *value.get(2)?]);
            Some(NotifyPayload::Value(i32::from(steps)))
        }
        StreamKind::Motion => Some(NotifyPayload::Bytes(value.to_vec())),
    }
}
