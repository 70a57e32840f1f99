//! Core types for the wristlink wearable bridge
//!
//! This module provides the data model shared by every tier of the service:
//! - Device addressing
//! - Stream kinds and the raw payloads a driver hands to stream listeners
//! - Typed telemetry samples (heart rate, steps, motion, battery)
//! - Outbound one-shot device actions

use core::fmt;
use core::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// Milliseconds since the Unix epoch.
///
/// Falls back to `0` if the host clock reads before the epoch.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

// ============================================================================
// Device Addressing
// ============================================================================

/// Opaque wireless address of the target wearable.
///
/// The bridge never interprets the address; it is handed verbatim to the
/// driver. Surrounding whitespace is trimmed and an empty address is rejected.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceAddress(String);

impl DeviceAddress {
    /// Create an address, rejecting empty input.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::EmptyAddress`] if `raw` is blank.
    pub fn new(raw: impl Into<String>) -> Result<Self, DecodeError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DecodeError::EmptyAddress);
        }
        if trimmed.len() == raw.len() {
            Ok(Self(raw))
        } else {
            Ok(Self(trimmed.to_string()))
        }
    }

    /// Address as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeviceAddress {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for DeviceAddress {
    type Error = DecodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DeviceAddress> for String {
    fn from(address: DeviceAddress) -> Self {
        address.0
    }
}

// ============================================================================
// Streams
// ============================================================================

/// One independent category of telemetry notification.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// Heart-rate readings (answers to heart-rate scans)
    HeartRate,
    /// Realtime running step count
    Steps,
    /// Raw tri-axis motion samples
    Motion,
}

impl StreamKind {
    /// Every stream kind, in a stable order.
    pub const ALL: [Self; 3] = [Self::HeartRate, Self::Steps, Self::Motion];

    /// Stable lowercase name, used in logs and storage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HeartRate => "heart_rate",
            Self::Steps => "steps",
            Self::Motion => "motion",
        }
    }

    /// Dense index in `0..3`, matching the order of [`StreamKind::ALL`].
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::HeartRate => 0,
            Self::Steps => 1,
            Self::Motion => 2,
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification payload as delivered by a driver to a stream listener.
///
/// Heart rate and steps arrive already decoded to an integer by the driver;
/// motion arrives as the raw characteristic bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotifyPayload {
    /// Integer value decoded by the driver
    Value(i32),
    /// Raw characteristic bytes
    Bytes(Vec<u8>),
}

// ============================================================================
// Samples
// ============================================================================

/// A single heart-rate reading.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartRateSample {
    /// Capture time (ms since Unix epoch)
    pub timestamp_ms: u64,
    /// Beats per minute
    pub beats_per_minute: i32,
}

/// Realtime running step count reported by the device.
///
/// This is the device's running total, not a delta.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCountSample {
    /// Capture time (ms since Unix epoch)
    pub timestamp_ms: u64,
    /// Running step count
    pub steps: i32,
}

/// One raw tri-axis motion reading.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotionSample {
    /// Capture time (ms since Unix epoch)
    pub timestamp_ms: u64,
    /// Device-side sequence counter
    pub sequence_index: u16,
    /// X axis
    pub axis_x: i16,
    /// Y axis
    pub axis_y: i16,
    /// Z axis
    pub axis_z: i16,
}

/// Battery snapshot, forwarded verbatim and never decoded by the bridge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryInfo {
    /// Time of the read (ms since Unix epoch)
    pub read_at_ms: u64,
    /// Raw bytes as returned by the device
    pub raw: Vec<u8>,
}

impl BatteryInfo {
    /// Wrap raw battery bytes read at `read_at_ms`.
    #[must_use]
    pub fn new(read_at_ms: u64, raw: Vec<u8>) -> Self {
        Self { read_at_ms, raw }
    }
}

/// Decoded telemetry, tagged by origin.
///
/// Samples are immutable once produced; ownership moves to the sink on insert.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Sample {
    /// Heart-rate reading
    HeartRate(HeartRateSample),
    /// Running step count
    Steps(StepCountSample),
    /// Raw motion reading
    Motion(MotionSample),
    /// Battery snapshot
    Battery(BatteryInfo),
}

impl Sample {
    /// Stream this sample came from, `None` for battery snapshots.
    #[must_use]
    pub fn stream(&self) -> Option<StreamKind> {
        match self {
            Self::HeartRate(_) => Some(StreamKind::HeartRate),
            Self::Steps(_) => Some(StreamKind::Steps),
            Self::Motion(_) => Some(StreamKind::Motion),
            Self::Battery(_) => None,
        }
    }

    /// Capture time (ms since Unix epoch).
    #[must_use]
    pub fn timestamp_ms(&self) -> u64 {
        match self {
            Self::HeartRate(s) => s.timestamp_ms,
            Self::Steps(s) => s.timestamp_ms,
            Self::Motion(s) => s.timestamp_ms,
            Self::Battery(b) => b.read_at_ms,
        }
    }
}

// ============================================================================
// Actions
// ============================================================================

/// One-shot outbound device action issued through the driver.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Start the haptic motor
    Vibrate,
    /// Stop the haptic motor
    StopVibrate,
    /// Ask the device for a one-shot heart-rate measurement
    HeartRateScan,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Vibrate => "vibrate",
            Self::StopVibrate => "stop_vibrate",
            Self::HeartRateScan => "heart_rate_scan",
        };
        f.write_str(name)
    }
}
