//! Device link drivers
//!
//! This module provides the drivers the session supervisor can run on:
//! - [`driver`]: the [`LinkDriver`] contract and its error type
//! - [`simulated`]: in-process wearable for development and demos
//! - [`ble`]: Bluetooth Low Energy wristband (requires `ble` feature)
//!
//! ```rust,ignore
//! use wristlink_native::bridge::{LinkDriver, SimulatedDriver};
//!
//! let driver = SimulatedDriver::new();
//! while !driver.connect(&address).await? {}
//! driver.enable_notify(StreamKind::Steps).await?;
//! ```

pub mod driver;
pub mod simulated;

#[cfg(feature = "ble")]
pub mod ble;

// Re-export key types
pub use driver::{DriverError, DriverResult, LinkDriver, LinkEvent, LinkListener, StreamHandler};
pub use simulated::{SimulatedConfig, SimulatedDriver};

#[cfg(feature = "ble")]
pub use ble::{BleDevice, BleDriver};
