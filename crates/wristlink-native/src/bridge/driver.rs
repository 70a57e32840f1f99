//! Device link driver abstraction.
//!
//! The session supervisor talks to the wearable exclusively through
//! [`LinkDriver`]. A driver owns the wireless transport and the device
//! protocol; it connects, pairs, toggles notifications, runs one-shot
//! actions and hands notification payloads to the listener registered for
//! each [`StreamKind`].
//!
//! Listeners are registered through one uniform call,
//! [`LinkDriver::set_listener`], so the fan-in path is the same for every
//! stream and can be exercised without any radio. Loss of the link itself
//! is reported separately, through [`LinkDriver::set_link_listener`].

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;

use wristlink_core::{ActionKind, BatteryInfo, DecodeError, DeviceAddress, NotifyPayload, StreamKind};

// ============================================================================
// Error Types
// ============================================================================

/// Errors reported by a link driver.
#[derive(Debug, Clone, Error)]
pub enum DriverError {
    /// Connection attempt failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Transport-level failure (adapter, GATT, radio)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation needs an established link
    #[error("Device not connected")]
    NotConnected,

    /// Device action did not complete
    #[error("Action {action} failed: {reason}")]
    ActionFailed {
        /// Action that failed
        action: ActionKind,
        /// Failure detail
        reason: String,
    },

    /// Operation not offered by this driver
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

/// Result type for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

// ============================================================================
// Driver Contract
// ============================================================================

/// Listener invoked by a driver for every notification on one stream.
///
/// A listener must not block. An `Err` means the driver delivered a payload
/// that breaks the stream's wire contract.
pub type StreamHandler = Arc<dyn Fn(NotifyPayload) -> Result<(), DecodeError> + Send + Sync>;

/// Link-level events reported by a driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    /// The established link went away without being asked to
    Disconnected {
        /// Reason given by the transport, if any
        reason: Option<String>,
    },
}

/// Listener invoked by a driver for link-level events. Must not block.
pub type LinkListener = Arc<dyn Fn(LinkEvent) + Send + Sync>;

/// Wireless link to one wearable.
///
/// Implementations are shared across the supervisor's background tasks, so
/// every returned future must be `Send`.
pub trait LinkDriver: Send + Sync + 'static {
    /// Connect to `device`. `Ok(false)` is a negative result without a
    /// transport error.
    fn connect(&self, device: &DeviceAddress) -> impl Future<Output = DriverResult<bool>> + Send;

    /// Pair with `device`.
    fn pair(&self, device: &DeviceAddress) -> impl Future<Output = DriverResult<()>> + Send;

    /// Install (`Some`) or remove (`None`) the listener for `stream`.
    fn set_listener(&self, stream: StreamKind, handler: Option<StreamHandler>);

    /// Install (`Some`) or remove (`None`) the listener for link events.
    fn set_link_listener(&self, listener: Option<LinkListener>);

    /// Ask the device to start notifying on `stream`.
    fn enable_notify(&self, stream: StreamKind) -> impl Future<Output = DriverResult<()>> + Send;

    /// Ask the device to stop notifying on `stream`.
    fn disable_notify(&self, stream: StreamKind) -> impl Future<Output = DriverResult<()>> + Send;

    /// Run a one-shot action. Completes when the device acknowledges it.
    fn start_action(&self, action: ActionKind) -> impl Future<Output = DriverResult<()>> + Send;

    /// Read the battery snapshot.
    fn read_battery_info(&self) -> impl Future<Output = DriverResult<BatteryInfo>> + Send;
}
