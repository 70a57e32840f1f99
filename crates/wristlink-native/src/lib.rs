//! Wristlink Native - host-side session supervisor for the wearable bridge
//!
//! This crate keeps a wristband connected and streaming:
//! - Connect, pair and subscribe with indefinite connect retry
//! - Heart-rate poll loop, alert and battery triggers
//! - Wake lock and self-restart around the session
//! - Fan-in of decoded samples to a sample sink
//!
//! # Modules
//!
//! - [`bridge`]: device link drivers (simulated, BLE)
//! - [`session`]: supervisor, command gateway, ingest pipeline, lifecycle guard
//! - [`store`]: state store and sample sinks

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod bridge;
pub mod session;
pub mod store;

#[cfg(test)]
mod testing;

// Re-export key types
pub use bridge::{DriverError, LinkDriver, SimulatedDriver};
pub use session::{
    Collaborators, Command, CommandGateway, GatewayOutcome, LockEnforcer, SessionEvent, SessionSnapshot,
    SessionState, Supervisor, SupervisorConfig, SupervisorHandle,
};
pub use store::{SampleSink, StateStore};
