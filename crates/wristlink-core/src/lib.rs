//! Wristlink Core - shared types and stream decoders
//!
//! This crate provides the data model and the pure decoding layer of the
//! wristlink wearable bridge. It has no runtime and no I/O; the host-side
//! session supervisor lives in `wristlink-native`.
//!
//! # Modules
//!
//! - [`types`]: device addressing, stream kinds, samples, actions
//! - [`error`]: decode errors
//! - [`protocol`]: stream decoders for driver notification payloads
//!
//! # Example
//!
//! ```rust
//! use wristlink_core::protocol::decode_motion;
//!
//! let sample = decode_motion(&[0x01, 0x00, 0x10, 0x00, 0x20, 0x00, 0x30, 0x00], 0).unwrap();
//! assert_eq!((sample.axis_x, sample.axis_y, sample.axis_z), (16, 32, 48));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod error;
pub mod protocol;
pub mod types;

// Re-export commonly used types at crate root
pub use error::{DecodeError, DecodeResult};
pub use protocol::{decode, decode_heart_rate, decode_motion, decode_steps, MOTION_PAYLOAD_LEN};
pub use types::{
    now_ms, ActionKind, BatteryInfo, DeviceAddress, HeartRateSample, MotionSample, NotifyPayload,
    Sample, StepCountSample, StreamKind,
};
