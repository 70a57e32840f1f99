//! Stream decoders
//!
//! Pure, stateless translation of driver notification payloads into typed
//! samples. Heart rate and steps are already integers when the driver hands
//! them over; motion is the vendor's fixed 8-byte little-endian record:
//!
//! ```text
//! offset  0      2      4      6      8
//!         +------+------+------+------+
//!         | idx  |  x   |  y   |  z   |
//!         | u16  | i16  | i16  | i16  |
//!         +------+------+------+------+
//! ```

use crate::error::{DecodeError, DecodeResult};
use crate::types::{HeartRateSample, MotionSample, NotifyPayload, Sample, StepCountSample, StreamKind};

/// Size of one raw motion record in bytes.
pub const MOTION_PAYLOAD_LEN: usize = 8;

/// Decode a heart-rate notification (pass-through of the driver's integer).
///
/// # Errors
///
/// Returns [`DecodeError::PayloadMismatch`] for byte payloads.
pub fn decode_heart_rate(payload: &NotifyPayload, timestamp_ms: u64) -> DecodeResult<HeartRateSample> {
    match payload {
        NotifyPayload::Value(bpm) => Ok(HeartRateSample {
            timestamp_ms,
            beats_per_minute: *bpm,
        }),
        NotifyPayload::Bytes(_) => Err(DecodeError::PayloadMismatch {
            stream: StreamKind::HeartRate,
            expected: "integer",
        }),
    }
}

/// Decode a realtime step notification (pass-through of the driver's integer).
///
/// # Errors
///
/// Returns [`DecodeError::PayloadMismatch`] for byte payloads.
pub fn decode_steps(payload: &NotifyPayload, timestamp_ms: u64) -> DecodeResult<StepCountSample> {
    match payload {
        NotifyPayload::Value(steps) => Ok(StepCountSample {
            timestamp_ms,
            steps: *steps,
        }),
        NotifyPayload::Bytes(_) => Err(DecodeError::PayloadMismatch {
            stream: StreamKind::Steps,
            expected: "integer",
        }),
    }
}

/// Decode a raw motion record.
///
/// Bytes past the first [`MOTION_PAYLOAD_LEN`] are ignored.
///
/// # Errors
///
/// Returns [`DecodeError::ShortPayload`] if fewer than 8 bytes are given.
pub fn decode_motion(bytes: &[u8], timestamp_ms: u64) -> DecodeResult<MotionSample> {
    if bytes.len() < MOTION_PAYLOAD_LEN {
        return Err(DecodeError::ShortPayload {
            stream: StreamKind::Motion,
            got: bytes.len(),
            need: MOTION_PAYLOAD_LEN,
        });
    }

    let word = |at: usize| [bytes[at], bytes[at + 1]];

    Ok(MotionSample {
        timestamp_ms,
        sequence_index: u16::from_le_bytes(word(0)),
        axis_x: i16::from_le_bytes(word(2)),
        axis_y: i16::from_le_bytes(word(4)),
        axis_z: i16::from_le_bytes(word(6)),
    })
}

/// Decode a payload delivered on `stream`.
///
/// # Errors
///
/// Propagates the per-stream decoder error.
pub fn decode(stream: StreamKind, payload: &NotifyPayload, timestamp_ms: u64) -> DecodeResult<Sample> {
    match stream {
        StreamKind::HeartRate => decode_heart_rate(payload, timestamp_ms).map(Sample::HeartRate),
        StreamKind::Steps => decode_steps(payload, timestamp_ms).map(Sample::Steps),
        StreamKind::Motion => match payload {
            NotifyPayload::Bytes(bytes) => decode_motion(bytes, timestamp_ms).map(Sample::Motion),
            NotifyPayload::Value(_) => Err(DecodeError::PayloadMismatch {
                stream: StreamKind::Motion,
                expected: "byte",
            }),
        },
    }
}
