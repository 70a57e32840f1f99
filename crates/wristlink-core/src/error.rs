//! Error types for the wristlink core
//!
//! Decoding is pure and only fails on input that breaks the driver contract,
//! so a decode error is a defect report, not a recoverable runtime condition.

use thiserror::Error;

use crate::types::StreamKind;

/// Errors raised while turning driver payloads into typed values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Payload shorter than the fixed wire layout
    #[error("{stream} payload too short: got {got} bytes, need {need}")]
    ShortPayload {
        /// Stream the payload was delivered on
        stream: StreamKind,
        /// Bytes received
        got: usize,
        /// Bytes required
        need: usize,
    },

    /// Payload variant does not match what the stream carries
    #[error("{stream} stream expects {expected} payload")]
    PayloadMismatch {
        /// Stream the payload was delivered on
        stream: StreamKind,
        /// Expected payload shape
        expected: &'static str,
    },

    /// Blank device address
    #[error("device address is empty")]
    EmptyAddress,
}

/// Result type for decoding.
pub type DecodeResult<T> = Result<T, DecodeError>;
