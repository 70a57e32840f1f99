//! Device session management
//!
//! - [`supervisor`]: the connect / subscribe / poll / teardown state machine
//! - [`gateway`]: validation of externally delivered commands
//! - [`ingest`]: fan-in of decoded samples to the sample sink
//! - [`guard`]: wake lock and self-restart host integrations
//! - [`config`]: supervisor tunables

pub mod config;
pub mod gateway;
pub mod guard;
pub mod ingest;
pub mod supervisor;

use thiserror::Error;

pub use config::{OverflowPolicy, SupervisorConfig};
pub use gateway::{resume_command, CommandGateway, DropReason, GatewayOutcome};
pub use guard::{
    DisabledRestartScheduler, GuardError, GuardResult, InhibitWakeLock, LifecycleGuard, NullWakeLock,
    RestartScheduler, SystemdRestartScheduler, WakeLock,
};
pub use ingest::{IngestQueue, StreamGate};
pub use supervisor::{
    Collaborators, Command, LockEnforcer, SessionEvent, SessionSnapshot, SessionState, Supervisor,
    SupervisorHandle,
};

/// Errors from the session layer.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The supervisor task has exited
    #[error("Session supervisor is not running")]
    SupervisorGone,
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;
