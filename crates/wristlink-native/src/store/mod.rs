//! Storage collaborators of the session supervisor
//!
//! - [`state`]: shared service state (run flag, last device, battery)
//! - [`sink`]: the sample sink boundary and an in-memory sink
//! - [`sqlite`]: SQLite-backed sample sink (requires `database` feature)

pub mod sink;
pub mod state;

#[cfg(feature = "database")]
pub mod sqlite;

use thiserror::Error;

pub use sink::{MemorySink, SampleSink};
pub use state::{JsonStateStore, MemoryStateStore, RunFlag, StateKey, StateStore, StateWrite, StateWriter};

#[cfg(feature = "database")]
pub use sqlite::SqliteSink;

/// Errors from the storage collaborators.
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// SQLite error
    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Stored value is not usable
    #[error("Corrupt stored value: {0}")]
    Corrupt(String),

    /// Lock poisoned by a panicking writer
    #[error("Store is locked")]
    Locked,
}

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;
