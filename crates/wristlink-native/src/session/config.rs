//! Supervisor configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What the ingest queue does when it is full.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Reject the incoming sample
    #[default]
    DropNewest,
    /// Evict the oldest queued sample to make room
    DropOldest,
}

/// Configuration for the session supervisor.
#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    /// Period of the heart-rate scan poll loop
    pub poll_interval: Duration,

    /// Delay before the host relaunches the service after a teardown
    pub restart_delay: Duration,

    /// Pause between failed connect attempts (zero = retry immediately)
    pub connect_retry_delay: Duration,

    /// Maximum samples waiting for the sink
    pub ingest_capacity: usize,

    /// Behavior of a full ingest queue
    pub overflow: OverflowPolicy,

    /// Maximum commands waiting for the supervisor
    pub command_queue: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            restart_delay: Duration::from_secs(1),
            connect_retry_delay: Duration::ZERO,
            ingest_capacity: 4096,
            overflow: OverflowPolicy::DropNewest,
            command_queue: 32,
        }
    }
}
