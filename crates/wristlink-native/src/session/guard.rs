//! Lifecycle guard: keeping the host awake and coming back after teardown.
//!
//! [`LifecycleGuard`] wraps a host [`WakeLock`] and tracks whether it is
//! held, so acquiring twice or releasing when not held is a logged no-op
//! instead of a host error. [`RestartScheduler`] arranges a one-shot relaunch
//! of the whole service when the host tears the process down mid-session.

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use thiserror::Error;

/// Errors from the lifecycle guard and its host integrations.
#[derive(Debug, Error)]
pub enum GuardError {
    /// Host facility could not be started
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        /// Program that failed to start
        program: String,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// Host facility reported failure
    #[error("{0}")]
    Host(String),
}

/// Result type for guard operations.
pub type GuardResult<T> = Result<T, GuardError>;

// ============================================================================
// Wake locks
// ============================================================================

/// Host resource that keeps background execution from being suspended.
pub trait WakeLock: Send {
    /// Take the resource.
    ///
    /// # Errors
    ///
    /// Host refused or failed.
    fn acquire(&mut self) -> GuardResult<()>;

    /// Give the resource back.
    ///
    /// # Errors
    ///
    /// Host failed to release.
    fn release(&mut self) -> GuardResult<()>;
}

/// Wake lock for hosts that never suspend background work.
#[derive(Debug, Default)]
pub struct NullWakeLock;

impl WakeLock for NullWakeLock {
    fn acquire(&mut self) -> GuardResult<()> {
        Ok(())
    }

    fn release(&mut self) -> GuardResult<()> {
        Ok(())
    }
}

/// Linux wake lock: holds a `systemd-inhibit` child that blocks sleep.
#[derive(Debug)]
pub struct InhibitWakeLock {
    who: String,
    why: String,
    child: Option<Child>,
}

impl InhibitWakeLock {
    /// Create an inhibitor labelled `who` in `systemd-inhibit --list`.
    #[must_use]
    pub fn new(who: impl Into<String>) -> Self {
        Self {
            who: who.into(),
            why: "wearable session active".to_string(),
            child: None,
        }
    }
}

impl WakeLock for InhibitWakeLock {
    fn acquire(&mut self) -> GuardResult<()> {
        let child = Command::new("systemd-inhibit")
            .arg("--what=sleep:idle")
            .arg("--mode=block")
            .arg(format!("--who={}", self.who))
            .arg(format!("--why={}", self.why))
            .args(["sleep", "infinity"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| GuardError::Spawn {
                program: "systemd-inhibit".to_string(),
                source,
            })?;
        self.child = Some(child);
        Ok(())
    }

    fn release(&mut self) -> GuardResult<()> {
        if let Some(mut child) = self.child.take() {
            child
                .kill()
                .map_err(|e| GuardError::Host(format!("failed to stop inhibitor: {e}")))?;
            let _ = child.wait();
        }
        Ok(())
    }
}

impl Drop for InhibitWakeLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

// ============================================================================
// Guard
// ============================================================================

/// Held-state tracking around a [`WakeLock`].
pub struct LifecycleGuard {
    lock: Box<dyn WakeLock>,
    held: bool,
}

impl LifecycleGuard {
    /// Wrap a host wake lock; starts released.
    #[must_use]
    pub fn new(lock: Box<dyn WakeLock>) -> Self {
        Self { lock, held: false }
    }

    /// Acquire once. Acquiring while held is a no-op.
    ///
    /// # Errors
    ///
    /// Host refused the lock; the guard stays released.
    pub fn acquire(&mut self) -> GuardResult<()> {
        if self.held {
            tracing::debug!("lifecycle guard already held");
            return Ok(());
        }
        self.lock.acquire()?;
        self.held = true;
        tracing::debug!("lifecycle guard acquired");
        Ok(())
    }

    /// Release if held. Returns whether anything was released.
    ///
    /// # Errors
    ///
    /// Host failed to release; the guard counts as released regardless.
    pub fn release(&mut self) -> GuardResult<bool> {
        if !self.held {
            tracing::debug!("lifecycle guard not held, nothing to release");
            return Ok(false);
        }
        self.held = false;
        self.lock.release()?;
        tracing::debug!("lifecycle guard released");
        Ok(true)
    }

    /// Whether the wake lock is held.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held
    }
}

impl std::fmt::Debug for LifecycleGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleGuard").field("held", &self.held).finish_non_exhaustive()
    }
}

// ============================================================================
// Self-restart
// ============================================================================

/// Host-level one-shot timer that relaunches the service with no command.
pub trait RestartScheduler: Send + Sync {
    /// Arrange a relaunch `delay` from now.
    ///
    /// # Errors
    ///
    /// Host timer could not be armed.
    fn schedule_restart(&self, delay: Duration) -> GuardResult<()>;
}

/// Relaunch through a transient systemd user timer.
///
/// The timer outlives this process, which is the point.
#[derive(Debug, Clone)]
pub struct SystemdRestartScheduler {
    program: PathBuf,
    args: Vec<String>,
    unit_prefix: String,
}

impl SystemdRestartScheduler {
    /// Relaunch `program` with `args` (normally the service's own binary).
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            unit_prefix: "wristlink-restart".to_string(),
        }
    }

    /// Relaunch the currently running executable.
    ///
    /// # Errors
    ///
    /// The executable path cannot be resolved.
    pub fn current_exe(args: Vec<String>) -> GuardResult<Self> {
        let program = std::env::current_exe()
            .map_err(|e| GuardError::Host(format!("cannot resolve own executable: {e}")))?;
        Ok(Self::new(program, args))
    }
}

impl RestartScheduler for SystemdRestartScheduler {
    fn schedule_restart(&self, delay: Duration) -> GuardResult<()> {
        // systemd accepts millisecond spans; keep at least 1ms
        let millis = delay.as_millis().max(1);
        let unit = format!("{}-{}", self.unit_prefix, std::process::id());

        let status = Command::new("systemd-run")
            .arg("--user")
            .arg(format!("--unit={unit}"))
            .arg(format!("--on-active={millis}ms"))
            .arg("--timer-property=AccuracySec=100ms")
            .arg(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|source| GuardError::Spawn {
                program: "systemd-run".to_string(),
                source,
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(GuardError::Host(format!("systemd-run exited with {status}")))
        }
    }
}

/// Scheduler for hosts where self-restart is not wanted.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledRestartScheduler;

impl RestartScheduler for DisabledRestartScheduler {
    fn schedule_restart(&self, delay: Duration) -> GuardResult<()> {
        tracing::info!("self-restart disabled, not relaunching in {:?}", delay);
        Ok(())
    }
}
