//! Command gateway.
//!
//! External surfaces (stdin, HTTP, a host relaunch) deliver commands as a
//! name plus an optional payload. The gateway validates them into
//! [`Command`]s and forwards them to the supervisor in arrival order.
//! Nothing a caller sends can fail the gateway: unknown or incomplete
//! commands are logged and dropped.

use std::fmt;

use serde::Serialize;

use wristlink_core::DeviceAddress;

use crate::store::{RunFlag, StateStore};

use super::supervisor::{Command, SupervisorHandle};

/// Why a command was not forwarded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum DropReason {
    /// Name is not a known command
    UnknownCommand(String),
    /// `PAIR` / `START` without a usable device id
    MissingDevice(String),
    /// Payload given where none is expected
    UnexpectedPayload(String),
    /// Supervisor has shut down
    SupervisorGone,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownCommand(name) => write!(f, "unknown command {name:?}"),
            Self::MissingDevice(name) => write!(f, "{name} needs a device id"),
            Self::UnexpectedPayload(name) => write!(f, "{name} takes no payload"),
            Self::SupervisorGone => f.write_str("supervisor is not running"),
        }
    }
}

/// Result of one dispatch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GatewayOutcome {
    /// Queued for the supervisor
    Forwarded {
        /// Wire name of the forwarded command
        command: &'static str,
    },
    /// Logged and dropped
    Dropped {
        /// Why
        #[serde(flatten)]
        reason: DropReason,
    },
}

/// Validate a command name and payload.
///
/// Names are trimmed and case-insensitive. A missing or blank name with no
/// payload is the host relaunch and maps to [`Command::Restart`].
///
/// # Errors
///
/// Returns the [`DropReason`] for anything that cannot be forwarded.
pub fn parse_command(name: Option<&str>, payload: Option<&str>) -> Result<Command, DropReason> {
    let name = name.map(str::trim).unwrap_or_default();
    let payload = payload.map(str::trim).filter(|p| !p.is_empty());

    if name.is_empty() {
        return match payload {
            None => Ok(Command::Restart),
            Some(_) => Err(DropReason::UnknownCommand(String::new())),
        };
    }

    let upper = name.to_ascii_uppercase();
    match upper.as_str() {
        "PAIR" | "START" => {
            let device = payload
                .and_then(|p| DeviceAddress::new(p).ok())
                .ok_or_else(|| DropReason::MissingDevice(upper.clone()))?;
            Ok(if upper == "PAIR" {
                Command::Pair(device)
            } else {
                Command::Start(device)
            })
        }
        "STOP" | "ALERT" | "BATTERY_REQUEST" | "BATTERY" => {
            if payload.is_some() {
                return Err(DropReason::UnexpectedPayload(upper));
            }
            Ok(match upper.as_str() {
                "STOP" => Command::Stop,
                "ALERT" => Command::Alert,
                _ => Command::BatteryRequest,
            })
        }
        _ => Err(DropReason::UnknownCommand(name.to_string())),
    }
}

/// Split a text line into name and payload: `"START AA:BB"`.
fn split_line(line: &str) -> (Option<&str>, Option<&str>) {
    let line = line.trim();
    if line.is_empty() {
        return (None, None);
    }
    match line.split_once(char::is_whitespace) {
        Some((name, rest)) => (Some(name), Some(rest)),
        None => (Some(line), None),
    }
}

/// Forwards validated commands to a supervisor.
#[derive(Clone, Debug)]
pub struct CommandGateway {
    handle: SupervisorHandle,
}

impl CommandGateway {
    /// Gateway in front of `handle`.
    #[must_use]
    pub fn new(handle: SupervisorHandle) -> Self {
        Self { handle }
    }

    /// Validate and forward one command. Never fails.
    pub async fn dispatch(&self, name: Option<&str>, payload: Option<&str>) -> GatewayOutcome {
        match parse_command(name, payload) {
            Ok(command) => self.forward(command).await,
            Err(reason) => {
                tracing::warn!("dropping command: {}", reason);
                GatewayOutcome::Dropped { reason }
            }
        }
    }

    /// Dispatch a line such as `START AA:BB:CC:DD:EE:FF`. An empty line is
    /// the no-payload relaunch command.
    pub async fn dispatch_line(&self, line: &str) -> GatewayOutcome {
        let (name, payload) = split_line(line);
        self.dispatch(name, payload).await
    }

    /// Forward an already validated command.
    pub async fn forward(&self, command: Command) -> GatewayOutcome {
        let name = command.name();
        match self.handle.send(command).await {
            Ok(()) => {
                tracing::debug!("forwarded {}", name);
                GatewayOutcome::Forwarded { command: name }
            }
            Err(e) => {
                tracing::warn!("dropping {}: {}", name, e);
                GatewayOutcome::Dropped {
                    reason: DropReason::SupervisorGone,
                }
            }
        }
    }
}

/// Command that resumes the session recorded in `store`, if any.
///
/// Yields `START(last device)` when the run flag is `STARTED`. Read errors
/// are logged and treated as nothing to resume.
pub fn resume_command(store: &dyn StateStore) -> Option<Command> {
    let flag = match store.run_flag() {
        Ok(flag) => flag,
        Err(e) => {
            tracing::warn!("cannot read run flag: {}", e);
            return None;
        }
    };
    if flag != RunFlag::Started {
        return None;
    }

    match store.last_device() {
        Ok(Some(device)) => {
            tracing::info!("resuming session on {}", device);
            Some(Command::Start(device))
        }
        Ok(None) => {
            tracing::warn!("service marked running but no device recorded");
            None
        }
        Err(e) => {
            tracing::warn!("cannot read last device: {}", e);
            None
        }
    }
}
