use crate::names::ProcessId;

/// A telemetry command forwarded verbatim to processes declared `telemetry`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryCommand {
    pub command: String,
    pub args: Vec<String>,
}

impl TelemetryCommand {
    pub fn new<S: Into<String>>(command: S) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
        }
    }
}

/// Events delivered by a launch agent over one umbilical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LauncherEvent {
    ProcessStarted {
        process_id: ProcessId,
        pid: i32,
    },
    ProcessStopped {
        process_id: ProcessId,
        /// `true` when the process exited; `false` when a signal killed it.
        exited: bool,
        /// Exit status when `exited`, the signal number otherwise.
        status_or_signal: i32,
    },
    ProcessOutput {
        process_id: ProcessId,
        fd: i32,
        bytes: Vec<u8>,
    },
    Disconnected {
        reason: String,
    },
    TelemetryStatus {
        process_id: ProcessId,
        payload: String,
    },
    ParameterUpdate {
        name: String,
        value: String,
    },
}
