use serde::Serialize;

use crate::names::{ProcessName, SubsystemName};

/// What the alarm is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AlarmSubject {
    Subsystem(SubsystemName),
    Process {
        subsystem: SubsystemName,
        process: ProcessName,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlarmSeverity {
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlarmStatus {
    Raised,
    Cleared,
}

/// Why the alarm was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlarmReason {
    ProcessCrashed,
    RestartLimitReached,
    StartupTimeout,
    ShutdownTimeout,
    ConnectionFailed,
    ChildBroken,
    ConfigurationError,
}

/// A structured alarm record emitted on the platform bus.
///
/// Raising an alarm on a subject replaces any prior unacknowledged alarm on
/// the same subject; clearing emits a record with [`AlarmStatus::Cleared`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alarm {
    pub subject: AlarmSubject,
    pub severity: AlarmSeverity,
    pub status: AlarmStatus,
    pub reason: AlarmReason,
    pub details: String,
}

impl Alarm {
    pub fn raised<S: Into<String>>(
        subject: AlarmSubject,
        severity: AlarmSeverity,
        reason: AlarmReason,
        details: S,
    ) -> Self {
        Self {
            subject,
            severity,
            status: AlarmStatus::Raised,
            reason,
            details: details.into(),
        }
    }

    /// The clear record matching this alarm.
    pub fn cleared(&self) -> Self {
        Self {
            status: AlarmStatus::Cleared,
            ..self.clone()
        }
    }
}
