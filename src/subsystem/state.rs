use serde::{Deserialize, Serialize};
use std::fmt;

/// Externally requested posture of a subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminState {
    Offline,
    Online,
}

/// Observed posture of a subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperState {
    Offline,
    StartingChildren,
    Connecting,
    StartingProcesses,
    Online,
    StoppingProcesses,
    StoppingChildren,
    Restarting,
    RestartingProcesses,
    Broken,
}

impl fmt::Display for OperState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperState::Offline => "offline",
            OperState::StartingChildren => "starting-children",
            OperState::Connecting => "connecting",
            OperState::StartingProcesses => "starting-processes",
            OperState::Online => "online",
            OperState::StoppingProcesses => "stopping-processes",
            OperState::StoppingChildren => "stopping-children",
            OperState::Restarting => "restarting",
            OperState::RestartingProcesses => "restarting-processes",
            OperState::Broken => "broken",
        };
        f.write_str(name)
    }
}

impl fmt::Display for AdminState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdminState::Offline => f.write_str("offline"),
            AdminState::Online => f.write_str("online"),
        }
    }
}

/// What the supervisor does when one of a subsystem's processes fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    /// Restart the whole subsystem on any process failure.
    #[default]
    Automatic,
    /// Go `Broken` on failure and wait for an explicit restart.
    Manual,
    /// Restart only the failed process.
    ProcessOnly,
}
