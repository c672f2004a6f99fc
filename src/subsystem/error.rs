use thiserror::Error;

use crate::launcher::LauncherError;
use crate::names::{ProcessName, SubsystemName};

#[derive(Debug, Error)]
pub enum SubsystemError {
    /// Every publisher of the message pipe is gone; the subsystem shuts
    /// down.
    #[error("message pipe closed")]
    PipeClosed,

    #[error(transparent)]
    Launcher(#[from] LauncherError),

    #[error("subsystem `{subsystem}` has no process named `{process}`")]
    UnknownProcess {
        subsystem: SubsystemName,
        process: ProcessName,
    },

    #[error("driver thread of subsystem `{0}` panicked")]
    DriverPanicked(SubsystemName),
}
