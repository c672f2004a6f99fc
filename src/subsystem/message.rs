use crate::descriptor::Terminal;
use crate::event::channel::EventPublisher;
use crate::launcher::event::TelemetryCommand;
use crate::names::{ProcessName, SubsystemName};
use crate::subsystem::state::{AdminState, OperState};

/// Client id meaning "no origin": never tracked in the active-client set.
pub const NO_CLIENT: u32 = u32::MAX;

/// One chunk of output from an interactive process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub fd: i32,
    pub bytes: Vec<u8>,
}

/// Terminal binding and output routing for an interactive session,
/// carried by `ChangeAdmin(Online)`.
#[derive(Debug, Clone)]
pub struct InteractiveParams {
    pub terminal: Terminal,
    pub output: EventPublisher<OutputChunk>,
}

/// Commands carried by a subsystem's message pipe.
///
/// The pipe is FIFO; the driver reads one message per event-loop iteration,
/// and a closed pipe is treated as shutdown.
#[derive(Debug, Clone)]
pub enum Message {
    ChangeAdmin {
        admin: AdminState,
        client_id: u32,
        /// Present when an online request binds an interactive session.
        interactive: Option<InteractiveParams>,
    },
    /// A child reporting its oper state after a change.
    ReportOper {
        sender: SubsystemName,
        oper: OperState,
        client_id: u32,
    },
    Abort {
        /// Bring the whole platform down, not just this subsystem.
        emergency: bool,
        client_id: u32,
    },
    /// Explicit restart; the only way out of `Broken`.
    Restart {
        client_id: u32,
    },
    /// Restart the named processes; an empty list means all of them.
    RestartProcesses {
        processes: Vec<ProcessName>,
        client_id: u32,
    },
    RestartCrashedProcesses {
        client_id: u32,
    },
    SendTelemetryCommand {
        command: TelemetryCommand,
    },
}

impl Message {
    pub fn change_admin(admin: AdminState, client_id: u32) -> Self {
        Message::ChangeAdmin {
            admin,
            client_id,
            interactive: None,
        }
    }
}
