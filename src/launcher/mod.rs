pub mod event;

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

use crate::descriptor::{StreamSpec, Terminal};
use crate::event::channel::EventConsumer;
use crate::names::{ComputeId, ProcessId, ProcessName, SubsystemName};

use self::event::{LauncherEvent, TelemetryCommand};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LauncherError {
    #[error("connecting to launch agent on compute `{compute}` failed: {reason}")]
    ConnectFailed { compute: ComputeId, reason: String },

    #[error("no launch agent is known for compute `{0}`")]
    UnknownCompute(ComputeId),

    #[error("no connection to compute `{0}` is held")]
    NotConnected(ComputeId),

    #[error("launching process `{process}` failed: {reason}")]
    LaunchFailed {
        process: ProcessName,
        reason: String,
    },

    #[error("process `{0}` did not start within its startup timeout")]
    LaunchTimeout(ProcessName),

    #[error("no running zygote named `{0}` in this subsystem")]
    ZygoteNotFound(ProcessName),

    #[error("launch agent request failed: {0}")]
    RequestFailed(String),
}

/// How the launch agent materializes a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchMode {
    /// `exec` a binary.
    Static { executable: String },
    /// `exec` a binary that stays resident as a fork donor.
    Zygote { executable: String },
    /// Load `module` into the running zygote and call `entry`.
    Virtual {
        zygote: ProcessId,
        module: String,
        entry: String,
    },
}

/// A fully-resolved launch request for one process on one compute.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub subsystem: SubsystemName,
    pub name: ProcessName,
    pub mode: LaunchMode,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub streams: Vec<StreamSpec>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub cgroup: Option<String>,
    pub notify: bool,
    pub interactive: bool,
    pub telemetry: bool,
    pub terminal: Option<Terminal>,
    pub startup_timeout: Duration,
    /// Graceful-stop budget: SIGINT wait, then SIGTERM wait, then SIGKILL.
    pub sigint_shutdown_timeout: Duration,
    pub sigterm_shutdown_timeout: Duration,
}

/// Request side of a launch-agent connection.
///
/// The agent acknowledges `launch` with the agent-assigned process id; the
/// pid and all later lifecycle changes arrive on the event stream. `stop`
/// performs the graceful escalation agent-side using the request's two
/// shutdown timeouts.
pub trait LauncherClient: Send {
    fn launch(&mut self, spec: &LaunchSpec) -> Result<ProcessId, LauncherError>;

    fn stop(&mut self, process_id: &ProcessId) -> Result<(), LauncherError>;

    fn send_input(
        &mut self,
        process_id: &ProcessId,
        fd: i32,
        data: &[u8],
    ) -> Result<(), LauncherError>;

    fn close_fd(&mut self, process_id: &ProcessId, fd: i32) -> Result<(), LauncherError>;

    fn send_telemetry_command(
        &mut self,
        process_id: &ProcessId,
        command: &TelemetryCommand,
    ) -> Result<(), LauncherError>;
}

/// A live connection to one compute's launch agent: the request client plus
/// the typed event stream read by the owning subsystem's driver.
pub struct Connection<C> {
    pub client: C,
    pub events: EventConsumer<LauncherEvent>,
}

/// Opens authenticated connections to launch agents, one per compute.
pub trait LauncherConnector: Send + 'static {
    type Client: LauncherClient + 'static;

    fn connect(&self, compute: &ComputeId) -> Result<Connection<Self::Client>, LauncherError>;
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use mockall::mock;

    mock! {
        pub LauncherClient {}

        impl LauncherClient for LauncherClient {
            fn launch(&mut self, spec: &LaunchSpec) -> Result<ProcessId, LauncherError>;
            fn stop(&mut self, process_id: &ProcessId) -> Result<(), LauncherError>;
            fn send_input(
                &mut self,
                process_id: &ProcessId,
                fd: i32,
                data: &[u8],
            ) -> Result<(), LauncherError>;
            fn close_fd(&mut self, process_id: &ProcessId, fd: i32) -> Result<(), LauncherError>;
            fn send_telemetry_command(
                &mut self,
                process_id: &ProcessId,
                command: &TelemetryCommand,
            ) -> Result<(), LauncherError>;
        }
    }

    impl MockLauncherClient {
        /// Expects one launch of `process` and acknowledges it with an id
        /// derived from the process name.
        pub fn should_launch(&mut self, process: &str) {
            let expected = ProcessName::from(process);
            self.expect_launch()
                .once()
                .withf(move |spec| spec.name == expected)
                .returning(|spec| Ok(ProcessId::from(format!("{}-id", spec.name))));
        }

        pub fn should_stop(&mut self, times: usize) {
            self.expect_stop().times(times).returning(|_| Ok(()));
        }
    }

    mock! {
        pub LauncherConnector {}

        impl LauncherConnector for LauncherConnector {
            type Client = MockLauncherClient;

            fn connect(
                &self,
                compute: &ComputeId,
            ) -> Result<Connection<MockLauncherClient>, LauncherError>;
        }
    }
}
