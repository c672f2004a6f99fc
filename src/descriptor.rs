use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::names::{ComputeId, ProcessName, SubsystemName};
use crate::subsystem::state::RestartPolicy;

/// Restart budget used when a descriptor does not set one.
pub const DEFAULT_MAX_RESTARTS: u32 = 3;

fn default_max_restarts() -> u32 {
    DEFAULT_MAX_RESTARTS
}

fn default_startup_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_sigint_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_sigterm_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_initial_restart_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_stable_interval() -> Duration {
    Duration::from_secs(30)
}

/// Where one of a process's file descriptors goes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum StreamDisposition {
    /// Inherit the launch agent's descriptor.
    Inherit,
    Close,
    /// Forward through the agent's event stream as `ProcessOutput`.
    Log,
    File { path: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StreamSpec {
    pub fd: i32,
    #[serde(flatten)]
    pub disposition: StreamDisposition,
}

/// Terminal parameters bound to an interactive subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Terminal {
    pub rows: u16,
    pub cols: u16,
    #[serde(default)]
    pub term: String,
}

/// The three process variants. A `Virtual` process runs inside a zygote of
/// the named identity within the same subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessKind {
    Static {
        executable: String,
    },
    Zygote {
        executable: String,
    },
    Virtual {
        zygote: ProcessName,
        module: String,
        entry: String,
    },
}

impl ProcessKind {
    pub fn is_zygote(&self) -> bool {
        matches!(self, ProcessKind::Zygote { .. })
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self, ProcessKind::Virtual { .. })
    }
}

/// Immutable configuration of a single process, as handed over by the
/// hosting daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessDescriptor {
    pub name: ProcessName,
    pub compute: ComputeId,
    #[serde(flatten)]
    pub kind: ProcessKind,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub streams: Vec<StreamSpec>,
    #[serde(
        default = "default_startup_timeout",
        deserialize_with = "duration_str::deserialize_duration"
    )]
    pub startup_timeout: Duration,
    #[serde(
        default = "default_sigint_timeout",
        deserialize_with = "duration_str::deserialize_duration"
    )]
    pub sigint_shutdown_timeout: Duration,
    #[serde(
        default = "default_sigterm_timeout",
        deserialize_with = "duration_str::deserialize_duration"
    )]
    pub sigterm_shutdown_timeout: Duration,
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub oneshot: bool,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default)]
    pub notify: bool,
    #[serde(default)]
    pub telemetry: bool,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub cgroup: Option<String>,
    /// Per-process restart budget; the subsystem's budget applies when unset.
    #[serde(default)]
    pub max_restarts: Option<u32>,
}

/// Immutable configuration of a subsystem.
#[derive(Debug, Clone, Deserialize)]
pub struct SubsystemDescriptor {
    pub name: SubsystemName,
    #[serde(default)]
    pub processes: Vec<ProcessDescriptor>,
    #[serde(default)]
    pub vars: HashMap<String, String>,
    #[serde(default)]
    pub streams: Vec<StreamSpec>,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    /// First backoff delay for subsystem and process restarts.
    #[serde(
        default = "default_initial_restart_delay",
        deserialize_with = "duration_str::deserialize_duration"
    )]
    pub initial_restart_delay: Duration,
    /// Continuous Online time after which restart counters reset.
    #[serde(
        default = "default_stable_interval",
        deserialize_with = "duration_str::deserialize_duration"
    )]
    pub stable_interval: Duration,
}

impl SubsystemDescriptor {
    pub fn new<S: Into<SubsystemName>>(name: S) -> Self {
        Self {
            name: name.into(),
            processes: Vec::new(),
            vars: HashMap::new(),
            streams: Vec::new(),
            max_restarts: DEFAULT_MAX_RESTARTS,
            critical: false,
            restart_policy: RestartPolicy::default(),
            initial_restart_delay: default_initial_restart_delay(),
            stable_interval: default_stable_interval(),
        }
    }
}
