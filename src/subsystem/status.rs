use serde::Serialize;
use std::sync::{Arc, RwLock};

use crate::alarm::Alarm;
use crate::names::{ComputeId, ProcessId, ProcessName, SubsystemName};
use crate::subsystem::state::{AdminState, OperState};

/// Runtime snapshot of one process.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessStatus {
    pub name: ProcessName,
    pub compute: ComputeId,
    pub running: bool,
    pub process_id: Option<ProcessId>,
    pub pid: Option<i32>,
    pub exited: bool,
    pub exit_status: i32,
    pub num_restarts: u32,
    pub alarm_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct UmbilicalStatus {
    pub compute: ComputeId,
    pub refs: usize,
    pub connected: bool,
}

/// Snapshot of a subsystem, rebuilt by its driver after every transition.
#[derive(Debug, Clone, Serialize)]
pub struct SubsystemStatus {
    pub name: SubsystemName,
    pub admin_state: AdminState,
    pub oper_state: OperState,
    pub prev_oper_state: OperState,
    pub num_restarts: u32,
    pub alarm_count: u32,
    pub active_clients: usize,
    pub processes: Vec<ProcessStatus>,
    pub umbilicals: Vec<UmbilicalStatus>,
    pub alarms: Vec<Alarm>,
}

impl SubsystemStatus {
    pub fn initial(name: SubsystemName) -> Self {
        Self {
            name,
            admin_state: AdminState::Offline,
            oper_state: OperState::Offline,
            prev_oper_state: OperState::Offline,
            num_restarts: 0,
            alarm_count: 0,
            active_clients: 0,
            processes: Vec::new(),
            umbilicals: Vec::new(),
            alarms: Vec::new(),
        }
    }

    pub fn process(&self, name: &ProcessName) -> Option<&ProcessStatus> {
        self.processes.iter().find(|p| &p.name == name)
    }
}

/// Shared cell through which a subsystem's handle reads the latest snapshot.
#[derive(Debug, Clone)]
pub struct StatusCell(Arc<RwLock<SubsystemStatus>>);

impl StatusCell {
    pub fn new(status: SubsystemStatus) -> Self {
        Self(Arc::new(RwLock::new(status)))
    }

    pub fn store(&self, status: SubsystemStatus) {
        *self.0.write().expect("status cell poisoned") = status;
    }

    pub fn load(&self) -> SubsystemStatus {
        self.0.read().expect("status cell poisoned").clone()
    }
}
