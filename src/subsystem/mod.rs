pub mod error;
pub mod graph;
pub mod message;
pub mod process;
pub mod registry;
pub mod state;
pub mod status;
pub mod umbilical;

mod event_loop;
mod machine;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::alarm::Alarm;
use crate::bus::PlatformBus;
use crate::descriptor::{StreamSpec, SubsystemDescriptor};
use crate::event::channel::{pub_sub, EventConsumer};
use crate::launcher::{LauncherConnector, LauncherError};
use crate::names::{ComputeId, ProcessId, ProcessName, SubsystemName};
use crate::utils::bitset::ClientSet;
use crate::utils::threads::spawn_named_thread;

use self::error::SubsystemError;
use self::message::{InteractiveParams, Message, NO_CLIENT};
use self::process::Process;
use self::registry::{SubsystemHandle, SubsystemRegistry};
use self::state::{AdminState, OperState, RestartPolicy};
use self::status::{ProcessStatus, StatusCell, SubsystemStatus, UmbilicalStatus};
use self::umbilical::Umbilical;

/// A named, restartable unit of one or more processes plus its dependency
/// edges. The value is consumed by [`Subsystem::start`], which moves it onto
/// its own driver thread; from the outside a running subsystem is only
/// reachable through its [`SubsystemHandle`].
pub struct Subsystem<C: LauncherConnector> {
    name: SubsystemName,
    vars: HashMap<String, String>,
    streams: Vec<StreamSpec>,
    critical: bool,
    restart_policy: RestartPolicy,
    max_restarts: u32,
    initial_restart_delay: Duration,
    stable_interval: Duration,

    admin_state: AdminState,
    oper_state: OperState,
    prev_oper_state: OperState,
    /// Client id that drove the current state; inherited by child fan-out.
    state_client: u32,
    active_clients: ClientSet,

    processes: Vec<Process>,
    /// Agent-id index. Strictly separate key space from the name lookup;
    /// deleting an agent id never touches name resolution.
    process_ids: HashMap<ProcessId, ProcessName>,
    pub(crate) umbilicals: HashMap<ComputeId, Umbilical<C::Client>>,
    processes_to_restart: Vec<ProcessName>,
    children_pending: HashSet<SubsystemName>,

    num_restarts: u32,
    restart_delay: Duration,
    online_since: Option<Instant>,
    connect_attempts: u32,

    alarm: Option<Alarm>,
    alarm_count: u32,
    emergency_abort_sent: bool,

    interactive: Option<InteractiveParams>,

    connector: C,
    registry: Arc<SubsystemRegistry>,
    bus: PlatformBus,

    pub(crate) pipe: EventConsumer<Message>,
    pub(crate) interrupt: EventConsumer<()>,
    status: StatusCell,
    /// Taken out on `start()`; holding it afterwards would keep the pipe
    /// open and defeat pipe-closure shutdown.
    handle_seed: Option<SubsystemHandle>,
}

impl<C: LauncherConnector> Subsystem<C> {
    pub fn new(
        descriptor: SubsystemDescriptor,
        connector: C,
        registry: Arc<SubsystemRegistry>,
        bus: PlatformBus,
    ) -> Self {
        let SubsystemDescriptor {
            name,
            processes,
            vars,
            streams,
            max_restarts,
            critical,
            restart_policy,
            initial_restart_delay,
            stable_interval,
        } = descriptor;

        let (pipe_publisher, pipe) = pub_sub();
        let (interrupt_publisher, interrupt) = pub_sub();
        let status = StatusCell::new(SubsystemStatus::initial(name.clone()));
        let handle = SubsystemHandle::new(
            name.clone(),
            pipe_publisher,
            interrupt_publisher,
            status.clone(),
        );

        let processes = processes
            .into_iter()
            .map(|d| Process::new(d, max_restarts, initial_restart_delay))
            .collect();

        Self {
            name,
            vars,
            streams,
            critical,
            restart_policy,
            max_restarts,
            initial_restart_delay,
            stable_interval,
            admin_state: AdminState::Offline,
            oper_state: OperState::Offline,
            prev_oper_state: OperState::Offline,
            state_client: NO_CLIENT,
            active_clients: ClientSet::new(),
            processes,
            process_ids: HashMap::new(),
            umbilicals: HashMap::new(),
            processes_to_restart: Vec::new(),
            children_pending: HashSet::new(),
            num_restarts: 0,
            restart_delay: initial_restart_delay,
            online_since: None,
            connect_attempts: 0,
            alarm: None,
            alarm_count: 0,
            emergency_abort_sent: false,
            interactive: None,
            connector,
            registry,
            bus,
            pipe,
            interrupt,
            status,
            handle_seed: Some(handle),
        }
    }

    pub fn name(&self) -> &SubsystemName {
        &self.name
    }

    pub fn is_critical(&self) -> bool {
        self.critical
    }

    pub fn is_offline(&self) -> bool {
        self.admin_state == AdminState::Offline && self.oper_state == OperState::Offline
    }

    pub fn is_connecting(&self) -> bool {
        self.oper_state == OperState::Connecting
    }

    /// The outward face of this subsystem. The daemon registers one clone in
    /// the registry and keeps others as needed.
    pub fn handle(&self) -> SubsystemHandle {
        self.handle_seed
            .as_ref()
            .expect("handle requested after start")
            .clone()
    }

    /// Drops a process from the descriptor set, releasing any umbilical
    /// contribution it holds.
    pub fn remove_process(&mut self, name: &ProcessName) {
        self.disconnect_process(name);
        self.processes.retain(|p| p.name() != name);
    }

    /// Spawns the driver thread; exactly one driver runs the state machine.
    pub fn start(mut self) -> StartedSubsystem {
        let handle = self
            .handle_seed
            .take()
            .expect("subsystem started twice");
        let name = self.name.clone();
        let registry = Arc::clone(&self.registry);
        let driver = spawn_named_thread(format!("subsystem-{name}"), move || self.run());
        StartedSubsystem {
            name,
            handle,
            registry,
            driver,
        }
    }

    // ---- process and umbilical queries used by the state machine ----

    pub(crate) fn find_process(&self, name: &ProcessName) -> Option<&Process> {
        self.processes.iter().find(|p| p.name() == name)
    }

    pub(crate) fn find_process_mut(&mut self, name: &ProcessName) -> Option<&mut Process> {
        self.processes.iter_mut().find(|p| p.name() == name)
    }

    /// A `oneshot` that completed successfully counts as running.
    pub(crate) fn all_processes_running(&self) -> bool {
        self.processes.iter().all(|p| p.counts_as_running())
    }

    pub(crate) fn all_processes_stopped(&self) -> bool {
        self.processes.iter().all(|p| !p.is_running())
    }

    pub(crate) fn all_umbilicals_connected(&self) -> bool {
        self.umbilicals.values().all(|u| u.is_connected())
    }

    /// Distinct computes referenced by the owned processes, in stable order.
    pub fn computes(&self) -> BTreeSet<ComputeId> {
        self.processes.iter().map(|p| p.compute().clone()).collect()
    }

    /// A running zygote of this identity within the subsystem, if any.
    pub(crate) fn find_running_zygote(&self, name: &ProcessName) -> Option<&Process> {
        self.processes
            .iter()
            .find(|p| p.is_zygote() && p.name() == name && p.is_running())
    }

    pub(crate) fn zygote_exists(&self, name: &ProcessName) -> bool {
        self.processes.iter().any(|p| p.is_zygote() && p.name() == name)
    }

    /// The subsystem's interactive process; at most one is expected.
    pub fn find_interactive_process(&self) -> Option<&Process> {
        self.processes.iter().find(|p| p.is_interactive())
    }

    // ---- interactive stream routing ----

    /// Routes input to an interactive process over its umbilical.
    pub fn send_input(
        &mut self,
        process: &ProcessName,
        fd: i32,
        data: &[u8],
    ) -> Result<(), SubsystemError> {
        let p = self
            .processes
            .iter()
            .find(|p| p.name() == process)
            .ok_or_else(|| SubsystemError::UnknownProcess {
                subsystem: self.name.clone(),
                process: process.clone(),
            })?;
        let umbilical = self
            .umbilicals
            .get_mut(p.compute())
            .ok_or_else(|| LauncherError::NotConnected(p.compute().clone()))?;
        p.send_input(umbilical.client_mut(), fd, data)?;
        Ok(())
    }

    pub fn close_fd(&mut self, process: &ProcessName, fd: i32) -> Result<(), SubsystemError> {
        let p = self
            .processes
            .iter()
            .find(|p| p.name() == process)
            .ok_or_else(|| SubsystemError::UnknownProcess {
                subsystem: self.name.clone(),
                process: process.clone(),
            })?;
        let umbilical = self
            .umbilicals
            .get_mut(p.compute())
            .ok_or_else(|| LauncherError::NotConnected(p.compute().clone()))?;
        p.close_fd(umbilical.client_mut(), fd)?;
        Ok(())
    }

    // ---- alarms ----

    pub(crate) fn raise_alarm(&mut self, alarm: Alarm) {
        self.alarm = Some(alarm.clone());
        self.alarm_count += 1;
        self.bus.emit_alarm(alarm);
    }

    pub(crate) fn clear_alarm(&mut self) {
        if let Some(alarm) = self.alarm.take() {
            self.bus.emit_alarm(alarm.cleared());
        }
    }

    /// The subsystem's alarm plus every process alarm, for snapshots.
    pub(crate) fn collect_alarms(&self) -> Vec<Alarm> {
        self.alarm
            .iter()
            .chain(self.processes.iter().filter_map(|p| p.alarm()))
            .cloned()
            .collect()
    }

    // ---- restart backoff ----

    /// Doubles the subsystem backoff up to the cap, returning the
    /// pre-increment delay to actually wait.
    pub(crate) fn inc_restart_delay(&mut self) -> Duration {
        let old_delay = self.restart_delay;
        self.restart_delay = (self.restart_delay * 2).min(process::MAX_RESTART_DELAY);
        old_delay
    }

    pub(crate) fn reset_restart_state(&mut self) {
        self.num_restarts = 0;
        self.restart_delay = self.initial_restart_delay;
    }

    pub(crate) fn reset_process_restarts(&mut self) {
        for p in &mut self.processes {
            p.reset_num_restarts();
            p.reset_restart_delay();
        }
    }

    // ---- status ----

    pub(crate) fn build_status(&self) -> SubsystemStatus {
        SubsystemStatus {
            name: self.name.clone(),
            admin_state: self.admin_state,
            oper_state: self.oper_state,
            prev_oper_state: self.prev_oper_state,
            num_restarts: self.num_restarts,
            alarm_count: self.alarm_count,
            active_clients: self.active_clients.len(),
            processes: self
                .processes
                .iter()
                .map(|p| ProcessStatus {
                    name: p.name().clone(),
                    compute: p.compute().clone(),
                    running: p.is_running(),
                    process_id: p.process_id().cloned(),
                    pid: p.pid(),
                    exited: p.exited(),
                    exit_status: p.exit_status(),
                    num_restarts: p.num_restarts(),
                    alarm_count: p.alarm_count(),
                })
                .collect(),
            umbilicals: self
                .umbilicals
                .values()
                .map(|u| UmbilicalStatus {
                    compute: u.compute().clone(),
                    refs: u.refs(),
                    connected: u.is_connected(),
                })
                .collect(),
            alarms: self.collect_alarms(),
        }
    }

    pub(crate) fn refresh_status(&self) {
        self.status.store(self.build_status());
    }

    // ---- umbilical reference counting ----

    /// Marks `process` as contributing to its compute's umbilical, opening
    /// the connection on the first reference. Idempotent per process.
    pub(crate) fn connect_process(&mut self, name: &ProcessName) -> Result<(), LauncherError> {
        let (compute, already) = {
            let p = self.processes.iter().find(|p| p.name() == name);
            let Some(p) = p else { return Ok(()) };
            (p.compute().clone(), p.maybe_connected())
        };
        if already {
            return Ok(());
        }

        if !self.umbilicals.contains_key(&compute) {
            let connection = self.connector.connect(&compute)?;
            self.umbilicals
                .insert(compute.clone(), Umbilical::new(compute.clone(), connection));
        }
        self.umbilicals
            .get_mut(&compute)
            .expect("umbilical just ensured")
            .add_reference();
        if let Some(p) = self.find_process_mut(name) {
            p.set_maybe_connected(true);
        }
        Ok(())
    }

    /// Drops `process`'s contribution; tears the umbilical down at zero.
    pub(crate) fn disconnect_process(&mut self, name: &ProcessName) {
        let compute = {
            let Some(p) = self.processes.iter_mut().find(|p| p.name() == name) else {
                return;
            };
            if !p.maybe_connected() {
                return;
            }
            p.set_maybe_connected(false);
            p.compute().clone()
        };

        if let Some(umbilical) = self.umbilicals.get_mut(&compute) {
            if umbilical.remove_reference() == 0 {
                debug!(subsystem = %self.name, compute = %compute, "tearing down umbilical");
                self.umbilicals.remove(&compute);
            }
        }
    }

    /// Releases every umbilical and clears all connection bookkeeping.
    pub(crate) fn release_umbilicals(&mut self) {
        for p in &mut self.processes {
            p.set_maybe_connected(false);
        }
        if !self.umbilicals.is_empty() {
            debug!(subsystem = %self.name, "releasing all umbilicals");
        }
        self.umbilicals.clear();
    }

    pub(crate) fn record_process_id(&mut self, id: ProcessId, name: ProcessName) {
        self.process_ids.insert(id, name);
    }

    pub(crate) fn delete_process_id(&mut self, id: &ProcessId) {
        self.process_ids.remove(id);
    }

    pub(crate) fn process_name_for_id(&self, id: &ProcessId) -> Option<ProcessName> {
        self.process_ids.get(id).cloned()
    }
}

/// A running subsystem: the driver thread plus the handle to reach it.
pub struct StartedSubsystem {
    name: SubsystemName,
    handle: SubsystemHandle,
    registry: Arc<SubsystemRegistry>,
    driver: JoinHandle<Result<(), SubsystemError>>,
}

impl StartedSubsystem {
    pub fn name(&self) -> &SubsystemName {
        &self.name
    }

    pub fn handle(&self) -> &SubsystemHandle {
        &self.handle
    }

    pub fn is_finished(&self) -> bool {
        self.driver.is_finished()
    }

    /// Winds the subsystem down and joins the driver: posts a non-emergency
    /// abort, deregisters from the registry and closes this handle, which
    /// lets the driver observe pipe closure and exit. Any handle clones the
    /// daemon still holds will keep the pipe open and stall the join.
    pub fn stop(self) -> Result<(), SubsystemError> {
        let _ = self.handle.send(Message::Abort {
            emergency: false,
            client_id: NO_CLIENT,
        });
        self.registry.deregister(&self.name);
        drop(self.handle);

        match self.driver.join() {
            Ok(result) => result,
            Err(_) => {
                warn!(subsystem = %self.name, "driver thread panicked");
                Err(SubsystemError::DriverPanicked(self.name))
            }
        }
    }
}
