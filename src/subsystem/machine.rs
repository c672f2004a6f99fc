//! The per-subsystem state machine: one driver loop dispatching per-state
//! handlers over the multiplexed event sources.

use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::alarm::{Alarm, AlarmReason, AlarmSeverity, AlarmSubject};
use crate::bus::PlatformEvent;
use crate::launcher::event::{LauncherEvent, TelemetryCommand};
use crate::launcher::{LauncherClient, LauncherConnector, LauncherError};
use crate::names::{ComputeId, ProcessId, ProcessName, SubsystemName};
use crate::subsystem::error::SubsystemError;
use crate::subsystem::event_loop::{EventSource, StateTransition};
use crate::descriptor::ProcessKind;
use crate::subsystem::message::{InteractiveParams, Message, OutputChunk, NO_CLIENT};
use crate::subsystem::state::{AdminState, OperState, RestartPolicy};
use crate::subsystem::Subsystem;

/// Budget allowed per child in the starting/stopping-children phases.
const CHILD_PHASE_TIMEOUT: Duration = Duration::from_secs(30);
/// Slack added on top of every phase budget.
const PHASE_GRACE: Duration = Duration::from_secs(5);

impl<C: LauncherConnector> Subsystem<C> {
    /// Driver entry point; runs on the subsystem's own thread until the
    /// message pipe closes.
    pub(crate) fn run(mut self) -> Result<(), SubsystemError> {
        info!(subsystem = %self.name, "subsystem driver started");
        self.refresh_status();
        let result = self.drive();
        self.shutdown_cleanup();
        match result {
            Err(SubsystemError::PipeClosed) => {
                debug!(subsystem = %self.name, "message pipe closed, driver exiting");
                Ok(())
            }
            other => other,
        }
    }

    fn drive(&mut self) -> Result<(), SubsystemError> {
        loop {
            match self.oper_state {
                OperState::Offline => self.offline()?,
                OperState::StartingChildren => self.starting_children()?,
                OperState::Connecting => self.connecting()?,
                OperState::StartingProcesses => self.starting_processes()?,
                OperState::Online => self.online()?,
                OperState::StoppingProcesses => self.stopping_processes()?,
                OperState::StoppingChildren => self.stopping_children()?,
                OperState::Restarting => self.restarting()?,
                OperState::RestartingProcesses => self.restarting_processes()?,
                OperState::Broken => self.broken()?,
            }
        }
    }

    fn shutdown_cleanup(&mut self) {
        self.stop_running_processes();
        for p in &mut self.processes {
            p.set_stopped();
        }
        self.release_umbilicals();
        self.refresh_status();
    }

    // ---- transitions and notifications ----

    pub(crate) fn enter_state(&mut self, state: OperState, client_id: u32) {
        if state == self.oper_state {
            return;
        }
        debug!(
            subsystem = %self.name,
            from = %self.oper_state,
            to = %state,
            "state transition"
        );
        self.prev_oper_state = self.oper_state;
        self.oper_state = state;
        self.state_client = client_id;
        if state == OperState::Online {
            self.online_since = Some(Instant::now());
            self.connect_attempts = 0;
        } else {
            self.online_since = None;
        }
        self.refresh_status();
        self.notify_parents();
    }

    /// Parents re-evaluate on every oper change of a child.
    fn notify_parents(&self) {
        for parent in self.registry.parents_of(&self.name) {
            if let Some(handle) = self.registry.lookup(&parent) {
                let _ = handle.send(Message::ReportOper {
                    sender: self.name.clone(),
                    oper: self.oper_state,
                    client_id: self.state_client,
                });
            }
        }
    }

    /// Child fan-out with the inheriting client id.
    fn send_to_children(&self, admin: AdminState, client_id: u32) {
        for child in self.registry.children_of(&self.name) {
            if let Some(handle) = self.registry.lookup(&child) {
                let _ = handle.send(Message::change_admin(admin, client_id));
            }
        }
    }

    /// Tracks the requesting client and picks the follow-up state.
    ///
    /// Online requests record the client and head for `next_online`.
    /// Offline requests drop the client; only when the active set empties
    /// does the admin posture flip and the machine head for `next_offline`.
    /// `NO_CLIENT` never touches the set.
    fn handle_admin_command(
        &mut self,
        admin: AdminState,
        client_id: u32,
        next_offline: OperState,
        next_online: OperState,
    ) -> OperState {
        match admin {
            AdminState::Online => {
                self.admin_state = AdminState::Online;
                if client_id != NO_CLIENT {
                    self.active_clients.insert(client_id);
                }
                next_online
            }
            AdminState::Offline => {
                if client_id != NO_CLIENT {
                    self.active_clients.remove(client_id);
                }
                if self.active_clients.is_empty() {
                    self.admin_state = AdminState::Offline;
                    next_offline
                } else {
                    self.oper_state
                }
            }
        }
    }

    fn handle_change_admin(
        &mut self,
        admin: AdminState,
        client_id: u32,
        interactive: Option<InteractiveParams>,
        next_offline: OperState,
        next_online: OperState,
    ) -> Result<StateTransition, SubsystemError> {
        if admin == AdminState::Online {
            if let Some(params) = interactive {
                self.interactive = Some(params);
            }
        }
        let next = self.handle_admin_command(admin, client_id, next_offline, next_online);
        if next != self.oper_state {
            self.enter_state(next, client_id);
            Ok(StateTransition::Leave)
        } else {
            // A parent winding us down needs to hear back even when other
            // clients keep us up; re-affirm the current posture.
            self.refresh_status();
            self.notify_parents();
            Ok(StateTransition::Stay)
        }
    }

    fn handle_abort(
        &mut self,
        emergency: bool,
        client_id: u32,
    ) -> Result<StateTransition, SubsystemError> {
        if emergency {
            warn!(subsystem = %self.name, "emergency abort requested");
            self.emit_emergency_abort();
            self.enter_state(OperState::Broken, client_id);
            return Ok(StateTransition::Leave);
        }
        match self.oper_state {
            OperState::Offline
            | OperState::Broken
            | OperState::StoppingProcesses
            | OperState::StoppingChildren => Ok(StateTransition::Stay),
            _ => {
                self.active_clients.clear();
                self.admin_state = AdminState::Offline;
                self.enter_state(OperState::StoppingProcesses, client_id);
                Ok(StateTransition::Leave)
            }
        }
    }

    fn emit_emergency_abort(&mut self) {
        if !self.emergency_abort_sent {
            self.emergency_abort_sent = true;
            self.bus.emit(PlatformEvent::EmergencyAbort {
                subsystem: self.name.clone(),
            });
        }
    }

    // ---- Offline ----

    fn offline(&mut self) -> Result<(), SubsystemError> {
        // A client may have requested online again while we were stopping.
        if self.admin_state == AdminState::Online && !self.active_clients.is_empty() {
            self.reset_process_runtime();
            self.enter_state(OperState::StartingChildren, self.state_client);
            return Ok(());
        }
        self.refresh_status();
        self.run_in_state(Self::offline_handler, None)
    }

    fn offline_handler(&mut self, source: EventSource) -> Result<StateTransition, SubsystemError> {
        match source {
            EventSource::Message(message) => match message {
                Message::ChangeAdmin {
                    admin,
                    client_id,
                    interactive,
                } => {
                    if admin == AdminState::Online {
                        self.reset_process_runtime();
                    }
                    self.handle_change_admin(
                        admin,
                        client_id,
                        interactive,
                        OperState::Offline,
                        OperState::StartingChildren,
                    )
                }
                Message::Abort {
                    emergency,
                    client_id,
                } => self.handle_abort(emergency, client_id),
                Message::SendTelemetryCommand { command } => {
                    self.forward_telemetry_to_children(&command);
                    Ok(StateTransition::Stay)
                }
                _ => Ok(StateTransition::Stay),
            },
            _ => Ok(StateTransition::Stay),
        }
    }

    // ---- StartingChildren ----

    fn starting_children(&mut self) -> Result<(), SubsystemError> {
        let children = self.registry.children_of(&self.name);
        if children.is_empty() {
            self.enter_state(OperState::Connecting, self.state_client);
            return Ok(());
        }
        self.children_pending = children.into_iter().collect();
        self.send_to_children(AdminState::Online, self.state_client);
        let timeout =
            CHILD_PHASE_TIMEOUT * self.children_pending.len() as u32 + PHASE_GRACE;
        self.run_in_state(Self::starting_children_handler, Some(timeout))
    }

    fn starting_children_handler(
        &mut self,
        source: EventSource,
    ) -> Result<StateTransition, SubsystemError> {
        match source {
            EventSource::Message(message) => match message {
                Message::ReportOper { sender, oper, .. } => match oper {
                    OperState::Online => {
                        self.children_pending.remove(&sender);
                        if self.children_pending.is_empty() {
                            self.enter_state(OperState::Connecting, self.state_client);
                            Ok(StateTransition::Leave)
                        } else {
                            Ok(StateTransition::Stay)
                        }
                    }
                    OperState::Broken => self.child_broken(&sender),
                    _ => Ok(StateTransition::Stay),
                },
                Message::ChangeAdmin {
                    admin,
                    client_id,
                    interactive,
                } => self.handle_change_admin(
                    admin,
                    client_id,
                    interactive,
                    OperState::StoppingChildren,
                    OperState::StartingChildren,
                ),
                Message::Abort {
                    emergency,
                    client_id,
                } => self.handle_abort(emergency, client_id),
                Message::SendTelemetryCommand { command } => {
                    self.forward_telemetry_to_children(&command);
                    Ok(StateTransition::Stay)
                }
                _ => Ok(StateTransition::Stay),
            },
            EventSource::Timeout => {
                self.raise_alarm(Alarm::raised(
                    AlarmSubject::Subsystem(self.name.clone()),
                    AlarmSeverity::Error,
                    AlarmReason::StartupTimeout,
                    format!(
                        "children did not come online: {:?}",
                        self.children_pending
                    ),
                ));
                self.enter_state(OperState::Broken, self.state_client);
                Ok(StateTransition::Leave)
            }
            _ => Ok(StateTransition::Stay),
        }
    }

    fn child_broken(&mut self, child: &SubsystemName) -> Result<StateTransition, SubsystemError> {
        self.raise_alarm(Alarm::raised(
            AlarmSubject::Subsystem(self.name.clone()),
            AlarmSeverity::Error,
            AlarmReason::ChildBroken,
            format!("child subsystem `{child}` is broken"),
        ));
        self.enter_state(OperState::Broken, self.state_client);
        Ok(StateTransition::Leave)
    }

    // ---- Connecting ----

    fn connecting(&mut self) -> Result<(), SubsystemError> {
        match self.connect_umbilicals() {
            Ok(true) => {
                self.connect_attempts = 0;
                self.enter_state(OperState::StartingProcesses, self.state_client);
                Ok(())
            }
            Ok(false) => {
                self.connect_attempts += 1;
                if self.connect_attempts > self.max_restarts {
                    self.raise_alarm(Alarm::raised(
                        AlarmSubject::Subsystem(self.name.clone()),
                        AlarmSeverity::Error,
                        AlarmReason::ConnectionFailed,
                        "giving up connecting to launch agents",
                    ));
                    self.enter_state(OperState::Broken, self.state_client);
                    return Ok(());
                }
                let delay = self.inc_restart_delay();
                warn!(
                    subsystem = %self.name,
                    attempt = self.connect_attempts,
                    delay = ?delay,
                    "umbilical connect incomplete, retrying after backoff"
                );
                self.run_in_state(Self::connecting_handler, Some(delay))
            }
            Err(err) => {
                self.configuration_failure(&err.to_string());
                Ok(())
            }
        }
    }

    /// Ensures an umbilical with refcount ≥ 1 for every compute referenced
    /// by an owned process. Returns whether every one is connected; a
    /// configuration error (unknown compute) is terminal.
    fn connect_umbilicals(&mut self) -> Result<bool, LauncherError> {
        let mut all_connected = true;

        let names: Vec<ProcessName> =
            self.processes.iter().map(|p| p.name().clone()).collect();
        for name in names {
            match self.connect_process(&name) {
                Ok(()) => {}
                Err(LauncherError::UnknownCompute(compute)) => {
                    return Err(LauncherError::UnknownCompute(compute));
                }
                Err(err) => {
                    warn!(subsystem = %self.name, process = %name, error = %err, "umbilical connect failed");
                    all_connected = false;
                }
            }
        }

        // Reconnect anything that dropped since the last attempt.
        let disconnected: Vec<ComputeId> = self
            .umbilicals
            .iter()
            .filter(|(_, u)| !u.is_connected())
            .map(|(c, _)| c.clone())
            .collect();
        for compute in disconnected {
            match self.connector.connect(&compute) {
                Ok(connection) => {
                    self.umbilicals
                        .get_mut(&compute)
                        .expect("umbilical present")
                        .reconnect(connection);
                }
                Err(LauncherError::UnknownCompute(compute)) => {
                    return Err(LauncherError::UnknownCompute(compute));
                }
                Err(err) => {
                    warn!(subsystem = %self.name, compute = %compute, error = %err, "umbilical reconnect failed");
                    all_connected = false;
                }
            }
        }

        Ok(all_connected && self.all_umbilicals_connected())
    }

    fn connecting_handler(
        &mut self,
        source: EventSource,
    ) -> Result<StateTransition, SubsystemError> {
        match source {
            // Backoff elapsed; the driver re-enters `connecting` and tries
            // again.
            EventSource::Timeout => Ok(StateTransition::Leave),
            EventSource::Message(message) => match message {
                Message::ChangeAdmin {
                    admin,
                    client_id,
                    interactive,
                } => self.handle_change_admin(
                    admin,
                    client_id,
                    interactive,
                    OperState::StoppingChildren,
                    OperState::Connecting,
                ),
                Message::Abort {
                    emergency,
                    client_id,
                } => self.handle_abort(emergency, client_id),
                Message::ReportOper { sender, oper, .. } if oper == OperState::Broken => {
                    self.child_broken(&sender)
                }
                _ => Ok(StateTransition::Stay),
            },
            EventSource::Launcher(compute, LauncherEvent::Disconnected { reason }) => {
                warn!(subsystem = %self.name, compute = %compute, reason = %reason, "umbilical dropped while connecting");
                if let Some(umbilical) = self.umbilicals.get_mut(&compute) {
                    umbilical.mark_disconnected();
                }
                Ok(StateTransition::Stay)
            }
            _ => Ok(StateTransition::Stay),
        }
    }

    // ---- StartingProcesses ----

    fn starting_processes(&mut self) -> Result<(), SubsystemError> {
        if let Err(err) = self.launch_pending_processes() {
            return self.handle_launch_failure(err);
        }
        if self.all_processes_running() && self.all_umbilicals_connected() {
            self.enter_state(OperState::Online, self.state_client);
            return Ok(());
        }
        let timeout = self.startup_budget();
        self.run_in_state(Self::starting_processes_handler, Some(timeout))
    }

    /// Launches every process that is neither running nor a completed
    /// oneshot, in descriptor order. Virtual processes whose zygote is not
    /// running yet stay pending and launch once the zygote reports started;
    /// a zygote name that matches no process at all is a configuration
    /// error.
    fn launch_pending_processes(&mut self) -> Result<(), SubsystemError> {
        let names: Vec<ProcessName> =
            self.processes.iter().map(|p| p.name().clone()).collect();
        for name in names {
            let (launchable, zygote_id) = {
                let p = self.find_process(&name).expect("iterating own processes");
                if p.counts_as_running() || p.is_launch_pending() {
                    continue;
                }
                match p.kind() {
                    ProcessKind::Virtual { zygote, .. } => {
                        if !self.zygote_exists(zygote) {
                            return Err(LauncherError::ZygoteNotFound(zygote.clone()).into());
                        }
                        match self
                            .find_running_zygote(zygote)
                            .and_then(|z| z.process_id().cloned())
                        {
                            Some(id) => (true, Some(id)),
                            None => (false, None),
                        }
                    }
                    _ => (true, None),
                }
            };
            if !launchable {
                trace!(subsystem = %self.name, process = %name, "waiting for zygote before launch");
                continue;
            }
            self.launch_process(&name, zygote_id)?;
        }
        Ok(())
    }

    fn launch_process(
        &mut self,
        name: &ProcessName,
        zygote: Option<ProcessId>,
    ) -> Result<(), SubsystemError> {
        let (spec, compute) = {
            let p = self.find_process(name).expect("caller validated process");
            let terminal = self
                .interactive
                .as_ref()
                .filter(|_| p.is_interactive())
                .map(|session| &session.terminal);
            let spec = p.launch_spec(&self.name, &self.vars, &self.streams, terminal, zygote.as_ref())?;
            (spec, p.compute().clone())
        };

        let umbilical = self
            .umbilicals
            .get_mut(&compute)
            .ok_or_else(|| LauncherError::NotConnected(compute.clone()))?;
        info!(subsystem = %self.name, process = %name, compute = %compute, "launching process");
        let id = umbilical.client_mut().launch(&spec)?;

        self.record_process_id(id.clone(), name.clone());
        if let Some(p) = self.find_process_mut(name) {
            p.set_process_id(id);
            p.clear_exit();
        }
        Ok(())
    }

    fn handle_launch_failure(&mut self, err: SubsystemError) -> Result<(), SubsystemError> {
        match &err {
            SubsystemError::Launcher(LauncherError::ZygoteNotFound(_))
            | SubsystemError::Launcher(LauncherError::UnknownCompute(_)) => {
                self.configuration_failure(&err.to_string());
                Ok(())
            }
            SubsystemError::PipeClosed => Err(err),
            _ => {
                warn!(subsystem = %self.name, error = %err, "launch failed, applying restart policy");
                self.raise_alarm(Alarm::raised(
                    AlarmSubject::Subsystem(self.name.clone()),
                    AlarmSeverity::Warning,
                    AlarmReason::ConnectionFailed,
                    err.to_string(),
                ));
                match self.restart_policy {
                    RestartPolicy::Manual => {
                        self.enter_state(OperState::Broken, self.state_client)
                    }
                    _ => self.enter_state(OperState::Restarting, self.state_client),
                }
                Ok(())
            }
        }
    }

    fn configuration_failure(&mut self, details: &str) {
        self.raise_alarm(Alarm::raised(
            AlarmSubject::Subsystem(self.name.clone()),
            AlarmSeverity::Error,
            AlarmReason::ConfigurationError,
            details,
        ));
        self.enter_state(OperState::Broken, self.state_client);
    }

    fn startup_budget(&self) -> Duration {
        self.processes
            .iter()
            .filter(|p| !p.counts_as_running())
            .map(|p| p.startup_timeout())
            .max()
            .unwrap_or(Duration::from_secs(1))
            + PHASE_GRACE
    }

    fn shutdown_budget(&self) -> Duration {
        self.processes
            .iter()
            .filter(|p| p.is_running())
            .map(|p| p.shutdown_budget())
            .max()
            .unwrap_or(Duration::from_secs(1))
            + PHASE_GRACE
    }

    fn starting_processes_handler(
        &mut self,
        source: EventSource,
    ) -> Result<StateTransition, SubsystemError> {
        match source {
            EventSource::Launcher(compute, event) => match event {
                LauncherEvent::ProcessStarted { process_id, pid } => {
                    self.on_process_started(&process_id, pid)?;
                    if self.all_processes_running() && self.all_umbilicals_connected() {
                        self.enter_state(OperState::Online, self.state_client);
                        Ok(StateTransition::Leave)
                    } else {
                        Ok(StateTransition::Stay)
                    }
                }
                LauncherEvent::ProcessStopped {
                    process_id,
                    exited,
                    status_or_signal,
                } => self.restart_if_possible_after_process_crash(
                    &process_id,
                    exited,
                    status_or_signal,
                ),
                LauncherEvent::Disconnected { reason } => {
                    self.handle_umbilical_loss(&compute, &reason)
                }
                other => self.absorb_launcher_event(other),
            },
            EventSource::Message(message) => match message {
                Message::ChangeAdmin {
                    admin,
                    client_id,
                    interactive,
                } => self.handle_change_admin(
                    admin,
                    client_id,
                    interactive,
                    OperState::StoppingProcesses,
                    OperState::StartingProcesses,
                ),
                Message::Abort {
                    emergency,
                    client_id,
                } => self.handle_abort(emergency, client_id),
                Message::ReportOper { sender, oper, .. } if oper == OperState::Broken => {
                    self.child_broken(&sender)
                }
                Message::SendTelemetryCommand { command } => {
                    self.fan_out_telemetry(&command);
                    Ok(StateTransition::Stay)
                }
                _ => Ok(StateTransition::Stay),
            },
            EventSource::Timeout => self.start_timeout_recovery(),
            EventSource::Interrupt => {
                if self.all_processes_running() && self.all_umbilicals_connected() {
                    self.enter_state(OperState::Online, self.state_client);
                    Ok(StateTransition::Leave)
                } else {
                    Ok(StateTransition::Stay)
                }
            }
        }
    }

    /// Output, telemetry and parameter events need no state logic.
    fn absorb_launcher_event(
        &mut self,
        event: LauncherEvent,
    ) -> Result<StateTransition, SubsystemError> {
        match event {
            LauncherEvent::ProcessOutput {
                process_id,
                fd,
                bytes,
            } => self.forward_output(&process_id, fd, bytes),
            LauncherEvent::TelemetryStatus {
                process_id,
                payload,
            } => self.bus.emit(PlatformEvent::TelemetryStatus {
                subsystem: self.name.clone(),
                process_id,
                payload,
            }),
            LauncherEvent::ParameterUpdate { name, value } => {
                self.bus.emit(PlatformEvent::ParameterUpdate {
                    subsystem: self.name.clone(),
                    name,
                    value,
                })
            }
            other => trace!(subsystem = %self.name, event = ?other, "launcher event ignored"),
        }
        Ok(StateTransition::Stay)
    }

    fn on_process_started(
        &mut self,
        process_id: &ProcessId,
        pid: i32,
    ) -> Result<(), SubsystemError> {
        let Some(name) = self.process_name_for_id(process_id) else {
            debug!(subsystem = %self.name, id = %process_id, "start ack for unknown process id");
            return Ok(());
        };
        if let Some(p) = self.find_process_mut(&name) {
            p.set_pid(pid);
            p.set_running();
            p.clear_exit();
        }
        info!(subsystem = %self.name, process = %name, pid, "process started");
        self.refresh_status();

        // A freshly started zygote may unblock pending virtual processes.
        if matches!(
            self.oper_state,
            OperState::StartingProcesses | OperState::RestartingProcesses
        ) {
            self.launch_pending_processes()?;
        }
        Ok(())
    }

    fn forward_output(&mut self, process_id: &ProcessId, fd: i32, bytes: Vec<u8>) {
        let Some(name) = self.process_name_for_id(process_id) else {
            return;
        };
        let interactive = self
            .find_process(&name)
            .is_some_and(|p| p.is_interactive());
        if interactive {
            if let Some(session) = &self.interactive {
                let _ = session.output.publish(OutputChunk { fd, bytes });
                return;
            }
        }
        trace!(subsystem = %self.name, process = %name, fd, len = bytes.len(), "process output");
    }

    fn fan_out_telemetry(&mut self, command: &TelemetryCommand) {
        let targets: Vec<(ComputeId, ProcessName)> = self
            .processes
            .iter()
            .filter(|p| p.is_telemetry() && p.is_running())
            .map(|p| (p.compute().clone(), p.name().clone()))
            .collect();
        for (compute, name) in targets {
            let result = {
                let Some(umbilical) = self.umbilicals.get_mut(&compute) else {
                    continue;
                };
                let Some(p) = self.processes.iter().find(|p| p.name() == &name) else {
                    continue;
                };
                p.send_telemetry_command(umbilical.client_mut(), command)
            };
            if let Err(err) = result {
                warn!(subsystem = %self.name, process = %name, error = %err, "telemetry command failed");
            }
        }
        self.forward_telemetry_to_children(command);
    }

    fn forward_telemetry_to_children(&self, command: &TelemetryCommand) {
        for child in self.registry.children_of(&self.name) {
            if let Some(handle) = self.registry.lookup(&child) {
                let _ = handle.send(Message::SendTelemetryCommand {
                    command: command.clone(),
                });
            }
        }
    }

    // ---- Online ----

    fn online(&mut self) -> Result<(), SubsystemError> {
        info!(subsystem = %self.name, "subsystem online");
        self.run_in_state(Self::online_handler, None)
    }

    fn online_handler(&mut self, source: EventSource) -> Result<StateTransition, SubsystemError> {
        match source {
            EventSource::Message(message) => match message {
                Message::ChangeAdmin {
                    admin,
                    client_id,
                    interactive,
                } => self.handle_change_admin(
                    admin,
                    client_id,
                    interactive,
                    OperState::StoppingProcesses,
                    OperState::Online,
                ),
                Message::ReportOper { sender, oper, .. } => {
                    self.on_child_report_while_online(&sender, oper)
                }
                Message::Abort {
                    emergency,
                    client_id,
                } => self.handle_abort(emergency, client_id),
                Message::Restart { client_id } => {
                    self.enter_state(OperState::Restarting, client_id);
                    Ok(StateTransition::Leave)
                }
                Message::RestartProcesses {
                    processes,
                    client_id,
                } => {
                    self.processes_to_restart = if processes.is_empty() {
                        self.processes.iter().map(|p| p.name().clone()).collect()
                    } else {
                        processes
                    };
                    self.enter_state(OperState::RestartingProcesses, client_id);
                    Ok(StateTransition::Leave)
                }
                Message::RestartCrashedProcesses { client_id } => {
                    let crashed: Vec<ProcessName> = self
                        .processes
                        .iter()
                        .filter(|p| !p.counts_as_running())
                        .map(|p| p.name().clone())
                        .collect();
                    if crashed.is_empty() {
                        Ok(StateTransition::Stay)
                    } else {
                        self.processes_to_restart = crashed;
                        self.enter_state(OperState::RestartingProcesses, client_id);
                        Ok(StateTransition::Leave)
                    }
                }
                Message::SendTelemetryCommand { command } => {
                    self.fan_out_telemetry(&command);
                    Ok(StateTransition::Stay)
                }
            },
            EventSource::Launcher(compute, event) => match event {
                LauncherEvent::ProcessStopped {
                    process_id,
                    exited,
                    status_or_signal,
                } => self.restart_if_possible_after_process_crash(
                    &process_id,
                    exited,
                    status_or_signal,
                ),
                LauncherEvent::Disconnected { reason } => {
                    self.handle_umbilical_loss(&compute, &reason)
                }
                LauncherEvent::ProcessStarted { process_id, pid } => {
                    self.on_process_started(&process_id, pid)?;
                    Ok(StateTransition::Stay)
                }
                other => self.absorb_launcher_event(other),
            },
            EventSource::Interrupt | EventSource::Timeout => Ok(StateTransition::Stay),
        }
    }

    fn on_child_report_while_online(
        &mut self,
        sender: &SubsystemName,
        oper: OperState,
    ) -> Result<StateTransition, SubsystemError> {
        match oper {
            OperState::Online => Ok(StateTransition::Stay),
            OperState::Broken => {
                warn!(subsystem = %self.name, child = %sender, "child went broken");
                match self.restart_policy {
                    RestartPolicy::Manual => self.child_broken(sender),
                    _ => {
                        self.raise_alarm(Alarm::raised(
                            AlarmSubject::Subsystem(self.name.clone()),
                            AlarmSeverity::Error,
                            AlarmReason::ChildBroken,
                            format!("child subsystem `{sender}` is broken"),
                        ));
                        self.enter_state(OperState::Restarting, self.state_client);
                        Ok(StateTransition::Leave)
                    }
                }
            }
            _ => {
                // The child left Online underneath us.
                debug!(subsystem = %self.name, child = %sender, child_state = %oper, "child left online");
                match self.restart_policy {
                    RestartPolicy::Manual => self.child_broken(sender),
                    _ => {
                        self.enter_state(OperState::Restarting, self.state_client);
                        Ok(StateTransition::Leave)
                    }
                }
            }
        }
    }

    // ---- crash handling ----

    /// Decides what happens after a `ProcessStopped`. Marks the process
    /// stopped, then applies the restart policy; a successful oneshot exit
    /// is not a crash.
    fn restart_if_possible_after_process_crash(
        &mut self,
        process_id: &ProcessId,
        exited: bool,
        status_or_signal: i32,
    ) -> Result<StateTransition, SubsystemError> {
        let Some(name) = self.process_name_for_id(process_id) else {
            return Ok(StateTransition::Stay);
        };
        self.delete_process_id(process_id);

        let Some(p) = self.find_process_mut(&name) else {
            return Ok(StateTransition::Stay);
        };
        p.set_stopped();
        p.set_exit(exited, status_or_signal);
        p.clear_process_id();
        let oneshot_success = p.is_oneshot() && exited && status_or_signal == 0;
        let critical_signal = p.is_critical() && !exited;
        self.refresh_status();

        if oneshot_success {
            debug!(subsystem = %self.name, process = %name, "oneshot completed");
            if self.oper_state != OperState::Online
                && self.all_processes_running()
                && self.all_umbilicals_connected()
            {
                self.enter_state(OperState::Online, self.state_client);
                return Ok(StateTransition::Leave);
            }
            return Ok(StateTransition::Stay);
        }

        warn!(
            subsystem = %self.name,
            process = %name,
            exited,
            status_or_signal,
            "process stopped unexpectedly"
        );

        // A long stable period forgives past failures before this one is
        // counted.
        if let Some(since) = self.online_since {
            if since.elapsed() >= self.stable_interval {
                self.reset_restart_state();
                self.reset_process_restarts();
            }
        }

        let alarm = Alarm::raised(
            AlarmSubject::Process {
                subsystem: self.name.clone(),
                process: name.clone(),
            },
            AlarmSeverity::Warning,
            AlarmReason::ProcessCrashed,
            if exited {
                format!("exited with status {status_or_signal}")
            } else {
                format!("killed by signal {status_or_signal}")
            },
        );
        self.bus.emit_alarm(alarm.clone());
        if let Some(p) = self.find_process_mut(&name) {
            p.raise_alarm(alarm);
        }

        // A critical process dying to a signal always restarts the whole
        // subsystem unless the policy is strictly per-process.
        if critical_signal && self.restart_policy != RestartPolicy::ProcessOnly {
            self.enter_state(OperState::Restarting, self.state_client);
            return Ok(StateTransition::Leave);
        }

        match self.restart_policy {
            RestartPolicy::Automatic => {
                self.enter_state(OperState::Restarting, self.state_client);
                Ok(StateTransition::Leave)
            }
            RestartPolicy::Manual => {
                self.raise_alarm(Alarm::raised(
                    AlarmSubject::Subsystem(self.name.clone()),
                    AlarmSeverity::Error,
                    AlarmReason::ProcessCrashed,
                    format!("process `{name}` failed; manual restart required"),
                ));
                self.enter_state(OperState::Broken, self.state_client);
                Ok(StateTransition::Leave)
            }
            RestartPolicy::ProcessOnly => self.queue_process_restart(name),
        }
    }

    /// Per-process restart bookkeeping under `ProcessOnly`: budget check,
    /// coalescing into `processes_to_restart`.
    fn queue_process_restart(
        &mut self,
        name: ProcessName,
    ) -> Result<StateTransition, SubsystemError> {
        let over_budget = {
            let p = self.find_process_mut(&name).expect("process exists");
            if p.num_restarts() >= p.max_restarts() {
                true
            } else {
                p.inc_num_restarts();
                false
            }
        };
        if over_budget {
            self.raise_alarm(Alarm::raised(
                AlarmSubject::Process {
                    subsystem: self.name.clone(),
                    process: name.clone(),
                },
                AlarmSeverity::Critical,
                AlarmReason::RestartLimitReached,
                format!("process `{name}` exhausted its restart budget"),
            ));
            self.enter_state(OperState::Broken, self.state_client);
            return Ok(StateTransition::Leave);
        }

        if !self.processes_to_restart.contains(&name) {
            self.processes_to_restart.push(name);
        }
        if self.oper_state == OperState::RestartingProcesses {
            // Additional crashes in the same tick only widen the set.
            Ok(StateTransition::Stay)
        } else {
            self.enter_state(OperState::RestartingProcesses, self.state_client);
            Ok(StateTransition::Leave)
        }
    }

    fn start_timeout_recovery(&mut self) -> Result<StateTransition, SubsystemError> {
        let pending: Vec<ProcessName> = self
            .processes
            .iter()
            .filter(|p| !p.counts_as_running())
            .map(|p| p.name().clone())
            .collect();
        self.raise_alarm(Alarm::raised(
            AlarmSubject::Subsystem(self.name.clone()),
            AlarmSeverity::Warning,
            AlarmReason::StartupTimeout,
            format!("processes did not start in time: {pending:?}"),
        ));
        match self.restart_policy {
            RestartPolicy::Manual => {
                self.enter_state(OperState::Broken, self.state_client);
                Ok(StateTransition::Leave)
            }
            RestartPolicy::Automatic => {
                self.enter_state(OperState::Restarting, self.state_client);
                Ok(StateTransition::Leave)
            }
            RestartPolicy::ProcessOnly => {
                for name in pending {
                    match self.queue_process_restart(name)? {
                        StateTransition::Leave if self.oper_state == OperState::Broken => {
                            return Ok(StateTransition::Leave);
                        }
                        _ => {}
                    }
                }
                // Leaving with the state unchanged re-enters the restart
                // sequence with the widened set.
                if self.oper_state != OperState::RestartingProcesses {
                    self.enter_state(OperState::RestartingProcesses, self.state_client);
                }
                Ok(StateTransition::Leave)
            }
        }
    }

    fn handle_umbilical_loss(
        &mut self,
        compute: &ComputeId,
        reason: &str,
    ) -> Result<StateTransition, SubsystemError> {
        warn!(subsystem = %self.name, compute = %compute, reason = %reason, "umbilical lost");
        if let Some(umbilical) = self.umbilicals.get_mut(compute) {
            umbilical.mark_disconnected();
        }

        let mut affected = Vec::new();
        for p in &mut self.processes {
            if p.is_on_compute(compute) && p.is_running() {
                p.set_stopped();
                p.set_exit(false, 0);
                affected.push(p.name().clone());
            }
        }
        for name in &affected {
            if let Some(id) = self.find_process(name).and_then(|p| p.process_id().cloned()) {
                self.delete_process_id(&id);
            }
            if let Some(p) = self.find_process_mut(name) {
                p.clear_process_id();
            }
        }
        self.refresh_status();

        self.raise_alarm(Alarm::raised(
            AlarmSubject::Subsystem(self.name.clone()),
            AlarmSeverity::Warning,
            AlarmReason::ConnectionFailed,
            format!("lost connection to launch agent on `{compute}`: {reason}"),
        ));

        if affected.is_empty() {
            // Nothing was running there; the next connecting pass retries.
            return Ok(StateTransition::Stay);
        }

        match self.restart_policy {
            RestartPolicy::Manual => {
                self.enter_state(OperState::Broken, self.state_client);
                Ok(StateTransition::Leave)
            }
            RestartPolicy::Automatic => {
                self.enter_state(OperState::Restarting, self.state_client);
                Ok(StateTransition::Leave)
            }
            RestartPolicy::ProcessOnly => {
                let before = self.oper_state;
                for name in affected {
                    self.queue_process_restart(name)?;
                    if self.oper_state == OperState::Broken {
                        return Ok(StateTransition::Leave);
                    }
                }
                // Leave only if the queueing moved us into the restart
                // state; inside it the widened set is picked up in place.
                if self.oper_state == before {
                    Ok(StateTransition::Stay)
                } else {
                    Ok(StateTransition::Leave)
                }
            }
        }
    }

    // ---- StoppingProcesses ----

    fn stopping_processes(&mut self) -> Result<(), SubsystemError> {
        self.stop_running_processes();
        if self.all_processes_stopped() {
            self.enter_state(OperState::StoppingChildren, self.state_client);
            return Ok(());
        }
        let timeout = self.shutdown_budget();
        self.run_in_state(Self::stopping_processes_handler, Some(timeout))
    }

    fn stop_running_processes(&mut self) {
        let targets: Vec<(ComputeId, ProcessName)> = self
            .processes
            .iter()
            .filter(|p| p.is_running())
            .map(|p| (p.compute().clone(), p.name().clone()))
            .collect();
        for (compute, name) in targets {
            let result = {
                let Some(umbilical) = self.umbilicals.get_mut(&compute) else {
                    continue;
                };
                let Some(p) = self.processes.iter().find(|p| p.name() == &name) else {
                    continue;
                };
                p.stop(umbilical.client_mut())
            };
            match result {
                Ok(()) => debug!(subsystem = %self.name, process = %name, "stop requested"),
                Err(err) => {
                    warn!(subsystem = %self.name, process = %name, error = %err, "stop request failed")
                }
            }
        }
    }

    fn on_process_stopped_while_stopping(
        &mut self,
        process_id: &ProcessId,
        exited: bool,
        status_or_signal: i32,
    ) {
        let Some(name) = self.process_name_for_id(process_id) else {
            return;
        };
        self.delete_process_id(process_id);
        if let Some(p) = self.find_process_mut(&name) {
            p.set_stopped();
            p.set_exit(exited, status_or_signal);
            p.clear_process_id();
        }
        debug!(subsystem = %self.name, process = %name, "process stopped");
        self.refresh_status();
    }

    fn stopping_processes_handler(
        &mut self,
        source: EventSource,
    ) -> Result<StateTransition, SubsystemError> {
        match source {
            EventSource::Launcher(compute, event) => match event {
                LauncherEvent::ProcessStopped {
                    process_id,
                    exited,
                    status_or_signal,
                } => {
                    self.on_process_stopped_while_stopping(&process_id, exited, status_or_signal);
                    if self.all_processes_stopped() {
                        self.enter_state(OperState::StoppingChildren, self.state_client);
                        Ok(StateTransition::Leave)
                    } else {
                        Ok(StateTransition::Stay)
                    }
                }
                LauncherEvent::Disconnected { reason } => {
                    // Losing the agent while stopping just means everything
                    // there is gone already.
                    debug!(subsystem = %self.name, compute = %compute, reason = %reason, "umbilical lost while stopping");
                    if let Some(umbilical) = self.umbilicals.get_mut(&compute) {
                        umbilical.mark_disconnected();
                    }
                    for p in &mut self.processes {
                        if p.is_on_compute(&compute) && p.is_running() {
                            p.set_stopped();
                            p.clear_process_id();
                        }
                    }
                    if self.all_processes_stopped() {
                        self.enter_state(OperState::StoppingChildren, self.state_client);
                        Ok(StateTransition::Leave)
                    } else {
                        Ok(StateTransition::Stay)
                    }
                }
                LauncherEvent::ProcessStarted { process_id, pid } => {
                    // A late start ack; stop it right away.
                    self.on_process_started(&process_id, pid)?;
                    if let Some(name) = self.process_name_for_id(&process_id) {
                        let compute = self
                            .find_process(&name)
                            .map(|p| p.compute().clone());
                        if let Some(compute) = compute {
                            let result = {
                                let Some(umbilical) = self.umbilicals.get_mut(&compute) else {
                                    return Ok(StateTransition::Stay);
                                };
                                umbilical.client_mut().stop(&process_id)
                            };
                            if let Err(err) = result {
                                warn!(subsystem = %self.name, process = %name, error = %err, "stop of late starter failed");
                            }
                        }
                    }
                    Ok(StateTransition::Stay)
                }
                other => self.absorb_launcher_event(other),
            },
            EventSource::Message(message) => match message {
                Message::ChangeAdmin {
                    admin,
                    client_id,
                    interactive,
                } => self.handle_change_admin(
                    admin,
                    client_id,
                    interactive,
                    OperState::StoppingProcesses,
                    OperState::StoppingProcesses,
                ),
                Message::Abort {
                    emergency,
                    client_id,
                } => self.handle_abort(emergency, client_id),
                _ => Ok(StateTransition::Stay),
            },
            EventSource::Timeout => {
                self.raise_alarm(Alarm::raised(
                    AlarmSubject::Subsystem(self.name.clone()),
                    AlarmSeverity::Warning,
                    AlarmReason::ShutdownTimeout,
                    "processes did not stop within the shutdown budget",
                ));
                for p in &mut self.processes {
                    p.set_stopped();
                    p.clear_process_id();
                }
                self.process_ids_clear();
                self.enter_state(OperState::StoppingChildren, self.state_client);
                Ok(StateTransition::Leave)
            }
            EventSource::Interrupt => {
                if self.all_processes_stopped() {
                    self.enter_state(OperState::StoppingChildren, self.state_client);
                    Ok(StateTransition::Leave)
                } else {
                    Ok(StateTransition::Stay)
                }
            }
        }
    }

    // ---- StoppingChildren ----

    fn stopping_children(&mut self) -> Result<(), SubsystemError> {
        let children = self.registry.children_of(&self.name);
        if children.is_empty() {
            self.finish_offline();
            return Ok(());
        }
        self.children_pending = children.into_iter().collect();
        self.send_to_children(AdminState::Offline, self.state_client);
        let timeout =
            CHILD_PHASE_TIMEOUT * self.children_pending.len() as u32 + PHASE_GRACE;
        self.run_in_state(Self::stopping_children_handler, Some(timeout))
    }

    fn stopping_children_handler(
        &mut self,
        source: EventSource,
    ) -> Result<StateTransition, SubsystemError> {
        match source {
            EventSource::Message(message) => match message {
                Message::ReportOper { sender, oper, .. } => {
                    // Offline is the normal acknowledgement. Online means
                    // the child stays up for other clients; Broken means it
                    // will never report offline. Either way our demand on it
                    // is settled.
                    if matches!(
                        oper,
                        OperState::Offline | OperState::Online | OperState::Broken
                    ) {
                        self.children_pending.remove(&sender);
                    }
                    if self.children_pending.is_empty() {
                        self.finish_offline();
                        Ok(StateTransition::Leave)
                    } else {
                        Ok(StateTransition::Stay)
                    }
                }
                Message::ChangeAdmin {
                    admin,
                    client_id,
                    interactive,
                } => self.handle_change_admin(
                    admin,
                    client_id,
                    interactive,
                    OperState::StoppingChildren,
                    OperState::StoppingChildren,
                ),
                Message::Abort {
                    emergency,
                    client_id,
                } => self.handle_abort(emergency, client_id),
                _ => Ok(StateTransition::Stay),
            },
            EventSource::Timeout => {
                self.raise_alarm(Alarm::raised(
                    AlarmSubject::Subsystem(self.name.clone()),
                    AlarmSeverity::Warning,
                    AlarmReason::ShutdownTimeout,
                    format!("children did not report offline: {:?}", self.children_pending),
                ));
                self.finish_offline();
                Ok(StateTransition::Leave)
            }
            EventSource::Launcher(compute, LauncherEvent::Disconnected { reason }) => {
                debug!(subsystem = %self.name, compute = %compute, reason = %reason, "umbilical lost while stopping children");
                if let Some(umbilical) = self.umbilicals.get_mut(&compute) {
                    umbilical.mark_disconnected();
                }
                Ok(StateTransition::Stay)
            }
            _ => Ok(StateTransition::Stay),
        }
    }

    /// Completes the wind-down: no running process, no held umbilical.
    fn finish_offline(&mut self) {
        for p in &mut self.processes {
            p.set_stopped();
            p.clear_process_id();
        }
        self.process_ids_clear();
        self.release_umbilicals();
        self.interactive = None;
        self.children_pending.clear();
        self.enter_state(OperState::Offline, self.state_client);
    }

    fn process_ids_clear(&mut self) {
        self.process_ids.clear();
    }

    // ---- Restarting ----

    fn restarting(&mut self) -> Result<(), SubsystemError> {
        if self.admin_state != AdminState::Online {
            self.enter_state(OperState::StoppingProcesses, self.state_client);
            return Ok(());
        }
        if self.num_restarts >= self.max_restarts {
            self.restart_limit_reached();
            return Ok(());
        }
        // A full restart never relaunches over live processes.
        self.stop_running_processes();
        let delay = self.inc_restart_delay();
        info!(subsystem = %self.name, delay = ?delay, num_restarts = self.num_restarts, "restarting after backoff");
        self.run_in_state(Self::restarting_handler, Some(delay))
    }

    fn restart_limit_reached(&mut self) {
        self.raise_alarm(Alarm::raised(
            AlarmSubject::Subsystem(self.name.clone()),
            AlarmSeverity::Critical,
            AlarmReason::RestartLimitReached,
            format!("restart limit of {} reached", self.max_restarts),
        ));
        self.enter_state(OperState::Broken, self.state_client);
    }

    fn restarting_handler(
        &mut self,
        source: EventSource,
    ) -> Result<StateTransition, SubsystemError> {
        match source {
            EventSource::Timeout => {
                if self.admin_state != AdminState::Online {
                    self.enter_state(OperState::StoppingProcesses, self.state_client);
                } else if self.num_restarts < self.max_restarts {
                    self.num_restarts += 1;
                    self.reset_process_runtime();
                    self.enter_state(OperState::StartingChildren, self.state_client);
                } else {
                    self.restart_limit_reached();
                }
                Ok(StateTransition::Leave)
            }
            EventSource::Message(message) => match message {
                Message::ChangeAdmin {
                    admin,
                    client_id,
                    interactive,
                } => self.handle_change_admin(
                    admin,
                    client_id,
                    interactive,
                    OperState::StoppingProcesses,
                    OperState::Restarting,
                ),
                Message::Abort {
                    emergency,
                    client_id,
                } => self.handle_abort(emergency, client_id),
                _ => Ok(StateTransition::Stay),
            },
            EventSource::Launcher(compute, event) => match event {
                LauncherEvent::ProcessStopped {
                    process_id,
                    exited,
                    status_or_signal,
                } => {
                    // Acks from the stop issued on entry; crashes coalesce
                    // into the restart that is already underway.
                    self.on_process_stopped_while_stopping(&process_id, exited, status_or_signal);
                    Ok(StateTransition::Stay)
                }
                LauncherEvent::ProcessStarted { process_id, pid } => {
                    // A straggling start ack; it will be stopped with the
                    // rest before the relaunch.
                    self.on_process_started(&process_id, pid)?;
                    self.stop_running_processes();
                    Ok(StateTransition::Stay)
                }
                LauncherEvent::Disconnected { reason } => {
                    debug!(subsystem = %self.name, compute = %compute, reason = %reason, "umbilical lost while restarting");
                    if let Some(umbilical) = self.umbilicals.get_mut(&compute) {
                        umbilical.mark_disconnected();
                    }
                    for p in &mut self.processes {
                        if p.is_on_compute(&compute) {
                            p.set_stopped();
                            p.clear_process_id();
                        }
                    }
                    Ok(StateTransition::Stay)
                }
                other => self.absorb_launcher_event(other),
            },
            EventSource::Interrupt => Ok(StateTransition::Stay),
        }
    }

    /// Clears runtime state so the next start cycle launches everything,
    /// including completed oneshots.
    fn reset_process_runtime(&mut self) {
        for p in &mut self.processes {
            p.set_stopped();
            p.clear_process_id();
            p.clear_exit();
        }
        self.process_ids_clear();
    }

    // ---- RestartingProcesses ----

    fn restarting_processes(&mut self) -> Result<(), SubsystemError> {
        if self.processes_to_restart.is_empty() {
            self.enter_state(OperState::Online, self.state_client);
            return Ok(());
        }
        debug!(subsystem = %self.name, targets = ?self.processes_to_restart, "restarting processes");

        // Stage 1: stop targets that are still alive (dead ones are skipped).
        let running_targets: Vec<(ComputeId, ProcessName)> = self
            .processes
            .iter()
            .filter(|p| p.is_running() && self.processes_to_restart.contains(p.name()))
            .map(|p| (p.compute().clone(), p.name().clone()))
            .collect();
        if !running_targets.is_empty() {
            for (compute, name) in &running_targets {
                let result = {
                    let Some(umbilical) = self.umbilicals.get_mut(compute) else {
                        continue;
                    };
                    let Some(p) = self.processes.iter().find(|p| p.name() == name) else {
                        continue;
                    };
                    p.stop(umbilical.client_mut())
                };
                if let Err(err) = result {
                    warn!(subsystem = %self.name, process = %name, error = %err, "stop request failed");
                }
            }
            let budget = self.shutdown_budget();
            self.run_in_state(Self::restarting_processes_stop_handler, Some(budget))?;
            if self.oper_state != OperState::RestartingProcesses {
                return Ok(());
            }
        }

        // Stage 2: per-process backoff; coalesced restarts wait for the
        // slowest member.
        let delay = {
            let targets = self.processes_to_restart.clone();
            targets
                .iter()
                .filter_map(|name| {
                    self.find_process_mut(name).map(|p| p.inc_restart_delay())
                })
                .max()
        };
        if let Some(delay) = delay {
            debug!(subsystem = %self.name, delay = ?delay, "process restart backoff");
            self.run_in_state(Self::restarting_processes_wait_handler, Some(delay))?;
            if self.oper_state != OperState::RestartingProcesses {
                return Ok(());
            }
        }

        // Stage 3: make sure the targets' umbilicals are up again, then
        // relaunch. Everything else stays untouched.
        match self.connect_umbilicals() {
            Ok(true) => {}
            Ok(false) => {
                self.connect_attempts += 1;
                if self.connect_attempts > self.max_restarts {
                    self.raise_alarm(Alarm::raised(
                        AlarmSubject::Subsystem(self.name.clone()),
                        AlarmSeverity::Error,
                        AlarmReason::ConnectionFailed,
                        "giving up reconnecting to launch agents",
                    ));
                    self.enter_state(OperState::Broken, self.state_client);
                }
                // Otherwise leave the state untouched; the driver re-enters
                // and the backoff stage widens the wait.
                return Ok(());
            }
            Err(err) => {
                self.configuration_failure(&err.to_string());
                return Ok(());
            }
        }
        for name in self.processes_to_restart.clone() {
            if let Some(p) = self.find_process_mut(&name) {
                p.clear_exit();
            }
        }
        if let Err(err) = self.launch_pending_processes() {
            return self.handle_launch_failure(err);
        }

        // Stage 4: wait for the relaunched processes to report started.
        if self.all_processes_running() && self.all_umbilicals_connected() {
            self.processes_to_restart.clear();
            self.enter_state(OperState::Online, self.state_client);
            return Ok(());
        }
        let budget = self.startup_budget();
        self.run_in_state(Self::restarting_processes_start_handler, Some(budget))
    }

    fn restarting_processes_stop_handler(
        &mut self,
        source: EventSource,
    ) -> Result<StateTransition, SubsystemError> {
        match source {
            EventSource::Launcher(compute, event) => match event {
                LauncherEvent::ProcessStopped {
                    process_id,
                    exited,
                    status_or_signal,
                } => {
                    let name = self.process_name_for_id(&process_id);
                    match name {
                        Some(name) if self.processes_to_restart.contains(&name) => {
                            self.on_process_stopped_while_stopping(
                                &process_id,
                                exited,
                                status_or_signal,
                            );
                            if self.restart_targets_all_stopped() {
                                Ok(StateTransition::Leave)
                            } else {
                                Ok(StateTransition::Stay)
                            }
                        }
                        _ => self.restart_if_possible_after_process_crash(
                            &process_id,
                            exited,
                            status_or_signal,
                        ),
                    }
                }
                LauncherEvent::Disconnected { reason } => {
                    self.handle_umbilical_loss(&compute, &reason)
                }
                LauncherEvent::ProcessStarted { process_id, pid } => {
                    self.on_process_started(&process_id, pid)?;
                    Ok(StateTransition::Stay)
                }
                other => self.absorb_launcher_event(other),
            },
            EventSource::Message(message) => {
                self.restarting_processes_common_message(message)
            }
            EventSource::Timeout => {
                for name in self.processes_to_restart.clone() {
                    if let Some(p) = self.find_process_mut(&name) {
                        p.set_stopped();
                        p.clear_process_id();
                    }
                }
                Ok(StateTransition::Leave)
            }
            EventSource::Interrupt => {
                if self.restart_targets_all_stopped() {
                    Ok(StateTransition::Leave)
                } else {
                    Ok(StateTransition::Stay)
                }
            }
        }
    }

    fn restarting_processes_wait_handler(
        &mut self,
        source: EventSource,
    ) -> Result<StateTransition, SubsystemError> {
        match source {
            // Backoff elapsed.
            EventSource::Timeout => Ok(StateTransition::Leave),
            EventSource::Message(message) => {
                self.restarting_processes_common_message(message)
            }
            EventSource::Launcher(compute, event) => match event {
                LauncherEvent::ProcessStopped {
                    process_id,
                    exited,
                    status_or_signal,
                } => self.restart_if_possible_after_process_crash(
                    &process_id,
                    exited,
                    status_or_signal,
                ),
                LauncherEvent::Disconnected { reason } => {
                    self.handle_umbilical_loss(&compute, &reason)
                }
                LauncherEvent::ProcessStarted { process_id, pid } => {
                    self.on_process_started(&process_id, pid)?;
                    Ok(StateTransition::Stay)
                }
                other => self.absorb_launcher_event(other),
            },
            EventSource::Interrupt => Ok(StateTransition::Stay),
        }
    }

    fn restarting_processes_start_handler(
        &mut self,
        source: EventSource,
    ) -> Result<StateTransition, SubsystemError> {
        match source {
            EventSource::Launcher(compute, event) => match event {
                LauncherEvent::ProcessStarted { process_id, pid } => {
                    self.on_process_started(&process_id, pid)?;
                    if self.all_processes_running() && self.all_umbilicals_connected() {
                        self.processes_to_restart.clear();
                        self.enter_state(OperState::Online, self.state_client);
                        Ok(StateTransition::Leave)
                    } else {
                        Ok(StateTransition::Stay)
                    }
                }
                LauncherEvent::ProcessStopped {
                    process_id,
                    exited,
                    status_or_signal,
                } => self.restart_if_possible_after_process_crash(
                    &process_id,
                    exited,
                    status_or_signal,
                ),
                LauncherEvent::Disconnected { reason } => {
                    self.handle_umbilical_loss(&compute, &reason)
                }
                other => self.absorb_launcher_event(other),
            },
            EventSource::Message(message) => {
                self.restarting_processes_common_message(message)
            }
            EventSource::Timeout => self.start_timeout_recovery(),
            EventSource::Interrupt => {
                if self.all_processes_running() && self.all_umbilicals_connected() {
                    self.processes_to_restart.clear();
                    self.enter_state(OperState::Online, self.state_client);
                    Ok(StateTransition::Leave)
                } else {
                    Ok(StateTransition::Stay)
                }
            }
        }
    }

    fn restarting_processes_common_message(
        &mut self,
        message: Message,
    ) -> Result<StateTransition, SubsystemError> {
        match message {
            Message::ChangeAdmin {
                admin,
                client_id,
                interactive,
            } => self.handle_change_admin(
                admin,
                client_id,
                interactive,
                OperState::StoppingProcesses,
                OperState::RestartingProcesses,
            ),
            Message::Abort {
                emergency,
                client_id,
            } => self.handle_abort(emergency, client_id),
            Message::RestartProcesses { processes, .. } => {
                for name in processes {
                    if !self.processes_to_restart.contains(&name) {
                        self.processes_to_restart.push(name);
                    }
                }
                Ok(StateTransition::Stay)
            }
            Message::ReportOper { sender, oper, .. } if oper == OperState::Broken => {
                self.child_broken(&sender)
            }
            Message::SendTelemetryCommand { command } => {
                self.fan_out_telemetry(&command);
                Ok(StateTransition::Stay)
            }
            _ => Ok(StateTransition::Stay),
        }
    }

    fn restart_targets_all_stopped(&self) -> bool {
        self.processes_to_restart
            .iter()
            .all(|name| self.find_process(name).map_or(true, |p| !p.is_running()))
    }

    // ---- Broken ----

    fn broken(&mut self) -> Result<(), SubsystemError> {
        warn!(subsystem = %self.name, "subsystem broken");
        if self.critical {
            self.emit_emergency_abort();
        }
        self.stop_running_processes();
        for p in &mut self.processes {
            p.set_stopped();
            p.clear_process_id();
        }
        self.process_ids_clear();
        self.release_umbilicals();
        self.refresh_status();
        self.run_in_state(Self::broken_handler, None)
    }

    fn broken_handler(&mut self, source: EventSource) -> Result<StateTransition, SubsystemError> {
        match source {
            EventSource::Message(message) => match message {
                Message::Restart { client_id } => {
                    info!(subsystem = %self.name, "explicit restart out of broken");
                    self.reset_restart_state();
                    self.reset_process_restarts();
                    self.clear_alarm();
                    let cleared: Vec<Alarm> = self
                        .processes
                        .iter_mut()
                        .filter_map(|p| p.clear_alarm())
                        .collect();
                    for alarm in cleared {
                        self.bus.emit_alarm(alarm);
                    }
                    self.reset_process_runtime();
                    self.emergency_abort_sent = false;
                    self.enter_state(OperState::Offline, client_id);
                    Ok(StateTransition::Leave)
                }
                Message::ChangeAdmin {
                    admin, client_id, ..
                } => {
                    // Absorbing: posture is tracked for the eventual
                    // restart, nothing else moves.
                    let _ = self.handle_admin_command(
                        admin,
                        client_id,
                        OperState::Broken,
                        OperState::Broken,
                    );
                    self.refresh_status();
                    self.notify_parents();
                    Ok(StateTransition::Stay)
                }
                _ => Ok(StateTransition::Stay),
            },
            _ => Ok(StateTransition::Stay),
        }
    }
}
