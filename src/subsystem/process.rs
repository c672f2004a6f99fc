use std::time::Duration;

use tracing::debug;

use crate::alarm::Alarm;
use crate::descriptor::{ProcessDescriptor, ProcessKind, StreamSpec, Terminal};
use crate::launcher::{LaunchMode, LaunchSpec, LauncherClient, LauncherError};
use crate::names::{ComputeId, ProcessId, ProcessName, SubsystemName};
use std::collections::HashMap;

/// Backoff delays double up to this cap.
pub const MAX_RESTART_DELAY: Duration = Duration::from_secs(32);

/// One process owned by a subsystem: immutable descriptor plus the runtime
/// state the supervisor tracks for it.
#[derive(Debug)]
pub struct Process {
    descriptor: ProcessDescriptor,
    max_restarts: u32,
    initial_restart_delay: Duration,

    running: bool,
    /// Contributing to the umbilical refcount of this process's compute.
    /// Not necessarily connected yet.
    maybe_connected: bool,
    process_id: Option<ProcessId>,
    pid: Option<i32>,
    exited: bool,
    exit_status: i32,
    num_restarts: u32,
    restart_delay: Duration,
    alarm: Option<Alarm>,
    alarm_count: u32,
}

impl Process {
    /// `subsystem_max_restarts` applies when the descriptor has no budget of
    /// its own.
    pub fn new(
        descriptor: ProcessDescriptor,
        subsystem_max_restarts: u32,
        initial_restart_delay: Duration,
    ) -> Self {
        let max_restarts = descriptor.max_restarts.unwrap_or(subsystem_max_restarts);
        Self {
            descriptor,
            max_restarts,
            initial_restart_delay,
            running: false,
            maybe_connected: false,
            process_id: None,
            pid: None,
            exited: false,
            exit_status: 0,
            num_restarts: 0,
            restart_delay: initial_restart_delay,
            alarm: None,
            alarm_count: 0,
        }
    }

    pub fn name(&self) -> &ProcessName {
        &self.descriptor.name
    }

    pub fn compute(&self) -> &ComputeId {
        &self.descriptor.compute
    }

    pub fn is_on_compute(&self, compute: &ComputeId) -> bool {
        &self.descriptor.compute == compute
    }

    pub fn kind(&self) -> &ProcessKind {
        &self.descriptor.kind
    }

    pub fn is_zygote(&self) -> bool {
        self.descriptor.kind.is_zygote()
    }

    pub fn is_virtual(&self) -> bool {
        self.descriptor.kind.is_virtual()
    }

    pub fn is_critical(&self) -> bool {
        self.descriptor.critical
    }

    pub fn is_oneshot(&self) -> bool {
        self.descriptor.oneshot
    }

    pub fn is_interactive(&self) -> bool {
        self.descriptor.interactive
    }

    pub fn is_telemetry(&self) -> bool {
        self.descriptor.telemetry
    }

    pub fn startup_timeout(&self) -> Duration {
        self.descriptor.startup_timeout
    }

    pub fn shutdown_budget(&self) -> Duration {
        self.descriptor.sigint_shutdown_timeout + self.descriptor.sigterm_shutdown_timeout
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn set_running(&mut self) {
        self.running = true;
    }

    pub fn set_stopped(&mut self) {
        self.running = false;
    }

    /// A oneshot process that ran to completion with status 0 counts as
    /// running for the subsystem's all-running check.
    pub fn counts_as_running(&self) -> bool {
        self.running || (self.is_oneshot() && self.exited && self.exit_status == 0)
    }

    /// Launched and awaiting the agent's start acknowledgement.
    pub fn is_launch_pending(&self) -> bool {
        self.process_id.is_some() && !self.running
    }

    pub fn maybe_connected(&self) -> bool {
        self.maybe_connected
    }

    pub fn set_maybe_connected(&mut self, connected: bool) {
        self.maybe_connected = connected;
    }

    pub fn process_id(&self) -> Option<&ProcessId> {
        self.process_id.as_ref()
    }

    pub fn set_process_id(&mut self, id: ProcessId) {
        self.process_id = Some(id);
    }

    pub fn clear_process_id(&mut self) {
        self.process_id = None;
    }

    pub fn pid(&self) -> Option<i32> {
        self.pid
    }

    pub fn set_pid(&mut self, pid: i32) {
        self.pid = Some(pid);
    }

    pub fn exited(&self) -> bool {
        self.exited
    }

    pub fn exit_status(&self) -> i32 {
        self.exit_status
    }

    pub fn set_exit(&mut self, exited: bool, status: i32) {
        self.exited = exited;
        self.exit_status = status;
    }

    pub fn clear_exit(&mut self) {
        self.exited = false;
        self.exit_status = 0;
    }

    pub fn num_restarts(&self) -> u32 {
        self.num_restarts
    }

    pub fn max_restarts(&self) -> u32 {
        self.max_restarts
    }

    pub fn inc_num_restarts(&mut self) {
        self.num_restarts += 1;
    }

    pub fn reset_num_restarts(&mut self) {
        self.num_restarts = 0;
    }

    /// Doubles the backoff delay up to [`MAX_RESTART_DELAY`] and returns the
    /// pre-increment value, which is what the caller actually sleeps.
    pub fn inc_restart_delay(&mut self) -> Duration {
        let old_delay = self.restart_delay;
        self.restart_delay = (self.restart_delay * 2).min(MAX_RESTART_DELAY);
        old_delay
    }

    pub fn reset_restart_delay(&mut self) {
        self.restart_delay = self.initial_restart_delay;
    }

    pub fn alarm(&self) -> Option<&Alarm> {
        self.alarm.as_ref()
    }

    pub fn alarm_count(&self) -> u32 {
        self.alarm_count
    }

    pub fn raise_alarm(&mut self, alarm: Alarm) {
        // Replaces any prior unacknowledged alarm on this process.
        self.alarm = Some(alarm);
        self.alarm_count += 1;
    }

    pub fn clear_alarm(&mut self) -> Option<Alarm> {
        self.alarm.take().map(|a| a.cleared())
    }

    pub fn reset_alarm_count(&mut self) {
        self.alarm_count = 0;
    }

    /// Builds the launch request for this process. `zygote` is the running
    /// zygote's agent handle, required for a `Virtual` process and resolved
    /// by the owning subsystem.
    pub fn launch_spec(
        &self,
        subsystem: &SubsystemName,
        subsystem_vars: &HashMap<String, String>,
        subsystem_streams: &[StreamSpec],
        terminal: Option<&Terminal>,
        zygote: Option<&ProcessId>,
    ) -> Result<LaunchSpec, LauncherError> {
        let mode = match &self.descriptor.kind {
            ProcessKind::Static { executable } => LaunchMode::Static {
                executable: executable.clone(),
            },
            ProcessKind::Zygote { executable } => LaunchMode::Zygote {
                executable: executable.clone(),
            },
            ProcessKind::Virtual {
                zygote: zygote_name,
                module,
                entry,
            } => {
                let zygote = zygote
                    .ok_or_else(|| LauncherError::ZygoteNotFound(zygote_name.clone()))?
                    .clone();
                LaunchMode::Virtual {
                    zygote,
                    module: module.clone(),
                    entry: entry.clone(),
                }
            }
        };

        // Process env wins over subsystem vars on key collisions.
        let mut env = subsystem_vars.clone();
        env.extend(self.descriptor.env.clone());

        let mut streams = subsystem_streams.to_vec();
        streams.extend(self.descriptor.streams.iter().cloned());

        Ok(LaunchSpec {
            subsystem: subsystem.clone(),
            name: self.descriptor.name.clone(),
            mode,
            args: self.descriptor.args.clone(),
            env,
            streams,
            user: self.descriptor.user.clone(),
            group: self.descriptor.group.clone(),
            cgroup: self.descriptor.cgroup.clone(),
            notify: self.descriptor.notify,
            interactive: self.descriptor.interactive,
            telemetry: self.descriptor.telemetry,
            terminal: terminal.cloned(),
            startup_timeout: self.descriptor.startup_timeout,
            sigint_shutdown_timeout: self.descriptor.sigint_shutdown_timeout,
            sigterm_shutdown_timeout: self.descriptor.sigterm_shutdown_timeout,
        })
    }

    /// Asks the launch agent to stop this process; the agent runs the
    /// graceful SIGINT/SIGTERM/SIGKILL escalation with the descriptor's two
    /// shutdown timeouts.
    pub fn stop<C: LauncherClient + ?Sized>(&self, client: &mut C) -> Result<(), LauncherError> {
        let Some(id) = &self.process_id else {
            debug!(process = %self.name(), "stop requested for a process that never launched");
            return Ok(());
        };
        client.stop(id)
    }

    pub fn send_input<C: LauncherClient + ?Sized>(
        &self,
        client: &mut C,
        fd: i32,
        data: &[u8],
    ) -> Result<(), LauncherError> {
        let id = self.launched_id()?;
        client.send_input(id, fd, data)
    }

    pub fn close_fd<C: LauncherClient + ?Sized>(
        &self,
        client: &mut C,
        fd: i32,
    ) -> Result<(), LauncherError> {
        let id = self.launched_id()?;
        client.close_fd(id, fd)
    }

    /// Delivered only if the process was declared `telemetry`.
    pub fn send_telemetry_command<C: LauncherClient + ?Sized>(
        &self,
        client: &mut C,
        command: &crate::launcher::event::TelemetryCommand,
    ) -> Result<(), LauncherError> {
        if !self.descriptor.telemetry {
            return Ok(());
        }
        let id = self.launched_id()?;
        client.send_telemetry_command(id, command)
    }

    fn launched_id(&self) -> Result<&ProcessId, LauncherError> {
        self.process_id.as_ref().ok_or_else(|| {
            LauncherError::RequestFailed(format!("process `{}` is not launched", self.name()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::tests::MockLauncherClient;

    fn descriptor(name: &str) -> ProcessDescriptor {
        serde_yaml::from_str(&format!(
            r#"
name: {name}
compute: c1
type: static
executable: /bin/{name}
"#
        ))
        .unwrap()
    }

    fn oneshot_descriptor(name: &str) -> ProcessDescriptor {
        serde_yaml::from_str(&format!(
            r#"
name: {name}
compute: c1
type: static
executable: /bin/{name}
oneshot: true
"#
        ))
        .unwrap()
    }

    #[test]
    fn restart_delay_doubles_and_caps() {
        let mut process = Process::new(descriptor("p1"), 3, Duration::from_secs(1));

        let observed: Vec<u64> = (0..7).map(|_| process.inc_restart_delay().as_secs()).collect();
        assert_eq!(observed, vec![1, 2, 4, 8, 16, 32, 32]);

        process.reset_restart_delay();
        assert_eq!(process.inc_restart_delay(), Duration::from_secs(1));
    }

    #[test]
    fn oneshot_success_counts_as_running() {
        let mut process = Process::new(oneshot_descriptor("init"), 3, Duration::from_secs(1));
        assert!(!process.counts_as_running());

        process.set_exit(true, 0);
        assert!(!process.is_running());
        assert!(process.counts_as_running());

        process.set_exit(true, 1);
        assert!(!process.counts_as_running());
    }

    #[test]
    fn descriptor_budget_overrides_subsystem_budget() {
        let mut d = descriptor("p1");
        d.max_restarts = Some(7);
        assert_eq!(Process::new(d, 3, Duration::from_secs(1)).max_restarts(), 7);
        assert_eq!(
            Process::new(descriptor("p2"), 3, Duration::from_secs(1)).max_restarts(),
            3
        );
    }

    #[test]
    fn telemetry_command_is_gated_on_the_flag() {
        let mut client = MockLauncherClient::new();
        client.expect_send_telemetry_command().never();

        let mut process = Process::new(descriptor("p1"), 3, Duration::from_secs(1));
        process.set_process_id("p1-id".into());

        let command = crate::launcher::event::TelemetryCommand::new("flush");
        process.send_telemetry_command(&mut client, &command).unwrap();
    }

    #[test]
    fn virtual_launch_spec_requires_a_zygote_handle() {
        let d: ProcessDescriptor = serde_yaml::from_str(
            r#"
name: worker
compute: c1
type: virtual
zygote: spawner
module: /lib/worker.so
entry: worker_main
"#,
        )
        .unwrap();
        let process = Process::new(d, 3, Duration::from_secs(1));

        let err = process
            .launch_spec(&"nav".into(), &HashMap::new(), &[], None, None)
            .unwrap_err();
        assert_eq!(err, LauncherError::ZygoteNotFound("spawner".into()));

        let zygote_id: ProcessId = "spawner-id".into();
        let spec = process
            .launch_spec(&"nav".into(), &HashMap::new(), &[], None, Some(&zygote_id))
            .unwrap();
        assert_eq!(
            spec.mode,
            LaunchMode::Virtual {
                zygote: zygote_id,
                module: "/lib/worker.so".to_string(),
                entry: "worker_main".to_string(),
            }
        );
    }

    #[test]
    fn raise_alarm_replaces_and_counts() {
        use crate::alarm::{Alarm, AlarmReason, AlarmSeverity, AlarmSubject};

        let mut process = Process::new(descriptor("p1"), 3, Duration::from_secs(1));
        let subject = AlarmSubject::Process {
            subsystem: "nav".into(),
            process: "p1".into(),
        };

        process.raise_alarm(Alarm::raised(
            subject.clone(),
            AlarmSeverity::Warning,
            AlarmReason::ProcessCrashed,
            "first",
        ));
        process.raise_alarm(Alarm::raised(
            subject,
            AlarmSeverity::Error,
            AlarmReason::ProcessCrashed,
            "second",
        ));

        assert_eq!(process.alarm_count(), 2);
        assert_eq!(process.alarm().unwrap().details, "second");

        let cleared = process.clear_alarm().unwrap();
        assert_eq!(cleared.status, crate::alarm::AlarmStatus::Cleared);
        assert!(process.alarm().is_none());
    }
}
