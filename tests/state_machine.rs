//! End-to-end lifecycle scenarios against an in-process fake launch agent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use fleet_supervisor::alarm::AlarmReason;
use fleet_supervisor::bus::{PlatformBus, PlatformEvent};
use fleet_supervisor::event::channel::{pub_sub, EventPublisher};
use fleet_supervisor::launcher::event::{LauncherEvent, TelemetryCommand};
use fleet_supervisor::launcher::{
    Connection, LaunchMode, LaunchSpec, LauncherClient, LauncherConnector, LauncherError,
};
use fleet_supervisor::names::{ComputeId, ProcessId};
use fleet_supervisor::subsystem::message::Message;
use fleet_supervisor::subsystem::registry::SubsystemRegistry;
use fleet_supervisor::{
    AdminState, OperState, StartedSubsystem, Subsystem, SubsystemDescriptor, SubsystemHandle,
};

const WAIT: Duration = Duration::from_secs(5);

fn shutdown(started: StartedSubsystem, handle: SubsystemHandle) {
    // The driver only observes pipe closure once every handle clone is
    // gone.
    drop(handle);
    started.stop().unwrap();
}

/// Shared state of one fake launch agent.
#[derive(Default)]
struct AgentState {
    publisher: Option<EventPublisher<LauncherEvent>>,
    launches: Vec<LaunchSpec>,
    stops: Vec<ProcessId>,
    telemetry: Vec<(ProcessId, TelemetryCommand)>,
    connects: usize,
    next_pid: i32,
}

/// One fake agent per compute; connects hand out fresh event channels and
/// every request is acknowledged immediately.
#[derive(Clone, Default)]
struct FakeAgents(Arc<Mutex<HashMap<ComputeId, AgentState>>>);

impl FakeAgents {
    fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, compute: &ComputeId, f: impl FnOnce(&mut AgentState) -> R) -> R {
        let mut agents = self.0.lock().unwrap();
        f(agents.entry(compute.clone()).or_default())
    }

    /// Injects an event as if the agent on `compute` had emitted it.
    fn emit(&self, compute: &ComputeId, event: LauncherEvent) {
        self.with(compute, |agent| {
            let publisher = agent.publisher.as_ref().expect("agent connected");
            publisher.publish(event).expect("driver is listening");
        });
    }

    fn launches_of(&self, compute: &ComputeId, process: &str) -> usize {
        self.with(compute, |agent| {
            agent
                .launches
                .iter()
                .filter(|spec| spec.name.as_str() == process)
                .count()
        })
    }

    fn connects(&self, compute: &ComputeId) -> usize {
        self.with(compute, |agent| agent.connects)
    }
}

struct FakeClient {
    compute: ComputeId,
    agents: FakeAgents,
}

impl LauncherClient for FakeClient {
    fn launch(&mut self, spec: &LaunchSpec) -> Result<ProcessId, LauncherError> {
        self.agents.with(&self.compute, |agent| {
            agent.launches.push(spec.clone());
            agent.next_pid += 1;
            let id = ProcessId::from(format!("{}-{}", spec.name, agent.launches.len()));
            let publisher = agent.publisher.as_ref().expect("agent connected");
            publisher
                .publish(LauncherEvent::ProcessStarted {
                    process_id: id.clone(),
                    pid: 1000 + agent.next_pid,
                })
                .expect("driver is listening");
            Ok(id)
        })
    }

    fn stop(&mut self, process_id: &ProcessId) -> Result<(), LauncherError> {
        self.agents.with(&self.compute, |agent| {
            agent.stops.push(process_id.clone());
            if let Some(publisher) = agent.publisher.as_ref() {
                let _ = publisher.publish(LauncherEvent::ProcessStopped {
                    process_id: process_id.clone(),
                    exited: true,
                    status_or_signal: 0,
                });
            }
            Ok(())
        })
    }

    fn send_input(&mut self, _: &ProcessId, _: i32, _: &[u8]) -> Result<(), LauncherError> {
        Ok(())
    }

    fn close_fd(&mut self, _: &ProcessId, _: i32) -> Result<(), LauncherError> {
        Ok(())
    }

    fn send_telemetry_command(
        &mut self,
        process_id: &ProcessId,
        command: &TelemetryCommand,
    ) -> Result<(), LauncherError> {
        self.agents.with(&self.compute, |agent| {
            agent.telemetry.push((process_id.clone(), command.clone()));
            Ok(())
        })
    }
}

struct FakeConnector {
    agents: FakeAgents,
}

impl LauncherConnector for FakeConnector {
    type Client = FakeClient;

    fn connect(&self, compute: &ComputeId) -> Result<Connection<FakeClient>, LauncherError> {
        let (publisher, events) = pub_sub();
        self.agents.with(compute, |agent| {
            agent.publisher = Some(publisher);
            agent.connects += 1;
        });
        Ok(Connection {
            client: FakeClient {
                compute: compute.clone(),
                agents: self.agents.clone(),
            },
            events,
        })
    }
}

struct Fixture {
    agents: FakeAgents,
    registry: Arc<SubsystemRegistry>,
    bus: PlatformBus,
}

impl Fixture {
    fn new() -> Self {
        Self {
            agents: FakeAgents::new(),
            registry: Arc::new(SubsystemRegistry::new()),
            bus: PlatformBus::new(),
        }
    }

    fn spawn(&self, yaml: &str) -> (StartedSubsystem, SubsystemHandle) {
        let descriptor: SubsystemDescriptor = serde_yaml::from_str(yaml).unwrap();
        let subsystem = Subsystem::new(
            descriptor,
            FakeConnector {
                agents: self.agents.clone(),
            },
            Arc::clone(&self.registry),
            self.bus.clone(),
        );
        let handle = subsystem.handle();
        self.registry.register(handle.clone()).unwrap();
        (subsystem.start(), handle)
    }
}

fn wait_for_oper(handle: &SubsystemHandle, expected: OperState) {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if handle.status().oper_state == expected {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!(
        "subsystem `{}` never reached {expected:?}, stuck in {:?}",
        handle.name(),
        handle.status().oper_state
    );
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("timed out waiting for {what}");
}

fn online(handle: &SubsystemHandle, client_id: u32) {
    handle
        .send(Message::change_admin(AdminState::Online, client_id))
        .unwrap();
}

fn offline(handle: &SubsystemHandle, client_id: u32) {
    handle
        .send(Message::change_admin(AdminState::Offline, client_id))
        .unwrap();
}

fn current_id(handle: &SubsystemHandle, process: &str) -> ProcessId {
    handle
        .status()
        .process(&process.into())
        .unwrap()
        .process_id
        .clone()
        .expect("process launched")
}

const ONE_PROCESS: &str = r#"
name: nav
max_restarts: 3
restart_policy: automatic
initial_restart_delay: 20ms
processes:
  - name: p1
    compute: c1
    type: static
    executable: /opt/fleet/bin/p1
"#;

#[test]
fn happy_start_reaches_online() {
    let fixture = Fixture::new();
    let (started, handle) = fixture.spawn(ONE_PROCESS);

    online(&handle, 1);
    wait_for_oper(&handle, OperState::Online);

    let status = handle.status();
    assert_eq!(status.admin_state, AdminState::Online);
    assert_eq!(status.num_restarts, 0);
    let p1 = status.process(&"p1".into()).unwrap();
    assert!(p1.running);
    assert_eq!(p1.num_restarts, 0);
    assert!(p1.pid.is_some());
    assert_eq!(status.umbilicals.len(), 1);
    assert_eq!(status.umbilicals[0].refs, 1);
    assert!(status.umbilicals[0].connected);

    shutdown(started, handle);
}

#[test]
fn single_crash_restarts_the_subsystem() {
    let fixture = Fixture::new();
    let (started, handle) = fixture.spawn(ONE_PROCESS);

    online(&handle, 1);
    wait_for_oper(&handle, OperState::Online);
    let id = current_id(&handle, "p1");

    fixture.agents.emit(
        &"c1".into(),
        LauncherEvent::ProcessStopped {
            process_id: id,
            exited: false,
            status_or_signal: 11,
        },
    );

    wait_until("subsystem to restart and come back online", || {
        let status = handle.status();
        status.oper_state == OperState::Online && status.num_restarts == 1
    });
    assert_eq!(fixture.agents.launches_of(&"c1".into(), "p1"), 2);

    shutdown(started, handle);
}

#[test]
fn restart_cap_breaks_and_critical_emits_emergency_abort() {
    let fixture = Fixture::new();
    let events = fixture.bus.subscribe_events();
    let alarms = fixture.bus.subscribe_alarms();
    let (started, handle) = fixture.spawn(
        r#"
name: nav
max_restarts: 2
critical: true
restart_policy: automatic
initial_restart_delay: 20ms
processes:
  - name: p1
    compute: c1
    type: static
    executable: /opt/fleet/bin/p1
"#,
    );

    online(&handle, 1);
    wait_for_oper(&handle, OperState::Online);

    for expected_restarts in 1..=2u32 {
        let id = current_id(&handle, "p1");
        fixture.agents.emit(
            &"c1".into(),
            LauncherEvent::ProcessStopped {
                process_id: id,
                exited: false,
                status_or_signal: 9,
            },
        );
        wait_until("restart to complete", || {
            let status = handle.status();
            status.oper_state == OperState::Online && status.num_restarts == expected_restarts
        });
    }

    // Third crash exceeds the budget.
    let id = current_id(&handle, "p1");
    fixture.agents.emit(
        &"c1".into(),
        LauncherEvent::ProcessStopped {
            process_id: id,
            exited: false,
            status_or_signal: 9,
        },
    );
    wait_for_oper(&handle, OperState::Broken);

    let raised: Vec<_> = std::iter::from_fn(|| alarms.try_recv().ok()).collect();
    assert!(raised
        .iter()
        .any(|a| a.reason == AlarmReason::RestartLimitReached));

    // Exactly one emergency abort on the bus.
    let aborts: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| matches!(e, PlatformEvent::EmergencyAbort { .. }))
        .collect();
    assert_eq!(aborts.len(), 1);

    shutdown(started, handle);
}

#[test]
fn process_only_policy_restarts_just_the_crashed_process() {
    let fixture = Fixture::new();
    let (started, handle) = fixture.spawn(
        r#"
name: nav
max_restarts: 3
restart_policy: process_only
initial_restart_delay: 20ms
processes:
  - name: p1
    compute: c1
    type: static
    executable: /opt/fleet/bin/p1
  - name: p2
    compute: c1
    type: static
    executable: /opt/fleet/bin/p2
"#,
    );

    online(&handle, 1);
    wait_for_oper(&handle, OperState::Online);
    let p1_pid = handle.status().process(&"p1".into()).unwrap().pid;
    let p2_id = current_id(&handle, "p2");

    fixture.agents.emit(
        &"c1".into(),
        LauncherEvent::ProcessStopped {
            process_id: p2_id,
            exited: false,
            status_or_signal: 6,
        },
    );

    wait_until("p2 to be restarted", || {
        let status = handle.status();
        status.oper_state == OperState::Online
            && status.process(&"p2".into()).unwrap().num_restarts == 1
    });

    let status = handle.status();
    let p1 = status.process(&"p1".into()).unwrap();
    assert!(p1.running);
    assert_eq!(p1.num_restarts, 0);
    assert_eq!(p1.pid, p1_pid);
    assert_eq!(status.num_restarts, 0);

    assert_eq!(fixture.agents.launches_of(&"c1".into(), "p1"), 1);
    assert_eq!(fixture.agents.launches_of(&"c1".into(), "p2"), 2);

    shutdown(started, handle);
}

#[test]
fn offline_waits_for_the_last_client() {
    let fixture = Fixture::new();
    let (started, handle) = fixture.spawn(ONE_PROCESS);

    online(&handle, 1);
    online(&handle, 2);
    wait_for_oper(&handle, OperState::Online);
    wait_until("both clients to be tracked", || {
        handle.status().active_clients == 2
    });

    offline(&handle, 1);
    // Still demanded by client 2.
    thread::sleep(Duration::from_millis(50));
    let status = handle.status();
    assert_eq!(status.oper_state, OperState::Online);
    assert_eq!(status.active_clients, 1);

    offline(&handle, 2);
    wait_for_oper(&handle, OperState::Offline);

    let status = handle.status();
    assert_eq!(status.admin_state, AdminState::Offline);
    assert_eq!(status.active_clients, 0);
    assert!(status.umbilicals.is_empty());
    assert!(!status.process(&"p1".into()).unwrap().running);
    // The wind-down went through a graceful agent-side stop.
    assert_eq!(fixture.agents.with(&"c1".into(), |a| a.stops.len()), 1);

    shutdown(started, handle);
}

#[test]
fn umbilical_loss_restarts_under_automatic_policy() {
    let fixture = Fixture::new();
    let (started, handle) = fixture.spawn(ONE_PROCESS);

    online(&handle, 1);
    wait_for_oper(&handle, OperState::Online);
    assert_eq!(fixture.agents.connects(&"c1".into()), 1);

    fixture.agents.emit(
        &"c1".into(),
        LauncherEvent::Disconnected {
            reason: "agent rebooted".to_string(),
        },
    );

    wait_until("reconnect and relaunch", || {
        let status = handle.status();
        status.oper_state == OperState::Online && status.num_restarts == 1
    });
    assert_eq!(fixture.agents.connects(&"c1".into()), 2);
    assert_eq!(fixture.agents.launches_of(&"c1".into(), "p1"), 2);

    shutdown(started, handle);
}

#[test]
fn umbilical_loss_under_process_only_restarts_that_computes_processes() {
    let fixture = Fixture::new();
    let (started, handle) = fixture.spawn(
        r#"
name: nav
max_restarts: 3
restart_policy: process_only
initial_restart_delay: 20ms
processes:
  - name: p1
    compute: c1
    type: static
    executable: /opt/fleet/bin/p1
  - name: p2
    compute: c2
    type: static
    executable: /opt/fleet/bin/p2
"#,
    );

    online(&handle, 1);
    wait_for_oper(&handle, OperState::Online);

    fixture.agents.emit(
        &"c1".into(),
        LauncherEvent::Disconnected {
            reason: "link flap".to_string(),
        },
    );

    wait_until("c1 processes to be restarted", || {
        let status = handle.status();
        status.oper_state == OperState::Online
            && status.process(&"p1".into()).unwrap().num_restarts == 1
    });

    let status = handle.status();
    assert_eq!(status.process(&"p2".into()).unwrap().num_restarts, 0);
    assert_eq!(fixture.agents.launches_of(&"c1".into(), "p1"), 2);
    assert_eq!(fixture.agents.launches_of(&"c2".into(), "p2"), 1);
    assert_eq!(fixture.agents.connects(&"c1".into()), 2);
    assert_eq!(fixture.agents.connects(&"c2".into()), 1);

    shutdown(started, handle);
}

#[test]
fn virtual_processes_launch_inside_their_zygote() {
    let fixture = Fixture::new();
    let (started, handle) = fixture.spawn(
        r#"
name: nav
restart_policy: automatic
initial_restart_delay: 20ms
processes:
  - name: spawner
    compute: c1
    type: zygote
    executable: /opt/fleet/bin/spawner
  - name: fusion
    compute: c1
    type: virtual
    zygote: spawner
    module: /opt/fleet/lib/fusion.so
    entry: fusion_main
"#,
    );

    online(&handle, 1);
    wait_for_oper(&handle, OperState::Online);

    // Both processes contribute to the single umbilical on c1.
    let status = handle.status();
    assert_eq!(status.umbilicals.len(), 1);
    assert_eq!(status.umbilicals[0].refs, 2);

    let zygote_id = current_id(&handle, "spawner");
    fixture.agents.with(&"c1".into(), |agent| {
        let fusion = agent
            .launches
            .iter()
            .find(|spec| spec.name.as_str() == "fusion")
            .expect("virtual process launched");
        assert_eq!(
            fusion.mode,
            LaunchMode::Virtual {
                zygote: zygote_id.clone(),
                module: "/opt/fleet/lib/fusion.so".to_string(),
                entry: "fusion_main".to_string(),
            }
        );
    });

    shutdown(started, handle);
}

#[test]
fn missing_zygote_is_a_configuration_error() {
    let fixture = Fixture::new();
    let alarms = fixture.bus.subscribe_alarms();
    let (started, handle) = fixture.spawn(
        r#"
name: nav
restart_policy: automatic
processes:
  - name: fusion
    compute: c1
    type: virtual
    zygote: no-such-zygote
    module: /opt/fleet/lib/fusion.so
    entry: fusion_main
"#,
    );

    online(&handle, 1);
    wait_for_oper(&handle, OperState::Broken);

    let raised: Vec<_> = std::iter::from_fn(|| alarms.try_recv().ok()).collect();
    assert!(raised
        .iter()
        .any(|a| a.reason == AlarmReason::ConfigurationError));

    shutdown(started, handle);
}

#[test]
fn parent_drives_child_through_the_dependency_edge() {
    let fixture = Fixture::new();
    let (child_started, child_handle) = fixture.spawn(
        r#"
name: sensors
restart_policy: automatic
initial_restart_delay: 20ms
processes:
  - name: imu
    compute: c1
    type: static
    executable: /opt/fleet/bin/imu
"#,
    );
    let (parent_started, parent_handle) = fixture.spawn(
        r#"
name: nav
restart_policy: automatic
initial_restart_delay: 20ms
processes:
  - name: planner
    compute: c1
    type: static
    executable: /opt/fleet/bin/planner
"#,
    );
    fixture
        .registry
        .link(&"nav".into(), &"sensors".into())
        .unwrap();

    online(&parent_handle, 1);
    wait_for_oper(&parent_handle, OperState::Online);
    // The child was driven online first.
    assert_eq!(child_handle.status().oper_state, OperState::Online);

    offline(&parent_handle, 1);
    wait_for_oper(&parent_handle, OperState::Offline);
    wait_for_oper(&child_handle, OperState::Offline);

    shutdown(parent_started, parent_handle);
    shutdown(child_started, child_handle);
}

#[test]
fn telemetry_commands_fan_out_to_declared_processes_and_children() {
    let fixture = Fixture::new();
    let (child_started, child_handle) = fixture.spawn(
        r#"
name: sensors
restart_policy: automatic
initial_restart_delay: 20ms
processes:
  - name: imu
    compute: c2
    type: static
    executable: /opt/fleet/bin/imu
    telemetry: true
"#,
    );
    let (parent_started, parent_handle) = fixture.spawn(
        r#"
name: nav
restart_policy: automatic
initial_restart_delay: 20ms
processes:
  - name: planner
    compute: c1
    type: static
    executable: /opt/fleet/bin/planner
    telemetry: true
  - name: logger
    compute: c1
    type: static
    executable: /opt/fleet/bin/logger
"#,
    );
    fixture
        .registry
        .link(&"nav".into(), &"sensors".into())
        .unwrap();

    online(&parent_handle, 1);
    wait_for_oper(&parent_handle, OperState::Online);
    wait_for_oper(&child_handle, OperState::Online);

    parent_handle
        .send(Message::SendTelemetryCommand {
            command: TelemetryCommand::new("flush"),
        })
        .unwrap();

    // Reaches the declared process locally and the child's declared process
    // through the graph; the non-telemetry process sees nothing.
    wait_until("telemetry to fan out", || {
        let parent_sent = fixture
            .agents
            .with(&"c1".into(), |agent| agent.telemetry.len());
        let child_sent = fixture
            .agents
            .with(&"c2".into(), |agent| agent.telemetry.len());
        parent_sent == 1 && child_sent == 1
    });
    let planner_id = current_id(&parent_handle, "planner");
    fixture.agents.with(&"c1".into(), |agent| {
        assert_eq!(agent.telemetry[0].0, planner_id);
        assert_eq!(agent.telemetry[0].1.command, "flush");
    });

    shutdown(parent_started, parent_handle);
    shutdown(child_started, child_handle);
}

#[test]
fn explicit_restart_reenters_from_broken() {
    let fixture = Fixture::new();
    let (started, handle) = fixture.spawn(
        r#"
name: nav
max_restarts: 0
restart_policy: automatic
initial_restart_delay: 20ms
processes:
  - name: p1
    compute: c1
    type: static
    executable: /opt/fleet/bin/p1
"#,
    );

    online(&handle, 1);
    wait_for_oper(&handle, OperState::Online);

    // Budget of zero: the first crash breaks the subsystem.
    let id = current_id(&handle, "p1");
    fixture.agents.emit(
        &"c1".into(),
        LauncherEvent::ProcessStopped {
            process_id: id,
            exited: false,
            status_or_signal: 11,
        },
    );
    wait_for_oper(&handle, OperState::Broken);

    // Clients still demand online, so the explicit restart goes all the way
    // back up.
    handle.send(Message::Restart { client_id: 1 }).unwrap();
    wait_for_oper(&handle, OperState::Online);
    assert_eq!(handle.status().num_restarts, 0);

    shutdown(started, handle);
}
