use crossbeam::channel::Receiver;

use crate::alarm::Alarm;
use crate::event::broadcaster::UnboundedBroadcast;
use crate::names::{ProcessId, SubsystemName};

/// Process-wide events that are not alarms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    /// A critical subsystem broke; the whole platform should come down.
    EmergencyAbort { subsystem: SubsystemName },
    TelemetryStatus {
        subsystem: SubsystemName,
        process_id: ProcessId,
        payload: String,
    },
    ParameterUpdate {
        subsystem: SubsystemName,
        name: String,
        value: String,
    },
}

/// Narrow process-wide surface handed to every subsystem at construction:
/// the alarm sink and the global event bus.
///
/// Cloning shares the underlying broadcast channels.
#[derive(Debug, Clone, Default)]
pub struct PlatformBus {
    alarms: UnboundedBroadcast<Alarm>,
    events: UnboundedBroadcast<PlatformEvent>,
}

impl PlatformBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe_alarms(&self) -> Receiver<Alarm> {
        self.alarms.subscribe()
    }

    pub fn subscribe_events(&self) -> Receiver<PlatformEvent> {
        self.events.subscribe()
    }

    /// Appends an alarm record to the sink.
    pub fn emit_alarm(&self, alarm: Alarm) {
        self.alarms.broadcast(alarm);
    }

    pub fn emit(&self, event: PlatformEvent) {
        self.events.broadcast(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::{AlarmReason, AlarmSeverity, AlarmSubject};

    #[test]
    fn alarms_and_events_reach_their_subscribers() {
        let bus = PlatformBus::new();
        let alarms = bus.subscribe_alarms();
        let events = bus.subscribe_events();

        bus.emit_alarm(Alarm::raised(
            AlarmSubject::Subsystem("nav".into()),
            AlarmSeverity::Error,
            AlarmReason::ProcessCrashed,
            "imu-driver crashed",
        ));
        bus.emit(PlatformEvent::EmergencyAbort {
            subsystem: "nav".into(),
        });

        assert_eq!(alarms.recv().unwrap().reason, AlarmReason::ProcessCrashed);
        assert_eq!(
            events.recv().unwrap(),
            PlatformEvent::EmergencyAbort {
                subsystem: "nav".into()
            }
        );
    }
}
