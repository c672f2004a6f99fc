use std::time::{Duration, Instant};

use crossbeam::channel::Select;

use crate::launcher::event::LauncherEvent;
use crate::launcher::LauncherConnector;
use crate::names::ComputeId;
use crate::subsystem::error::SubsystemError;
use crate::subsystem::message::Message;
use crate::subsystem::Subsystem;

/// What a state handler tells the driver after one wake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StateTransition {
    Stay,
    Leave,
}

/// The source a wake came from, with its payload.
#[derive(Debug)]
pub(crate) enum EventSource {
    /// One message read from the pipe.
    Message(Message),
    /// An event from the umbilical of the given compute.
    Launcher(ComputeId, LauncherEvent),
    /// The wakeup trigger fired; re-evaluate without a payload.
    Interrupt,
    /// The state timeout elapsed.
    Timeout,
}

pub(crate) type StateHandler<C> =
    fn(&mut Subsystem<C>, EventSource) -> Result<StateTransition, SubsystemError>;

impl<C: LauncherConnector> Subsystem<C> {
    /// Blocks the driver inside one state: multiplexes the message pipe,
    /// every held umbilical and the interrupt trigger, delivering exactly
    /// one [`EventSource`] per wake to `handler` until it returns
    /// [`StateTransition::Leave`]. `timeout` of `None` waits forever.
    pub(crate) fn run_in_state(
        &mut self,
        handler: StateHandler<C>,
        timeout: Option<Duration>,
    ) -> Result<(), SubsystemError> {
        let mut deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let source = self.next_event(deadline)?;
            let timed_out = matches!(source, EventSource::Timeout);
            match handler(self, source)? {
                StateTransition::Leave => return Ok(()),
                StateTransition::Stay if timed_out => {
                    // The handler rode out its own timeout; restart the
                    // window instead of spinning on an expired deadline.
                    deadline = timeout.map(|t| Instant::now() + t);
                }
                StateTransition::Stay => {}
            }
        }
    }

    fn next_event(&self, deadline: Option<Instant>) -> Result<EventSource, SubsystemError> {
        let mut sel = Select::new();
        let pipe_index = sel.recv(self.pipe.as_ref());
        let interrupt_index = sel.recv(self.interrupt.as_ref());

        let mut umbilical_indices: Vec<(usize, ComputeId)> =
            Vec::with_capacity(self.umbilicals.len());
        for (compute, umbilical) in &self.umbilicals {
            let index = sel.recv(umbilical.events().as_ref());
            umbilical_indices.push((index, compute.clone()));
        }

        let operation = match deadline {
            Some(deadline) => match sel.select_deadline(deadline) {
                Ok(operation) => operation,
                Err(_) => return Ok(EventSource::Timeout),
            },
            None => sel.select(),
        };

        let index = operation.index();
        if index == pipe_index {
            return operation
                .recv(self.pipe.as_ref())
                .map(EventSource::Message)
                .map_err(|_| SubsystemError::PipeClosed);
        }
        if index == interrupt_index {
            // A dead interrupt trigger means every handle is gone as well.
            return operation
                .recv(self.interrupt.as_ref())
                .map(|()| EventSource::Interrupt)
                .map_err(|_| SubsystemError::PipeClosed);
        }

        let (_, compute) = umbilical_indices
            .iter()
            .find(|(i, _)| *i == index)
            .expect("selected index belongs to a registered umbilical");
        let event = operation
            .recv(self.umbilicals[compute].events().as_ref())
            .unwrap_or_else(|_| LauncherEvent::Disconnected {
                reason: "event stream closed".to_string(),
            });
        Ok(EventSource::Launcher(compute.clone(), event))
    }
}
