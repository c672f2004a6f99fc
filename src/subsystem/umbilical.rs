use tracing::debug;

use crate::event::channel::EventConsumer;
use crate::launcher::event::LauncherEvent;
use crate::launcher::Connection;
use crate::names::ComputeId;

/// A subsystem's connection to the launch agent on one compute.
///
/// The refcount mirrors how many of the subsystem's processes on that
/// compute are `maybe_connected`; the owning subsystem drops the umbilical
/// when it falls to zero. Umbilicals are never shared across subsystems:
/// each subsystem reads its own event stream inside its own state machine.
pub struct Umbilical<C> {
    compute: ComputeId,
    client: C,
    events: EventConsumer<LauncherEvent>,
    refs: usize,
    connected: bool,
}

impl<C> Umbilical<C> {
    pub fn new(compute: ComputeId, connection: Connection<C>) -> Self {
        Self {
            compute,
            client: connection.client,
            events: connection.events,
            refs: 0,
            connected: true,
        }
    }

    pub fn compute(&self) -> &ComputeId {
        &self.compute
    }

    pub fn add_reference(&mut self) {
        self.refs += 1;
        debug!(compute = %self.compute, refs = self.refs, "umbilical reference added");
    }

    /// Returns the remaining count; the owner tears the umbilical down at 0.
    pub fn remove_reference(&mut self) -> usize {
        self.refs = self.refs.saturating_sub(1);
        debug!(compute = %self.compute, refs = self.refs, "umbilical reference removed");
        self.refs
    }

    pub fn refs(&self) -> usize {
        self.refs
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn mark_disconnected(&mut self) {
        self.connected = false;
    }

    /// Replaces the underlying connection after a reconnect, keeping the
    /// refcount.
    pub fn reconnect(&mut self, connection: Connection<C>) {
        self.client = connection.client;
        self.events = connection.events;
        self.connected = true;
    }

    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }

    pub fn events(&self) -> &EventConsumer<LauncherEvent> {
        &self.events
    }
}
