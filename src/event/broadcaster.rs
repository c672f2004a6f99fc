use crossbeam::channel::{unbounded, Receiver, Sender};
use std::sync::{Arc, Mutex};

/// A simple, unbounded broadcast channel for low-throughput use cases.
///
/// Every subscriber gets its own channel, so all subscribers see all
/// messages. The platform bus uses this for alarms, emergency aborts and
/// telemetry, where there are few subscribers and few messages.
///
/// # Notes
/// - Not optimized for high-throughput scenarios.
/// - Broadcasters aren't notified when a subscriber disconnects.
#[derive(Debug)]
pub struct UnboundedBroadcast<T> {
    subscribed_senders: Arc<Mutex<Vec<Sender<T>>>>,
}

// Manual impls: the derived ones would demand `T: Clone`/`T: Default` even
// though only the shared sender list is cloned or defaulted.
impl<T> Clone for UnboundedBroadcast<T> {
    fn clone(&self) -> Self {
        Self {
            subscribed_senders: Arc::clone(&self.subscribed_senders),
        }
    }
}

impl<T> Default for UnboundedBroadcast<T> {
    fn default() -> Self {
        Self {
            subscribed_senders: Arc::default(),
        }
    }
}

impl<T> UnboundedBroadcast<T>
where
    T: Clone,
{
    /// Registers a new receiver on the channel.
    pub fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = unbounded();

        self.subscribed_senders
            .lock()
            .expect("failed to acquire the lock")
            .push(tx);

        rx
    }

    /// Sends `message` to every registered subscriber. Never blocks (the
    /// channels are unbounded) and never fails: disconnected subscribers are
    /// dropped from the list.
    pub fn broadcast(&self, message: T) {
        self.subscribed_senders
            .lock()
            .expect("failed to acquire the lock")
            .retain(|s| s.send(message.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_sees_every_message() {
        let broadcaster = UnboundedBroadcast::default();

        let subs1 = broadcaster.subscribe();
        let subs2 = broadcaster.subscribe();

        broadcaster.broadcast("first");
        broadcaster.broadcast("second");

        assert_eq!(subs1.recv().unwrap(), "first");
        assert_eq!(subs1.recv().unwrap(), "second");
        assert_eq!(subs2.recv().unwrap(), "first");
        assert_eq!(subs2.recv().unwrap(), "second");
    }

    #[test]
    fn dropped_subscriber_does_not_break_broadcast() {
        let broadcaster = UnboundedBroadcast::default();

        let subs1 = broadcaster.subscribe();
        let subs2 = broadcaster.subscribe();
        drop(subs2);

        broadcaster.broadcast("message");
        assert_eq!(subs1.recv().unwrap(), "message");
    }
}
