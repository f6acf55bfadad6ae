use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

/// Protocol/job state machine states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProtocolState {
    Disconnected,
    DisconnectedWithError,
    Connecting,
    Connected,
    Starting,
    Processing,
    Pausing,
    Paused,
    Resuming,
    Cancelling,
    Finishing,
    Error,
}

impl ProtocolState {
    pub fn is_operational(&self) -> bool {
        !matches!(self, ProtocolState::Disconnected | ProtocolState::DisconnectedWithError)
    }

    pub fn is_processing(&self) -> bool {
        matches!(
            self,
            ProtocolState::Starting
                | ProtocolState::Processing
                | ProtocolState::Pausing
                | ProtocolState::Cancelling
                | ProtocolState::Resuming
                | ProtocolState::Finishing
        )
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, ProtocolState::Processing | ProtocolState::Paused)
    }
}

#[derive(Clone, Debug)]
pub struct StateChange {
    pub from: ProtocolState,
    pub to: ProtocolState,
}

/// Publish/subscribe bus for protocol state transitions and job progress.
///
/// Grounded on the teacher's `change::ChangeDistributer` (a background
/// dispatch thread fed by an unbounded sender, each subscriber holding a
/// bounded slot-of-one channel so a slow listener only misses a coalesced
/// notification rather than blocking the publisher). Simplified to direct,
/// synchronous fan-out under a single lock since the engine's listener
/// count is small and listeners are expected to be non-blocking (log a
/// line, update a UI label) rather than needing back-pressure.
#[derive(Clone)]
pub struct ChangePublisher {
    shared: Arc<Mutex<Subscribers>>,
}

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    entries: HashMap<u64, mpsc::Sender<StateChange>>,
}

impl Default for ChangePublisher {
    fn default() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Subscribers::default())),
        }
    }
}

impl ChangePublisher {
    pub fn publish(&self, change: StateChange) {
        let subscribers = self.shared.lock().unwrap();
        for sender in subscribers.entries.values() {
            let _ = sender.send(change.clone());
        }
    }

    pub fn subscribe(&self) -> ChangeReceiver {
        let (sender, receiver) = mpsc::channel();
        let mut subscribers = self.shared.lock().unwrap();
        let id = subscribers.next_id;
        subscribers.next_id += 1;
        subscribers.entries.insert(id, sender);

        ChangeReceiver {
            id,
            receiver,
            shared: self.shared.clone(),
        }
    }
}

/// Dropping this unsubscribes.
pub struct ChangeReceiver {
    id: u64,
    receiver: mpsc::Receiver<StateChange>,
    shared: Arc<Mutex<Subscribers>>,
}

impl ChangeReceiver {
    pub fn recv(&self) -> Option<StateChange> {
        self.receiver.recv().ok()
    }

    pub fn try_recv(&self) -> Option<StateChange> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for ChangeReceiver {
    fn drop(&mut self) {
        let mut subscribers = self.shared.lock().unwrap();
        subscribers.entries.remove(&self.id);
    }
}

/// Owns the current state and performs validated transitions, publishing
/// each one.
pub struct StateMachine {
    current: Mutex<ProtocolState>,
    publisher: ChangePublisher,
}

impl StateMachine {
    pub fn new(publisher: ChangePublisher) -> Self {
        Self {
            current: Mutex::new(ProtocolState::Disconnected),
            publisher,
        }
    }

    pub fn current(&self) -> ProtocolState {
        *self.current.lock().unwrap()
    }

    pub fn subscribe(&self) -> ChangeReceiver {
        self.publisher.subscribe()
    }

    pub fn transition(&self, to: ProtocolState) {
        let mut current = self.current.lock().unwrap();
        let from = *current;
        if from == to {
            return;
        }
        *current = to;
        drop(current);
        self.publisher.publish(StateChange { from, to });
    }

    /// Transitions only if the current state still matches `expected`,
    /// guarding against e.g. a pause-completion marker firing after the job
    /// was already resumed.
    pub fn transition_if(&self, expected: ProtocolState, to: ProtocolState) -> bool {
        let mut current = self.current.lock().unwrap();
        if *current != expected {
            return false;
        }
        let from = *current;
        *current = to;
        drop(current);
        self.publisher.publish(StateChange { from, to });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribers_receive_transitions() {
        let publisher = ChangePublisher::default();
        let receiver = publisher.subscribe();
        let machine = StateMachine::new(publisher);

        machine.transition(ProtocolState::Connecting);
        let change = receiver.recv().unwrap();
        assert_eq!(change.from, ProtocolState::Disconnected);
        assert_eq!(change.to, ProtocolState::Connecting);
    }

    #[test]
    fn transition_if_guards_against_stale_markers() {
        let publisher = ChangePublisher::default();
        let machine = StateMachine::new(publisher);
        machine.transition(ProtocolState::Connecting);
        machine.transition(ProtocolState::Connected);
        machine.transition(ProtocolState::Processing);
        machine.transition(ProtocolState::Pausing);

        // Simulate a resume racing ahead of the pause-completion marker.
        machine.transition(ProtocolState::Resuming);

        let applied = machine.transition_if(ProtocolState::Pausing, ProtocolState::Paused);
        assert!(!applied);
        assert_eq!(machine.current(), ProtocolState::Resuming);
    }

    #[test]
    fn dropping_receiver_unsubscribes() {
        let publisher = ChangePublisher::default();
        {
            let _receiver = publisher.subscribe();
            assert_eq!(publisher.shared.lock().unwrap().entries.len(), 1);
        }
        assert_eq!(publisher.shared.lock().unwrap().entries.len(), 0);
    }
}
