use std::collections::{HashSet, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::command::QueueEntry;
use crate::error::{EngineError, Result};

/// FIFO queue shared by the job, command, and send stages, with type-based
/// deduplication.
///
/// Grounded on the teacher's `SerialPendingSendQueue` (pending/inflight
/// split guarded by a single lock, `notify_all` on push) generalized to the
/// dedup-by-type and priority-resend behavior the protocol needs: periodic
/// polls (temperature, SD status) carry a stable `item_type` so a slow
/// firmware can't make them pile up unboundedly.
pub struct CommandQueue {
    state: Mutex<State>,
    condvar: Condvar,
}

struct State {
    entries: VecDeque<QueueEntry>,
    pending_types: HashSet<String>,
    resend_entries: VecDeque<QueueEntry>,
    resend_active: bool,
    blocked: bool,
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                entries: VecDeque::new(),
                pending_types: HashSet::new(),
                resend_entries: VecDeque::new(),
                resend_active: false,
                blocked: false,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Enqueues `entry`. Fails if `entry` is a [`QueueEntry::Command`] with a
    /// non-null `item_type` already pending.
    pub fn put(&self, entry: QueueEntry) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        if let QueueEntry::Command(cmd) = &entry {
            if let Some(item_type) = &cmd.item_type {
                if !state.pending_types.insert(item_type.clone()) {
                    return Err(EngineError::TypeAlreadyInQueue(item_type.clone()));
                }
            }
        }

        state.entries.push_back(entry);
        self.condvar.notify_all();
        Ok(())
    }

    /// Enqueues a resend line ahead of ordinary work, and flips
    /// `resend_active` until [`CommandQueue::resend_window_closed`] is
    /// called.
    pub fn put_resend(&self, entry: QueueEntry) {
        let mut state = self.state.lock().unwrap();
        state.resend_active = true;
        state.resend_entries.push_back(entry);
        self.condvar.notify_all();
    }

    pub fn resend_window_closed(&self) {
        let mut state = self.state.lock().unwrap();
        if state.resend_entries.is_empty() {
            state.resend_active = false;
        }
    }

    pub fn resend_active(&self) -> bool {
        self.state.lock().unwrap().resend_active
    }

    /// Drops any in-flight resend window outright, unconditionally. Used by
    /// `M110`: once the line counter is reset, a resend of a line numbered
    /// against the old counter can never be satisfied.
    pub fn clear_resend(&self) {
        let mut state = self.state.lock().unwrap();
        state.resend_entries.clear();
        state.resend_active = false;
    }

    /// Blocks until an entry is available (honouring resend priority) and
    /// the queue is not held by a `blocked()` scope.
    pub fn get(&self) -> QueueEntry {
        let mut state = self.state.lock().unwrap();
        loop {
            if !state.blocked {
                if let Some(entry) = state.resend_entries.pop_front() {
                    if state.resend_entries.is_empty() {
                        state.resend_active = false;
                    }
                    return entry;
                }

                if let Some(entry) = state.entries.pop_front() {
                    if let QueueEntry::Command(cmd) = &entry {
                        if let Some(item_type) = &cmd.item_type {
                            state.pending_types.remove(item_type);
                        }
                    }
                    return entry;
                }
            }

            state = self.condvar.wait(state).unwrap();
        }
    }

    pub fn get_timeout(&self, timeout: Duration) -> Option<QueueEntry> {
        let mut state = self.state.lock().unwrap();
        loop {
            if !state.blocked {
                if let Some(entry) = state.resend_entries.pop_front() {
                    if state.resend_entries.is_empty() {
                        state.resend_active = false;
                    }
                    return Some(entry);
                }

                if let Some(entry) = state.entries.pop_front() {
                    if let QueueEntry::Command(cmd) = &entry {
                        if let Some(item_type) = &cmd.item_type {
                            state.pending_types.remove(item_type);
                        }
                    }
                    return Some(entry);
                }
            }

            let (next_state, result) = self.condvar.wait_timeout(state, timeout).unwrap();
            state = next_state;
            if result.timed_out() {
                return None;
            }
        }
    }

    /// Atomically drains the queue, holding it blocked for the duration of
    /// `f` so callers can replace its contents without racing `get()`.
    pub fn with_blocked<R>(&self, f: impl FnOnce(&mut VecDeque<QueueEntry>) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        state.blocked = true;
        let result = f(&mut state.entries);
        state.pending_types.clear();
        let item_types: Vec<_> = state
            .entries
            .iter()
            .filter_map(|entry| match entry {
                QueueEntry::Command(cmd) => cmd.item_type.clone(),
                _ => None,
            })
            .collect();
        state.pending_types.extend(item_types);
        state.blocked = false;
        self.condvar.notify_all();
        result
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.entries.len() + state.resend_entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;

    #[test]
    fn dedups_by_item_type() {
        let queue = CommandQueue::new();
        queue
            .put(QueueEntry::Command(
                Command::text("M105").with_type("temperature_poll"),
            ))
            .unwrap();

        let err = queue
            .put(QueueEntry::Command(
                Command::text("M105").with_type("temperature_poll"),
            ))
            .unwrap_err();
        assert!(matches!(err, EngineError::TypeAlreadyInQueue(_)));

        let _ = queue.get();

        // Once drained, the type can be queued again.
        queue
            .put(QueueEntry::Command(
                Command::text("M105").with_type("temperature_poll"),
            ))
            .unwrap();
    }

    #[test]
    fn resend_entries_are_served_before_ordinary_entries() {
        let queue = CommandQueue::new();
        queue
            .put(QueueEntry::Command(Command::text("G1 X10")))
            .unwrap();
        queue.put_resend(QueueEntry::Command(Command::text("G1 X5")));

        let first = queue.get();
        match first {
            QueueEntry::Command(cmd) => assert_eq!(cmd.body.to_line(), "G1 X5"),
            _ => panic!("expected a command"),
        }
        assert!(!queue.resend_active());
    }

    #[test]
    fn untyped_entries_never_dedup() {
        let queue = CommandQueue::new();
        queue.put(QueueEntry::Command(Command::text("G1"))).unwrap();
        queue.put(QueueEntry::Command(Command::text("G1"))).unwrap();
        assert_eq!(queue.len(), 2);
    }
}
