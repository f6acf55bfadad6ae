use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Counted clear-to-send semaphore, with an "ignore quota" used to absorb
/// acknowledgements a firmware is known to double-send around a resend.
///
/// `clear()`'s ignore-branch deliberately reproduces a long-standing
/// double-decrement in the reference implementation this is modeled on:
/// spending an ignore slot decrements the counter, and then the same call
/// decrements it a second time unconditionally. See DESIGN.md's "Send Token
/// ignore-clear" entry — resend timing in the corpus this was grounded on
/// depends on this exact behavior, so it is kept rather than "fixed".
pub struct SendToken {
    max: u32,
    state: Mutex<State>,
    condvar: Condvar,
}

struct State {
    counter: u32,
    ignored: u32,
}

impl SendToken {
    pub fn new(max: u32) -> Self {
        Self {
            max: max.max(1),
            state: Mutex::new(State {
                counter: 0,
                ignored: 0,
            }),
            condvar: Condvar::new(),
        }
    }

    pub fn set(&self) {
        self.set_impl(false);
    }

    pub fn set_ignored(&self) {
        self.set_impl(true);
    }

    fn set_impl(&self, ignore: bool) {
        let mut state = self.state.lock().unwrap();
        state.counter = (state.counter + 1).min(self.max);
        if ignore {
            state.ignored += 1;
        }
        self.condvar.notify_all();
    }

    /// Decrements the counter. Reproduces the ignore-branch double decrement
    /// described on the type.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        if state.ignored > 0 {
            state.ignored -= 1;
            state.counter = state.counter.saturating_sub(1);
        }
        state.counter = state.counter.saturating_sub(1);
    }

    pub fn clear_completely(&self) {
        let mut state = self.state.lock().unwrap();
        state.counter = 0;
        state.ignored = 0;
    }

    /// Blocks until the counter is greater than zero. Does not itself
    /// decrement the counter.
    pub fn wait(&self) {
        let state = self.state.lock().unwrap();
        let _unused = self
            .condvar
            .wait_while(state, |s| s.counter == 0)
            .unwrap();
    }

    /// Like [`SendToken::wait`] but bounded; returns `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let state = self.state.lock().unwrap();
        let (guard, result) = self
            .condvar
            .wait_timeout_while(state, timeout, |s| s.counter == 0)
            .unwrap();
        !result.timed_out() && guard.counter > 0
    }

    pub fn blocked(&self) -> bool {
        self.state.lock().unwrap().counter == 0
    }

    pub fn counter(&self) -> u32 {
        self.state.lock().unwrap().counter
    }
}
