use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::command::Command;
use crate::error::EngineError;
use crate::queues::CommandQueue;

const SLEEP_STEP: Duration = Duration::from_millis(50);

/// Sleeps for `duration`, checking `running` every [`SLEEP_STEP`] so a
/// shutdown request interrupts the sleep promptly instead of after a full
/// (potentially multi-second) poll interval.
fn sleep_interruptible(duration: Duration, running: &AtomicBool) {
    let mut waited = Duration::ZERO;
    while waited < duration && running.load(Ordering::SeqCst) {
        let chunk = SLEEP_STEP.min(duration - waited);
        thread::sleep(chunk);
        waited += chunk;
    }
}

/// Generic periodic poller: computes the interval and whether to send fresh
/// each tick, since both conditions are state-dependent (the temperature
/// poller's interval shortens once a heater target is set; both pollers
/// skip a tick once the firmware is autoreporting on its own).
///
/// Grounded on the teacher's `state_polling_thread`, one thread per kind of
/// periodic status request rather than a single scheduler multiplexing all
/// of them.
pub fn run_poll_loop(
    running: &AtomicBool,
    queue: &CommandQueue,
    interval: impl Fn() -> Duration,
    should_send: impl Fn() -> bool,
    command: impl Fn() -> Command,
) {
    while running.load(Ordering::SeqCst) {
        sleep_interruptible(interval(), running);
        if !running.load(Ordering::SeqCst) {
            break;
        }
        if should_send() {
            match queue.put(crate::command::QueueEntry::Command(command())) {
                Ok(()) | Err(EngineError::TypeAlreadyInQueue(_)) => {}
                Err(err) => {
                    tracing::warn!(target: "reprap::state", error = %err, "poll enqueue failed");
                }
            }
        }
    }
}

/// A cancellable one-shot timer used for the resend-OK watchdog and the
/// pause/cancel position-log wait: both need "fire unless cancelled within
/// N seconds" semantics and nothing more.
pub struct OneShot {
    cancelled: Arc<AtomicBool>,
}

impl OneShot {
    pub fn start(delay: Duration, on_fire: impl FnOnce() + Send + 'static) -> Self {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();

        thread::spawn(move || {
            let mut waited = Duration::ZERO;
            while waited < delay {
                if flag.load(Ordering::SeqCst) {
                    return;
                }
                let chunk = SLEEP_STEP.min(delay - waited);
                thread::sleep(chunk);
                waited += chunk;
            }
            if !flag.load(Ordering::SeqCst) {
                on_fire();
            }
        });

        Self { cancelled }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[test]
    fn poll_loop_skips_ticks_when_should_send_is_false() {
        let running = AtomicBool::new(true);
        let queue = CommandQueue::new();
        let calls = AtomicUsize::new(0);

        thread::scope(|scope| {
            scope.spawn(|| {
                run_poll_loop(
                    &running,
                    &queue,
                    || Duration::from_millis(10),
                    || {
                        let n = calls.fetch_add(1, Ordering::SeqCst);
                        n >= 2
                    },
                    || Command::text("M105").with_type("temperature_poll"),
                );
            });

            thread::sleep(Duration::from_millis(80));
            running.store(false, Ordering::SeqCst);
        });

        assert!(queue.len() <= 1, "dedup by item_type should cap the queue at one pending poll");
    }

    #[test]
    fn one_shot_fires_unless_cancelled() {
        let fired = Arc::new(Mutex::new(false));
        let flag = fired.clone();
        let _timer = OneShot::start(Duration::from_millis(20), move || {
            *flag.lock().unwrap() = true;
        });

        thread::sleep(Duration::from_millis(60));
        assert!(*fired.lock().unwrap());
    }

    #[test]
    fn one_shot_does_not_fire_once_cancelled() {
        let fired = Arc::new(Mutex::new(false));
        let flag = fired.clone();
        let timer = OneShot::start(Duration::from_millis(40), move || {
            *flag.lock().unwrap() = true;
        });
        timer.cancel();

        thread::sleep(Duration::from_millis(80));
        assert!(!*fired.lock().unwrap());
    }
}
