use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::command::{Command, CommandBody, QueueEntry};
use crate::config::{ChecksumPolicy, EngineConfig};
use crate::error::{EngineError, Result};
use crate::line_history::LineHistory;
use crate::queues::CommandQueue;
use crate::send_token::SendToken;
use crate::transport::Transport;

/// Tag marking a queue entry as already wire-framed (line number and
/// checksum baked in), so the send loop writes it verbatim instead of
/// framing it again. Used for resend traffic, which must reproduce the
/// exact bytes the firmware is asking to see again.
pub const RAW_WIRE_TAG: &str = "raw_wire";

fn compute_checksum(line: &str) -> u8 {
    line.bytes().fold(0u8, |acc, b| acc ^ b)
}

/// Looks up `requested` in `history` and, if still retained, pushes it back
/// onto `queue` ahead of ordinary traffic.
///
/// Grounded on the teacher's `serial_writer_thread` resend path: a
/// `Resend:` line is satisfied from the outbound ring buffer rather than
/// re-running the higher-level command through the pipeline a second time.
pub fn request_resend(history: &LineHistory, queue: &CommandQueue, requested: u64) -> Result<()> {
    let Some(bytes) = history.get(requested) else {
        return Err(EngineError::UnknownResend {
            requested,
            oldest_known: history.oldest().unwrap_or(requested),
        });
    };

    let text = String::from_utf8_lossy(&bytes).into_owned();
    queue.put_resend(QueueEntry::Command(
        Command::text(text).with_tags([RAW_WIRE_TAG]),
    ));
    Ok(())
}

/// Drains [`CommandQueue`], frames each command with a line number and
/// checksum per `config.send_checksum`, blocks on the [`SendToken`], and
/// writes the result to the [`Transport`].
///
/// Grounded on the teacher's `serial_writer_thread`: a single loop owning
/// the write half of the connection, the line-number counter, and the
/// outbound history ring, translated from its async mutex/channel plumbing
/// to a blocking loop over `std::sync` primitives.
pub struct SendLoop {
    queue: Arc<CommandQueue>,
    token: Arc<SendToken>,
    history: Arc<LineHistory>,
    transport: Arc<Mutex<Box<dyn Transport>>>,
    next_line_number: AtomicU64,
    config: Arc<EngineConfig>,
}

impl SendLoop {
    pub fn new(
        queue: Arc<CommandQueue>,
        token: Arc<SendToken>,
        history: Arc<LineHistory>,
        transport: Arc<Mutex<Box<dyn Transport>>>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            queue,
            token,
            history,
            transport,
            next_line_number: AtomicU64::new(1),
            config,
        }
    }

    pub fn reset_line_number(&self, n: u64) {
        self.next_line_number.store(n, Ordering::SeqCst);
    }

    /// Line number of the most recently assigned (not yet necessarily
    /// acknowledged) frame, used by the resend handler to recognize a
    /// spurious resend of the line just sent.
    pub fn current_line_number(&self) -> u64 {
        self.next_line_number.load(Ordering::SeqCst).saturating_sub(1)
    }

    /// Numbers, checksums, and records `body` in Line History without
    /// sending it. Used both by the normal checksummed send path and by the
    /// emergency fast path, which must still observe checksum rules and
    /// advance the line counter so a later resend can be satisfied.
    pub fn frame_and_record(&self, body: &str) -> String {
        let n = self.next_line_number.fetch_add(1, Ordering::SeqCst);
        let numbered = format!("N{} {}", n, body);
        let checksum = compute_checksum(&numbered);
        let framed = format!("{}*{}", numbered, checksum);
        self.history.append(n, framed.clone().into_bytes());
        framed
    }

    /// Runs until `running` is cleared. Polls the queue rather than blocking
    /// forever on it so a shutdown request is noticed promptly.
    pub fn run(&self, running: &AtomicBool, printing: impl Fn() -> bool) {
        while running.load(Ordering::SeqCst) {
            let entry = match self.queue.get_timeout(Duration::from_millis(200)) {
                Some(entry) => entry,
                None => continue,
            };

            match entry {
                QueueEntry::Marker => {}
                QueueEntry::SendQueueMarker(callback) => callback(),
                QueueEntry::Command(cmd) => {
                    if let Err(err) = self.send_once(cmd, printing()) {
                        tracing::warn!(target: "reprap::wire", error = %err, "write failed");
                    }
                }
            }
        }
    }

    fn send_once(&self, cmd: Command, printing: bool) -> Result<()> {
        self.token.wait();

        let needs_ack = requires_ack(&cmd, &self.config);

        let line = if cmd.has_tag(RAW_WIRE_TAG) {
            cmd.body.to_line()
        } else {
            let body = cmd.body.to_line();
            let use_checksum = match self.config.send_checksum {
                ChecksumPolicy::Always => true,
                ChecksumPolicy::Never => false,
                ChecksumPolicy::Printing => printing,
            };

            if use_checksum {
                self.frame_and_record(&body)
            } else {
                body
            }
        };

        tracing::trace!(target: "reprap::wire", %line, "write");
        {
            let mut transport = self.transport.lock().unwrap();
            transport.write_all(format!("{}\n", line).as_bytes())?;
        }

        // A command that doesn't need an ack never consumed the slot
        // `wait()` found open, so the next iteration's `wait()` proceeds
        // immediately instead of blocking on a clear that would never come.
        if needs_ack {
            self.token.clear();
        }

        Ok(())
    }
}

/// Whether sending `cmd` should consume a [`SendToken`] slot: G-code always
/// expects an `ok`, a raw-wire resend replay is itself a G-code line, and
/// anything else (`@`-commands, plain text) only does if the flavor opts in.
fn requires_ack(cmd: &Command, config: &EngineConfig) -> bool {
    if cmd.has_tag(RAW_WIRE_TAG) {
        return true;
    }
    match &cmd.body {
        CommandBody::Gcode(_) => true,
        _ => config.unknown_requires_ack,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use std::time::Duration as StdDuration;

    fn send_loop_with_mock() -> (SendLoop, crate::transport::MockFirmware, Arc<CommandQueue>, Arc<SendToken>, Arc<LineHistory>) {
        let (transport, firmware) = MockTransport::pair();
        let queue = Arc::new(CommandQueue::new());
        let token = Arc::new(SendToken::new(4));
        let history = Arc::new(LineHistory::new(16));
        let config = Arc::new(EngineConfig::default());
        let send_loop = SendLoop::new(
            queue.clone(),
            token.clone(),
            history.clone(),
            Arc::new(Mutex::new(Box::new(transport) as Box<dyn Transport>)),
            config,
        );
        (send_loop, firmware, queue, token, history)
    }

    #[test]
    fn frames_line_number_and_checksum_when_printing() {
        let (send_loop, mut firmware, _queue, token, history) = send_loop_with_mock();
        token.set();

        send_loop
            .send_once(Command::text("G1 X10"), true)
            .unwrap();

        let written = firmware.recv_line(StdDuration::from_secs(1)).unwrap();
        assert_eq!(written, "N1 G1 X10*80");
        assert!(history.contains(1));
    }

    #[test]
    fn never_policy_sends_unframed() {
        let (send_loop, mut firmware, _queue, token, history) = send_loop_with_mock();
        token.set();

        let mut config_override = EngineConfig::default();
        config_override.send_checksum = ChecksumPolicy::Never;
        let send_loop = SendLoop {
            config: Arc::new(config_override),
            ..send_loop
        };

        send_loop
            .send_once(Command::text("M105"), true)
            .unwrap();

        assert_eq!(
            firmware.recv_line(StdDuration::from_secs(1)).unwrap(),
            "M105"
        );
        assert!(history.is_empty());
    }

    #[test]
    fn raw_wire_tagged_commands_bypass_framing() {
        let (send_loop, mut firmware, _queue, token, _history) = send_loop_with_mock();
        token.set();

        send_loop
            .send_once(Command::text("N3 G1 X10*57").with_tags([RAW_WIRE_TAG]), true)
            .unwrap();

        assert_eq!(
            firmware.recv_line(StdDuration::from_secs(1)).unwrap(),
            "N3 G1 X10*57"
        );
    }

    #[test]
    fn send_once_clears_the_token_after_an_ack_requiring_command() {
        let (send_loop, mut firmware, _queue, token, _history) = send_loop_with_mock();
        token.set();

        send_loop.send_once(Command::text("G1 X10"), true).unwrap();
        let _ = firmware.recv_line(StdDuration::from_secs(1)).unwrap();
        assert_eq!(token.counter(), 0);
    }

    #[test]
    fn send_once_leaves_the_token_set_for_commands_that_never_ack() {
        let (send_loop, mut firmware, _queue, token, _history) = send_loop_with_mock();
        let mut config_override = EngineConfig::default();
        config_override.unknown_requires_ack = false;
        let send_loop = SendLoop {
            config: Arc::new(config_override),
            ..send_loop
        };
        token.set();

        send_loop.send_once(Command::text("@fire_laser"), true).unwrap();
        let _ = firmware.recv_line(StdDuration::from_secs(1)).unwrap();
        assert_eq!(token.counter(), 1, "a command that never acks must not consume the slot");
    }

    #[test]
    fn request_resend_requeues_the_framed_line() {
        let history = LineHistory::new(8);
        history.append(5, b"N5 G1 X1*9".to_vec());
        let queue = CommandQueue::new();

        request_resend(&history, &queue, 5).unwrap();
        match queue.get() {
            QueueEntry::Command(cmd) => {
                assert!(cmd.has_tag(RAW_WIRE_TAG));
                assert_eq!(cmd.body.to_line(), "N5 G1 X1*9");
            }
            _ => panic!("expected a command"),
        }
    }

    #[test]
    fn request_resend_fails_once_the_line_has_been_evicted() {
        let history = LineHistory::new(2);
        history.append(1, b"a".to_vec());
        history.append(2, b"b".to_vec());
        history.append(3, b"c".to_vec());
        let queue = CommandQueue::new();

        let err = request_resend(&history, &queue, 1).unwrap_err();
        assert!(matches!(err, EngineError::UnknownResend { requested: 1, .. }));
    }
}
