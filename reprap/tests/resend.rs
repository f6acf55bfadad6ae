//! Exercises the resend path end to end through `Engine`, not just the
//! dispatcher/send-loop units in isolation: a `Resend:` line from firmware
//! must cause the exact previously framed bytes to be replayed.

use std::time::{Duration, Instant};

use reprap::config::ChecksumPolicy;
use reprap::{Engine, EngineConfig, MockTransport};

fn wait_until(mut predicate: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !predicate() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    true
}

#[test]
fn resend_request_replays_the_exact_framed_line() {
    let mut config = EngineConfig::default();
    config.send_checksum = ChecksumPolicy::Always;

    let (transport, mut firmware) = MockTransport::pair();
    let engine = Engine::connect(Box::new(transport), config);

    // Handshake: both bootstrap lines are framed too under `Always`.
    let hello = firmware.recv_line(Duration::from_secs(1)).unwrap();
    assert!(hello.starts_with("N1 M110 N0*"));
    firmware.send_line("ok");

    let info = firmware.recv_line(Duration::from_secs(1)).unwrap();
    assert!(info.starts_with("N2 M115*"));
    firmware.send_line("FIRMWARE_NAME:Marlin 2.0.9");
    firmware.send_line("ok");

    assert!(wait_until(|| engine.state().is_operational(), Duration::from_secs(2)));

    engine.send_gcode("G1 X10", false).unwrap();
    let first_attempt = firmware.recv_line(Duration::from_secs(1)).unwrap();
    assert!(first_attempt.starts_with("N3 G1 X10*"));

    let line_number: u64 = first_attempt
        .trim_start_matches('N')
        .split_whitespace()
        .next()
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(line_number, 3);

    firmware.send_line(format!("Resend: {}", line_number));

    let replay = firmware.recv_line(Duration::from_secs(1)).unwrap();
    assert_eq!(replay, first_attempt, "resend must replay the identical framed bytes");

    firmware.send_line("ok");

    engine.shutdown();
}

#[test]
fn resend_for_an_evicted_line_is_logged_and_does_not_hang_the_engine() {
    let mut config = EngineConfig::default();
    config.send_checksum = ChecksumPolicy::Always;
    config.line_history_capacity = 1;

    let (transport, mut firmware) = MockTransport::pair();
    let engine = Engine::connect(Box::new(transport), config);

    firmware.recv_line(Duration::from_secs(1)).unwrap();
    firmware.send_line("ok");
    firmware.recv_line(Duration::from_secs(1)).unwrap();
    firmware.send_line("FIRMWARE_NAME:Marlin 2.0.9");
    firmware.send_line("ok");
    assert!(wait_until(|| engine.state().is_operational(), Duration::from_secs(2)));

    // Line 1 (M110) has already been evicted by line 2 (M115) given a
    // history capacity of one. Requesting it back must not hang anything.
    firmware.send_line("Resend: 1");

    // The engine stays responsive: a fresh command still round-trips.
    engine.send_gcode("M114", false).unwrap();
    let written = firmware.recv_line(Duration::from_secs(1)).unwrap();
    assert!(written.contains("M114"));
    firmware.send_line("ok");

    engine.shutdown();
}
