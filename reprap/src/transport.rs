use std::io::{BufRead, BufReader, Write};
use std::sync::mpsc;
use std::time::Duration;

use crate::error::{EngineError, Result};

/// Byte-oriented, line-framed transport to the firmware.
///
/// Kept deliberately narrow: the protocol engine only needs whole lines in
/// and raw bytes out. A real serial device and an in-memory scripted fake
/// firmware both implement it; callers may supply their own (a TCP print
/// server, for instance) without the engine needing to know.
pub trait Transport: Send {
    /// Blocking write of raw bytes (already including the trailing `\n`).
    fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Blocks for at most `timeout` for the next whole, newline-stripped
    /// line. Returns `Ok(None)` on timeout (not yet a protocol timeout —
    /// callers decide how many of these to tolerate) and `Err(Eof)` if the
    /// stream has closed.
    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>>;

    /// True if the medium already guarantees message integrity (checksums
    /// are then never necessary).
    fn message_integrity(&self) -> bool {
        false
    }
}

/// Real serial port transport.
///
/// Grounded on the `serialport` crate usage shown in the corpus's own
/// serial-device manifest (`timothyb89-sds011`); unlike that device this
/// engine needs line framing, so reads go through a `BufReader` the way the
/// teacher's receiver buffer accumulates bytes until a `\n`.
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
    reader: BufReader<Box<dyn serialport::SerialPort>>,
}

pub struct SerialTransportConfig {
    pub path: String,
    pub baud_rate: u32,
    /// Many boards (Arduino `reset_using_dtr` bootloaders) reset when DTR
    /// toggles on open; this mirrors the teacher's boot-preamble delay.
    pub toggle_dtr_on_open: bool,
}

impl SerialTransport {
    pub fn open(config: &SerialTransportConfig) -> Result<Self> {
        let mut port = serialport::new(&config.path, config.baud_rate)
            .timeout(Duration::from_millis(50))
            .open()
            .map_err(|e| EngineError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        if config.toggle_dtr_on_open {
            let _ = port.write_data_terminal_ready(false);
            std::thread::sleep(Duration::from_millis(100));
            let _ = port.write_data_terminal_ready(true);
        }

        let reader = BufReader::new(port.try_clone().map_err(|e| {
            EngineError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
        })?);

        Ok(Self { port, reader })
    }
}

impl Transport for SerialTransport {
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>> {
        let _ = self.port.set_timeout(timeout);
        let mut line = Vec::new();
        match self.reader.read_until(b'\n', &mut line) {
            Ok(0) => Err(EngineError::Eof),
            Ok(_) => {
                while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
                    line.pop();
                }
                Ok(Some(String::from_utf8_lossy(&line).into_owned()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(EngineError::Io(e)),
        }
    }
}

/// In-memory, script-driven fake firmware used by the engine's own tests
/// and available to callers testing code built on the engine.
///
/// Two `mpsc` pipes stand in for the serial wire, the same shape the
/// teacher's `serial_controller` uses for its reader/writer split, just
/// without the async executor.
pub struct MockTransport {
    outbound: mpsc::Sender<Vec<u8>>,
    inbound: mpsc::Receiver<String>,
}

/// The firmware side of a [`MockTransport`] pair: what a test drives to
/// simulate firmware behavior.
pub struct MockFirmware {
    outbound: mpsc::Receiver<Vec<u8>>,
    inbound: mpsc::Sender<String>,
}

impl MockTransport {
    pub fn pair() -> (MockTransport, MockFirmware) {
        let (to_firmware, from_host) = mpsc::channel();
        let (to_host, from_firmware) = mpsc::channel();

        (
            MockTransport {
                outbound: to_firmware,
                inbound: from_firmware,
            },
            MockFirmware {
                outbound: from_host,
                inbound: to_host,
            },
        )
    }
}

impl Transport for MockTransport {
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.outbound
            .send(data.to_vec())
            .map_err(|_| EngineError::Eof)
    }

    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>> {
        match self.inbound.recv_timeout(timeout) {
            Ok(line) => Ok(Some(line)),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(EngineError::Eof),
        }
    }
}

impl MockFirmware {
    /// Sends one response line to the host.
    pub fn send_line(&self, line: impl Into<String>) {
        let _ = self.inbound.send(line.into());
    }

    /// Blocks for the next line the host wrote (a full `\n`-terminated
    /// write may arrive as one or more chunks; this reassembles lines).
    pub fn recv_line(&mut self, timeout: Duration) -> Option<String> {
        loop {
            match self.outbound.recv_timeout(timeout) {
                Ok(chunk) => {
                    if let Some(line) = String::from_utf8_lossy(&chunk).lines().next() {
                        return Some(line.to_string());
                    }
                }
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_transport_round_trips_a_line() {
        let (mut host, mut firmware) = MockTransport::pair();
        host.write_all(b"G28\n").unwrap();
        assert_eq!(
            firmware.recv_line(Duration::from_secs(1)),
            Some("G28".to_string())
        );

        firmware.send_line("ok");
        assert_eq!(
            host.read_line(Duration::from_secs(1)).unwrap(),
            Some("ok".to_string())
        );
    }

    #[test]
    fn read_line_times_out_when_nothing_arrives() {
        let (mut host, _firmware) = MockTransport::pair();
        assert_eq!(host.read_line(Duration::from_millis(20)).unwrap(), None);
    }
}
