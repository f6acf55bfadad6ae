use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use reprap::{
    Engine, EngineConfig, FileJob, MockFirmware, MockTransport, ProtocolState, SerialTransport,
    SerialTransportConfig, Transport,
};

/// Streams a G-code file to a RepRap-compatible printer over serial, or
/// against an in-process mock firmware for smoke-testing without hardware.
#[derive(Parser, Debug)]
#[command(name = "reprap-cli", version, about)]
struct Args {
    /// Serial device path, e.g. /dev/ttyUSB0. Ignored with --mock.
    #[arg(long)]
    port: Option<String>,

    #[arg(long, default_value_t = 250_000)]
    baud_rate: u32,

    /// Run against a built-in fake firmware instead of a real serial port.
    #[arg(long)]
    mock: bool,

    /// Path to a config file overriding engine defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// G-code file to stream once connected.
    #[arg(long)]
    job: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => {
            let data = std::fs::read_to_string(path)?;
            EngineConfig::from_toml_str(&data)?
        }
        None => EngineConfig::default(),
    };

    let engine = if args.mock {
        let (transport, firmware) = MockTransport::pair();
        std::thread::spawn(move || run_mock_firmware(firmware));
        Engine::connect(Box::new(transport), config)
    } else {
        let port = args
            .port
            .ok_or_else(|| anyhow::anyhow!("--port is required unless --mock is set"))?;
        let transport = SerialTransport::open(&SerialTransportConfig {
            path: port,
            baud_rate: args.baud_rate,
            toggle_dtr_on_open: true,
        })?;
        Engine::connect(Box::new(transport) as Box<dyn Transport>, config)
    };

    let changes = engine.subscribe();
    std::thread::spawn(move || {
        while let Some(change) = changes.recv() {
            tracing::info!(target: "reprap::state", from = ?change.from, to = ?change.to, "state change");
        }
    });

    wait_for(&engine, |state| state.is_operational(), Duration::from_secs(10));

    if let Some(job_path) = args.job {
        let job = FileJob::open(&job_path)?;
        Arc::clone(&engine).start_job(Box::new(job))?;
        wait_for(&engine, |state| state != ProtocolState::Processing, Duration::from_secs(3600));
    } else {
        engine.send_gcode("M115", false)?;
    }

    engine.shutdown();
    Ok(())
}

fn wait_for(engine: &Arc<Engine>, mut predicate: impl FnMut(ProtocolState) -> bool, timeout: Duration) {
    let deadline = std::time::Instant::now() + timeout;
    while !predicate(engine.state()) && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Minimal scripted firmware used by `--mock`: identifies as Marlin and acks
/// every line it's sent.
fn run_mock_firmware(mut firmware: MockFirmware) {
    loop {
        let Some(line) = firmware.recv_line(Duration::from_secs(3600)) else {
            return;
        };

        if line.contains("M115") {
            firmware.send_line("FIRMWARE_NAME:Marlin 2.0.9 (reprap-cli mock)");
        }
        firmware.send_line("ok");
    }
}
