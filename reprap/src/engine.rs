use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::command::{Command, QueueEntry};
use crate::config::{EngineConfig, FirmwareErrorPolicy, TriggerOkAfterResend};
use crate::dispatcher::FirmwareEvent;
use crate::error::{EngineError, Result};
use crate::flavor::{bundled_flavors, Flavor, GenericFlavor};
use crate::job::Job;
use crate::line_history::LineHistory;
use crate::pipeline::{self, PipelineFlags, QueuingOutcome};
use crate::position::PositionRecord;
use crate::queues::CommandQueue;
use crate::send_loop::{self, SendLoop};
use crate::send_token::SendToken;
use crate::state::{ChangePublisher, ChangeReceiver, ProtocolState, StateMachine};
use crate::temperature::TemperatureRecord;
use crate::timers::OneShot;
use crate::transport::Transport;

/// Everything the engine's background threads share, one `Arc` handed to
/// each of them.
///
/// Grounded on the teacher's `SerialController`/`Shared` split: a thin
/// public handle wrapping an `Arc<Shared>` that the spawned threads close
/// over, translated from `ServiceResourceGroup`/async tasks to
/// `std::thread::JoinHandle`s.
struct Shared {
    config: EngineConfig,
    state_machine: Arc<StateMachine>,
    queue: Arc<CommandQueue>,
    token: Arc<SendToken>,
    history: Arc<LineHistory>,
    transport: Arc<Mutex<Box<dyn Transport>>>,
    send_loop: SendLoop,
    flavor: Mutex<Box<dyn Flavor>>,
    flags: Mutex<PipelineFlags>,
    temperatures: Mutex<TemperatureRecord>,
    position: Mutex<PositionRecord>,

    /// Consecutive transport read timeouts since the last line was
    /// received, reset on every successful read.
    timeout_consecutive: AtomicU32,
    /// Set on the first `busy:` line of a stretch, cleared on `Start`.
    busy_detected: AtomicBool,
    busy_interval_sent: AtomicBool,

    /// Set while a resend request is outstanding, used to recognize a
    /// spurious or echoed re-request of the same line.
    last_resend_line: Mutex<Option<u64>>,
    last_communication_error: Mutex<Option<String>>,
    resend_echo_count: AtomicU32,
    resend_ok_watchdog: Mutex<Option<OneShot>>,

    capturing_pause: Arc<AtomicBool>,
    capturing_cancel: Arc<AtomicBool>,
    pause_position: Mutex<Option<PositionRecord>>,
    cancel_position: Mutex<Option<PositionRecord>>,
    position_log_watchdog: Mutex<Option<OneShot>>,
}

/// Public handle to a running protocol engine: one serial connection, its
/// send/receive/poll threads, and the job currently being streamed, if any.
pub struct Engine {
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Engine {
    /// Opens the engine against an already-constructed transport and starts
    /// its background threads. The caller still needs to wait for a
    /// `Connected` state change (via [`Engine::subscribe`]) before treating
    /// the link as usable.
    pub fn connect(transport: Box<dyn Transport>, config: EngineConfig) -> Arc<Engine> {
        let publisher = ChangePublisher::default();
        let state_machine = Arc::new(StateMachine::new(publisher));
        let queue = Arc::new(CommandQueue::new());
        let token = Arc::new(SendToken::new(config.send_queue_capacity as u32));
        let history = Arc::new(LineHistory::new(config.line_history_capacity));
        let transport = Arc::new(Mutex::new(transport));
        let config = Arc::new(config);

        let send_loop = SendLoop::new(
            queue.clone(),
            token.clone(),
            history.clone(),
            transport.clone(),
            config.clone(),
        );

        let shared = Arc::new(Shared {
            config: (*config).clone(),
            state_machine: state_machine.clone(),
            queue,
            token: token.clone(),
            history: history.clone(),
            transport,
            send_loop,
            flavor: Mutex::new(Box::new(GenericFlavor::default())),
            flags: Mutex::new(PipelineFlags::with_heated_bed(config.has_heated_bed)),
            temperatures: Mutex::new(TemperatureRecord::default()),
            position: Mutex::new(PositionRecord::default()),
            timeout_consecutive: AtomicU32::new(0),
            busy_detected: AtomicBool::new(false),
            busy_interval_sent: AtomicBool::new(false),
            last_resend_line: Mutex::new(None),
            last_communication_error: Mutex::new(None),
            resend_echo_count: AtomicU32::new(0),
            resend_ok_watchdog: Mutex::new(None),
            capturing_pause: Arc::new(AtomicBool::new(false)),
            capturing_cancel: Arc::new(AtomicBool::new(false)),
            pause_position: Mutex::new(None),
            cancel_position: Mutex::new(None),
            position_log_watchdog: Mutex::new(None),
        });

        let engine = Arc::new(Engine {
            shared,
            running: Arc::new(AtomicBool::new(true)),
            threads: Mutex::new(Vec::new()),
        });

        {
            let mut threads = engine.threads.lock().unwrap();

            let receive_engine = engine.clone();
            threads.push(
                thread::Builder::new()
                    .name("reprap-receive".into())
                    .spawn(move || receive_engine.receive_loop())
                    .expect("spawn receive thread"),
            );

            let send_engine = engine.clone();
            threads.push(
                thread::Builder::new()
                    .name("reprap-send".into())
                    .spawn(move || {
                        let running = send_engine.running.clone();
                        send_engine
                            .shared
                            .send_loop
                            .run(&running, || send_engine.state().is_busy());
                    })
                    .expect("spawn send thread"),
            );

            let temp_engine = engine.clone();
            threads.push(
                thread::Builder::new()
                    .name("reprap-temp-poll".into())
                    .spawn(move || temp_engine.temperature_poll_loop())
                    .expect("spawn temperature poll thread"),
            );
        }

        state_machine.transition(ProtocolState::Connecting);
        // Unblock the first write; every subsequent slot comes from an `ok`.
        token.set();
        let _ = engine.enqueue_raw(Command::text("M110 N0"));
        let _ = engine.enqueue_raw(Command::text("M115"));

        engine
    }

    fn receive_loop(self: Arc<Self>) {
        const POLL: Duration = Duration::from_millis(200);
        let mut since_activity = Instant::now();

        while self.running.load(Ordering::SeqCst) {
            let line = {
                let mut transport = self.shared.transport.lock().unwrap();
                transport.read_line(POLL)
            };

            match line {
                Ok(Some(line)) => {
                    since_activity = Instant::now();
                    self.handle_line(&line);
                }
                Ok(None) => {
                    let effective_timeout = if self.shared.busy_detected.load(Ordering::SeqCst) {
                        self.shared.config.timeouts.communication_busy
                    } else {
                        self.shared.config.timeouts.communication
                    };
                    if since_activity.elapsed() >= effective_timeout {
                        since_activity = Instant::now();
                        self.handle_timeout();
                    }
                }
                Err(EngineError::Eof) => {
                    self.shared.state_machine.transition(ProtocolState::Disconnected);
                    break;
                }
                Err(err) => {
                    tracing::warn!(target: "reprap::wire", error = %err, "read failed");
                }
            }
        }
    }

    /// Runs the consecutive-timeout state machine described by the transport
    /// timeout policy: a per-state ceiling on how many communication
    /// timeouts in a row are tolerated before declaring the link dead.
    fn handle_timeout(&self) {
        let count = self.shared.timeout_consecutive.fetch_add(1, Ordering::SeqCst) + 1;

        let flags_long_running = self.shared.flags.lock().unwrap().long_running_command;
        let ceiling = if flags_long_running {
            self.shared.config.max_consecutive_timeouts.long
        } else if self.state().is_processing() {
            self.shared.config.max_consecutive_timeouts.printing
        } else {
            self.shared.config.max_consecutive_timeouts.idle
        };

        if ceiling == 0 {
            // A ceiling of zero disables timeout enforcement for this state.
            return;
        }
        if count > ceiling {
            tracing::error!(
                target: "reprap::wire",
                count,
                ceiling,
                "too many consecutive communication timeouts; disconnecting"
            );
            self.shared.state_machine.transition(ProtocolState::Error);
            self.shared.state_machine.transition(ProtocolState::Disconnected);
            return;
        }

        if let Some(line) = *self.shared.last_resend_line.lock().unwrap() {
            tracing::warn!(target: "reprap::wire", line, "timed out waiting on a resend; resending again");
            if send_loop::request_resend(&self.shared.history, &self.shared.queue, line).is_ok() {
                self.shared.token.set();
            }
            return;
        }

        let heating = self.shared.flags.lock().unwrap().heating;
        if heating {
            tracing::debug!(target: "reprap::wire", "timeout while heating; treating as heatup finished");
            let mut flags = self.shared.flags.lock().unwrap();
            flags.heating = false;
            flags.heating_start = None;
            flags.long_running_command = false;
            drop(flags);
            self.shared.token.set();
            return;
        }

        if flags_long_running {
            // Expected: a long-running command (homing, wait-for-temp) can
            // legitimately hold the line quiet longer than the ordinary
            // communication timeout.
            return;
        }

        if self.state().is_processing() {
            let _ = self.enqueue_raw(Command::text("M105").with_type("timeout_tickle"));
            self.shared.token.set();
            return;
        }

        if self.shared.token.blocked() {
            self.shared.token.set();
        }
    }

    fn temperature_poll_loop(self: Arc<Self>) {
        let running = self.running.clone();
        let queue = self.shared.queue.clone();
        let config = self.shared.config.clone();
        let interval_engine = self.clone();
        let send_engine = self.clone();

        crate::timers::run_poll_loop(
            &running,
            &queue,
            move || {
                let flags = interval_engine.shared.flags.lock().unwrap();
                if flags.heating {
                    config.intervals.temperature_target_set
                } else {
                    config.intervals.temperature_idle
                }
            },
            move || {
                let flags = send_engine.shared.flags.lock().unwrap();
                send_engine.state().is_operational()
                    && !flags.heating
                    && flags.dwelling_until.is_none()
                    && !flags.long_running_command
                    && !flags.temperature_autoreporting
            },
            || Command::text("M105").with_type("temperature_poll"),
        );
    }

    fn handle_line(&self, line: &str) {
        let event = {
            let flavor = self.shared.flavor.lock().unwrap();
            flavor.classify(line)
        };

        let Some(event) = event else {
            tracing::trace!(target: "reprap::wire", %line, "unrecognized line");
            return;
        };

        match event {
            FirmwareEvent::Ok { .. } => {
                self.handle_ack();
            }
            FirmwareEvent::Wait => {
                self.handle_ack();
            }
            FirmwareEvent::Busy { .. } => {
                self.shared.token.set();
                if !self.shared.busy_interval_sent.swap(true, Ordering::SeqCst) {
                    self.shared.busy_detected.store(true, Ordering::SeqCst);
                    let busy_timeout = self.shared.config.timeouts.communication_busy;
                    let interval = busy_timeout.saturating_sub(Duration::from_secs(1));
                    let command = {
                        let flavor = self.shared.flavor.lock().unwrap();
                        flavor.command_busy_protocol_interval(interval)
                    };
                    let _ = self.enqueue_raw(Command::text(command));
                } else {
                    self.shared.busy_detected.store(true, Ordering::SeqCst);
                }
            }
            FirmwareEvent::Resend { line_number } => {
                self.handle_resend_request(line_number);
            }
            FirmwareEvent::Start => {
                self.shared.queue.with_blocked(|entries| entries.clear());
                self.shared.queue.clear_resend();
                self.shared.token.clear_completely();
                self.shared.history.clear();
                *self.shared.flavor.lock().unwrap() = Box::new(GenericFlavor::default());
                self.shared.send_loop.reset_line_number(1);
                self.shared.timeout_consecutive.store(0, Ordering::SeqCst);
                self.shared.busy_detected.store(false, Ordering::SeqCst);
                self.shared.busy_interval_sent.store(false, Ordering::SeqCst);
                *self.shared.last_resend_line.lock().unwrap() = None;
                self.shared.token.set();
                let _ = self.enqueue_raw(Command::text("M110 N0"));
                let _ = self.enqueue_raw(Command::text("M115"));
            }
            FirmwareEvent::Error { message } => {
                self.handle_firmware_error(message);
            }
            FirmwareEvent::Echo { message } => {
                tracing::debug!(target: "reprap::wire", %message, "firmware echo");
            }
            FirmwareEvent::Capability { name, present } => {
                self.handle_capability(name, present);
            }
            FirmwareEvent::Temperature(tokens) => {
                let mut temps = self.shared.temperatures.lock().unwrap();
                for token in tokens {
                    let reading = match token.id.as_str() {
                        "B" => &mut temps.bed,
                        "C" => &mut temps.chamber,
                        other => {
                            let index: u32 = other.trim_start_matches('T').parse().unwrap_or(0);
                            temps.tool_mut(index)
                        }
                    };
                    reading.set_actual(token.actual);
                    if let Some(target) = token.target {
                        reading.set_target(target);
                    }
                }
            }
            FirmwareEvent::Position(values) => {
                self.handle_position(values);
            }
            FirmwareEvent::FirmwareInfo { fields } => {
                let name = fields.get("FIRMWARE_NAME").cloned().unwrap_or_default();
                if let Some(flavor) = bundled_flavors().into_iter().find(|f| f.identify(&name)) {
                    tracing::info!(target: "reprap::state", flavor = flavor.name(), "firmware identified");
                    *self.shared.flavor.lock().unwrap() = flavor;
                }
                self.shared
                    .state_machine
                    .transition_if(ProtocolState::Connecting, ProtocolState::Connected);
            }
            FirmwareEvent::ActionCommand { action } => {
                self.handle_action_command(&action);
            }
            FirmwareEvent::Unknown => {}
        }
    }

    /// Common `ok`/`wait` bookkeeping: per the Send Token's contract, every
    /// acknowledging event re-opens a slot for the send loop.
    fn handle_ack(&self) {
        self.shared.timeout_consecutive.store(0, Ordering::SeqCst);
        self.shared.busy_detected.store(false, Ordering::SeqCst);
        self.shared.busy_interval_sent.store(false, Ordering::SeqCst);
        *self.shared.last_resend_line.lock().unwrap() = None;
        *self.shared.last_communication_error.lock().unwrap() = None;
        self.shared.resend_echo_count.store(0, Ordering::SeqCst);

        if let Some(watchdog) = self.shared.resend_ok_watchdog.lock().unwrap().take() {
            watchdog.cancel();
        }

        {
            let mut flags = self.shared.flags.lock().unwrap();
            if flags.heating {
                flags.heating = false;
                flags.heating_start = None;
            }
            flags.long_running_command = false;
        }

        self.shared.token.set();
        self.shared
            .state_machine
            .transition_if(ProtocolState::Connecting, ProtocolState::Connected);
    }

    /// Validates and services a `Resend:`/`rs` request: ignores a spurious
    /// re-request of the line just sent, suppresses an echo of a resend
    /// already being handled, then either replays the line from Line
    /// History or cancels if it's unrecoverably gone.
    fn handle_resend_request(&self, line_number: u64) {
        let current = self.shared.send_loop.current_line_number();
        // A request for the line that will be assigned *next* (nothing with
        // that number has actually hit the wire yet) can't be a real resend.
        if line_number == current + 1 {
            tracing::debug!(target: "reprap::wire", line_number, "ignoring spurious resend of an unsent line");
            return;
        }

        {
            let mut last_error = self.shared.last_communication_error.lock().unwrap();
            if last_error.as_deref() == Some("linenumber") {
                let echoes = self.shared.resend_echo_count.fetch_add(1, Ordering::SeqCst) + 1;
                let gap = current.saturating_sub(line_number).saturating_sub(1);
                if u64::from(echoes) < gap {
                    tracing::debug!(target: "reprap::wire", line_number, "ignoring echoed resend request");
                    return;
                }
            }
            *last_error = Some("linenumber".to_string());
        }
        self.shared.resend_echo_count.store(0, Ordering::SeqCst);

        match send_loop::request_resend(&self.shared.history, &self.shared.queue, line_number) {
            Ok(()) => {
                *self.shared.last_resend_line.lock().unwrap() = Some(line_number);
                self.arm_resend_ok_policy();
            }
            Err(err) => {
                if self.state().is_busy() {
                    tracing::error!(target: "reprap::wire", error = %err, "resend for an unrecoverable line while busy; cancelling");
                    let _ = self.cancel();
                } else {
                    tracing::warn!(target: "reprap::wire", error = %err, "resend request could not be satisfied");
                }
            }
        }
    }

    /// Applies `trigger_ok_after_resend`: some firmwares never send a fresh
    /// `ok` after satisfying a resend (they already sent one for the
    /// original, rejected line), so the engine has to synthesize one either
    /// immediately or after a bounded wait.
    fn arm_resend_ok_policy(&self) {
        let policy = { self.shared.flavor.lock().unwrap().config().trigger_ok_after_resend };
        match policy {
            TriggerOkAfterResend::Always => {
                self.shared.token.set();
            }
            TriggerOkAfterResend::Detect => {
                let token = self.shared.token.clone();
                let watchdog = OneShot::start(self.shared.config.timeouts.resendok, move || {
                    token.set();
                });
                *self.shared.resend_ok_watchdog.lock().unwrap() = Some(watchdog);
            }
            TriggerOkAfterResend::Never => {}
        }
    }

    fn handle_capability(&self, name: String, present: bool) {
        {
            let mut flags = self.shared.flags.lock().unwrap();
            flags.capabilities.insert(name.clone(), present);
        }

        if !present {
            return;
        }

        match name.as_str() {
            "AUTOREPORT_TEMP" => {
                let interval = self.shared.config.intervals.temperature_autoreport;
                let command = {
                    let flavor = self.shared.flavor.lock().unwrap();
                    flavor.command_autoreport_temperature(interval)
                };
                let _ = self.enqueue_raw(Command::text(command));
            }
            "AUTOREPORT_SD_STATUS" => {
                let interval = self.shared.config.intervals.sd_status_autoreport;
                let command = {
                    let flavor = self.shared.flavor.lock().unwrap();
                    flavor.command_autoreport_sd_status(interval)
                };
                let _ = self.enqueue_raw(Command::text(command));
            }
            // The engine always fast-paths M112 outside the send queue
            // regardless of this capability, so there's nothing further to
            // flip on; recording it above is enough.
            "EMERGENCY_PARSER" => {}
            _ => {}
        }
    }

    fn handle_firmware_error(&self, message: String) {
        tracing::error!(target: "reprap::wire", %message, "firmware reported an error");

        let is_sd_error = message.to_ascii_lowercase().contains("sd");
        let disconnect =
            is_sd_error || matches!(self.shared.config.firmware_errors, FirmwareErrorPolicy::Disconnect);

        if disconnect {
            if self.shared.config.send_m112_on_error {
                self.write_emergency();
            }
            self.shared.state_machine.transition(ProtocolState::Error);
            self.shared.state_machine.transition(ProtocolState::Disconnected);
        } else if matches!(self.shared.config.firmware_errors, FirmwareErrorPolicy::Cancel) {
            if self.state().is_processing() || self.state() == ProtocolState::Paused {
                let _ = self.cancel();
            }
        } else {
            tracing::warn!(target: "reprap::state", %message, "ignoring firmware error per policy");
        }
    }

    fn handle_position(&self, values: Vec<(String, f32)>) {
        let mut position = self.shared.position.lock().unwrap();
        for (axis, value) in values {
            position.set(&axis, value);
        }
        let snapshot = position.clone();
        drop(position);

        if self.shared.capturing_pause.swap(false, Ordering::SeqCst) {
            if let Some(watchdog) = self.shared.position_log_watchdog.lock().unwrap().take() {
                watchdog.cancel();
            }
            *self.shared.pause_position.lock().unwrap() = Some(snapshot);
            self.shared
                .state_machine
                .transition_if(ProtocolState::Pausing, ProtocolState::Paused);
        } else if self.shared.capturing_cancel.swap(false, Ordering::SeqCst) {
            if let Some(watchdog) = self.shared.position_log_watchdog.lock().unwrap().take() {
                watchdog.cancel();
            }
            *self.shared.cancel_position.lock().unwrap() = Some(snapshot);
            self.shared
                .state_machine
                .transition_if(ProtocolState::Cancelling, ProtocolState::Connected);
        } else {
            self.shared
                .state_machine
                .transition_if(ProtocolState::Connecting, ProtocolState::Connected);
        }
    }

    fn handle_action_command(&self, action: &str) {
        tracing::info!(target: "reprap::state", %action, "firmware action command");
        match action {
            "cancel" => {
                let _ = self.cancel();
            }
            "pause" => {
                let _ = self.pause();
            }
            // `paused`/`resumed` just confirm a transition already driven
            // locally; there's no script-replay machinery in this engine to
            // suppress, so the transition itself is the whole handler.
            "paused" => {
                self.shared
                    .state_machine
                    .transition_if(ProtocolState::Pausing, ProtocolState::Paused);
            }
            "resume" => {
                let _ = self.resume();
            }
            "resumed" => {
                self.shared
                    .state_machine
                    .transition_if(ProtocolState::Resuming, ProtocolState::Processing);
            }
            "disconnect" => {
                self.shared.state_machine.transition(ProtocolState::Disconnected);
            }
            _ => {}
        }
    }

    /// Enqueues a command without routing it through the pipeline, for
    /// engine-internal bootstrap traffic (`M110`, `M115`) that shouldn't be
    /// tagged with job provenance or rewritten by heater-offset logic.
    fn enqueue_raw(&self, cmd: Command) -> Result<()> {
        self.shared.queue.put(QueueEntry::Command(cmd))
    }

    /// Runs `cmd` through the queuing/sending/sent pipeline phases and
    /// enqueues the result, or writes it immediately if it's an emergency
    /// command.
    pub fn enqueue_command(&self, cmd: Command) -> Result<()> {
        let outcome = {
            let flags = self.shared.flags.lock().unwrap();
            pipeline::run_queuing_phase(cmd, &flags)
        };

        match outcome {
            QueuingOutcome::Emergency => {
                self.write_emergency();
                self.shared.state_machine.transition(ProtocolState::Error);
                Ok(())
            }
            QueuingOutcome::Drop => Ok(()),
            QueuingOutcome::Commands(cmds) => {
                for cmd in cmds {
                    let cmd = {
                        let mut flags = self.shared.flags.lock().unwrap();
                        pipeline::run_sending_phase(cmd, &mut flags)
                    };

                    let reset = {
                        let mut flags = self.shared.flags.lock().unwrap();
                        flags.pending_line_reset.take()
                    };
                    if let Some(n) = reset {
                        self.shared.send_loop.reset_line_number(n + 1);
                        self.shared.history.clear();
                        self.shared.queue.clear_resend();
                    }

                    {
                        let mut flags = self.shared.flags.lock().unwrap();
                        let mut temps = self.shared.temperatures.lock().unwrap();
                        pipeline::run_sent_phase(&cmd, &mut flags, &mut temps);
                    }
                    self.shared.queue.put(QueueEntry::Command(cmd))?;
                }
                Ok(())
            }
        }
    }

    /// Parses and enqueues one line of G-code typed by a user or read from a
    /// job, tagged `source:file` when `from_job` is set.
    pub fn send_gcode(&self, line: &str, from_job: bool) -> Result<()> {
        let parsed = gcode::parse_line(line.as_bytes()).map_err(|_| EngineError::InvalidConfiguration {
            reason: format!("unparseable gcode line: {:?}", line),
        })?;

        let cmd = match parsed {
            Some(gcode_line) => Command::gcode(gcode_line),
            None => Command::text(line.to_string()),
        };

        let cmd = if from_job {
            cmd.with_tags(["source:file"])
        } else {
            cmd.with_tags(["source:user"])
        };

        self.enqueue_command(cmd)
    }

    /// Writes `M112` (or the flavor's equivalent) twice — once unnumbered,
    /// for firmwares that fast-path it outside normal line parsing, once
    /// numbered and checksummed through Line History so a firmware that
    /// insists on sequencing can still resend-recover it — then forces the
    /// heaters off. State transition is the caller's responsibility: a
    /// firmware-error-triggered emergency and a deliberate one unwind
    /// differently.
    fn write_emergency(&self) {
        let flavor_command = {
            let flavor = self.shared.flavor.lock().unwrap();
            flavor.command_emergency_stop()
        };

        {
            let mut transport = self.shared.transport.lock().unwrap();
            let _ = transport.write_all(format!("{}\n", flavor_command).as_bytes());
        }

        let framed = self.shared.send_loop.frame_and_record(&flavor_command);
        {
            let mut transport = self.shared.transport.lock().unwrap();
            let _ = transport.write_all(format!("{}\n", framed).as_bytes());
        }

        for zero in ["M104 S0", "M140 S0", "M141 S0"] {
            let mut transport = self.shared.transport.lock().unwrap();
            let _ = transport.write_all(format!("{}\n", zero).as_bytes());
        }

        tracing::error!(target: "reprap::state", "E_STOP");
    }

    pub fn subscribe(&self) -> ChangeReceiver {
        self.shared.state_machine.subscribe()
    }

    pub fn state(&self) -> ProtocolState {
        self.shared.state_machine.current()
    }

    pub fn temperatures(&self) -> TemperatureRecord {
        self.shared.temperatures.lock().unwrap().clone()
    }

    pub fn position(&self) -> PositionRecord {
        self.shared.position.lock().unwrap().clone()
    }

    /// Starts streaming `job`'s lines as `source:file` commands on a
    /// dedicated feeder thread. Takes an owned handle (`engine.clone()` at
    /// the call site) since the feeder thread needs its own `Arc` to outlive
    /// this call.
    pub fn start_job(self: Arc<Self>, job: Box<dyn Job>) -> Result<()> {
        if !self.state().is_operational() {
            return Err(EngineError::NotConnected);
        }

        self.shared.state_machine.transition(ProtocolState::Starting);
        self.shared.state_machine.transition(ProtocolState::Processing);

        let engine = self.clone();
        self.threads.lock().unwrap().push(
            thread::Builder::new()
                .name("reprap-job".into())
                .spawn(move || engine.job_feeder(job))
                .expect("spawn job feeder thread"),
        );
        Ok(())
    }

    fn job_feeder(self: Arc<Self>, mut job: Box<dyn Job>) {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return;
            }

            match self.state() {
                ProtocolState::Paused => {
                    thread::sleep(Duration::from_millis(100));
                    continue;
                }
                ProtocolState::Cancelling | ProtocolState::Error | ProtocolState::Disconnected => {
                    return;
                }
                _ => {}
            }

            match job.next_line() {
                Ok(Some(line)) => {
                    if let Err(err) = self.send_gcode(&line, true) {
                        tracing::warn!(target: "reprap::job", error = %err, "job line rejected");
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(target: "reprap::job", error = %err, "job read failed");
                    break;
                }
            }
        }

        self.shared
            .state_machine
            .transition_if(ProtocolState::Processing, ProtocolState::Finishing);

        while !self.shared.queue.is_empty() && self.running.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(50));
        }

        self.shared
            .state_machine
            .transition_if(ProtocolState::Finishing, ProtocolState::Connected);
    }

    /// Requests a pause. The transition to [`ProtocolState::Paused`] doesn't
    /// happen until the machine's position has been captured (or capture
    /// times out), so in-flight moves finish and the resume point is known.
    pub fn pause(&self) -> Result<()> {
        if !self
            .shared
            .state_machine
            .transition_if(ProtocolState::Processing, ProtocolState::Pausing)
        {
            return Ok(());
        }

        if !self.shared.config.log_position_on_pause {
            self.shared
                .state_machine
                .transition_if(ProtocolState::Pausing, ProtocolState::Paused);
            return Ok(());
        }

        self.arm_position_capture(
            &self.shared.capturing_pause,
            &self.shared.capturing_cancel,
            ProtocolState::Pausing,
            ProtocolState::Paused,
        );
        self.send_position_capture_commands()
    }

    /// Sends `finish_moving` + `get_position` and arms the watchdog that
    /// forces the pending transition through even if the `M114` reply never
    /// arrives. `other` is cleared because the two captures share one
    /// watchdog slot and are mutually exclusive.
    fn arm_position_capture(
        &self,
        flag: &Arc<AtomicBool>,
        other: &Arc<AtomicBool>,
        from: ProtocolState,
        to: ProtocolState,
    ) {
        other.store(false, Ordering::SeqCst);
        flag.store(true, Ordering::SeqCst);

        if let Some(old) = self.shared.position_log_watchdog.lock().unwrap().take() {
            old.cancel();
        }

        let state_machine = self.shared.state_machine.clone();
        let flag = flag.clone();
        let watchdog = OneShot::start(self.shared.config.timeouts.position_log_wait, move || {
            if flag.swap(false, Ordering::SeqCst) {
                state_machine.transition_if(from, to);
            }
        });
        *self.shared.position_log_watchdog.lock().unwrap() = Some(watchdog);
    }

    fn send_position_capture_commands(&self) -> Result<()> {
        let (finish, get_position) = {
            let flavor = self.shared.flavor.lock().unwrap();
            (flavor.command_finish_moving(), flavor.command_get_position())
        };
        self.enqueue_raw(Command::text(finish))?;
        self.enqueue_raw(Command::text(get_position))
    }

    pub fn resume(&self) -> Result<()> {
        if self
            .shared
            .state_machine
            .transition_if(ProtocolState::Paused, ProtocolState::Resuming)
        {
            self.shared
                .state_machine
                .transition_if(ProtocolState::Resuming, ProtocolState::Processing);
        }
        Ok(())
    }

    /// Abruptly drops all pending work. Grounded on the teacher's "abrupt
    /// cancellation clears the pending buffer and resets the send token"
    /// shutdown path, minus the async executor. Still captures the machine's
    /// final position before declaring itself recovered, same as `pause`.
    pub fn cancel(&self) -> Result<()> {
        let from = self.state();
        if !from.is_processing() && from != ProtocolState::Paused {
            return Ok(());
        }

        self.shared.state_machine.transition(ProtocolState::Cancelling);
        self.shared.queue.with_blocked(|entries| entries.clear());
        self.shared.queue.clear_resend();
        self.shared.token.clear_completely();
        self.shared.token.set();

        if self.shared.config.heatup_abortable {
            let heating = self.shared.flags.lock().unwrap().heating;
            if heating {
                let abort = { self.shared.flavor.lock().unwrap().command_abort_heatup() };
                let _ = self.enqueue_raw(Command::text(abort));
            }
        }

        if !self.shared.config.log_position_on_cancel {
            self.shared
                .state_machine
                .transition_if(ProtocolState::Cancelling, ProtocolState::Connected);
            return Ok(());
        }

        self.arm_position_capture(
            &self.shared.capturing_cancel,
            &self.shared.capturing_pause,
            ProtocolState::Cancelling,
            ProtocolState::Connected,
        );
        self.send_position_capture_commands()
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}
