use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::command::{Command, CommandBody};
use crate::temperature::TemperatureRecord;

/// Mutable protocol flags the pipeline phases read and update as commands
/// pass through them. Owned by the engine and handed to each phase call by
/// mutable reference; kept as one small struct (rather than scattered
/// fields threaded individually) because most handlers touch more than one
/// of them together (e.g. `M109` sets both `heating` and
/// `long_running_command`).
#[derive(Default)]
pub struct PipelineFlags {
    pub current_tool: u32,
    pub current_f: Option<f32>,
    pub current_z: Option<f32>,
    pub dwelling_until: Option<Instant>,
    pub heating: bool,
    pub heating_start: Option<Instant>,
    pub long_running_command: bool,
    pub temperature_autoreporting: bool,
    pub sd_status_autoreporting: bool,
    /// Per-heater offsets applied only to `source:file` commands, so the
    /// command as displayed to a user (the queued copy) keeps the
    /// original, un-offset target.
    pub temperature_offsets: HashMap<char, f32>,
    /// Whether the machine profile has a heated bed; `M140`/`M190` are
    /// dropped in the queuing phase when this is false. Seeded from
    /// `EngineConfig::has_heated_bed` at connect time.
    pub has_heated_bed: bool,
    /// `M110 N<k>` seen in the `sending` phase: the engine must reset the
    /// send loop's line counter and Line History to `k`. `pipeline.rs` has
    /// no handle on either, so it surfaces the request here instead of
    /// acting on it directly.
    pub pending_line_reset: Option<u64>,
    /// `Cap:<NAME>:<0|1>` lines seen so far, keyed by capability name.
    pub capabilities: HashMap<String, bool>,
}

impl PipelineFlags {
    /// Seeds the flags that come from static machine configuration rather
    /// than starting at their zero value, since `#[derive(Default)]` would
    /// otherwise leave `has_heated_bed` false.
    pub fn with_heated_bed(has_heated_bed: bool) -> Self {
        Self {
            has_heated_bed,
            ..Default::default()
        }
    }
}

/// Outcome of running the `queuing` phase, the only phase allowed to expand
/// one command into several.
pub enum QueuingOutcome {
    Commands(Vec<Command>),
    Drop,
    /// `M112` and friends: emergency commands bypass the queue and are
    /// written directly by the caller; the pipeline only flags this so the
    /// engine knows not to enqueue the original.
    Emergency,
}

/// Phase 1 of 4: `queuing`. Runs once, as a command is first accepted.
pub fn run_queuing_phase(cmd: Command, flags: &PipelineFlags) -> QueuingOutcome {
    match cmd.body.gcode_code() {
        Some(('M', 112)) => return QueuingOutcome::Emergency,
        Some(('M', 140)) | Some(('M', 190)) if !flags.has_heated_bed => {
            return QueuingOutcome::Drop;
        }
        _ => {}
    }

    QueuingOutcome::Commands(vec![cmd])
}

/// Phase 3 of 4: `sending`, immediately before the line is written.
///
/// Rewrites at most the command it was given (multi-expansion here is a
/// pipeline misuse by definition, so `sending` always returns exactly one
/// command).
pub fn run_sending_phase(mut cmd: Command, flags: &mut PipelineFlags) -> Command {
    let Some((group, code)) = cmd.body.gcode_code() else {
        return cmd;
    };

    if group != 'M' {
        return cmd;
    }

    if code == 110 {
        if let CommandBody::Gcode(line) = &cmd.body {
            if let Some(n) = line.param_f32('N') {
                flags.pending_line_reset = Some(n as u64);
            }
        }
        return cmd;
    }

    let heater_key = match code {
        104 | 109 => 'T',
        140 | 190 => 'B',
        141 | 191 => 'C',
        _ => {
            if code == 155 || code == 27 {
                apply_autoreport_toggle(&mut cmd, code, flags);
            }
            return cmd;
        }
    };

    // Only file-sourced commands get the per-heater offset; user-issued
    // commands (the "set temp" button) should do exactly what was asked.
    if !cmd.has_tag("source:file") {
        return cmd;
    }

    let offset = match flags.temperature_offsets.get(&heater_key) {
        Some(v) if *v != 0.0 => *v,
        _ => return cmd,
    };

    if let CommandBody::Gcode(line) = &cmd.body {
        if let Some(target) = line.param_f32('S') {
            let rewritten = format!(
                "{} S{:.2}",
                line.command().to_string(),
                target + offset
            );
            cmd.body = CommandBody::Text(rewritten);
        }
    }

    cmd
}

fn apply_autoreport_toggle(cmd: &mut Command, code: i64, flags: &mut PipelineFlags) {
    let enabled = if let CommandBody::Gcode(line) = &cmd.body {
        line.param_f32('S').map(|v| v > 0.0).unwrap_or(false)
    } else {
        false
    };

    match code {
        155 => flags.temperature_autoreporting = enabled,
        27 => flags.sd_status_autoreporting = enabled,
        _ => {}
    }
}

/// Phase 4 of 4: `sent`, run immediately after the line has been written
/// and acknowledged by the send loop's bookkeeping (not by the firmware —
/// `sent` fires on write, `ok` handling is a receive-side concern).
pub fn run_sent_phase(cmd: &Command, flags: &mut PipelineFlags, temperatures: &mut TemperatureRecord) {
    let Some((group, code)) = cmd.body.gcode_code() else {
        return;
    };

    match (group, code) {
        ('M', 104) | ('M', 109) => {
            if let CommandBody::Gcode(line) = &cmd.body {
                if let Some(target) = line.param_f32('S') {
                    temperatures.tool_mut(flags.current_tool).set_target(target);
                }
            }
            if code == 109 {
                flags.heating = true;
                flags.long_running_command = true;
                flags.heating_start = Some(Instant::now());
            }
        }
        ('M', 140) | ('M', 190) => {
            if let CommandBody::Gcode(line) = &cmd.body {
                if let Some(target) = line.param_f32('S') {
                    temperatures.bed.set_target(target);
                }
            }
            if code == 190 {
                flags.heating = true;
                flags.long_running_command = true;
                flags.heating_start = Some(Instant::now());
            }
        }
        ('M', 141) | ('M', 191) => {
            if let CommandBody::Gcode(line) = &cmd.body {
                if let Some(target) = line.param_f32('S') {
                    temperatures.chamber.set_target(target);
                }
            }
            if code == 191 {
                flags.heating = true;
                flags.long_running_command = true;
                flags.heating_start = Some(Instant::now());
            }
        }
        ('G', 0) | ('G', 1) | ('G', 2) | ('G', 3) | ('G', 28) => {
            if let CommandBody::Gcode(line) = &cmd.body {
                if let Some(z) = line.param_f32('Z') {
                    flags.current_z = Some(z);
                }
                if let Some(f) = line.param_f32('F') {
                    flags.current_f = Some(f);
                }
            }
        }
        ('T', n) => {
            flags.current_tool = n.max(0) as u32;
        }
        ('G', 4) => {
            if let CommandBody::Gcode(line) = &cmd.body {
                let dwell = line
                    .param_f32('P')
                    .map(|ms| Duration::from_millis(ms as u64))
                    .or_else(|| line.param_f32('S').map(Duration::from_secs_f32));
                if let Some(dwell) = dwell {
                    flags.dwelling_until = Some(Instant::now() + dwell);
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gcode_command(text: &str) -> Command {
        let line = gcode::parse_line(text.as_bytes()).unwrap().unwrap();
        Command::gcode(line)
    }

    #[test]
    fn m112_is_flagged_as_emergency_not_queued() {
        let flags = PipelineFlags::default();
        let outcome = run_queuing_phase(gcode_command("M112"), &flags);
        assert!(matches!(outcome, QueuingOutcome::Emergency));
    }

    #[test]
    fn m140_is_dropped_when_the_profile_has_no_heated_bed() {
        let flags = PipelineFlags::with_heated_bed(false);
        let outcome = run_queuing_phase(gcode_command("M140 S60"), &flags);
        assert!(matches!(outcome, QueuingOutcome::Drop));
    }

    #[test]
    fn m140_is_queued_normally_when_the_profile_has_a_heated_bed() {
        let flags = PipelineFlags::with_heated_bed(true);
        let outcome = run_queuing_phase(gcode_command("M140 S60"), &flags);
        assert!(matches!(outcome, QueuingOutcome::Commands(_)));
    }

    #[test]
    fn sending_phase_surfaces_an_m110_line_reset() {
        let mut flags = PipelineFlags::default();
        let cmd = gcode_command("M110 N45");
        let rewritten = run_sending_phase(cmd, &mut flags);
        assert_eq!(rewritten.body.to_line(), "M110 N45");
        assert_eq!(flags.pending_line_reset, Some(45));
    }

    #[test]
    fn sending_phase_offsets_file_sourced_heater_commands() {
        let mut flags = PipelineFlags::default();
        flags.temperature_offsets.insert('T', 5.0);

        let cmd = gcode_command("M104 S200").with_tags(["source:file"]);
        let rewritten = run_sending_phase(cmd, &mut flags);
        assert_eq!(rewritten.body.to_line(), "M104 S205.00");
    }

    #[test]
    fn sending_phase_leaves_user_issued_commands_alone() {
        let mut flags = PipelineFlags::default();
        flags.temperature_offsets.insert('T', 5.0);

        let cmd = gcode_command("M104 S200");
        let rewritten = run_sending_phase(cmd, &mut flags);
        assert_eq!(rewritten.body.to_line(), "M104 S200");
    }

    #[test]
    fn sent_phase_updates_target_temperature_and_heating_flag() {
        let mut flags = PipelineFlags::default();
        let mut temps = TemperatureRecord::default();
        let cmd = gcode_command("M109 S210");

        run_sent_phase(&cmd, &mut flags, &mut temps);

        assert_eq!(temps.tools[&0].target, Some(210.0));
        assert!(flags.heating);
        assert!(flags.long_running_command);
    }

    #[test]
    fn sent_phase_tracks_tool_change_and_dwell() {
        let mut flags = PipelineFlags::default();
        let mut temps = TemperatureRecord::default();

        run_sent_phase(&gcode_command("T1"), &mut flags, &mut temps);
        assert_eq!(flags.current_tool, 1);

        run_sent_phase(&gcode_command("G4 P250"), &mut flags, &mut temps);
        assert!(flags.dwelling_until.is_some());
    }
}
