use std::collections::HashSet;
use std::time::Duration;

use crate::config::{ChecksumPolicy, TriggerOkAfterResend};
use crate::dispatcher::FirmwareEvent;

/// Overridable per-firmware behavior knobs, layered as a diff over a
/// preset the same way [`crate::config::EngineConfig`] is.
#[derive(Clone, Debug)]
pub struct FlavorConfig {
    pub send_checksum: ChecksumPolicy,
    pub trigger_ok_after_resend: TriggerOkAfterResend,
    pub unknown_requires_ack: bool,
    pub unknown_with_checksum: bool,
    pub block_while_dwelling: bool,
    pub heatup_abortable: bool,
    pub detect_external_heatups: bool,
    pub shared_nozzle: bool,

    pub blocked_commands: HashSet<(char, i64)>,
    pub checksum_requiring_commands: HashSet<(char, i64)>,
    pub long_running_commands: HashSet<(char, i64)>,
    pub asynchronous_commands: HashSet<(char, i64)>,
    pub pausing_commands: HashSet<(char, i64)>,
    pub emergency_commands: HashSet<(char, i64)>,
}

/// Sparse diff applied on top of a preset [`FlavorConfig`] by
/// [`FlavorConfig::with_overrides`], the same diff-over-preset shape
/// [`crate::config::EngineConfig`] uses for its own TOML overrides —
/// unset fields here leave the preset's value untouched.
#[derive(Clone, Debug, Default)]
pub struct FlavorConfigOverrides {
    pub send_checksum: Option<ChecksumPolicy>,
    pub trigger_ok_after_resend: Option<TriggerOkAfterResend>,
    pub unknown_requires_ack: Option<bool>,
    pub unknown_with_checksum: Option<bool>,
    pub block_while_dwelling: Option<bool>,
    pub heatup_abortable: Option<bool>,
    pub detect_external_heatups: Option<bool>,
    pub shared_nozzle: Option<bool>,
}

impl FlavorConfig {
    pub fn with_overrides(&self, overrides: &FlavorConfigOverrides) -> FlavorConfig {
        let mut config = self.clone();
        if let Some(v) = overrides.send_checksum {
            config.send_checksum = v;
        }
        if let Some(v) = overrides.trigger_ok_after_resend {
            config.trigger_ok_after_resend = v;
        }
        if let Some(v) = overrides.unknown_requires_ack {
            config.unknown_requires_ack = v;
        }
        if let Some(v) = overrides.unknown_with_checksum {
            config.unknown_with_checksum = v;
        }
        if let Some(v) = overrides.block_while_dwelling {
            config.block_while_dwelling = v;
        }
        if let Some(v) = overrides.heatup_abortable {
            config.heatup_abortable = v;
        }
        if let Some(v) = overrides.detect_external_heatups {
            config.detect_external_heatups = v;
        }
        if let Some(v) = overrides.shared_nozzle {
            config.shared_nozzle = v;
        }
        config
    }
}

impl Default for FlavorConfig {
    fn default() -> Self {
        Self {
            send_checksum: ChecksumPolicy::Printing,
            trigger_ok_after_resend: TriggerOkAfterResend::Detect,
            unknown_requires_ack: true,
            unknown_with_checksum: false,
            block_while_dwelling: true,
            heatup_abortable: true,
            detect_external_heatups: true,
            shared_nozzle: false,
            blocked_commands: HashSet::new(),
            checksum_requiring_commands: [('M', 110), ('M', 112)].into_iter().collect(),
            long_running_commands: [('M', 109), ('M', 190), ('M', 191), ('G', 28), ('G', 29)]
                .into_iter()
                .collect(),
            asynchronous_commands: [('M', 105), ('M', 114), ('M', 115)].into_iter().collect(),
            pausing_commands: [('M', 0), ('M', 1), ('M', 25)].into_iter().collect(),
            emergency_commands: [('M', 112), ('M', 108), ('M', 410)].into_iter().collect(),
        }
    }
}

/// Capability object providing command literals, response classification,
/// and configuration overrides for one firmware family.
///
/// Grounded on the diff-over-preset shape of the teacher's
/// `MachineConfigContainer` (generalized from "one machine's config diff"
/// to "one firmware family's behavior diff") and on the regex-driven
/// classification in `response_parser::parse_response_line`, adapted to a
/// `&self` trait so additional firmwares can be plugged in without touching
/// the dispatcher.
pub trait Flavor: Send + Sync {
    fn name(&self) -> &str;

    fn config(&self) -> &FlavorConfig;

    /// Attempts to identify this flavor from an `M115` firmware-info reply.
    /// Returns true if this flavor should be selected.
    fn identify(&self, firmware_name: &str) -> bool;

    fn command_hello(&self) -> String {
        "M110 N0".to_string()
    }

    fn command_set_line(&self, n: u64) -> String {
        format!("M110 N{}", n)
    }

    fn command_get_firmware_info(&self) -> String {
        "M115".to_string()
    }

    fn command_get_position(&self) -> String {
        "M114".to_string()
    }

    fn command_finish_moving(&self) -> String {
        "M400".to_string()
    }

    fn command_emergency_stop(&self) -> String {
        "M112".to_string()
    }

    fn command_abort_heatup(&self) -> String {
        "M108".to_string()
    }

    fn command_autoreport_temperature(&self, interval: Duration) -> String {
        format!("M155 S{}", interval.as_secs())
    }

    fn command_autoreport_sd_status(&self, interval: Duration) -> String {
        format!("M27 S{}", interval.as_secs())
    }

    fn command_busy_protocol_interval(&self, interval: Duration) -> String {
        format!("M113 S{}", interval.as_secs())
    }

    fn command_set_extruder_temp(&self, target: f32, wait: bool) -> String {
        format!("M{} S{:.2}", if wait { 109 } else { 104 }, target)
    }

    fn command_set_bed_temp(&self, target: f32, wait: bool) -> String {
        format!("M{} S{:.2}", if wait { 190 } else { 140 }, target)
    }

    fn command_set_chamber_temp(&self, target: f32, wait: bool) -> String {
        format!("M{} S{:.2}", if wait { 191 } else { 141 }, target)
    }

    /// Classifies one already line-framed, stripped response line.
    fn classify(&self, line: &str) -> Option<FirmwareEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_overrides_replaces_only_named_fields() {
        let preset = FlavorConfig::default();
        let overrides = FlavorConfigOverrides {
            shared_nozzle: Some(true),
            ..Default::default()
        };

        let derived = preset.with_overrides(&overrides);
        assert!(derived.shared_nozzle);
        assert_eq!(derived.send_checksum, preset.send_checksum);
    }
}

pub mod generic;
pub mod marlin;

pub use generic::GenericFlavor;
pub use marlin::MarlinFlavor;

/// Returns the bundled flavors in identification-attempt order. The first
/// whose `identify` returns true on a firmware-info reply is selected;
/// `GenericFlavor` never identifies and is used only as the connect-time
/// fallback.
pub fn bundled_flavors() -> Vec<Box<dyn Flavor>> {
    vec![Box::new(MarlinFlavor::default())]
}
