use crate::dispatcher::{classify_common, parse_position_line, parse_temperature_line, FirmwareEvent};
use crate::flavor::{Flavor, FlavorConfig};

const HEATER_IDS: &[&str] = &["T", "T0", "T1", "T2", "T3", "T4", "B", "C"];

/// Marlin and Marlin-derived (Prusa-Firmware) flavor.
///
/// Grounded on the Prusa i3 MK3S response shapes exercised by the teacher's
/// `prusa_i3_log_parsing` test: `ok T:21.8 /0.0 B:22.1 /0.0 T0:21.8 /0.0 ...`
/// temperature replies, `X:0.00 Y:0.00 Z:0.15 E:0.00 Count X: ...` position
/// replies, and `FIRMWARE_NAME:Prusa-Firmware ... based on Marlin` identity
/// strings.
pub struct MarlinFlavor {
    config: FlavorConfig,
}

impl Default for MarlinFlavor {
    fn default() -> Self {
        Self {
            config: FlavorConfig::default(),
        }
    }
}

impl Flavor for MarlinFlavor {
    fn name(&self) -> &str {
        "marlin"
    }

    fn config(&self) -> &FlavorConfig {
        &self.config
    }

    fn identify(&self, firmware_name: &str) -> bool {
        let lower = firmware_name.to_ascii_lowercase();
        lower.contains("marlin") || lower.contains("prusa")
    }

    fn classify(&self, line: &str) -> Option<FirmwareEvent> {
        if let Some(event) = classify_common(line) {
            return Some(event);
        }

        let trimmed = line.trim();

        if trimmed.starts_with("X:") {
            let values = parse_position_line(trimmed);
            if !values.is_empty() {
                return Some(FirmwareEvent::Position(values));
            }
        }

        if trimmed.starts_with("T:") || trimmed.starts_with("B:") {
            let tokens = parse_temperature_line(trimmed, HEATER_IDS);
            if !tokens.is_empty() {
                return Some(FirmwareEvent::Temperature(tokens));
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifies_prusa_firmware_based_on_marlin() {
        let flavor = MarlinFlavor::default();
        assert!(flavor.identify(
            "FIRMWARE_NAME:Prusa-Firmware 3.13.3 based on Marlin FIRMWARE_URL:https://github.com/prusa3d/Prusa-Firmware"
        ));
    }

    #[test]
    fn does_not_identify_unrelated_firmware() {
        let flavor = MarlinFlavor::default();
        assert!(!flavor.identify("FIRMWARE_NAME:RepRapFirmware"));
    }

    #[test]
    fn classifies_prusa_temperature_reply() {
        let flavor = MarlinFlavor::default();
        let event = flavor
            .classify("T:21.8 /0.0 B:22.1 /0.0 T0:21.8 /0.0 @:0 B@:0 P:0.0 A:25.3")
            .unwrap();
        match event {
            FirmwareEvent::Temperature(tokens) => assert_eq!(tokens.len(), 3),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn classifies_position_reply_ignoring_step_counts() {
        let flavor = MarlinFlavor::default();
        let event = flavor
            .classify("X:0.00 Y:0.00 Z:0.15 E:0.00 Count X: 0.00 Y:0.00 Z:0.15 E:0.00")
            .unwrap();
        match event {
            FirmwareEvent::Position(values) => assert_eq!(values.len(), 4),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
