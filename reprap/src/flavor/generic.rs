use crate::dispatcher::{classify_common, parse_position_line, parse_temperature_line, FirmwareEvent};
use crate::flavor::{Flavor, FlavorConfig};

/// Fallback flavor used before firmware identification completes (or for
/// firmwares that don't match any bundled flavor's `identify`).
///
/// Only classifies the message shapes common to essentially every RepRap
/// firmware; temperature/position tags are inferred heuristically (`T`,
/// `T0`.."T7", `B`, `C`, `X`, `Y`, `Z`, `E`) rather than read from a
/// flavor-specific axis configuration.
pub struct GenericFlavor {
    config: FlavorConfig,
}

impl Default for GenericFlavor {
    fn default() -> Self {
        Self {
            config: FlavorConfig::default(),
        }
    }
}

const HEATER_IDS: &[&str] = &["T", "T0", "T1", "T2", "T3", "B", "C"];

impl Flavor for GenericFlavor {
    fn name(&self) -> &str {
        "generic"
    }

    fn config(&self) -> &FlavorConfig {
        &self.config
    }

    fn identify(&self, _firmware_name: &str) -> bool {
        false
    }

    fn classify(&self, line: &str) -> Option<FirmwareEvent> {
        if let Some(event) = classify_common(line) {
            return Some(event);
        }

        let trimmed = line.trim();
        if trimmed.starts_with('X') && trimmed.contains('Y') && trimmed.contains('Z') {
            let values = parse_position_line(trimmed);
            if !values.is_empty() {
                return Some(FirmwareEvent::Position(values));
            }
        }

        if HEATER_IDS.iter().any(|id| trimmed.starts_with(&format!("{}:", id))) {
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
    fn never_identifies() {
        assert!(!GenericFlavor::default().identify("FIRMWARE_NAME:anything"));
    }

    #[test]
    fn falls_back_to_common_classification() {
        let flavor = GenericFlavor::default();
        assert_eq!(flavor.classify("ok"), Some(FirmwareEvent::Ok { tail: None }));
    }
}
