use std::collections::HashMap;

/// One heater's actual/target pair. Setting one field preserves the other,
/// since the firmware reports them on independent lines (`M105` replies vs.
/// a fresh `M104 S<target>` echo).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct HeaterReading {
    pub actual: Option<f32>,
    pub target: Option<f32>,
}

impl HeaterReading {
    pub fn set_actual(&mut self, actual: f32) {
        self.actual = Some(actual);
    }

    pub fn set_target(&mut self, target: f32) {
        self.target = Some(target);
    }
}

#[derive(Clone, Debug, Default)]
pub struct TemperatureRecord {
    pub tools: HashMap<u32, HeaterReading>,
    pub bed: HeaterReading,
    pub chamber: HeaterReading,
}

impl TemperatureRecord {
    pub fn tool_mut(&mut self, index: u32) -> &mut HeaterReading {
        self.tools.entry(index).or_default()
    }

    /// Replicates the current tool's reading to every tool slot missing an
    /// explicit value. Used for `shared_nozzle` profiles where the firmware
    /// only reports a bare `T:` value for whichever tool is active.
    pub fn propagate_shared_nozzle(&mut self, current_tool: u32, reading: HeaterReading) {
        self.tools.insert(current_tool, reading);
        let known_tools: Vec<u32> = self.tools.keys().copied().collect();
        for tool in known_tools {
            if tool == current_tool {
                continue;
            }
            let slot = self.tools.get_mut(&tool).unwrap();
            if slot.actual.is_none() {
                slot.actual = reading.actual;
            }
            if slot.target.is_none() {
                slot.target = reading.target;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_updates_preserve_other_field() {
        let mut reading = HeaterReading::default();
        reading.set_target(210.0);
        reading.set_actual(25.0);
        assert_eq!(reading.target, Some(210.0));
        reading.set_actual(30.0);
        assert_eq!(reading.target, Some(210.0));
        assert_eq!(reading.actual, Some(30.0));
    }

    #[test]
    fn shared_nozzle_fills_missing_slots_only() {
        let mut record = TemperatureRecord::default();
        record.tool_mut(1).set_actual(50.0);

        record.propagate_shared_nozzle(
            0,
            HeaterReading {
                actual: Some(200.0),
                target: Some(210.0),
            },
        );

        assert_eq!(record.tools[&0].actual, Some(200.0));
        // Tool 1 already had an actual reading; only the missing target is filled.
        assert_eq!(record.tools[&1].actual, Some(50.0));
        assert_eq!(record.tools[&1].target, Some(210.0));
    }
}
