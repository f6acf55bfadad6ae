use std::collections::HashMap;

/// A structured event produced by classifying one incoming line.
///
/// Plays the role of the teacher's `ResponseEvent` (see
/// `response_parser::ResponseEvent`), generalized with the additional
/// message kinds the full protocol needs: resend requests, the busy
/// keep-alive line, firmware reset (`start`), firmware identification, and
/// `//action:` commands.
#[derive(Clone, Debug, PartialEq)]
pub enum FirmwareEvent {
    Ok { tail: Option<String> },
    Wait,
    Busy { reason: Option<String> },
    Resend { line_number: u64 },
    Start,
    Error { message: String },
    Echo { message: String },
    Capability { name: String, present: bool },
    Temperature(Vec<TemperatureToken>),
    Position(Vec<(String, f32)>),
    FirmwareInfo { fields: HashMap<String, String> },
    ActionCommand { action: String },
    Unknown,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TemperatureToken {
    pub id: String,
    pub actual: f32,
    pub target: Option<f32>,
}

/// Runs the universal pre-classification checks that apply regardless of
/// firmware flavor: resend requests, busy keep-alives, and `ok`/`wait`
/// share a wire shape stable enough across RepRap firmwares that they don't
/// need to be flavor-specific, unlike temperature/position line shapes.
pub fn classify_common(line: &str) -> Option<FirmwareEvent> {
    let trimmed = line.trim();

    if trimmed.is_empty() {
        return None;
    }

    if trimmed == "start" {
        return Some(FirmwareEvent::Start);
    }

    if trimmed == "wait" {
        return Some(FirmwareEvent::Wait);
    }

    if let Some(rest) = trimmed
        .strip_prefix("Resend:")
        .or_else(|| trimmed.strip_prefix("rs"))
    {
        if let Ok(n) = rest.trim().parse::<u64>() {
            return Some(FirmwareEvent::Resend { line_number: n });
        }
    }

    if let Some(rest) = trimmed.strip_prefix("busy:") {
        return Some(FirmwareEvent::Busy {
            reason: Some(rest.trim().to_string()),
        });
    }
    if trimmed == "echo:busy processing" {
        return Some(FirmwareEvent::Busy { reason: None });
    }

    if let Some(rest) = trimmed.strip_prefix("//action:") {
        return Some(FirmwareEvent::ActionCommand {
            action: rest.trim().to_string(),
        });
    }

    if let Some(cap) = parse_capability_line(trimmed) {
        return Some(cap);
    }

    if let Some(rest) = trimmed.strip_prefix("echo:") {
        return Some(FirmwareEvent::Echo {
            message: rest.to_string(),
        });
    }

    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("ok") {
        let tail = trimmed[2..].trim_start();
        return Some(FirmwareEvent::Ok {
            tail: if tail.is_empty() {
                None
            } else {
                Some(tail.to_string())
            },
        });
    }

    if lower.starts_with("error") {
        let idx = trimmed.find(':').map(|i| i + 1).unwrap_or(trimmed.len());
        return Some(FirmwareEvent::Error {
            message: trimmed[idx..].trim().to_string(),
        });
    }

    if trimmed.starts_with("!!") {
        return Some(FirmwareEvent::Error {
            message: trimmed.trim_start_matches('!').trim().to_string(),
        });
    }

    if trimmed.starts_with("FIRMWARE_NAME:") {
        return Some(FirmwareEvent::FirmwareInfo {
            fields: parse_firmware_info(trimmed),
        });
    }

    None
}

fn parse_capability_line(line: &str) -> Option<FirmwareEvent> {
    let rest = line.strip_prefix("Cap:")?;
    let (name, flag) = rest.rsplit_once(':')?;
    let present = match flag {
        "1" => true,
        "0" => false,
        _ => return None,
    };
    Some(FirmwareEvent::Capability {
        name: name.to_string(),
        present,
    })
}

fn parse_firmware_info(line: &str) -> HashMap<String, String> {
    // Fields are space separated `KEY:value` pairs; values themselves may
    // contain no whitespace (RepRap M115 replies never quote them).
    let mut fields = HashMap::new();
    for token in line.split_whitespace() {
        if let Some((key, value)) = token.split_once(':') {
            fields.insert(key.to_string(), value.to_string());
        }
    }
    fields
}

/// Parses a run of `TAG:value[/target] ...` tokens into temperature
/// readings, the shape Marlin-family firmwares use for `M105` replies
/// (`T:205.0 /210.0 B:60.2 /60.0 T0:205.0 /210.0`).
///
/// Grounded on `response_parser::parse_response_line`'s tag/float/slash
/// scanning loop, simplified to plain string splitting since the engine
/// only needs to recognize the handful of axis-style tags declared by the
/// active flavor rather than arbitrary regex-governed float formats.
pub fn parse_temperature_line(line: &str, heater_ids: &[&str]) -> Vec<TemperatureToken> {
    let mut tokens = Vec::new();
    let mut rest = line;

    while !rest.is_empty() {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }

        let Some(colon) = rest.find(':') else { break };
        let tag = &rest[..colon];
        if !heater_ids.contains(&tag) {
            // Skip to the next whitespace-delimited token (e.g. `@:0`,
            // `P:0.0`) that isn't one of the configured heater ids.
            if let Some(space) = rest.find(char::is_whitespace) {
                rest = &rest[space..];
                continue;
            } else {
                break;
            }
        }

        rest = &rest[colon + 1..];
        let (actual, remainder) = take_number(rest);
        let Some(actual) = actual else { break };
        rest = remainder.trim_start();

        let mut target = None;
        if let Some(slash_rest) = rest.strip_prefix('/') {
            let (t, remainder) = take_number(slash_rest);
            target = t;
            rest = remainder;
        }

        tokens.push(TemperatureToken {
            id: tag.to_string(),
            actual,
            target,
        });
    }

    tokens
}

fn take_number(input: &str) -> (Option<f32>, &str) {
    let end = input
        .find(|c: char| c.is_whitespace())
        .unwrap_or(input.len());
    let (candidate, rest) = input.split_at(end);
    (candidate.parse::<f32>().ok(), rest)
}

/// Parses a `X:0.00 Y:0.00 Z:0.15 E:0.00 Count X: ...` position reply,
/// stopping at the `Count` step-count tail Marlin appends (and which this
/// engine has no use for).
pub fn parse_position_line(line: &str) -> Vec<(String, f32)> {
    let mut values = Vec::new();
    let mut rest = line;

    while !rest.is_empty() {
        rest = rest.trim_start();
        if rest.is_empty() || rest.starts_with("Count") {
            break;
        }

        let Some(colon) = rest.find(':') else { break };
        let tag = rest[..colon].to_string();
        rest = &rest[colon + 1..];
        let (value, remainder) = take_number(rest);
        rest = remainder;

        if let Some(value) = value {
            values.push((tag, value));
        } else {
            break;
        }
    }

    values
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_ok_with_tail() {
        assert_eq!(
            classify_common("ok T:20.1 /0.0"),
            Some(FirmwareEvent::Ok {
                tail: Some("T:20.1 /0.0".to_string())
            })
        );
        assert_eq!(classify_common("ok"), Some(FirmwareEvent::Ok { tail: None }));
    }

    #[test]
    fn classifies_resend_both_spellings() {
        assert_eq!(
            classify_common("Resend: 42"),
            Some(FirmwareEvent::Resend { line_number: 42 })
        );
        assert_eq!(
            classify_common("rs 42"),
            Some(FirmwareEvent::Resend { line_number: 42 })
        );
    }

    #[test]
    fn classifies_capability_lines() {
        assert_eq!(
            classify_common("Cap:AUTOREPORT_POSITION:1"),
            Some(FirmwareEvent::Capability {
                name: "AUTOREPORT_POSITION".to_string(),
                present: true
            })
        );
    }

    #[test]
    fn classifies_busy_line() {
        assert_eq!(
            classify_common("busy: processing"),
            Some(FirmwareEvent::Busy {
                reason: Some("processing".to_string())
            })
        );
    }

    #[test]
    fn parses_temperature_with_targets() {
        let tokens = parse_temperature_line(
            "T:21.8 /0.0 B:22.1 /0.0 T0:21.8 /0.0 @:0 B@:0 P:0.0 A:25.3",
            &["T", "B", "T0"],
        );
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens[0].id, "T");
        assert_eq!(tokens[0].actual, 21.8);
        assert_eq!(tokens[0].target, Some(0.0));
    }

    #[test]
    fn parses_position_stopping_at_count() {
        let values =
            parse_position_line("X:0.00 Y:0.00 Z:0.15 E:0.00 Count X: 0.00 Y:0.00 Z:0.15 E:0.00");
        assert_eq!(
            values,
            vec![
                ("X".to_string(), 0.0),
                ("Y".to_string(), 0.0),
                ("Z".to_string(), 0.15),
                ("E".to_string(), 0.0),
            ]
        );
    }

    #[test]
    fn parses_firmware_info_fields() {
        let fields = parse_firmware_info(
            "FIRMWARE_NAME:Prusa-Firmware 3.13.3 based on Marlin PROTOCOL_VERSION:1.0",
        );
        assert_eq!(fields.get("PROTOCOL_VERSION").map(String::as_str), Some("1.0"));
        assert!(fields.contains_key("FIRMWARE_NAME"));
    }
}
