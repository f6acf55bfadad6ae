use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumPolicy {
    Always,
    Printing,
    Never,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOkAfterResend {
    Always,
    Detect,
    Never,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirmwareErrorPolicy {
    Disconnect,
    Cancel,
    Ignore,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Intervals {
    pub temperature_idle: Duration,
    pub temperature_target_set: Duration,
    pub temperature_autoreport: Duration,
    pub sd_status: Duration,
    pub sd_status_autoreport: Duration,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            temperature_idle: Duration::from_secs(5),
            temperature_target_set: Duration::from_secs(2),
            temperature_autoreport: Duration::from_secs(2),
            sd_status: Duration::from_secs(5),
            sd_status_autoreport: Duration::from_secs(2),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub communication: Duration,
    pub communication_busy: Duration,
    pub connection: Duration,
    pub detection: Duration,
    pub position_log_wait: Duration,
    pub resendok: Duration,
    pub baudrate_detection_pause: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            communication: Duration::from_secs(30),
            communication_busy: Duration::from_secs(2),
            connection: Duration::from_secs(10),
            detection: Duration::from_secs(1),
            position_log_wait: Duration::from_secs(10),
            resendok: Duration::from_millis(500),
            baudrate_detection_pause: Duration::from_millis(500),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MaxConsecutiveTimeouts {
    pub idle: u32,
    pub printing: u32,
    pub long: u32,
}

/// Layered configuration for the engine.
///
/// Loaded as a diff applied on top of [`EngineConfig::default`] the same way
/// a [`crate::flavor::Flavor`] override map is applied on top of a preset:
/// `merge_overrides` never removes a field, it only replaces the ones the
/// caller names.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub send_checksum: ChecksumPolicy,
    pub trigger_ok_after_resend: TriggerOkAfterResend,
    pub unknown_requires_ack: bool,
    pub unknown_with_checksum: bool,
    pub detect_external_heatups: bool,
    pub block_while_dwelling: bool,
    pub heatup_abortable: bool,
    pub firmware_errors: FirmwareErrorPolicy,
    pub send_m112_on_error: bool,
    pub log_position_on_pause: bool,
    pub log_position_on_cancel: bool,
    /// Whether the machine profile has a heated bed; `M140`/`M190` are
    /// dropped in the queuing phase when this is false.
    pub has_heated_bed: bool,
    pub intervals: Intervals,
    pub timeouts: Timeouts,
    pub max_consecutive_timeouts: MaxConsecutiveTimeouts,
    pub line_history_capacity: usize,
    pub send_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            send_checksum: ChecksumPolicy::Printing,
            trigger_ok_after_resend: TriggerOkAfterResend::Detect,
            unknown_requires_ack: true,
            unknown_with_checksum: false,
            detect_external_heatups: true,
            block_while_dwelling: true,
            heatup_abortable: true,
            firmware_errors: FirmwareErrorPolicy::Disconnect,
            send_m112_on_error: true,
            log_position_on_pause: true,
            log_position_on_cancel: true,
            has_heated_bed: true,
            intervals: Intervals::default(),
            timeouts: Timeouts::default(),
            max_consecutive_timeouts: MaxConsecutiveTimeouts {
                idle: 0,
                printing: 10,
                long: 1,
            },
            line_history_capacity: 50,
            send_queue_capacity: 10,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(data: &str) -> Result<Self> {
        let preset = Self::default();
        let diff: EngineConfig =
            toml::from_str(data).map_err(|e| EngineError::InvalidConfiguration {
                reason: e.to_string(),
            })?;
        let _ = &preset;
        Ok(diff)
    }
}
