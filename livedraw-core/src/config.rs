use crate::error::{DrawError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const MAX_SAMPLES_PLANNED: u32 = 1_000;

/// Per-round schedule, snapshotted when a round starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleConfig {
    pub samples_planned: u32,
    #[serde(rename = "previewOffset")]
    pub preview_offset_secs: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            samples_planned: 25,
            preview_offset_secs: 35,
        }
    }
}

impl ScheduleConfig {
    pub fn new(samples_planned: u32, preview_offset_secs: u32) -> Result<Self> {
        let config = Self {
            samples_planned,
            preview_offset_secs,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.samples_planned == 0 {
            return Err(DrawError::config("samplesPlanned must be at least 1"));
        }

        if self.samples_planned > MAX_SAMPLES_PLANNED {
            return Err(DrawError::config(format!(
                "samplesPlanned must not exceed {}",
                MAX_SAMPLES_PLANNED
            )));
        }

        if self.preview_offset_secs >= 60 {
            return Err(DrawError::config("previewOffset must be in [0, 60)"));
        }

        Ok(())
    }

    /// Seconds at the start of a round during which samples are drawn.
    pub fn sample_window_secs(&self) -> u32 {
        60u32.saturating_sub(self.preview_offset_secs).max(1)
    }

    /// Apply a partial update, returning the merged config if it is valid.
    pub fn merged(&self, update: &ConfigUpdate) -> Result<Self> {
        let merged = Self {
            samples_planned: update.samples_planned.unwrap_or(self.samples_planned),
            preview_offset_secs: update.preview_offset_secs.unwrap_or(self.preview_offset_secs),
        };
        merged.validate()?;
        Ok(merged)
    }
}

/// Administrative change request; absent fields keep their current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub samples_planned: Option<u32>,
    #[serde(default, rename = "previewOffset", skip_serializing_if = "Option::is_none")]
    pub preview_offset_secs: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub schedule: ScheduleConfig,
    pub heartbeat_interval: Duration,
    /// Per-observer outbound queue length.
    pub observer_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            schedule: ScheduleConfig::default(),
            heartbeat_interval: Duration::from_secs(30),
            observer_buffer: 64,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        self.schedule.validate()?;

        if self.heartbeat_interval.is_zero() {
            return Err(DrawError::config("Heartbeat interval must be greater than 0"));
        }

        if self.observer_buffer == 0 {
            return Err(DrawError::config("Observer buffer must be greater than 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_out_of_range_values() {
        assert!(ScheduleConfig::new(0, 10).is_err());
        assert!(ScheduleConfig::new(10, 60).is_err());
        assert!(ScheduleConfig::new(MAX_SAMPLES_PLANNED + 1, 10).is_err());
        assert!(ScheduleConfig::new(1, 0).is_ok());
        assert!(ScheduleConfig::new(25, 59).is_ok());
    }

    #[test]
    fn test_invalid_update_keeps_prior_config() {
        let config = ScheduleConfig::default();
        let update = ConfigUpdate {
            samples_planned: Some(40),
            preview_offset_secs: Some(75),
        };

        assert!(matches!(config.merged(&update), Err(DrawError::InvalidConfig(_))));
        assert_eq!(config, ScheduleConfig::default());
    }

    #[test]
    fn test_partial_update_merges() {
        let config = ScheduleConfig::default();
        let update: ConfigUpdate = serde_json::from_str(r#"{"previewOffset":10}"#).unwrap();

        let merged = config.merged(&update).unwrap();
        assert_eq!(merged.samples_planned, 25);
        assert_eq!(merged.preview_offset_secs, 10);
        assert_eq!(merged.sample_window_secs(), 50);
    }

    #[test]
    fn test_wire_names() {
        let json = serde_json::to_value(ScheduleConfig::default()).unwrap();
        assert_eq!(json["samplesPlanned"], 25);
        assert_eq!(json["previewOffset"], 35);
    }
}
