use crate::message::AnnounceDataset;
use crate::ptp::{ClockIdentity, ClockQuality};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GptpConfig {
    pub clock: ClockConfig,
    pub port: PortConfig,
    pub servo: ServoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub priority1: u8,
    pub priority2: u8,
    pub clock_class: u8,
    pub clock_accuracy: u8,
    pub offset_scaled_log_variance: u16,
    pub time_source: u8,
    pub current_utc_offset: i16,
    /// Discipline the system clock from the grandmaster.
    pub syntonize: bool,
    pub step_threshold_ns: i64,
    pub stepping_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    pub force_slave: bool,
    pub log_sync_interval: i8,
    pub log_announce_interval: i8,
    pub log_pdelay_interval: i8,
    pub announce_receipt_timeout_multiplier: u32,
    pub sync_receipt_timeout_multiplier: u32,
    pub pdelay_resp_receipt_timeout_multiplier: u32,
    pub neighbor_prop_delay_thresh_ns: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServoConfig {
    pub kp: f64,
    pub ki: f64,
    pub max_freq_adj_ppm: f64,
    pub max_integral_ppm: f64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        let quality = ClockQuality::default();
        ClockConfig {
            priority1: 248,
            priority2: 248,
            clock_class: quality.clock_class,
            clock_accuracy: quality.clock_accuracy,
            offset_scaled_log_variance: quality.offset_scaled_log_variance,
            time_source: 0xA0, // internal oscillator
            current_utc_offset: 37,
            syntonize: false,
            step_threshold_ns: 5_000_000, // 5ms
            stepping_enabled: true,
        }
    }
}

impl Default for PortConfig {
    fn default() -> Self {
        PortConfig {
            force_slave: false,
            log_sync_interval: -3,
            log_announce_interval: 0,
            log_pdelay_interval: 0,
            announce_receipt_timeout_multiplier: 3,
            sync_receipt_timeout_multiplier: 3,
            pdelay_resp_receipt_timeout_multiplier: 3,
            neighbor_prop_delay_thresh_ns: 800,
        }
    }
}

impl Default for ServoConfig {
    fn default() -> Self {
        ServoConfig {
            kp: 0.0005,
            ki: 0.00005,
            max_freq_adj_ppm: 250.0,
            max_integral_ppm: 100.0,
        }
    }
}

impl ClockConfig {
    pub fn quality(&self) -> ClockQuality {
        ClockQuality {
            clock_class: self.clock_class,
            clock_accuracy: self.clock_accuracy,
            offset_scaled_log_variance: self.offset_scaled_log_variance,
        }
    }

    pub fn dataset(&self, identity: ClockIdentity) -> AnnounceDataset {
        AnnounceDataset {
            priority1: self.priority1,
            clock_quality: self.quality(),
            priority2: self.priority2,
            grandmaster_identity: identity,
            steps_removed: 0,
            time_source: self.time_source,
            current_utc_offset: self.current_utc_offset,
        }
    }
}

impl GptpConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: GptpConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }
}
