use crate::ptp::PortState;
use crate::timestamp::PtpTimestamp;
use crate::traits::PortHandle;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Offset report a port hands to its clock after every Sync exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct MasterOffset {
    pub port: PortHandle,
    pub port_state: PortState,
    pub master_offset_ns: i64,
    pub master_time: PtpTimestamp,
    pub master_local_ppt: f64,
    pub local_system_offset_ns: i64,
    pub system_time: PtpTimestamp,
    pub local_system_ppt: f64,
    pub sync_count: u32,
    pub pdelay_count: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SyncStatus {
    pub offset_ns: i64,
    pub master_local_ppt: f64,
    pub local_system_ppt: f64,
    pub freq_adj_ppm: f64,
    pub gm_identity: Option<String>,
    pub port_state: Option<String>,
    pub sync_count: u32,
    pub pdelay_count: u32,
    pub updated_ts: u64,
}

impl Default for SyncStatus {
    fn default() -> Self {
        SyncStatus {
            offset_ns: 0,
            master_local_ppt: 0.0,
            local_system_ppt: 0.0,
            freq_adj_ppm: 0.0,
            gm_identity: None,
            port_state: None,
            sync_count: 0,
            pdelay_count: 0,
            updated_ts: 0,
        }
    }
}

impl SyncStatus {
    pub fn apply(&mut self, report: &MasterOffset) {
        self.offset_ns = report.master_offset_ns;
        self.master_local_ppt = report.master_local_ppt;
        self.local_system_ppt = report.local_system_ppt;
        self.port_state = Some(report.port_state.to_string());
        self.sync_count = report.sync_count;
        self.pdelay_count = report.pdelay_count;
        self.updated_ts = report.system_time.seconds;
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write status file {}", path.display()))
    }
}
