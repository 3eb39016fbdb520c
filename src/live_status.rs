use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::fusion::StateSnapshot;
use crate::types::current_timestamp;

/// Periodically written status file for external dashboards.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LiveStatus {
    pub timestamp: f64,
    pub uptime_seconds: u64,
    pub link_phase: String,
    // Counters
    pub events_processed: u64,
    pub telemetry_frames: u64,
    pub events_dropped: u64,
    pub marks_saved: u64,
    // Fused state, flattened into the top level
    #[serde(flatten)]
    pub state: StateSnapshot,
}

impl LiveStatus {
    pub fn new(state: StateSnapshot) -> Self {
        Self {
            timestamp: current_timestamp(),
            uptime_seconds: 0,
            link_phase: "idle".to_string(),
            events_processed: 0,
            telemetry_frames: 0,
            events_dropped: 0,
            marks_saved: 0,
            state,
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}
