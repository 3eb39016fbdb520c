use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Which telemetry characteristic a frame arrived on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Main,
    Compact,
}

/// How a frame reached us: pushed notification or active read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameSource {
    Notification,
    Poll,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RawFrame {
    pub channel: Channel,
    pub bytes: Vec<u8>,
    pub received_at: f64,
}

impl RawFrame {
    pub fn new(channel: Channel, bytes: Vec<u8>, received_at: f64) -> Self {
        Self {
            channel,
            bytes,
            received_at,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MainTelemetry {
    pub msg_type: u8,
    pub msg_subtype: u8,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub heading_deg: Option<f64>,
    pub pitch_deg: Option<f64>,
    pub heel_deg: Option<f64>,
    pub speed_mps: Option<f64>,
    pub native_cog_deg: Option<f64>,
    pub reserved: Vec<u8>,
    pub trailer: Vec<u8>,
    pub raw_len: usize,
}

impl MainTelemetry {
    pub fn position(&self) -> Option<(f64, f64)> {
        Some((self.latitude?, self.longitude?))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompactTelemetry {
    pub msg_type: u8,
    pub msg_subtype: u8,
    pub heading_deg: f64,
    /// Speed-like field whose fixed-point scale is not announced by the device.
    pub field_2: u16,
    pub raw_len: usize,
}

/// Two geographic points found inside a frame that could be a start line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LineSegmentCandidate {
    pub offset: usize,
    pub a_lat: f64,
    pub a_lon: f64,
    pub b_lat: f64,
    pub b_lon: f64,
    pub length_m: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub device_address: Option<String>,
    pub error: Option<String>,
}

impl ConnectionStatus {
    pub fn connected(address: &str) -> Self {
        Self {
            connected: true,
            device_address: Some(address.to_string()),
            error: None,
        }
    }

    pub fn disconnected(address: Option<&str>, error: Option<String>) -> Self {
        Self {
            connected: false,
            device_address: address.map(str::to_string),
            error,
        }
    }
}

/// Everything the link layer emits. Timestamps are receive time in seconds
/// since the unix epoch; the device has no clock of its own.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryEvent {
    Status {
        status: ConnectionStatus,
        received_at: f64,
    },
    TelemetryMain {
        telemetry: MainTelemetry,
        received_at: f64,
    },
    TelemetryCompact {
        telemetry: CompactTelemetry,
        received_at: f64,
    },
    StartLineCandidates {
        candidates: Vec<LineSegmentCandidate>,
        source: FrameSource,
        received_at: f64,
    },
}

impl TelemetryEvent {
    pub fn status(status: ConnectionStatus, received_at: f64) -> Self {
        TelemetryEvent::Status {
            status,
            received_at,
        }
    }

    pub fn received_at(&self) -> f64 {
        match self {
            TelemetryEvent::Status { received_at, .. }
            | TelemetryEvent::TelemetryMain { received_at, .. }
            | TelemetryEvent::TelemetryCompact { received_at, .. }
            | TelemetryEvent::StartLineCandidates { received_at, .. } => *received_at,
        }
    }

    pub fn is_telemetry(&self) -> bool {
        matches!(
            self,
            TelemetryEvent::TelemetryMain { .. } | TelemetryEvent::TelemetryCompact { .. }
        )
    }
}

/// Wall-clock seconds since the unix epoch.
pub fn current_timestamp() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
