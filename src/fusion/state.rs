use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::scale::SpeedScale;
use crate::marks::{MarkSource, MarkTarget, RaceMarks};
use crate::types::ConnectionStatus;

/// A position fix with its receive time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Fix {
    pub at: f64,
    pub lat: f64,
    pub lon: f64,
}

/// Everything the fusion engine knows. Owned by the engine; consumers read
/// it through [`StateSnapshot`].
#[derive(Clone, Debug, Default)]
pub struct FusedState {
    pub connection: ConnectionStatus,
    pub last_event_at: Option<f64>,

    // ── Position ──
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,

    // ── Heading sources ──
    pub heading_main_deg: Option<f64>,
    pub heading_main_at: Option<f64>,
    pub heading_compact_deg: Option<f64>,
    pub heading_compact_at: Option<f64>,
    /// Heading used by the last fusion step.
    pub heading_deg: Option<f64>,

    // ── Fused motion ──
    pub sog_knots: Option<f64>,
    pub cog_deg: Option<f64>,
    pub gps_sog_knots: Option<f64>,
    pub gps_sog_at: Option<f64>,
    pub gps_cog_deg: Option<f64>,

    // ── Raw device fields ──
    pub pitch_deg: Option<f64>,
    pub heel_deg: Option<f64>,
    pub speed_mps: Option<f64>,
    pub native_cog_deg: Option<f64>,
    pub main_reserved: Option<Vec<u8>>,
    pub main_trailer: Option<Vec<u8>>,
    pub main_raw_len: Option<usize>,
    pub compact_field_2: Option<u16>,
    pub compact_sog_knots: Option<f64>,
    pub compact_raw_len: Option<usize>,

    pub marks: RaceMarks,

    pub(crate) fixes: VecDeque<Fix>,
    pub(crate) last_fusion_heading: Option<f64>,
    pub(crate) cog_updated_at: Option<f64>,
}

impl FusedState {
    pub fn position(&self) -> Option<(f64, f64)> {
        Some((self.latitude?, self.longitude?))
    }

    pub fn fixes(&self) -> impl Iterator<Item = &Fix> {
        self.fixes.iter()
    }

    /// Forget everything derived from the lost session. Last position, raw
    /// fields and marks stay for display.
    pub(crate) fn reset_session(&mut self) {
        self.fixes.clear();
        self.sog_knots = None;
        self.cog_deg = None;
        self.gps_sog_knots = None;
        self.gps_sog_at = None;
        self.gps_cog_deg = None;
        self.heading_deg = None;
        self.heading_main_at = None;
        self.heading_compact_at = None;
        self.compact_sog_knots = None;
        self.last_fusion_heading = None;
        self.cog_updated_at = None;
    }

    pub fn snapshot(&self, speed_scale: Option<SpeedScale>) -> StateSnapshot {
        let marks = &self.marks;
        StateSnapshot {
            connected: self.connection.connected,
            device_address: self.connection.device_address.clone(),
            last_error: self.connection.error.clone(),
            last_event_at: self.last_event_at,
            latitude: self.latitude,
            longitude: self.longitude,
            heading_deg: self.heading_deg,
            heading_main_deg: self.heading_main_deg,
            heading_compact_deg: self.heading_compact_deg,
            sog_knots: self.sog_knots,
            cog_deg: self.cog_deg,
            gps_sog_knots: self.gps_sog_knots,
            gps_cog_deg: self.gps_cog_deg,
            native_cog_deg: self.native_cog_deg,
            pitch_deg: self.pitch_deg,
            heel_deg: self.heel_deg,
            speed_mps: self.speed_mps,
            compact_sog_knots: self.compact_sog_knots,
            compact_speed_scale: speed_scale,
            compact_field_2: self.compact_field_2,
            main_raw_len: self.main_raw_len,
            compact_raw_len: self.compact_raw_len,
            main_reserved_hex: self.main_reserved.as_deref().map(to_hex),
            main_trailer_hex: self.main_trailer.as_deref().map(to_hex),
            start_pin_lat: marks.start_pin.map(|p| p.lat),
            start_pin_lon: marks.start_pin.map(|p| p.lon),
            start_rcb_lat: marks.start_rcb.map(|p| p.lat),
            start_rcb_lon: marks.start_rcb.map(|p| p.lon),
            start_line_source: marks.source,
            start_line_follow: marks.follow,
            target: marks.target,
        }
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Flat, serialisable view of the fused state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub connected: bool,
    pub device_address: Option<String>,
    pub last_error: Option<String>,
    pub last_event_at: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub heading_deg: Option<f64>,
    pub heading_main_deg: Option<f64>,
    pub heading_compact_deg: Option<f64>,
    pub sog_knots: Option<f64>,
    pub cog_deg: Option<f64>,
    pub gps_sog_knots: Option<f64>,
    pub gps_cog_deg: Option<f64>,
    pub native_cog_deg: Option<f64>,
    pub pitch_deg: Option<f64>,
    pub heel_deg: Option<f64>,
    pub speed_mps: Option<f64>,
    pub compact_sog_knots: Option<f64>,
    pub compact_speed_scale: Option<SpeedScale>,
    pub compact_field_2: Option<u16>,
    pub main_raw_len: Option<usize>,
    pub compact_raw_len: Option<usize>,
    pub main_reserved_hex: Option<String>,
    pub main_trailer_hex: Option<String>,
    pub start_pin_lat: Option<f64>,
    pub start_pin_lon: Option<f64>,
    pub start_rcb_lat: Option<f64>,
    pub start_rcb_lon: Option<f64>,
    pub start_line_source: Option<MarkSource>,
    pub start_line_follow: bool,
    pub target: Option<MarkTarget>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marks::GeoPoint;

    #[test]
    fn test_snapshot_flattens_start_line() {
        let state = FusedState {
            main_trailer: Some(vec![0x00, 0xab, 0x10]),
            marks: RaceMarks {
                start_pin: Some(GeoPoint::new(42.1, -8.1, None)),
                source: Some(MarkSource::Auto),
                follow: true,
                ..RaceMarks::default()
            },
            ..FusedState::default()
        };
        let snap = state.snapshot(Some(SpeedScale::Tenths));
        assert_eq!(snap.start_pin_lat, Some(42.1));
        assert_eq!(snap.start_rcb_lat, None);
        assert_eq!(snap.main_trailer_hex.as_deref(), Some("00ab10"));

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["start_line_source"], "auto");
        assert_eq!(json["compact_speed_scale"], "tenths");
        assert_eq!(json["start_line_follow"], true);
    }
}
