//! Atlas 2 BLE telemetry decoding.
//!
//! Pure functions only: a malformed frame yields `None` (or an empty list),
//! never an error, so one corrupt notification cannot affect the next.

use std::collections::HashSet;

use crate::geo::{haversine_distance, is_valid_coordinate};
use crate::types::{CompactTelemetry, LineSegmentCandidate, MainTelemetry};

pub const SERVICE_UUID: &str = "ac510001-0000-5a11-0076-616b61726f73";
pub const CHAR_COMMAND_1: &str = "ac510002-0000-5a11-0076-616b61726f73";
pub const CHAR_TELEMETRY_MAIN: &str = "ac510003-0000-5a11-0076-616b61726f73";
pub const CHAR_COMMAND_2: &str = "ac510004-0000-5a11-0076-616b61726f73";
pub const CHAR_TELEMETRY_COMPACT: &str = "ac510005-0000-5a11-0076-616b61726f73";

pub const DEVICE_NAME_FILTER: &str = "Atlas";

/// Written to the command characteristic right after connecting; some units
/// stay silent until they receive it.
pub const WAKE_UP_COMMAND: [u8; 1] = [0x01];

pub const MAIN_MARKER: u8 = 0x02;
pub const COMPACT_MARKER: u8 = 0xFE;
pub const MAIN_MIN_LEN: usize = 20;
pub const COMPACT_MIN_LEN: usize = 6;

const OFFSET_LAT: usize = 8;
const OFFSET_LON: usize = 12;
const OFFSET_HEADING: usize = 16;
const OFFSET_PITCH: usize = 20;
const OFFSET_HEEL: usize = 24;
const OFFSET_SPEED: usize = 28;
const OFFSET_NATIVE_COG: usize = 32;

// Latitude band used to recognise coordinates when firmware shifts the layout
const FALLBACK_LAT_RANGE: (f64, f64) = (35.0, 65.0);
const FALLBACK_SCAN_END: usize = 40;

pub const LINE_MIN_LEN_M: f64 = 5.0;
pub const LINE_MAX_LEN_M: f64 = 2000.0;
pub const MAX_LINE_CANDIDATES: usize = 12;

/// Little-endian f32 at `offset`, `None` if out of bounds or not finite.
fn read_f32(data: &[u8], offset: usize) -> Option<f64> {
    let bytes: [u8; 4] = data.get(offset..offset + 4)?.try_into().ok()?;
    let value = f32::from_le_bytes(bytes);
    value.is_finite().then_some(value as f64)
}

fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes: [u8; 2] = data.get(offset..offset + 2)?.try_into().ok()?;
    Some(u16::from_le_bytes(bytes))
}

fn near_zero(lat: Option<f64>, lon: Option<f64>) -> bool {
    match (lat, lon) {
        (Some(lat), Some(lon)) => lat.abs() < 1e-6 && lon.abs() < 1e-6,
        _ => false,
    }
}

/// Look for a float pair that resembles a real lat/lon somewhere near the
/// expected position offsets.
fn scan_for_position(data: &[u8]) -> Option<(f64, f64)> {
    let end = data.len().saturating_sub(8).min(FALLBACK_SCAN_END);
    (2..=end).filter(|&off| off != OFFSET_LAT).find_map(|off| {
        let lat = read_f32(data, off)?;
        let lon = read_f32(data, off + 4)?;
        let (min_lat, max_lat) = FALLBACK_LAT_RANGE;
        let plausible_lat = (min_lat..=max_lat).contains(&lat.abs());
        let plausible_lon = lon.abs() <= 180.0 && lon.abs() > 1e-6;
        (plausible_lat && plausible_lon).then_some((lat, lon))
    })
}

pub fn decode_main(data: &[u8]) -> Option<MainTelemetry> {
    if data.len() < MAIN_MIN_LEN || data[0] != MAIN_MARKER {
        return None;
    }

    let mut latitude = read_f32(data, OFFSET_LAT);
    let mut longitude = read_f32(data, OFFSET_LON);
    if near_zero(latitude, longitude) {
        if let Some((lat, lon)) = scan_for_position(data) {
            latitude = Some(lat);
            longitude = Some(lon);
        }
    }

    Some(MainTelemetry {
        msg_type: data[0],
        msg_subtype: data[1],
        latitude,
        longitude,
        heading_deg: read_f32(data, OFFSET_HEADING),
        pitch_deg: read_f32(data, OFFSET_PITCH),
        heel_deg: read_f32(data, OFFSET_HEEL),
        speed_mps: read_f32(data, OFFSET_SPEED),
        native_cog_deg: read_f32(data, OFFSET_NATIVE_COG),
        reserved: data[2..OFFSET_LAT].to_vec(),
        trailer: data.get(OFFSET_NATIVE_COG..).map(<[u8]>::to_vec).unwrap_or_default(),
        raw_len: data.len(),
    })
}

pub fn decode_compact(data: &[u8]) -> Option<CompactTelemetry> {
    if data.len() < COMPACT_MIN_LEN || data[0] != COMPACT_MARKER {
        return None;
    }
    let heading_raw = read_u16(data, 2)?;
    // Two firmware encodings seen in the field: x10 and x100
    let scale = if heading_raw > 3600 { 100.0 } else { 10.0 };
    Some(CompactTelemetry {
        msg_type: data[0],
        msg_subtype: data[1],
        heading_deg: heading_raw as f64 / scale,
        field_2: read_u16(data, 4)?,
        raw_len: data.len(),
    })
}

/// Slide a 16-byte window over the frame and keep every (latA, lonA, latB,
/// lonB) quadruple that looks like a plausible start line.
pub fn extract_line_candidates(data: &[u8]) -> Vec<LineSegmentCandidate> {
    extract_line_candidates_within(data, LINE_MIN_LEN_M, LINE_MAX_LEN_M)
}

pub fn extract_line_candidates_within(
    data: &[u8],
    min_len_m: f64,
    max_len_m: f64,
) -> Vec<LineSegmentCandidate> {
    let mut out = Vec::new();
    if data.len() < 16 {
        return out;
    }

    let mut seen: HashSet<[i64; 4]> = HashSet::new();
    for offset in 0..=data.len() - 16 {
        let quad = (
            read_f32(data, offset),
            read_f32(data, offset + 4),
            read_f32(data, offset + 8),
            read_f32(data, offset + 12),
        );
        let (Some(a_lat), Some(a_lon), Some(b_lat), Some(b_lon)) = quad else {
            continue;
        };
        if !is_valid_coordinate(a_lat, a_lon) || !is_valid_coordinate(b_lat, b_lon) {
            continue;
        }
        let length_m = haversine_distance(a_lat, a_lon, b_lat, b_lon);
        if !(min_len_m..=max_len_m).contains(&length_m) {
            continue;
        }

        let key = [a_lat, a_lon, b_lat, b_lon].map(|v| (v * 1e6).round() as i64);
        if !seen.insert(key) {
            continue;
        }
        out.push(LineSegmentCandidate {
            offset,
            a_lat,
            a_lon,
            b_lat,
            b_lon,
            length_m,
        });
        if out.len() >= MAX_LINE_CANDIDATES {
            break;
        }
    }
    out
}
