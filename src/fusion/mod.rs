// fusion/mod.rs: pure state layer for the Atlas telemetry pipeline
//
// Nothing here touches the runtime, the transport or the filesystem. Events
// go in, fused state and update notices come out, so the whole thing can be
// replayed from recorded events in tests.

pub mod scale;
pub mod state;

use crate::geo::{
    bearing_deg, blend_deg, delta_deg, haversine_distance, is_valid_coordinate, wrap_deg,
    MPS_TO_KNOTS,
};
use crate::marks::{MarkCommand, RaceMarks};
use crate::start_line::{MatcherConfig, StartLineMatcher};
use crate::types::{
    CompactTelemetry, ConnectionStatus, LineSegmentCandidate, MainTelemetry, TelemetryEvent,
};

pub use scale::{ScaleConfig, SpeedScale, SpeedScaleInference};
pub use state::{Fix, FusedState, StateSnapshot};

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct FusionConfig {
    // ── GPS-derived motion ──
    pub fix_window_secs: f64,
    pub min_fixes: usize,
    pub max_gps_sog_knots: f64,
    pub min_bearing_displacement_m: f64,
    pub gps_bearing_min_sog_knots: f64,

    // ── Device speed ──
    pub max_native_sog_knots: f64,
    pub reference_sog_max_age_secs: f64,

    // ── Heading selection ──
    pub heading_max_age_secs: f64,

    // ── COG blending ──
    pub cog_blend_sog_low: f64,
    pub cog_blend_sog_high: f64,
    pub cog_blend_weight_low: f64,
    pub cog_blend_weight_high: f64,
    pub cog_moving_sog_knots: f64,
    pub cog_hold_secs: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            fix_window_secs: 4.0,
            min_fixes: 2,
            max_gps_sog_knots: 40.0,
            min_bearing_displacement_m: 1.0,
            gps_bearing_min_sog_knots: 0.5,
            max_native_sog_knots: 60.0,
            reference_sog_max_age_secs: 2.5,
            heading_max_age_secs: 2.5,
            cog_blend_sog_low: 1.0,
            cog_blend_sog_high: 3.0,
            cog_blend_weight_low: 0.2,
            cog_blend_weight_high: 0.8,
            cog_moving_sog_knots: 0.3,
            cog_hold_secs: 7.0,
        }
    }
}

// ─── Output ──────────────────────────────────────────────────────────────────

/// Notable changes produced while applying an event or command.
#[derive(Clone, Debug, PartialEq)]
pub enum FusionUpdate {
    /// Race marks changed and should be persisted.
    MarksChanged,
    ScaleLocked(SpeedScale),
    /// Link dropped; fused motion was cleared.
    SessionReset,
}

// ─── Engine ──────────────────────────────────────────────────────────────────

pub struct FusionEngine {
    config: FusionConfig,
    state: FusedState,
    scale: SpeedScaleInference,
    matcher: StartLineMatcher,
    pending_line_match: bool,
}

impl Default for FusionEngine {
    fn default() -> Self {
        Self::new(
            FusionConfig::default(),
            ScaleConfig::default(),
            MatcherConfig::default(),
        )
    }
}

fn fresh(at: Option<f64>, now: f64, max_age: f64) -> bool {
    at.map_or(false, |t| (now - t).abs() <= max_age)
}

impl FusionEngine {
    pub fn new(config: FusionConfig, scale: ScaleConfig, matcher: MatcherConfig) -> Self {
        Self {
            config,
            state: FusedState::default(),
            scale: SpeedScaleInference::new(scale),
            matcher: StartLineMatcher::new(matcher),
            pending_line_match: false,
        }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn state(&self) -> &FusedState {
        &self.state
    }

    pub fn speed_scale(&self) -> Option<SpeedScale> {
        self.scale.locked()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.state.snapshot(self.scale.locked())
    }

    pub fn marks(&self) -> &RaceMarks {
        &self.state.marks
    }

    /// Replace marks wholesale, e.g. after loading them from disk.
    pub fn set_marks(&mut self, marks: RaceMarks) {
        self.state.marks = marks;
    }

    pub fn apply(&mut self, event: &TelemetryEvent) -> Vec<FusionUpdate> {
        let now = event.received_at();
        self.state.last_event_at = Some(now);
        match event {
            TelemetryEvent::Status { status, .. } => self.apply_status(status),
            TelemetryEvent::TelemetryMain { telemetry, .. } => {
                self.apply_main(telemetry, now);
                Vec::new()
            }
            TelemetryEvent::TelemetryCompact { telemetry, .. } => {
                self.apply_compact(telemetry, now)
            }
            TelemetryEvent::StartLineCandidates { candidates, .. } => {
                self.apply_candidates(candidates, now)
            }
        }
    }

    pub fn handle_command(&mut self, command: &MarkCommand, now: f64) -> Vec<FusionUpdate> {
        if let MarkCommand::MatchStartLineNow = command {
            log::info!("Start line will follow the next broadcast line");
            self.pending_line_match = true;
            return Vec::new();
        }
        let position = self.state.position();
        if self.state.marks.apply(command, position, now) {
            vec![FusionUpdate::MarksChanged]
        } else {
            log::debug!("Mark command {:?} changed nothing", command);
            Vec::new()
        }
    }

    fn apply_status(&mut self, status: &ConnectionStatus) -> Vec<FusionUpdate> {
        let was_connected = self.state.connection.connected;
        self.state.connection = status.clone();
        if status.connected {
            return Vec::new();
        }

        self.state.reset_session();
        self.scale.reset();
        if was_connected {
            log::info!("Link lost, fused motion cleared");
            vec![FusionUpdate::SessionReset]
        } else {
            Vec::new()
        }
    }

    fn apply_main(&mut self, t: &MainTelemetry, now: f64) {
        let s = &mut self.state;
        if let Some(h) = t.heading_deg {
            s.heading_main_deg = Some(wrap_deg(h));
            s.heading_main_at = Some(now);
        }
        s.pitch_deg = t.pitch_deg.or(s.pitch_deg);
        s.heel_deg = t.heel_deg.or(s.heel_deg);
        s.speed_mps = t.speed_mps.or(s.speed_mps);
        s.native_cog_deg = t.native_cog_deg.map(wrap_deg).or(s.native_cog_deg);
        s.main_reserved = Some(t.reserved.clone());
        s.main_trailer = Some(t.trailer.clone());
        s.main_raw_len = Some(t.raw_len);

        let mut gps_bearing = None;
        let valid = t
            .position()
            .filter(|&(lat, lon)| is_valid_coordinate(lat, lon));
        if let Some((lat, lon)) = valid {
            s.latitude = Some(lat);
            s.longitude = Some(lon);
            gps_bearing = self.push_fix(Fix { at: now, lat, lon });
        }

        // Device speed wins over GPS-derived SOG when plausible
        if let Some(mps) = t.speed_mps {
            let knots = mps * MPS_TO_KNOTS;
            if knots <= self.config.max_native_sog_knots {
                self.state.sog_knots = Some(knots.max(0.0));
            }
        }

        self.fuse_cog(now, gps_bearing);
    }

    /// Add a fix to the window and derive SOG and a travel bearing from the
    /// oldest and newest fixes. Returns the bearing when it is trustworthy
    /// enough to steer COG.
    fn push_fix(&mut self, fix: Fix) -> Option<f64> {
        let cfg = &self.config;
        let s = &mut self.state;

        s.fixes.push_back(fix);
        let cutoff = fix.at - cfg.fix_window_secs;
        while s.fixes.len() > cfg.min_fixes.max(2) {
            match s.fixes.front() {
                Some(oldest) if oldest.at < cutoff => {
                    s.fixes.pop_front();
                }
                _ => break,
            }
        }

        let (first, last) = (*s.fixes.front()?, *s.fixes.back()?);
        if s.fixes.len() < 2 {
            return None;
        }
        let dt = (last.at - first.at).max(0.001);
        let distance = haversine_distance(first.lat, first.lon, last.lat, last.lon);
        let sog = distance / dt * MPS_TO_KNOTS;
        if sog > cfg.max_gps_sog_knots {
            log::debug!("Discarding implausible GPS SOG {:.1} kn", sog);
            return None;
        }

        s.gps_sog_knots = Some(sog);
        s.gps_sog_at = Some(last.at);
        s.sog_knots = Some(sog);

        if distance < cfg.min_bearing_displacement_m {
            return None;
        }
        let bearing = bearing_deg(first.lat, first.lon, last.lat, last.lon);
        s.gps_cog_deg = Some(bearing);
        (sog >= cfg.gps_bearing_min_sog_knots).then_some(bearing)
    }

    fn apply_compact(&mut self, t: &CompactTelemetry, now: f64) -> Vec<FusionUpdate> {
        let mut updates = Vec::new();
        let s = &mut self.state;
        s.heading_compact_deg = Some(wrap_deg(t.heading_deg));
        s.heading_compact_at = Some(now);
        s.compact_field_2 = Some(t.field_2);
        s.compact_raw_len = Some(t.raw_len);

        let reference = s
            .gps_sog_knots
            .filter(|_| fresh(s.gps_sog_at, now, self.config.reference_sog_max_age_secs));
        let was_locked = self.scale.locked().is_some();
        if let Some(knots) = self.scale.decode(t.field_2, reference) {
            s.compact_sog_knots = Some(knots);
        }
        if !was_locked {
            if let Some(scale) = self.scale.locked() {
                updates.push(FusionUpdate::ScaleLocked(scale));
            }
        }

        self.fuse_cog(now, None);
        updates
    }

    fn apply_candidates(
        &mut self,
        candidates: &[LineSegmentCandidate],
        now: f64,
    ) -> Vec<FusionUpdate> {
        let forced = self.pending_line_match;
        if !(self.state.marks.follow || forced) {
            return Vec::new();
        }
        let Some(boat) = self.state.position() else {
            return Vec::new();
        };
        self.pending_line_match = false;

        let Some(m) = self.matcher.best_match(candidates, boat, &self.state.marks) else {
            return Vec::new();
        };
        let updated = self.matcher.apply(&m, &mut self.state.marks, now);
        if updated == 0 {
            return Vec::new();
        }
        log::info!(
            "Start line updated from device broadcast ({} end(s), {:.1} m off{})",
            updated,
            m.cost_m,
            if m.swapped { ", ends swapped" } else { "" }
        );
        vec![FusionUpdate::MarksChanged]
    }

    /// Freshest trustworthy heading: compact channel first, then main.
    fn select_heading(&self, now: f64) -> Option<f64> {
        let max_age = self.config.heading_max_age_secs;
        let s = &self.state;
        [
            (s.heading_compact_deg, s.heading_compact_at),
            (s.heading_main_deg, s.heading_main_at),
        ]
        .into_iter()
        .find_map(|(heading, at)| heading.filter(|_| fresh(at, now, max_age)))
    }

    fn gps_weight(&self, sog: f64) -> f64 {
        let cfg = &self.config;
        let span = (cfg.cog_blend_sog_high - cfg.cog_blend_sog_low).max(f64::EPSILON);
        let frac = ((sog - cfg.cog_blend_sog_low) / span).clamp(0.0, 1.0);
        cfg.cog_blend_weight_low + (cfg.cog_blend_weight_high - cfg.cog_blend_weight_low) * frac
    }

    /// Advance COG by the heading change since the last step, then pull it
    /// toward the GPS travel bearing when one is available.
    fn fuse_cog(&mut self, now: f64, gps_bearing: Option<f64>) {
        let heading = self.select_heading(now);
        let sog = self.state.sog_knots.unwrap_or(0.0);
        let weight = self.gps_weight(sog);
        let cfg = &self.config;
        let s = &mut self.state;
        s.heading_deg = heading;

        let predicted = match (s.cog_deg, heading, s.last_fusion_heading) {
            (Some(cog), Some(h), Some(last)) => Some(wrap_deg(cog + delta_deg(h, last))),
            (Some(cog), _, _) => Some(cog),
            (None, h, _) => h,
        };

        if let Some(bearing) = gps_bearing {
            s.cog_deg = Some(match predicted {
                Some(p) => blend_deg(p, bearing, weight),
                None => bearing,
            });
            s.cog_updated_at = Some(now);
        } else if let Some(p) = predicted {
            let moving = sog > cfg.cog_moving_sog_knots;
            let recently_fixed = fresh(s.cog_updated_at, now, cfg.cog_hold_secs);
            if moving || recently_fixed {
                s.cog_deg = Some(p);
            }
        }

        if heading.is_some() {
            s.last_fusion_heading = heading;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::EARTH_RADIUS_M;
    use crate::marks::{GeoPoint, MarkSource};
    use crate::types::CompactTelemetry;
    use approx::assert_abs_diff_eq;

    const ORIGIN: (f64, f64) = (42.2300, -8.7330);

    /// Flat-earth offset, accurate to centimetres over a few hundred metres.
    fn offset(p: (f64, f64), bearing: f64, meters: f64) -> (f64, f64) {
        let b = bearing.to_radians();
        let north = meters * b.cos();
        let east = meters * b.sin();
        (
            p.0 + (north / EARTH_RADIUS_M).to_degrees(),
            p.1 + (east / (EARTH_RADIUS_M * p.0.to_radians().cos())).to_degrees(),
        )
    }

    fn main_event(
        at: f64,
        pos: (f64, f64),
        heading: Option<f64>,
        speed_mps: Option<f64>,
    ) -> TelemetryEvent {
        TelemetryEvent::TelemetryMain {
            telemetry: MainTelemetry {
                msg_type: 0x02,
                msg_subtype: 0x0A,
                latitude: Some(pos.0),
                longitude: Some(pos.1),
                heading_deg: heading,
                pitch_deg: Some(1.0),
                heel_deg: Some(-4.0),
                speed_mps,
                native_cog_deg: None,
                reserved: vec![0; 6],
                trailer: vec![],
                raw_len: 36,
            },
            received_at: at,
        }
    }

    fn compact_event(at: f64, heading: f64, field_2: u16) -> TelemetryEvent {
        TelemetryEvent::TelemetryCompact {
            telemetry: CompactTelemetry {
                msg_type: 0xFE,
                msg_subtype: 0x01,
                heading_deg: heading,
                field_2,
                raw_len: 6,
            },
            received_at: at,
        }
    }

    fn status_event(at: f64, connected: bool) -> TelemetryEvent {
        let status = if connected {
            ConnectionStatus::connected("AA:BB:CC:DD:EE:FF")
        } else {
            ConnectionStatus::disconnected(None, None)
        };
        TelemetryEvent::status(status, at)
    }

    /// 1 Hz fixes sailing `bearing` at `knots`, heading reported as `heading`.
    fn sail(engine: &mut FusionEngine, seconds: usize, bearing: f64, knots: f64, heading: f64) {
        let mps = knots / MPS_TO_KNOTS;
        for i in 0..seconds {
            let pos = offset(ORIGIN, bearing, mps * i as f64);
            engine.apply(&main_event(100.0 + i as f64, pos, Some(heading), None));
        }
    }

    #[test]
    fn test_cog_converges_to_gps_bearing() {
        let mut engine = FusionEngine::default();
        engine.apply(&status_event(99.0, true));
        // Heading 30° off from the track (leeway, current)
        sail(&mut engine, 15, 45.0, 5.0, 15.0);

        let s = engine.state();
        assert_abs_diff_eq!(s.sog_knots.unwrap(), 5.0, epsilon = 0.05);
        assert_abs_diff_eq!(s.gps_cog_deg.unwrap(), 45.0, epsilon = 0.1);
        assert!(delta_deg(s.cog_deg.unwrap(), 45.0).abs() < 0.5);
        assert!(s.fixes().count() <= 5);
    }

    #[test]
    fn test_heading_change_rotates_cog_between_fixes() {
        let mut engine = FusionEngine::default();
        sail(&mut engine, 10, 90.0, 6.0, 90.0);
        let cog = engine.state().cog_deg.unwrap();

        // Boat turns 20° to starboard; compact heading reports it before the next fix
        engine.apply(&compact_event(109.5, 110.0, 600));
        let turned = engine.state().cog_deg.unwrap();
        assert_abs_diff_eq!(delta_deg(turned, cog), 20.0, epsilon = 0.01);
    }

    #[test]
    fn test_cog_holds_when_stationary() {
        let mut engine = FusionEngine::default();
        sail(&mut engine, 6, 180.0, 4.0, 180.0);

        // Stopped: same fix repeated well past the hold window
        let last = offset(ORIGIN, 180.0, 4.0 / MPS_TO_KNOTS * 5.0);
        for i in 0..12 {
            engine.apply(&main_event(106.0 + i as f64, last, Some(180.0), None));
        }
        assert!(engine.state().sog_knots.unwrap() < 0.3);
        let cog = engine.state().cog_deg.unwrap();
        engine.apply(&main_event(118.5, last, Some(240.0), None));
        assert_abs_diff_eq!(engine.state().cog_deg.unwrap(), cog, epsilon = 1e-9);
    }

    #[test]
    fn test_native_speed_overrides_gps_sog() {
        let mut engine = FusionEngine::default();
        engine.apply(&main_event(1.0, ORIGIN, Some(0.0), Some(3.0)));
        engine.apply(&main_event(2.0, offset(ORIGIN, 0.0, 2.0), Some(0.0), Some(3.0)));
        let s = engine.state();
        assert_abs_diff_eq!(s.sog_knots.unwrap(), 3.0 * MPS_TO_KNOTS, epsilon = 1e-9);
        assert_abs_diff_eq!(s.gps_sog_knots.unwrap(), 2.0 * MPS_TO_KNOTS, epsilon = 0.01);

        // Implausible device speed falls back to GPS
        engine.apply(&main_event(3.0, offset(ORIGIN, 0.0, 4.0), Some(0.0), Some(45.0)));
        assert_abs_diff_eq!(engine.state().sog_knots.unwrap(), 2.0 * MPS_TO_KNOTS, epsilon = 0.01);
    }

    #[test]
    fn test_invalid_position_is_ignored() {
        let mut engine = FusionEngine::default();
        engine.apply(&main_event(1.0, (0.0, 0.0), Some(10.0), None));
        engine.apply(&main_event(2.0, (91.0, 0.0), Some(10.0), None));
        assert_eq!(engine.state().position(), None);
        assert_eq!(engine.state().fixes().count(), 0);
        assert_eq!(engine.state().heading_main_deg, Some(10.0));
    }

    #[test]
    fn test_implausible_gps_jump_is_discarded() {
        let mut engine = FusionEngine::default();
        engine.apply(&main_event(1.0, ORIGIN, None, None));
        engine.apply(&main_event(2.0, offset(ORIGIN, 0.0, 500.0), None, None));
        assert_eq!(engine.state().gps_sog_knots, None);
        assert_eq!(engine.state().cog_deg, None);
    }

    #[test]
    fn test_stale_compact_heading_falls_back_to_main() {
        let mut engine = FusionEngine::default();
        engine.apply(&compact_event(10.0, 100.0, 0));
        engine.apply(&main_event(11.0, ORIGIN, Some(200.0), None));
        assert_eq!(engine.state().heading_deg, Some(100.0));

        engine.apply(&main_event(13.0, ORIGIN, Some(200.0), None));
        assert_eq!(engine.state().heading_deg, Some(200.0));

        // Both channels stale: no heading is fused
        engine.apply(&main_event(16.0, ORIGIN, None, None));
        assert_eq!(engine.state().heading_deg, None);
        assert_eq!(engine.state().heading_main_deg, Some(200.0));
    }

    #[test]
    fn test_disconnect_clears_fused_motion() {
        let mut engine = FusionEngine::default();
        engine.apply(&status_event(99.0, true));
        sail(&mut engine, 5, 45.0, 5.0, 45.0);
        for i in 0..3 {
            engine.apply(&compact_event(104.0 + i as f64 * 0.2, 45.0, 500));
        }
        assert!(engine.speed_scale().is_some());

        let updates = engine.apply(&status_event(105.0, false));
        assert_eq!(updates, vec![FusionUpdate::SessionReset]);

        let s = engine.state();
        assert_eq!(s.sog_knots, None);
        assert_eq!(s.cog_deg, None);
        assert_eq!(s.gps_sog_knots, None);
        assert_eq!(s.fixes().count(), 0);
        assert_eq!(engine.speed_scale(), None);
        assert!(!engine.snapshot().connected);
        // Last known position is kept for display
        assert!(s.position().is_some());

        // Reconnected: the first fix starts a fresh window instead of pairing
        // with a fix from the old session
        engine.apply(&status_event(106.0, true));
        engine.apply(&main_event(107.0, offset(ORIGIN, 0.0, 100.0), None, None));
        let s = engine.state();
        assert_eq!(s.fixes().count(), 1);
        assert_eq!(s.sog_knots, None);
        assert_eq!(s.gps_cog_deg, None);
        assert_eq!(s.cog_deg, None);
    }

    #[test]
    fn test_compact_speed_locks_against_gps_without_overriding_sog() {
        let mut engine = FusionEngine::default();
        sail(&mut engine, 5, 0.0, 5.0, 0.0);

        let mut updates = Vec::new();
        for i in 0..3 {
            updates.extend(engine.apply(&compact_event(104.2 + i as f64 * 0.2, 0.0, 498)));
        }
        assert_eq!(updates, vec![FusionUpdate::ScaleLocked(SpeedScale::Hundredths)]);

        let s = engine.state();
        assert_abs_diff_eq!(s.compact_sog_knots.unwrap(), 4.98, epsilon = 1e-9);
        assert_abs_diff_eq!(s.sog_knots.unwrap(), 5.0, epsilon = 0.05);
        assert_eq!(engine.snapshot().compact_speed_scale, Some(SpeedScale::Hundredths));
    }

    fn line_candidates(pin: (f64, f64), rcb: (f64, f64), at: f64) -> TelemetryEvent {
        TelemetryEvent::StartLineCandidates {
            candidates: vec![LineSegmentCandidate {
                offset: 36,
                a_lat: pin.0,
                a_lon: pin.1,
                b_lat: rcb.0,
                b_lon: rcb.1,
                length_m: haversine_distance(pin.0, pin.1, rcb.0, rcb.1),
            }],
            source: crate::types::FrameSource::Notification,
            received_at: at,
        }
    }

    #[test]
    fn test_candidates_only_applied_when_following() {
        let mut engine = FusionEngine::default();
        engine.apply(&main_event(1.0, ORIGIN, None, None));
        let pin = offset(ORIGIN, 0.0, 200.0);
        let rcb = offset(pin, 90.0, 150.0);

        assert!(engine.apply(&line_candidates(pin, rcb, 2.0)).is_empty());
        assert_eq!(engine.marks().start_pin, None);

        engine.handle_command(&MarkCommand::SetFollow { enabled: true }, 3.0);
        assert_eq!(
            engine.apply(&line_candidates(pin, rcb, 4.0)),
            vec![FusionUpdate::MarksChanged]
        );
        assert_eq!(engine.marks().source, Some(MarkSource::Auto));
        assert!(engine.apply(&line_candidates(pin, rcb, 5.0)).is_empty());
    }

    #[test]
    fn test_match_now_is_one_shot() {
        let mut engine = FusionEngine::default();
        let pin = offset(ORIGIN, 0.0, 200.0);
        let rcb = offset(pin, 90.0, 150.0);

        assert!(engine
            .handle_command(&MarkCommand::MatchStartLineNow, 1.0)
            .is_empty());
        // No position yet: the request waits
        assert!(engine.apply(&line_candidates(pin, rcb, 2.0)).is_empty());

        engine.apply(&main_event(3.0, ORIGIN, None, None));
        assert_eq!(
            engine.apply(&line_candidates(pin, rcb, 4.0)),
            vec![FusionUpdate::MarksChanged]
        );

        let moved = offset(pin, 0.0, 20.0);
        assert!(engine.apply(&line_candidates(moved, rcb, 5.0)).is_empty());
        assert!(!engine.marks().follow);
    }

    #[test]
    fn test_set_mark_uses_current_position() {
        let mut engine = FusionEngine::default();
        assert!(engine
            .handle_command(&MarkCommand::SetWindward { point: None }, 1.0)
            .is_empty());

        engine.apply(&main_event(2.0, ORIGIN, None, None));
        assert_eq!(
            engine.handle_command(&MarkCommand::SetWindward { point: None }, 3.0),
            vec![FusionUpdate::MarksChanged]
        );
        assert_eq!(
            engine.marks().windward,
            Some(GeoPoint::new(ORIGIN.0, ORIGIN.1, Some(3.0)))
        );
    }
}
