//! Infer the fixed-point scale of the compact speed field.
//!
//! Firmware revisions encode the same speed as knots, tenths or hundredths
//! without saying which. Each reading votes for a scale, against a fresh
//! GPS-derived SOG when one exists; once a scale has enough votes it locks
//! and every later reading decodes with it.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedScale {
    Unit,
    Tenths,
    Hundredths,
}

impl SpeedScale {
    pub const ALL: [SpeedScale; 3] = [SpeedScale::Unit, SpeedScale::Tenths, SpeedScale::Hundredths];

    pub fn divisor(&self) -> f64 {
        match self {
            SpeedScale::Unit => 1.0,
            SpeedScale::Tenths => 10.0,
            SpeedScale::Hundredths => 100.0,
        }
    }

    fn index(&self) -> usize {
        match self {
            SpeedScale::Unit => 0,
            SpeedScale::Tenths => 1,
            SpeedScale::Hundredths => 2,
        }
    }

    pub fn decode(&self, raw: u16) -> f64 {
        raw as f64 / self.divisor()
    }
}

#[derive(Clone, Debug)]
pub struct ScaleConfig {
    pub max_knots: f64,
    pub referenced_lock_hits: u32,
    pub unreferenced_lock_hits: u32,
    /// Accept a referenced vote only within max(min, relative × reference).
    pub min_tolerance_knots: f64,
    pub relative_tolerance: f64,
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self {
            max_knots: 60.0,
            referenced_lock_hits: 3,
            unreferenced_lock_hits: 5,
            min_tolerance_knots: 2.5,
            relative_tolerance: 0.8,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SpeedScaleInference {
    config: ScaleConfig,
    hits: [u32; 3],
    locked: Option<SpeedScale>,
}

impl SpeedScaleInference {
    pub fn new(config: ScaleConfig) -> Self {
        Self {
            config,
            hits: [0; 3],
            locked: None,
        }
    }

    pub fn locked(&self) -> Option<SpeedScale> {
        self.locked
    }

    pub fn hits(&self, scale: SpeedScale) -> u32 {
        self.hits[scale.index()]
    }

    pub fn reset(&mut self) {
        self.hits = [0; 3];
        self.locked = None;
    }

    fn in_range(&self, knots: f64) -> bool {
        (0.0..=self.config.max_knots).contains(&knots)
    }

    /// Decode a raw reading, voting on the scale until one locks. Returns
    /// `None` while the reading fits no scale.
    pub fn decode(&mut self, raw: u16, reference_knots: Option<f64>) -> Option<f64> {
        if let Some(scale) = self.locked {
            return Some(scale.decode(raw));
        }

        let (winner, lock_at) = match reference_knots.filter(|r| r.is_finite()) {
            Some(reference) => {
                let (scale, deviation) = SpeedScale::ALL
                    .iter()
                    .filter(|s| self.in_range(s.decode(raw)))
                    .map(|s| (*s, (s.decode(raw) - reference).abs()))
                    .min_by(|a, b| a.1.total_cmp(&b.1))?;
                let tolerance = self
                    .config
                    .min_tolerance_knots
                    .max(self.config.relative_tolerance * reference.abs());
                if deviation > tolerance {
                    return None;
                }
                (scale, self.config.referenced_lock_hits)
            }
            // Without a reference, the finest scale that yields a sane speed
            None => {
                let scale = SpeedScale::ALL
                    .iter()
                    .rev()
                    .copied()
                    .find(|s| self.in_range(s.decode(raw)))?;
                (scale, self.config.unreferenced_lock_hits)
            }
        };

        for scale in SpeedScale::ALL {
            let h = &mut self.hits[scale.index()];
            *h = if scale == winner { h.saturating_add(1) } else { h.saturating_sub(1) };
        }
        if self.hits[winner.index()] >= lock_at {
            log::info!(
                "Compact speed scale locked at 1/{} after {} votes",
                winner.divisor(),
                self.hits[winner.index()]
            );
            self.locked = Some(winner);
        }
        Some(winner.decode(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_locks_hundredths_against_reference() {
        let mut inference = SpeedScaleInference::new(ScaleConfig::default());
        for (raw, reference) in [(512u16, 5.1), (498, 5.0), (505, 5.05)] {
            let decoded = inference.decode(raw, Some(reference)).unwrap();
            assert_abs_diff_eq!(decoded, raw as f64 / 100.0);
        }
        assert_eq!(inference.locked(), Some(SpeedScale::Hundredths));

        // Locked: decodes at 1/100 even when 1/10 would fit the reference better
        assert_abs_diff_eq!(inference.decode(300, Some(30.0)).unwrap(), 3.0);
        assert_abs_diff_eq!(inference.decode(300, None).unwrap(), 3.0);
    }

    #[test]
    fn test_tenths_with_reference() {
        let mut inference = SpeedScaleInference::new(ScaleConfig::default());
        for _ in 0..3 {
            assert_abs_diff_eq!(inference.decode(52, Some(5.2)).unwrap(), 5.2);
        }
        assert_eq!(inference.locked(), Some(SpeedScale::Tenths));
    }

    #[test]
    fn test_far_from_reference_is_rejected() {
        let mut inference = SpeedScaleInference::new(ScaleConfig::default());
        // 2000 decodes to 20, 200 or 2000 kn; none is near 5
        assert_eq!(inference.decode(2000, Some(5.0)), None);
        assert!(SpeedScale::ALL.iter().all(|s| inference.hits(*s) == 0));
    }

    #[test]
    fn test_conflicting_votes_cancel() {
        let mut inference = SpeedScaleInference::new(ScaleConfig::default());
        inference.decode(500, Some(5.0));
        inference.decode(500, Some(5.0));
        assert_eq!(inference.hits(SpeedScale::Hundredths), 2);
        inference.decode(50, Some(5.0));
        assert_eq!(inference.hits(SpeedScale::Hundredths), 1);
        assert_eq!(inference.hits(SpeedScale::Tenths), 1);
        assert_eq!(inference.locked(), None);
    }

    #[test]
    fn test_unreferenced_prefers_finest_scale() {
        let mut inference = SpeedScaleInference::new(ScaleConfig::default());
        for _ in 0..4 {
            assert_abs_diff_eq!(inference.decode(640, None).unwrap(), 6.4);
        }
        assert_eq!(inference.locked(), None);
        inference.decode(640, None);
        assert_eq!(inference.locked(), Some(SpeedScale::Hundredths));

        inference.reset();
        assert_eq!(inference.locked(), None);
        assert_eq!(inference.hits(SpeedScale::Hundredths), 0);
    }
}
