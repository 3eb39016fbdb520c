//! Match start-line segments broadcast by the device against the current
//! pin/committee-boat ends and adopt the best fit.

use crate::geo::haversine_distance;
use crate::marks::{GeoPoint, MarkSource, RaceMarks};
use crate::types::LineSegmentCandidate;

#[derive(Clone, Debug)]
pub struct MatcherConfig {
    pub min_length_m: f64,
    pub max_length_m: f64,
    /// Both ends must lie within this distance of the boat.
    pub max_distance_from_boat_m: f64,
    /// Smaller moves are treated as the same point.
    pub min_update_m: f64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            min_length_m: 5.0,
            max_length_m: 2500.0,
            max_distance_from_boat_m: 20_000.0,
            min_update_m: 0.5,
        }
    }
}

/// A candidate with its ends assigned to pin and committee boat.
#[derive(Clone, Debug, PartialEq)]
pub struct LineMatch {
    pub pin: (f64, f64),
    pub rcb: (f64, f64),
    pub cost_m: f64,
    /// Candidate's B end became the pin.
    pub swapped: bool,
    pub offset: usize,
}

#[derive(Clone, Debug, Default)]
pub struct StartLineMatcher {
    config: MatcherConfig,
}

fn dist(a: (f64, f64), b: &GeoPoint) -> f64 {
    haversine_distance(a.0, a.1, b.lat, b.lon)
}

impl StartLineMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    fn plausible(&self, c: &LineSegmentCandidate, boat: (f64, f64)) -> bool {
        let max = self.config.max_distance_from_boat_m;
        (self.config.min_length_m..=self.config.max_length_m).contains(&c.length_m)
            && haversine_distance(boat.0, boat.1, c.a_lat, c.a_lon) <= max
            && haversine_distance(boat.0, boat.1, c.b_lat, c.b_lon) <= max
    }

    /// Assign the candidate's ends to pin/rcb, returning the assignment and
    /// how far the ends sit from the current line.
    fn assign(
        &self,
        c: &LineSegmentCandidate,
        boat: (f64, f64),
        pin: Option<&GeoPoint>,
        rcb: Option<&GeoPoint>,
    ) -> LineMatch {
        let a = (c.a_lat, c.a_lon);
        let b = (c.b_lat, c.b_lon);
        let direct = |cost_m: f64| LineMatch {
            pin: a,
            rcb: b,
            cost_m,
            swapped: false,
            offset: c.offset,
        };
        let swapped = |cost_m: f64| LineMatch {
            pin: b,
            rcb: a,
            cost_m,
            swapped: true,
            offset: c.offset,
        };

        match (pin, rcb) {
            (Some(p), Some(r)) => {
                let straight = dist(a, p) + dist(b, r);
                let crossed = dist(b, p) + dist(a, r);
                if crossed < straight {
                    swapped(crossed)
                } else {
                    direct(straight)
                }
            }
            (Some(p), None) => {
                let (da, db) = (dist(a, p), dist(b, p));
                if db < da {
                    swapped(db)
                } else {
                    direct(da)
                }
            }
            (None, Some(r)) => {
                let (da, db) = (dist(a, r), dist(b, r));
                if da < db {
                    swapped(da)
                } else {
                    direct(db)
                }
            }
            // Nothing to anchor on: keep broadcast order, prefer lines near the boat
            (None, None) => {
                let near = haversine_distance(boat.0, boat.1, a.0, a.1)
                    + haversine_distance(boat.0, boat.1, b.0, b.1);
                direct(near)
            }
        }
    }

    pub fn best_match(
        &self,
        candidates: &[LineSegmentCandidate],
        boat: (f64, f64),
        marks: &RaceMarks,
    ) -> Option<LineMatch> {
        candidates
            .iter()
            .filter(|c| self.plausible(c, boat))
            .map(|c| self.assign(c, boat, marks.start_pin.as_ref(), marks.start_rcb.as_ref()))
            .min_by(|x, y| x.cost_m.total_cmp(&y.cost_m))
    }

    /// Write the match into the marks, moving only ends that are new or moved
    /// by more than the update threshold. Returns how many ends changed.
    pub fn apply(&self, m: &LineMatch, marks: &mut RaceMarks, now: f64) -> usize {
        let min_move = self.config.min_update_m;
        let mut updated = 0;
        for (slot, target) in [(&mut marks.start_pin, m.pin), (&mut marks.start_rcb, m.rcb)] {
            let moved = slot.as_ref().map_or(true, |p| dist(target, p) > min_move);
            if moved {
                *slot = Some(GeoPoint::new(target.0, target.1, Some(now)));
                updated += 1;
            }
        }
        if updated > 0 {
            marks.source = Some(MarkSource::Auto);
        }
        updated
    }
}
