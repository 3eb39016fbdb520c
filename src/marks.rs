//! Race marks: the start line (pin end and committee boat end), course marks
//! and the follow flag, plus JSON persistence.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::geo::is_valid_coordinate;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
    /// When this point was last set, seconds since the unix epoch.
    #[serde(default)]
    pub updated_at: Option<f64>,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64, updated_at: Option<f64>) -> Self {
        Self { lat, lon, updated_at }
    }

    pub fn is_valid(&self) -> bool {
        is_valid_coordinate(self.lat, self.lon)
    }
}

/// Who last set the start line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkSource {
    Manual,
    Auto,
}

/// Mark currently being sailed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkTarget {
    Mark,
    Windward,
    LeewardPort,
    LeewardStarboard,
    LeewardGate,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaceMarks {
    pub mark: Option<GeoPoint>,
    pub windward: Option<GeoPoint>,
    pub leeward_port: Option<GeoPoint>,
    pub leeward_starboard: Option<GeoPoint>,
    pub start_pin: Option<GeoPoint>,
    pub start_rcb: Option<GeoPoint>,
    pub source: Option<MarkSource>,
    pub target: Option<MarkTarget>,
    /// Let the start line follow lines broadcast by the device.
    pub follow: bool,
}

/// Operator commands. Points default to the boat's current position when
/// omitted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarkCommand {
    SetMark {
        #[serde(default)]
        point: Option<GeoPoint>,
    },
    ClearMark,
    SetWindward {
        #[serde(default)]
        point: Option<GeoPoint>,
    },
    ClearWindward,
    SetLeewardPort {
        #[serde(default)]
        point: Option<GeoPoint>,
    },
    SetLeewardStarboard {
        #[serde(default)]
        point: Option<GeoPoint>,
    },
    ClearLeewardGate,
    SetStartPin {
        #[serde(default)]
        point: Option<GeoPoint>,
    },
    SetStartRcb {
        #[serde(default)]
        point: Option<GeoPoint>,
    },
    SetStartLine {
        start_pin: GeoPoint,
        start_rcb: GeoPoint,
    },
    ClearStartLine,
    ClearRaceMarks,
    SetFollow {
        enabled: bool,
    },
    SetTarget {
        #[serde(default)]
        target: Option<MarkTarget>,
    },
    /// Adopt the best device-broadcast line once, even when not following.
    MatchStartLineNow,
}

impl RaceMarks {
    pub fn start_line(&self) -> Option<(GeoPoint, GeoPoint)> {
        Some((self.start_pin?, self.start_rcb?))
    }

    /// Apply a command. Invalid or unresolvable points leave the marks
    /// untouched. Returns true if anything changed.
    pub fn apply(&mut self, command: &MarkCommand, position: Option<(f64, f64)>, now: f64) -> bool {
        let before = self.clone();
        let resolve = |point: &Option<GeoPoint>| -> Option<GeoPoint> {
            let p = match point {
                Some(p) => GeoPoint::new(p.lat, p.lon, Some(now)),
                None => {
                    let (lat, lon) = position?;
                    GeoPoint::new(lat, lon, Some(now))
                }
            };
            p.is_valid().then_some(p)
        };

        match command {
            MarkCommand::SetMark { point } => {
                if let Some(p) = resolve(point) {
                    self.mark = Some(p);
                }
            }
            MarkCommand::ClearMark => self.mark = None,
            MarkCommand::SetWindward { point } => {
                if let Some(p) = resolve(point) {
                    self.windward = Some(p);
                }
            }
            MarkCommand::ClearWindward => self.windward = None,
            MarkCommand::SetLeewardPort { point } => {
                if let Some(p) = resolve(point) {
                    self.leeward_port = Some(p);
                }
            }
            MarkCommand::SetLeewardStarboard { point } => {
                if let Some(p) = resolve(point) {
                    self.leeward_starboard = Some(p);
                }
            }
            MarkCommand::ClearLeewardGate => {
                self.leeward_port = None;
                self.leeward_starboard = None;
            }
            MarkCommand::SetStartPin { point } => {
                if let Some(p) = resolve(point) {
                    self.start_pin = Some(p);
                    self.set_manual();
                }
            }
            MarkCommand::SetStartRcb { point } => {
                if let Some(p) = resolve(point) {
                    self.start_rcb = Some(p);
                    self.set_manual();
                }
            }
            MarkCommand::SetStartLine {
                start_pin,
                start_rcb,
            } => {
                let ends = (resolve(&Some(*start_pin)), resolve(&Some(*start_rcb)));
                if let (Some(pin), Some(rcb)) = ends {
                    self.start_pin = Some(pin);
                    self.start_rcb = Some(rcb);
                    self.set_manual();
                }
            }
            MarkCommand::ClearStartLine => {
                self.start_pin = None;
                self.start_rcb = None;
                self.source = None;
            }
            MarkCommand::ClearRaceMarks => {
                let follow = self.follow;
                *self = RaceMarks {
                    follow,
                    ..RaceMarks::default()
                };
            }
            MarkCommand::SetFollow { enabled } => self.follow = *enabled,
            MarkCommand::SetTarget { target } => self.target = *target,
            MarkCommand::MatchStartLineNow => {}
        }

        *self != before
    }

    // A hand-placed line must not be overwritten by the next broadcast
    fn set_manual(&mut self) {
        self.source = Some(MarkSource::Manual);
        self.follow = false;
    }
}

// ─── Persistence ────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Default)]
struct MarksFile {
    #[serde(default)]
    marks: RaceMarks,
}

pub struct MarksStore {
    path: PathBuf,
}

impl MarksStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file means no marks yet.
    pub fn load(&self) -> Result<RaceMarks, StoreError> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => Ok(serde_json::from_str::<MarksFile>(&raw)?.marks),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RaceMarks::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn load_or_default(&self) -> RaceMarks {
        self.load().unwrap_or_else(|e| {
            log::warn!("Ignoring marks file {}: {}", self.path.display(), e);
            RaceMarks::default()
        })
    }

    pub fn save(&self, marks: &RaceMarks) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&MarksFile {
            marks: marks.clone(),
        })?;
        fs::write(&self.path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HERE: (f64, f64) = (42.2303, -8.7330);

    fn point(lat: f64, lon: f64) -> Option<GeoPoint> {
        Some(GeoPoint::new(lat, lon, None))
    }

    #[test]
    fn test_set_mark_from_current_position() {
        let mut marks = RaceMarks::default();
        assert!(marks.apply(&MarkCommand::SetMark { point: None }, Some(HERE), 10.0));
        let mark = marks.mark.unwrap();
        assert_eq!((mark.lat, mark.lon, mark.updated_at), (HERE.0, HERE.1, Some(10.0)));
    }

    #[test]
    fn test_invalid_input_is_a_noop() {
        let mut marks = RaceMarks::default();
        assert!(!marks.apply(&MarkCommand::SetMark { point: None }, None, 1.0));
        let out_of_range = MarkCommand::SetWindward {
            point: point(95.0, 0.0),
        };
        assert!(!marks.apply(&out_of_range, Some(HERE), 1.0));
        assert!(!marks.apply(&MarkCommand::SetStartPin { point: point(0.0, 0.0) }, None, 1.0));
        assert!(!marks.apply(&MarkCommand::ClearStartLine, None, 1.0));
        assert_eq!(marks, RaceMarks::default());
    }

    #[test]
    fn test_manual_start_point_disables_follow() {
        let mut marks = RaceMarks {
            follow: true,
            ..RaceMarks::default()
        };
        marks.apply(&MarkCommand::SetStartPin { point: point(42.23, -8.74) }, None, 1.0);
        assert!(!marks.follow);
        assert_eq!(marks.source, Some(MarkSource::Manual));

        marks.apply(&MarkCommand::SetFollow { enabled: true }, None, 2.0);
        marks.apply(
            &MarkCommand::SetStartLine {
                start_pin: GeoPoint::new(42.23, -8.74, None),
                start_rcb: GeoPoint::new(42.231, -8.738, None),
            },
            None,
            3.0,
        );
        assert!(!marks.follow);
        assert!(marks.start_line().is_some());
    }

    #[test]
    fn test_clear_race_marks_keeps_follow() {
        let mut marks = RaceMarks {
            follow: true,
            mark: point(42.0, -8.0),
            target: Some(MarkTarget::Windward),
            ..RaceMarks::default()
        };
        assert!(marks.apply(&MarkCommand::ClearRaceMarks, None, 1.0));
        assert_eq!(
            marks,
            RaceMarks {
                follow: true,
                ..RaceMarks::default()
            }
        );
    }

    #[test]
    fn test_command_json_shape() {
        let json = r#"{"type":"set_start_pin","point":{"lat":42.1,"lon":-8.2}}"#;
        let cmd: MarkCommand = serde_json::from_str(json).unwrap();
        assert_eq!(cmd, MarkCommand::SetStartPin { point: point(42.1, -8.2) });
        let cmd: MarkCommand = serde_json::from_str(r#"{"type":"set_windward"}"#).unwrap();
        assert_eq!(cmd, MarkCommand::SetWindward { point: None });
    }

    #[test]
    fn test_store_roundtrip_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let store = MarksStore::new(dir.path().join("nested/marks.json"));
        let mut marks = RaceMarks::default();
        marks.apply(&MarkCommand::SetStartPin { point: point(42.23, -8.74) }, None, 5.0);

        store.save(&marks).unwrap();
        assert_eq!(store.load().unwrap(), marks);

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["marks"]["source"], "manual");
    }

    #[test]
    fn test_store_missing_or_corrupt_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = MarksStore::new(dir.path().join("marks.json"));
        assert_eq!(store.load().unwrap(), RaceMarks::default());

        fs::write(store.path(), "{not json").unwrap();
        assert!(matches!(store.load(), Err(StoreError::Json(_))));
        assert_eq!(store.load_or_default(), RaceMarks::default());
    }
}
