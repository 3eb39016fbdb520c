//! Telemetry pipeline for the Vakaros Atlas 2 sailing instrument: wire
//! decoding, a self-healing BLE link, fusion of position, heading and speed
//! into SOG/COG, and start-line tracking.

pub mod error;
pub mod event_bus;
pub mod fusion;
pub mod geo;
pub mod link;
pub mod live_status;
pub mod marks;
pub mod protocol;
pub mod start_line;
pub mod types;

pub use error::{LinkError, LinkResult, StoreError};
pub use event_bus::{event_bus, EventReceiver, EventSender};
pub use fusion::{FusionConfig, FusionEngine, FusionUpdate, StateSnapshot};
pub use link::{AtlasLink, LinkConfig, LinkPhase, SimConfig, SimulatedTransport, Transport};
pub use marks::{MarkCommand, MarksStore, RaceMarks};
pub use types::{ConnectionStatus, TelemetryEvent};
