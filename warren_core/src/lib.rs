pub mod branch;
pub mod capture;
pub mod config;
pub mod controller;
pub mod edge;
pub mod forksrv;
pub mod map;
pub mod persistent;
pub mod runtime;

#[cfg(test)]
mod testutil;

pub use branch::ComparisonKind;
pub use capture::{CAPTURE_SENTINEL, CapturedOperands};
pub use config::{ConfigError, ControllerSettings, InstrumentationRatio};
pub use controller::{Controller, ControllerError, ExecutionReport, RunOutcome};
pub use edge::{GuardTable, record_edge, reset_previous_location};
pub use forksrv::Handoff;
pub use map::{CoverageMap, MAP_SIZE, MapError, SharedRegion};
pub use persistent::PersistentLoop;
pub use runtime::Runtime;
