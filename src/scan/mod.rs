//! Fly-scan orchestration.
//!
//! - [`request`]: the scan request and row motion math
//! - [`state`]: orchestrator states and legal transitions
//! - [`overrides`]: scoped hardware overrides restored on every exit path
//! - [`orchestrator`]: the state machine driving one scan
//! - [`document`]: start / descriptor / event page / stop documents
//! - [`hooks`]: lifecycle callbacks and scan-record telemetry
//! - [`presets`]: named bindings of axes, trigger buffer and detectors

pub mod document;
pub mod hooks;
pub mod orchestrator;
pub mod overrides;
pub mod presets;
pub mod request;
pub mod state;
