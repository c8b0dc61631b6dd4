//! # flyscan
//!
//! Hardware-synchronized 2D fly-scan orchestration. One stage axis moves
//! continuously while a position-buffering trigger controller timestamps samples and
//! the detectors capture frames in lockstep with that motion.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: capability traits the devices implement, the axis, trigger buffer
//!   and detector controllers built on top of them, mock devices and the device
//!   registry.
//! - **`scan`**: the scan request and its motion math, the orchestrator state machine,
//!   scoped hardware overrides, lifecycle hooks, documents and presets.
//! - **`config`**: figment-based settings (TOML file plus `FLYSCAN_` environment).
//! - **`error`**: the crate error type `FlyScanError`.
//! - **`logging`**: tracing subscriber setup.

pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod scan;

pub use error::{FlyScanError, ScanResult};
pub use scan::orchestrator::{
    AbortHandle, FlyScanDevices, FlyScanOrchestrator, RunResult, ScanSettings,
};
pub use scan::request::ScanRequest;
