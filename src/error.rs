//! Custom error types for fly-scan orchestration.
//!
//! This module defines the primary error type, `FlyScanError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the kinds of failure a fly scan can run into, from rejected scan requests to
//! hardware that never acknowledges a command.
//!
//! ## Error Hierarchy
//!
//! - **`Configuration`**: The scan request failed validation. Raised before any
//!   hardware is touched.
//! - **`Config`**: Wraps errors from `figment` while loading the TOML/env settings.
//! - **`ConvergenceTimeout`**: An axis never settled inside its deadband during
//!   pre-roll within the configured attempt/time bound.
//! - **`HardwareAcknowledgmentTimeout`**: The trigger buffer or the motion/detector
//!   completion group never signalled.
//! - **`BufferProtocol`**: The trigger buffer's configure/kickoff/complete/collect
//!   ordering was violated. This is a programming error and is never papered over.
//! - **`Hardware`**: Anything a device driver reported through its capability trait.
//!
//! Device capability traits return `anyhow::Result`, so `FlyScanError` converts from
//! `anyhow::Error` and the `?` operator works across the boundary.
//!
//! Detector timing violations are not errors: the affected adapter clamps its dwell
//! and the run records a [`DetectorTimingViolation`].

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::hardware::trigger_buffer::BufferPhase;

/// Convenience alias for results using the crate error type.
pub type ScanResult<T> = std::result::Result<T, FlyScanError>;

/// Primary error type for fly-scan orchestration.
#[derive(Error, Debug)]
pub enum FlyScanError {
    /// Settings file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// The scan request (or a settings value) is invalid.
    ///
    /// **Error Type**: Permanent. Raised during validation with zero side effects.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// An axis did not converge on its pre-roll target.
    #[error(
        "Axis '{axis}' did not converge on {target} (last position {position}, deadband {deadband}) after {attempts} attempts"
    )]
    ConvergenceTimeout {
        /// Axis identity
        axis: String,
        /// Commanded position
        target: f64,
        /// Last readback
        position: f64,
        /// Tolerance the readback was checked against
        deadband: f64,
        /// Number of re-issued moves
        attempts: u32,
    },

    /// A completion wait never signalled.
    #[error("Timed out after {timeout:?} waiting for {operation}")]
    HardwareAcknowledgmentTimeout {
        /// What was being waited on
        operation: String,
        /// Bound that expired
        timeout: Duration,
    },

    /// Trigger buffer protocol called out of order.
    #[error("Trigger buffer protocol violation: cannot {attempted} while {phase}")]
    BufferProtocol {
        /// Operation that was attempted
        attempted: &'static str,
        /// Phase the buffer was in
        phase: BufferPhase,
    },

    /// The run was aborted through its abort handle.
    #[error("Scan aborted: {0}")]
    Aborted(String),

    /// Another scan currently owns the hardware.
    #[error("A scan is already running on this orchestrator")]
    Busy,

    /// A preset or request named a device the registry does not know.
    #[error("Unknown device '{0}'")]
    UnknownDevice(String),

    /// Failure reported by a device driver.
    #[error("Hardware error: {0:#}")]
    Hardware(anyhow::Error),
}

impl From<anyhow::Error> for FlyScanError {
    fn from(err: anyhow::Error) -> Self {
        FlyScanError::Hardware(err)
    }
}

impl From<figment::Error> for FlyScanError {
    fn from(err: figment::Error) -> Self {
        FlyScanError::Config(Box::new(err))
    }
}

impl FlyScanError {
    /// True for failures raised before any hardware was touched.
    pub fn is_pre_mutation(&self) -> bool {
        matches!(
            self,
            FlyScanError::Configuration(_)
                | FlyScanError::Config(_)
                | FlyScanError::Busy
                | FlyScanError::UnknownDevice(_)
        )
    }

    /// Exit status string recorded in the stop document.
    pub fn exit_status(&self) -> &'static str {
        match self {
            FlyScanError::Aborted(_) => "abort",
            _ => "fail",
        }
    }
}

/// A detector was asked to run faster than its kind allows.
///
/// Recovered locally: the adapter configures itself with `effective_dwell` and the
/// stage keeps using `requested_dwell`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorTimingViolation {
    /// Detector name
    pub detector: String,
    /// Dwell from the scan request
    pub requested_dwell: f64,
    /// Minimum dwell the kind accepts
    pub minimum_dwell: f64,
    /// Dwell the adapter was configured with
    pub effective_dwell: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_are_pre_mutation() {
        let err = FlyScanError::Configuration("fast_num must be >= 1".into());
        assert!(err.is_pre_mutation());
        assert_eq!(err.exit_status(), "fail");
        assert!(err.to_string().contains("fast_num"));
    }

    #[test]
    fn hardware_errors_wrap_anyhow_context() {
        let err: FlyScanError = anyhow::anyhow!("encoder offline")
            .context("collecting row 3")
            .into();
        assert!(!err.is_pre_mutation());
        let msg = err.to_string();
        assert!(msg.contains("collecting row 3"));
        assert!(msg.contains("encoder offline"));
    }

    #[test]
    fn abort_maps_to_abort_status() {
        let err = FlyScanError::Aborted("operator request".into());
        assert_eq!(err.exit_status(), "abort");
    }

    #[test]
    fn protocol_violation_names_phase() {
        let err = FlyScanError::BufferProtocol {
            attempted: "collect",
            phase: BufferPhase::Kickedoff,
        };
        assert_eq!(
            err.to_string(),
            "Trigger buffer protocol violation: cannot collect while kicked off"
        );
    }
}
