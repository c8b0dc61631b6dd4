//! Fly-scan hardware layer.
//!
//! Devices implement the fine-grained traits in [`capabilities`]. The controllers in
//! [`axis`], [`trigger_buffer`] and [`detector`] add the policies the orchestrator
//! relies on (deadbands, override slots, buffer protocol, detector timing) on top of
//! those traits.

pub mod axis;
pub mod capabilities;
pub mod detector;
pub mod mock;
pub mod registry;
pub mod trigger_buffer;

use std::future::Future;
use std::time::Duration;

use crate::error::{FlyScanError, ScanResult};

/// Await a hardware acknowledgment, failing with
/// [`FlyScanError::HardwareAcknowledgmentTimeout`] once `timeout` expires.
pub async fn acknowledge<F, T, E>(
    operation: impl Into<String>,
    timeout: Duration,
    fut: F,
) -> ScanResult<T>
where
    F: Future<Output = Result<T, E>>,
    E: Into<FlyScanError>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(FlyScanError::HardwareAcknowledgmentTimeout {
            operation: operation.into(),
            timeout,
        }),
    }
}
