//! Atomic Hardware Capabilities
//!
//! This module defines the fine-grained capability traits that fly-scan hardware
//! implements. Instead of one monolithic `Device` trait, each device implements the
//! capabilities it actually has:
//!
//! - A motor axis implements: `Movable + VelocityControl + OverrideSlots`
//! - An area detector implements: `Triggerable + FrameCountConfigurable +
//!   CaptureCountConfigurable`, optionally exposing `ExposureConfigurable`
//! - The trigger buffer implements: `PositionBuffer`, with its counter as `Scaler`
//! - A shutter implements: `ShutterControl`
//!
//! The orchestrator dispatches on these declared capabilities (and on the detector
//! kind), never on device name strings.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE thing
//!
//! # Example
//!
//! ```rust,ignore
//! async fn pre_roll<A>(axis: &A, target: f64) -> Result<()>
//! where
//!     A: Movable + VelocityControl,
//! {
//!     axis.set_velocity(1.0).await?;
//!     axis.move_abs(target).await?;
//!     Ok(())
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::hardware::detector::DetectorKind;
use crate::hardware::trigger_buffer::{BufferedSample, RowBufferConfig};

/// Completion of an acquisition started by [`Triggerable::trigger`].
///
/// The future resolves once the detector has captured every frame it was armed for.
/// It is `'static` so it can be awaited alongside motion in a wait group.
pub type AcquisitionStatus = BoxFuture<'static, Result<()>>;

/// Capability: Motion Control
///
/// Devices that can move to positions (stage axes).
///
/// # Contract
/// - Positions are in device-native units (see `engineering_units`)
/// - `move_abs` resolves once the axis reports the move done; the readback may
///   still sit outside a tight deadband afterwards
/// - `position` returns the current readback
#[async_trait]
pub trait Movable: Send + Sync {
    /// Move to absolute position and wait for the move to finish
    ///
    /// # Returns
    /// - Ok(()) when the controller reports motion done
    /// - Err if position is out of range or hardware error
    async fn move_abs(&self, position: f64) -> Result<()>;

    /// Get current readback position
    async fn position(&self) -> Result<f64>;

    /// Engineering units of the axis (e.g. "mm", "um", "deg")
    fn engineering_units(&self) -> &str;

    /// Stop motion immediately
    ///
    /// # Default Implementation
    /// Returns an error indicating stop is not supported.
    async fn stop(&self) -> Result<()> {
        anyhow::bail!("Stop not supported by this device")
    }
}

/// Capability: Velocity Control
///
/// Axes whose travel speed can be commanded.
#[async_trait]
pub trait VelocityControl: Send + Sync {
    /// Set travel velocity in units/second
    async fn set_velocity(&self, velocity: f64) -> Result<()>;

    /// Current commanded velocity in units/second
    async fn velocity(&self) -> Result<f64>;

    /// Upper velocity limit, if the controller exposes one
    async fn velocity_high_limit(&self) -> Result<Option<f64>> {
        Ok(None)
    }
}

/// Named controller settings the orchestrator may temporarily override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideSlot {
    /// Position tolerance the controller's retry loop works to
    RetryDeadband,
    /// Speed used for the final backlash-compensating approach
    BacklashSpeed,
    /// Travel velocity (row-scoped during a fly)
    Velocity,
}

impl fmt::Display for OverrideSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverrideSlot::RetryDeadband => write!(f, "retry_deadband"),
            OverrideSlot::BacklashSpeed => write!(f, "backlash_speed"),
            OverrideSlot::Velocity => write!(f, "velocity"),
        }
    }
}

/// Capability: Override Slots
///
/// Process-wide controller settings (deadband, backlash speed) that are shared by
/// every user of the axis. Anything written here must be restored by the writer.
///
/// # Contract
/// - `supports_slot` is static for the lifetime of the device
/// - `read_slot`/`write_slot` on an unsupported slot return Err
/// - `Velocity` is always supported by axes that also implement `VelocityControl`
#[async_trait]
pub trait OverrideSlots: Send + Sync {
    /// Whether the controller exposes this slot
    fn supports_slot(&self, slot: OverrideSlot) -> bool;

    /// Read the current value of a slot
    async fn read_slot(&self, slot: OverrideSlot) -> Result<f64>;

    /// Write a slot value
    async fn write_slot(&self, slot: OverrideSlot, value: f64) -> Result<()>;

    /// Return every controller setting to its factory defaults
    ///
    /// # Default Implementation
    /// Nothing to reset.
    async fn reset_defaults(&self) -> Result<()> {
        Ok(())
    }
}

/// Combined trait for motion axes
///
/// This trait exists solely to enable trait objects. Implement the individual
/// traits and get this automatically via blanket impl.
pub trait MotionAxis: Movable + VelocityControl + OverrideSlots {}

/// Blanket implementation - any type implementing all three traits is a MotionAxis
impl<T: Movable + VelocityControl + OverrideSlots> MotionAxis for T {}

/// Capability: External Triggering
///
/// Detectors that are armed once per row and then triggered.
///
/// # Contract
/// - `arm()` prepares the detector to output data for the next fly row
/// - `trigger()` starts the acquisition and returns immediately with a status
///   future that resolves when the acquisition is complete
/// - Calling `trigger()` on an unarmed device returns Err
#[async_trait]
pub trait Triggerable: Send + Sync {
    /// Arm for the next fly row
    async fn arm(&self) -> Result<()>;

    /// Start acquisition, returning its completion status
    async fn trigger(&self) -> Result<AcquisitionStatus>;
}

/// Capability: Exposure Time Control
///
/// # Contract
/// - Times are in seconds
/// - Setting exposure does not start acquisition
#[async_trait]
pub trait ExposureConfigurable: Send + Sync {
    /// Set integration time and frame period
    async fn set_exposure(&self, exposure_time: f64, exposure_period: f64) -> Result<()>;

    /// Current (exposure_time, exposure_period)
    async fn exposure(&self) -> Result<(f64, f64)>;
}

/// Capability: Frame Count
#[async_trait]
pub trait FrameCountConfigurable: Send + Sync {
    /// Number of images the detector will acquire per trigger
    async fn set_frame_count(&self, frames: u32) -> Result<()>;

    /// Current image count
    async fn frame_count(&self) -> Result<u32>;

    /// Number of points in one fly row, used by the file writer
    async fn set_total_points(&self, points: u32) -> Result<()>;
}

/// Capability: Capture Buffer Count
#[async_trait]
pub trait CaptureCountConfigurable: Send + Sync {
    /// Number of frames the capture plugin will buffer
    async fn set_capture_count(&self, captures: u32) -> Result<()>;

    /// Current capture count
    async fn capture_count(&self) -> Result<u32>;
}

/// Capability: Trigger Source Selection
#[async_trait]
pub trait ExternalTriggerControl: Send + Sync {
    /// Route triggers from the external trigger buffer (`true`) or internal (`false`)
    async fn set_external_trigger(&self, external: bool) -> Result<()>;

    /// Whether external triggering is enabled
    async fn external_trigger(&self) -> Result<bool>;
}

/// A detector usable in a fly scan
///
/// Optional capabilities are exposed through accessor methods so that adapters
/// can gate configuration on what the device declares.
#[async_trait]
pub trait FlyDetector: Triggerable + FrameCountConfigurable + CaptureCountConfigurable {
    /// Device identity (used for documents and logs only)
    fn name(&self) -> &str;

    /// Detector kind, selects the timing policy
    fn kind(&self) -> DetectorKind;

    /// Exposure control, if the detector supports it
    fn exposure_control(&self) -> Option<&dyn ExposureConfigurable> {
        None
    }

    /// Trigger source selection, if the detector supports it
    fn trigger_source(&self) -> Option<&dyn ExternalTriggerControl> {
        None
    }

    /// Frames acquired since the detector was last armed
    async fn frames_acquired(&self) -> Result<u64>;
}

/// Capability: Position Buffering
///
/// The trigger fan-out device that timestamps encoder positions during a row. The
/// raw device performs no ordering checks; see
/// [`TriggerBufferController`](crate::hardware::trigger_buffer::TriggerBufferController).
#[async_trait]
pub trait PositionBuffer: Send + Sync {
    /// Device identity
    fn name(&self) -> &str;

    /// Load the row parameters
    async fn configure(&self, config: &RowBufferConfig) -> Result<()>;

    /// Arm buffering; resolves once the device acknowledges
    async fn kickoff(&self) -> Result<()>;

    /// Stop buffering; resolves once the device acknowledges
    async fn complete(&self) -> Result<()>;

    /// Read out the buffered samples and clear them on the device
    async fn collect(&self) -> Result<Vec<BufferedSample>>;

    /// Drop whatever the device has buffered
    async fn discard(&self) -> Result<()> {
        self.collect().await.map(|_| ())
    }
}

/// Scaler counting mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalerCountMode {
    /// Count once for the configured number of points
    OneShot,
    /// Free-running background counting
    AutoCount,
}

/// Capability: Scaler/Counter
///
/// Multichannel counter clocked by the trigger buffer.
#[async_trait]
pub trait Scaler: Send + Sync {
    /// Number of points to acquire
    async fn set_points(&self, points: u32) -> Result<()>;

    /// Erase and start counting
    async fn erase_start(&self) -> Result<()>;

    /// Stop counting
    async fn stop_all(&self) -> Result<()>;

    /// Select counting mode
    async fn set_count_mode(&self, mode: ScalerCountMode) -> Result<()>;

    /// Current counting mode
    async fn count_mode(&self) -> Result<ScalerCountMode>;

    /// Whether the scaler is currently counting
    async fn is_counting(&self) -> Result<bool>;
}

/// Capability: Shutter Control
///
/// # Safety
/// CAUTION: Always verify shutter state before assuming beam is blocked.
#[async_trait]
pub trait ShutterControl: Send + Sync {
    /// Open the shutter (allow beam to pass)
    async fn open_shutter(&self) -> Result<()>;

    /// Close the shutter (block beam)
    async fn close_shutter(&self) -> Result<()>;

    /// Query shutter state
    async fn is_shutter_open(&self) -> Result<bool>;
}

/// Capability: Scalar Readout
///
/// Used for beamline status values (e.g. monochromator energy in keV).
#[async_trait]
pub trait Readable: Send + Sync {
    /// Read current value
    async fn read(&self) -> Result<f64>;
}

/// Capability: Beam Alignment
///
/// External peak-up routine optionally run before the first row.
#[async_trait]
pub trait BeamAligner: Send + Sync {
    /// Run a fine peak-up; `shutter` says whether the routine may drive the shutter
    async fn peakup(&self, shutter: bool) -> Result<()>;
}
