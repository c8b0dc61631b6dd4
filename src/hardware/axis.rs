//! Axis controller.
//!
//! Wraps one [`MotionAxis`] together with its declared [`AxisProfile`]. The profile
//! replaces identity checks on axis names: whether an axis gets a tightened retry
//! deadband, whether its backlash speed follows the fly velocity, and which
//! return velocity it gets after a row are all looked up from the profile.

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::error::{FlyScanError, ScanResult};
use crate::hardware::capabilities::{MotionAxis, OverrideSlot};

/// Convergence tolerance for axes in millimetres.
pub const METRIC_DEADBAND: f64 = 0.0005;

/// Convergence tolerance for axes in any other unit system.
pub const COARSE_DEADBAND: f64 = 0.1;

/// Tightened controller retry deadband installed on high-flux stage axes.
pub const FINE_RETRY_DEADBAND: f64 = 2e-4;

/// Unit system of an axis, as far as convergence is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisUnits {
    /// Millimetres
    Millimeters,
    /// Anything else (micrometres, degrees, counts)
    Other,
}

impl AxisUnits {
    /// Classify an engineering-units string
    pub fn from_egu(egu: &str) -> Self {
        if egu.trim() == "mm" {
            AxisUnits::Millimeters
        } else {
            AxisUnits::Other
        }
    }

    /// Position tolerance used when polling for convergence
    pub fn deadband(self) -> f64 {
        match self {
            AxisUnits::Millimeters => METRIC_DEADBAND,
            AxisUnits::Other => COARSE_DEADBAND,
        }
    }
}

/// Mechanical family an axis belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisFamily {
    /// High-flux sample stage (Aerotech)
    HfStage,
    /// Nano-positioning stage
    NanoStage,
    /// Energy-tomography rotation/translation stage
    ETomo,
    /// No special handling
    Generic,
}

impl fmt::Display for AxisFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AxisFamily::HfStage => write!(f, "hf_stage"),
            AxisFamily::NanoStage => write!(f, "nano_stage"),
            AxisFamily::ETomo => write!(f, "e_tomo"),
            AxisFamily::Generic => write!(f, "generic"),
        }
    }
}

/// Velocity an axis returns to after a fly row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReturnVelocity {
    /// Always this value
    Fixed(f64),
    /// This value, capped at the controller's velocity high limit
    CappedByHighLimit(f64),
}

/// Return-velocity policy, keyed by axis family.
const RETURN_VELOCITY_TABLE: &[(AxisFamily, ReturnVelocity)] = &[
    (AxisFamily::ETomo, ReturnVelocity::CappedByHighLimit(4.0)),
    (AxisFamily::NanoStage, ReturnVelocity::Fixed(30.0)),
];

/// Return velocity for families without an entry in the table.
const DEFAULT_RETURN_VELOCITY: ReturnVelocity = ReturnVelocity::Fixed(1.0);

impl AxisFamily {
    /// Look up the post-row return velocity policy
    pub fn return_velocity(self) -> ReturnVelocity {
        RETURN_VELOCITY_TABLE
            .iter()
            .find(|(family, _)| *family == self)
            .map(|(_, policy)| *policy)
            .unwrap_or(DEFAULT_RETURN_VELOCITY)
    }
}

/// Declared capabilities of an axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisProfile {
    /// Family, selects the return-velocity policy
    pub family: AxisFamily,
    /// Retry deadband to install while the axis takes part in a scan
    pub tightened_retry_deadband: Option<f64>,
    /// Whether the backlash speed must track the fly velocity
    pub backlash_follows_velocity: bool,
    /// Whether the stage defaults are reset after a scan that flew this axis
    pub reset_defaults_on_finish: bool,
}

impl AxisProfile {
    /// Default profile for a family
    pub fn for_family(family: AxisFamily) -> Self {
        match family {
            AxisFamily::HfStage => Self {
                family,
                tightened_retry_deadband: Some(FINE_RETRY_DEADBAND),
                backlash_follows_velocity: true,
                reset_defaults_on_finish: true,
            },
            AxisFamily::NanoStage | AxisFamily::ETomo | AxisFamily::Generic => Self {
                family,
                tightened_retry_deadband: None,
                backlash_follows_velocity: false,
                reset_defaults_on_finish: false,
            },
        }
    }

    /// Profile with no special handling
    pub fn generic() -> Self {
        Self::for_family(AxisFamily::Generic)
    }
}

impl Default for AxisProfile {
    fn default() -> Self {
        Self::generic()
    }
}

/// Bounds for the pre-roll convergence loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvergencePolicy {
    /// Maximum number of re-issued moves
    pub max_attempts: u32,
    /// Sleep between a re-issued move and the next readback
    pub poll_interval: Duration,
    /// Wall-clock bound on the whole loop
    pub timeout: Duration,
}

impl Default for ConvergencePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 50,
            poll_interval: Duration::from_millis(100),
            timeout: Duration::from_secs(30),
        }
    }
}

/// One motion axis with its declared profile.
#[derive(Clone)]
pub struct AxisController {
    name: String,
    device: Arc<dyn MotionAxis>,
    profile: AxisProfile,
}

impl fmt::Debug for AxisController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AxisController")
            .field("name", &self.name)
            .field("units", &self.device.engineering_units())
            .field("profile", &self.profile)
            .finish()
    }
}

impl AxisController {
    /// Wrap a device under the given identity
    pub fn new(name: impl Into<String>, device: Arc<dyn MotionAxis>, profile: AxisProfile) -> Self {
        Self {
            name: name.into(),
            device,
            profile,
        }
    }

    /// Axis identity
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared profile
    pub fn profile(&self) -> &AxisProfile {
        &self.profile
    }

    /// Engineering units reported by the device
    pub fn engineering_units(&self) -> &str {
        self.device.engineering_units()
    }

    /// Unit system derived from the device's engineering units
    pub fn units(&self) -> AxisUnits {
        AxisUnits::from_egu(self.device.engineering_units())
    }

    /// Convergence tolerance for this axis
    pub fn deadband(&self) -> f64 {
        self.units().deadband()
    }

    /// Move to `target` and wait for the controller to report done
    pub async fn set_position(&self, target: f64) -> ScanResult<()> {
        debug!(axis = %self.name, target, "Moving axis");
        self.device
            .move_abs(target)
            .await
            .map_err(|e| e.context(format!("moving {} to {target}", self.name)).into())
    }

    /// Current readback
    pub async fn position(&self) -> ScanResult<f64> {
        Ok(self.device.position().await?)
    }

    /// Command travel velocity (speed magnitude)
    pub async fn set_velocity(&self, velocity: f64) -> ScanResult<()> {
        debug!(axis = %self.name, velocity, "Setting axis velocity");
        self.device
            .set_velocity(velocity)
            .await
            .map_err(|e| e.context(format!("setting {} velocity", self.name)).into())
    }

    /// Current commanded velocity
    pub async fn velocity(&self) -> ScanResult<f64> {
        Ok(self.device.velocity().await?)
    }

    /// Whether the readback is within `tolerance` of `target`
    pub async fn is_converged(&self, target: f64, tolerance: f64) -> ScanResult<bool> {
        let position = self.position().await?;
        Ok((position - target).abs() <= tolerance)
    }

    /// Whether the device exposes an override slot
    pub fn supports(&self, slot: OverrideSlot) -> bool {
        slot == OverrideSlot::Velocity || self.device.supports_slot(slot)
    }

    /// Read the current value of a slot
    pub async fn read_override(&self, slot: OverrideSlot) -> ScanResult<f64> {
        match slot {
            OverrideSlot::Velocity => self.velocity().await,
            _ => {
                self.ensure_supported(slot)?;
                Ok(self.device.read_slot(slot).await?)
            }
        }
    }

    /// Write `value` into `slot`, returning the value it replaced
    pub async fn install_override(&self, slot: OverrideSlot, value: f64) -> ScanResult<f64> {
        let prior = self.read_override(slot).await?;
        self.write_override(slot, value).await?;
        debug!(axis = %self.name, %slot, prior, value, "Installed override");
        Ok(prior)
    }

    /// Put `prior` back into `slot`
    pub async fn restore_override(&self, slot: OverrideSlot, prior: f64) -> ScanResult<()> {
        self.write_override(slot, prior).await?;
        debug!(axis = %self.name, %slot, value = prior, "Restored override");
        Ok(())
    }

    /// Write `value` into `slot` without reading the prior value
    pub async fn write_override(&self, slot: OverrideSlot, value: f64) -> ScanResult<()> {
        match slot {
            OverrideSlot::Velocity => self.set_velocity(value).await,
            _ => {
                self.ensure_supported(slot)?;
                self.device
                    .write_slot(slot, value)
                    .await
                    .map_err(|e| e.context(format!("writing {slot} on {}", self.name)).into())
            }
        }
    }

    fn ensure_supported(&self, slot: OverrideSlot) -> ScanResult<()> {
        if self.device.supports_slot(slot) {
            Ok(())
        } else {
            Err(anyhow!("axis '{}' does not expose the {slot} slot", self.name).into())
        }
    }

    /// Velocity to restore after a fly row, per the family policy table
    pub async fn return_velocity(&self) -> ScanResult<f64> {
        match self.profile.family.return_velocity() {
            ReturnVelocity::Fixed(v) => Ok(v),
            ReturnVelocity::CappedByHighLimit(v) => {
                let limit = self.device.velocity_high_limit().await?;
                Ok(limit.map_or(v, |limit| v.min(limit)))
            }
        }
    }

    /// Reset controller defaults (only meaningful for families that ask for it)
    pub async fn reset_defaults(&self) -> ScanResult<()> {
        info!(axis = %self.name, "Resetting stage defaults");
        Ok(self.device.reset_defaults().await?)
    }

    /// Move to `target`, giving up once `limit` has elapsed.
    ///
    /// A move that has not finished in time fails with
    /// [`FlyScanError::ConvergenceTimeout`] reporting the readback at expiry.
    pub async fn set_position_within(&self, target: f64, limit: Duration) -> ScanResult<()> {
        match timeout(limit, self.set_position(target)).await {
            Ok(result) => result,
            Err(_) => Err(self.convergence_timeout(target, 0).await),
        }
    }

    async fn convergence_timeout(&self, target: f64, attempts: u32) -> FlyScanError {
        let position = self.position().await.unwrap_or(f64::NAN);
        warn!(axis = %self.name, target, position, attempts, "Axis did not reach its target in time");
        FlyScanError::ConvergenceTimeout {
            axis: self.name.clone(),
            target,
            position,
            deadband: self.deadband(),
            attempts,
        }
    }

    /// Re-issue the move to `target` until the readback is inside the deadband.
    ///
    /// Returns the number of re-issued moves. Fails with
    /// [`FlyScanError::ConvergenceTimeout`] once `policy` is exhausted; a re-issued
    /// move that stalls is cut off when the time bound runs out.
    pub async fn converge_to(&self, target: f64, policy: &ConvergencePolicy) -> ScanResult<u32> {
        let deadband = self.deadband();
        let started = Instant::now();
        let mut attempts = 0u32;
        let mut position = self.position().await?;

        while (target - position).abs() > deadband {
            let remaining = policy.timeout.saturating_sub(started.elapsed());
            if attempts >= policy.max_attempts || remaining.is_zero() {
                return Err(FlyScanError::ConvergenceTimeout {
                    axis: self.name.clone(),
                    target,
                    position,
                    deadband,
                    attempts,
                });
            }
            if attempts == 0 {
                info!(axis = %self.name, target, position, deadband, "Waiting for axis to reach starting position");
            }
            attempts += 1;
            if timeout(remaining, self.set_position(target)).await.is_err() {
                return Err(self.convergence_timeout(target, attempts).await);
            }
            sleep(policy.poll_interval).await;
            position = self.position().await?;
        }

        if attempts > 0 {
            info!(axis = %self.name, attempts, "Axis reached starting position");
        }
        Ok(attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockAxis;

    fn controller(axis: MockAxis, family: AxisFamily) -> (Arc<MockAxis>, AxisController) {
        let axis = Arc::new(axis);
        let ctrl = AxisController::new("x", axis.clone(), AxisProfile::for_family(family));
        (axis, ctrl)
    }

    #[test]
    fn deadband_depends_on_units() {
        assert_eq!(AxisUnits::from_egu("mm").deadband(), 0.0005);
        assert_eq!(AxisUnits::from_egu("um").deadband(), 0.1);
        assert_eq!(AxisUnits::from_egu("deg").deadband(), 0.1);
    }

    #[test]
    fn return_velocity_table() {
        assert_eq!(
            AxisFamily::ETomo.return_velocity(),
            ReturnVelocity::CappedByHighLimit(4.0)
        );
        assert_eq!(AxisFamily::NanoStage.return_velocity(), ReturnVelocity::Fixed(30.0));
        assert_eq!(AxisFamily::HfStage.return_velocity(), ReturnVelocity::Fixed(1.0));
        assert_eq!(AxisFamily::Generic.return_velocity(), ReturnVelocity::Fixed(1.0));
    }

    #[tokio::test]
    async fn capped_return_velocity_honors_high_limit() {
        let (_, ctrl) = controller(
            MockAxis::new("x", "mm").with_velocity_high_limit(2.5),
            AxisFamily::ETomo,
        );
        assert_eq!(ctrl.return_velocity().await.unwrap(), 2.5);

        let (_, ctrl) = controller(
            MockAxis::new("x", "mm").with_velocity_high_limit(10.0),
            AxisFamily::ETomo,
        );
        assert_eq!(ctrl.return_velocity().await.unwrap(), 4.0);
    }

    #[tokio::test]
    async fn install_and_restore_override() {
        let (axis, ctrl) = controller(
            MockAxis::new("x", "mm").with_slot(OverrideSlot::RetryDeadband, 0.01),
            AxisFamily::HfStage,
        );
        let prior = ctrl
            .install_override(OverrideSlot::RetryDeadband, FINE_RETRY_DEADBAND)
            .await
            .unwrap();
        assert_eq!(prior, 0.01);
        assert_eq!(axis.slot_value(OverrideSlot::RetryDeadband), Some(2e-4));

        ctrl.restore_override(OverrideSlot::RetryDeadband, prior)
            .await
            .unwrap();
        assert_eq!(axis.slot_value(OverrideSlot::RetryDeadband), Some(0.01));
    }

    #[tokio::test]
    async fn unsupported_slot_is_an_error() {
        let (_, ctrl) = controller(MockAxis::new("x", "mm"), AxisFamily::Generic);
        assert!(!ctrl.supports(OverrideSlot::BacklashSpeed));
        assert!(ctrl
            .install_override(OverrideSlot::BacklashSpeed, 1.0)
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn converge_retries_short_moves() {
        let (axis, ctrl) = controller(
            MockAxis::new("x", "mm").with_short_moves(2, 0.01),
            AxisFamily::Generic,
        );
        ctrl.set_position(-2.0).await.unwrap();
        assert!(!ctrl.is_converged(-2.0, ctrl.deadband()).await.unwrap());

        let attempts = ctrl
            .converge_to(-2.0, &ConvergencePolicy::default())
            .await
            .unwrap();
        assert_eq!(attempts, 2);
        assert_eq!(axis.moves_to(-2.0), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn converge_is_bounded() {
        let (_, ctrl) = controller(MockAxis::new("x", "mm").stuck_at(5.0), AxisFamily::Generic);
        let policy = ConvergencePolicy {
            max_attempts: 3,
            ..Default::default()
        };
        let err = ctrl.converge_to(0.0, &policy).await.unwrap_err();
        match err {
            FlyScanError::ConvergenceTimeout {
                attempts, position, ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(position, 5.0);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn converge_cuts_off_a_crawling_move() {
        let (_, ctrl) = controller(
            MockAxis::new("x", "mm").with_velocity(1e-6),
            AxisFamily::Generic,
        );
        // Starts outside the deadband, so the loop issues the move itself
        let axis = Arc::new(MockAxis::new("x", "mm").with_velocity(1e-6).with_position(0.5));
        let crawling = AxisController::new("x", axis, AxisProfile::generic());
        let policy = ConvergencePolicy {
            max_attempts: 3,
            poll_interval: Duration::from_millis(100),
            timeout: Duration::from_secs(30),
        };

        let started = Instant::now();
        let err = crawling.converge_to(0.0, &policy).await.unwrap_err();
        assert_eq!(started.elapsed(), Duration::from_secs(30));
        assert!(matches!(
            err,
            FlyScanError::ConvergenceTimeout { attempts: 1, .. }
        ));

        let started = Instant::now();
        let err = ctrl
            .set_position_within(10.0, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert!(matches!(
            err,
            FlyScanError::ConvergenceTimeout { attempts: 0, position, .. } if position == 0.0
        ));
    }
}
