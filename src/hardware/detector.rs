//! Detector adapters.
//!
//! Every detector kind carries a timing policy: how exposure time and period derive
//! from the requested dwell, the shortest dwell the kind can keep up with, how long
//! to settle after a trigger, and whether external triggering must be switched on.
//! The policies live in one lookup table so that adding a kind means adding a row,
//! not another branch in the orchestrator.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{DetectorTimingViolation, ScanResult};
use crate::hardware::capabilities::{AcquisitionStatus, FlyDetector};

/// Scan type recorded when no detector asks for another.
pub const DEFAULT_SCAN_TYPE: &str = "XRF_fly";

/// Detector family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    /// Xspress3 fluorescence detector
    Xspress3,
    /// Xspress3 Mini (energy-tomography end station)
    Xspress3Mini,
    /// Merlin pixel detector
    Merlin,
    /// Dexela flat panel
    Dexela,
    /// Anything else: triggered, no timing policy
    Generic,
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectorKind::Xspress3 => write!(f, "xspress3"),
            DetectorKind::Xspress3Mini => write!(f, "xspress3_mini"),
            DetectorKind::Merlin => write!(f, "merlin"),
            DetectorKind::Dexela => write!(f, "dexela"),
            DetectorKind::Generic => write!(f, "generic"),
        }
    }
}

/// Linear exposure derivation: `time = time_scale * dwell + time_offset`,
/// `period = period_scale * dwell + period_offset`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExposureFormula {
    /// Multiplier on dwell for the exposure time
    pub time_scale: f64,
    /// Offset added to the exposure time
    pub time_offset: f64,
    /// Multiplier on dwell for the exposure period
    pub period_scale: f64,
    /// Offset added to the exposure period
    pub period_offset: f64,
}

impl ExposureFormula {
    /// (exposure_time, exposure_period) for a dwell
    pub fn apply(&self, dwell: f64) -> (f64, f64) {
        (
            self.time_scale * dwell + self.time_offset,
            self.period_scale * dwell + self.period_offset,
        )
    }
}

/// Minimum dwell for a kind and the dwell substituted when a request is below it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DwellFloor {
    /// Shortest dwell the detector keeps up with
    pub minimum: f64,
    /// Dwell used instead of a too-short request
    pub clamp_to: f64,
}

/// Timing policy of a detector kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorPolicy {
    /// Exposure derivation, if the kind has one
    pub exposure: Option<ExposureFormula>,
    /// Dwell floor, if the kind has one
    pub dwell_floor: Option<DwellFloor>,
    /// Pause after triggering before the fly move starts
    pub settle_after_trigger: Duration,
    /// Whether external triggering is installed for the run
    pub external_trigger: bool,
    /// Scan type this detector imposes on the run
    pub scan_type: Option<&'static str>,
}

const NO_POLICY: DetectorPolicy = DetectorPolicy {
    exposure: None,
    dwell_floor: None,
    settle_after_trigger: Duration::ZERO,
    external_trigger: false,
    scan_type: None,
};

const POLICY_TABLE: &[(DetectorKind, DetectorPolicy)] = &[
    (
        DetectorKind::Xspress3,
        DetectorPolicy {
            external_trigger: true,
            ..NO_POLICY
        },
    ),
    (
        DetectorKind::Xspress3Mini,
        DetectorPolicy {
            external_trigger: true,
            scan_type: Some("XRF_E_tomo_fly"),
            ..NO_POLICY
        },
    ),
    (
        DetectorKind::Merlin,
        DetectorPolicy {
            exposure: Some(ExposureFormula {
                time_scale: 0.25,
                time_offset: -0.0016392,
                period_scale: 0.5,
                period_offset: 0.0,
            }),
            dwell_floor: Some(DwellFloor {
                minimum: 0.0066392,
                clamp_to: 0.007,
            }),
            ..NO_POLICY
        },
    ),
    (
        DetectorKind::Dexela,
        DetectorPolicy {
            exposure: Some(ExposureFormula {
                time_scale: 0.5,
                time_offset: -0.05,
                period_scale: 0.5,
                period_offset: -0.02,
            }),
            settle_after_trigger: Duration::from_secs(1),
            ..NO_POLICY
        },
    ),
];

impl DetectorKind {
    /// Timing policy for this kind
    pub fn policy(self) -> DetectorPolicy {
        POLICY_TABLE
            .iter()
            .find(|(kind, _)| *kind == self)
            .map(|(_, policy)| *policy)
            .unwrap_or(NO_POLICY)
    }
}

/// A detector together with its kind's timing policy.
#[derive(Clone)]
pub struct DetectorAdapter {
    device: Arc<dyn FlyDetector>,
    policy: DetectorPolicy,
}

impl fmt::Debug for DetectorAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetectorAdapter")
            .field("name", &self.device.name())
            .field("kind", &self.device.kind())
            .finish()
    }
}

impl DetectorAdapter {
    /// Adapt a device using the policy of its declared kind
    pub fn new(device: Arc<dyn FlyDetector>) -> Self {
        let policy = device.kind().policy();
        Self { device, policy }
    }

    /// Device identity
    pub fn name(&self) -> &str {
        self.device.name()
    }

    /// Declared kind
    pub fn kind(&self) -> DetectorKind {
        self.device.kind()
    }

    /// Timing policy
    pub fn policy(&self) -> &DetectorPolicy {
        &self.policy
    }

    /// Dwell this detector will actually be configured with.
    ///
    /// Requests under the kind's floor are clamped; the violation is returned so the
    /// run can record it. The stage keeps the requested dwell either way.
    pub fn effective_dwell(&self, requested: f64) -> (f64, Option<DetectorTimingViolation>) {
        match self.policy.dwell_floor {
            Some(floor) if requested < floor.minimum => (
                floor.clamp_to,
                Some(DetectorTimingViolation {
                    detector: self.name().to_string(),
                    requested_dwell: requested,
                    minimum_dwell: floor.minimum,
                    effective_dwell: floor.clamp_to,
                }),
            ),
            _ => (requested, None),
        }
    }

    /// Configure exposure for `requested_dwell` according to the kind's policy
    pub async fn configure_exposure(
        &self,
        requested_dwell: f64,
    ) -> ScanResult<Option<DetectorTimingViolation>> {
        let (dwell, violation) = self.effective_dwell(requested_dwell);
        if let Some(v) = &violation {
            warn!(
                detector = %v.detector,
                requested = v.requested_dwell,
                minimum = v.minimum_dwell,
                effective = v.effective_dwell,
                "Dwell below detector minimum, clamping"
            );
        }

        let Some(formula) = self.policy.exposure else {
            return Ok(violation);
        };
        let (time, period) = formula.apply(dwell);
        match self.device.exposure_control() {
            Some(control) => {
                debug!(detector = %self.name(), time, period, "Setting exposure");
                control.set_exposure(time, period).await?;
            }
            None => warn!(
                detector = %self.name(),
                "Detector kind has an exposure policy but the device exposes no exposure control"
            ),
        }
        Ok(violation)
    }

    /// Frames per row and capture buffer size
    pub async fn set_row_frames(&self, frames: u32) -> ScanResult<()> {
        self.device.set_frame_count(frames).await?;
        self.device.set_capture_count(frames).await?;
        Ok(())
    }

    /// Points per row for the file writer
    pub async fn set_total_points(&self, points: u32) -> ScanResult<()> {
        Ok(self.device.set_total_points(points).await?)
    }

    /// Arm for the next row
    pub async fn arm(&self) -> ScanResult<()> {
        Ok(self.device.arm().await?)
    }

    /// Trigger the acquisition and hand back its completion status
    pub async fn trigger(&self) -> ScanResult<AcquisitionStatus> {
        Ok(self.device.trigger().await?)
    }

    /// Frames acquired since the last arm
    pub async fn frames_acquired(&self) -> ScanResult<u64> {
        Ok(self.device.frames_acquired().await?)
    }

    /// Whether this detector needs external triggering and exposes trigger selection
    pub fn wants_external_trigger(&self) -> bool {
        self.policy.external_trigger && self.device.trigger_source().is_some()
    }

    /// Current trigger source selection, if exposed
    pub async fn external_trigger(&self) -> ScanResult<Option<bool>> {
        match self.device.trigger_source() {
            Some(source) => Ok(Some(source.external_trigger().await?)),
            None => Ok(None),
        }
    }

    /// Select the trigger source, if exposed
    pub async fn set_external_trigger(&self, external: bool) -> ScanResult<()> {
        if let Some(source) = self.device.trigger_source() {
            debug!(detector = %self.name(), external, "Selecting trigger source");
            source.set_external_trigger(external).await?;
        }
        Ok(())
    }
}

/// Scan type for a set of detectors.
pub fn scan_type_for(detectors: &[DetectorAdapter]) -> &'static str {
    detectors
        .iter()
        .find_map(|d| d.policy().scan_type)
        .unwrap_or(DEFAULT_SCAN_TYPE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{CommandJournal, MockDetector};

    fn adapter(kind: DetectorKind) -> (Arc<MockDetector>, DetectorAdapter) {
        let det = Arc::new(MockDetector::new("det", kind, CommandJournal::new()));
        (det.clone(), DetectorAdapter::new(det))
    }

    #[test]
    fn merlin_clamps_short_dwell() {
        let (_, merlin) = adapter(DetectorKind::Merlin);
        let (dwell, violation) = merlin.effective_dwell(0.005);
        assert_eq!(dwell, 0.007);
        let v = violation.unwrap();
        assert_eq!(v.requested_dwell, 0.005);
        assert_eq!(v.minimum_dwell, 0.0066392);

        let (dwell, violation) = merlin.effective_dwell(0.01);
        assert_eq!(dwell, 0.01);
        assert!(violation.is_none());
    }

    #[test]
    fn other_kinds_never_clamp() {
        for kind in [
            DetectorKind::Xspress3,
            DetectorKind::Xspress3Mini,
            DetectorKind::Dexela,
            DetectorKind::Generic,
        ] {
            let (_, det) = adapter(kind);
            assert_eq!(det.effective_dwell(0.001), (0.001, None));
        }
    }

    #[tokio::test]
    async fn merlin_exposure_uses_clamped_dwell() {
        let (det, merlin) = adapter(DetectorKind::Merlin);
        let violation = merlin.configure_exposure(0.005).await.unwrap();
        assert!(violation.is_some());
        let (time, period) = det.exposure_settings().unwrap();
        assert!((time - (0.25 * 0.007 - 0.0016392)).abs() < 1e-12);
        assert!((period - 0.0035).abs() < 1e-12);
    }

    #[tokio::test]
    async fn dexela_exposure_formula() {
        let (det, dexela) = adapter(DetectorKind::Dexela);
        dexela.configure_exposure(0.2).await.unwrap();
        let (time, period) = det.exposure_settings().unwrap();
        assert!((time - 0.05).abs() < 1e-12);
        assert!((period - 0.08).abs() < 1e-12);
        assert_eq!(dexela.policy().settle_after_trigger, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn xspress3_leaves_exposure_alone() {
        let (det, xs) = adapter(DetectorKind::Xspress3);
        xs.configure_exposure(0.1).await.unwrap();
        assert!(det.exposure_settings().is_none());
        assert!(xs.wants_external_trigger());
    }

    #[test]
    fn scan_type_follows_detectors() {
        let (_, xs) = adapter(DetectorKind::Xspress3);
        let (_, xs2) = adapter(DetectorKind::Xspress3Mini);
        assert_eq!(scan_type_for(std::slice::from_ref(&xs)), "XRF_fly");
        assert_eq!(scan_type_for(&[xs, xs2]), "XRF_E_tomo_fly");
        assert_eq!(scan_type_for(&[]), "XRF_fly");
    }
}
