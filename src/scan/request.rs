//! Scan requests and row motion math.
//!
//! A [`ScanRequest`] is the immutable user input. [`ScanRequest::validate`] rejects
//! impossible requests before any hardware is touched, and [`RowGeometry`] derives
//! the fly velocity and pre-roll distance every row uses.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::MotionConfig;
use crate::error::{FlyScanError, ScanResult};

/// A rectangular fly scan.
///
/// The first three coordinates belong to the fast (flying) axis, the next three to
/// the slow (stepped) axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRequest {
    /// First trigger position on the fast axis
    pub fast_start: f64,
    /// Last trigger position on the fast axis
    pub fast_stop: f64,
    /// Triggers per row
    pub fast_num: u32,
    /// First slow-axis position
    pub slow_start: f64,
    /// Last slow-axis position
    pub slow_stop: f64,
    /// Number of rows
    pub slow_num: u32,
    /// Seconds per point
    pub dwell: f64,
    /// Pre-roll distance; derived from the velocity when absent
    #[serde(default)]
    pub delta: Option<f64>,
    /// Open the shutter for the scan and close it afterwards
    #[serde(default = "default_true")]
    pub shutter_control: bool,
    /// Run a peak-up at the start position before the first row
    #[serde(default)]
    pub align_first: bool,
    /// Free-form user metadata copied into the start document
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

impl ScanRequest {
    /// Request with default flags and no metadata
    pub fn new(
        (fast_start, fast_stop, fast_num): (f64, f64, u32),
        (slow_start, slow_stop, slow_num): (f64, f64, u32),
        dwell: f64,
    ) -> Self {
        Self {
            fast_start,
            fast_stop,
            fast_num,
            slow_start,
            slow_stop,
            slow_num,
            dwell,
            delta: None,
            shutter_control: true,
            align_first: false,
            metadata: HashMap::new(),
        }
    }

    /// Reject requests that cannot be executed.
    ///
    /// Pure: never touches hardware.
    pub fn validate(&self) -> ScanResult<()> {
        if self.fast_num < 1 || self.slow_num < 1 {
            return Err(FlyScanError::Configuration(format!(
                "point counts must be at least 1 (fast_num={}, slow_num={})",
                self.fast_num, self.slow_num
            )));
        }
        if self.fast_num < 2 {
            return Err(FlyScanError::Configuration(
                "fast_num must be at least 2 to derive a fly velocity".into(),
            ));
        }
        for (name, value) in [
            ("fast_start", self.fast_start),
            ("fast_stop", self.fast_stop),
            ("slow_start", self.slow_start),
            ("slow_stop", self.slow_stop),
        ] {
            if !value.is_finite() {
                return Err(FlyScanError::Configuration(format!(
                    "{name} must be finite, got {value}"
                )));
            }
        }
        if !self.dwell.is_finite() || self.dwell <= 0.0 {
            return Err(FlyScanError::Configuration(format!(
                "dwell must be a positive number of seconds, got {}",
                self.dwell
            )));
        }
        if self.fast_start == self.fast_stop {
            return Err(FlyScanError::Configuration(
                "fast_start and fast_stop must differ".into(),
            ));
        }
        if let Some(delta) = self.delta {
            if !delta.is_finite() || delta < 0.0 {
                return Err(FlyScanError::Configuration(format!(
                    "delta must be a non-negative distance, got {delta}"
                )));
            }
        }
        Ok(())
    }

    /// Total number of points
    pub fn total_points(&self) -> u64 {
        u64::from(self.fast_num) * u64::from(self.slow_num)
    }

    /// Slow-axis position of every row, evenly spaced and inclusive
    pub fn slow_positions(&self) -> Vec<f64> {
        linspace(self.slow_start, self.slow_stop, self.slow_num)
    }
}

/// `num` evenly spaced values from `start` to `stop` inclusive.
///
/// A single value is `start`.
pub fn linspace(start: f64, stop: f64, num: u32) -> Vec<f64> {
    match num {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / f64::from(num - 1);
            (0..num)
                .map(|i| if i == num - 1 { stop } else { start + step * f64::from(i) })
                .collect()
        }
    }
}

/// Fly velocity: one point per dwell.
///
/// Signed; negative when the row runs towards smaller coordinates.
pub fn row_velocity(fast_start: f64, fast_stop: f64, fast_num: u32, dwell: f64) -> f64 {
    (fast_stop - fast_start) / f64::from(fast_num.saturating_sub(1)) / dwell
}

/// Pre-roll distance needed to reach `velocity` before the first trigger.
pub fn pre_roll_delta(velocity: f64, motion: &MotionConfig) -> f64 {
    motion.min_delta.max(motion.accel_time_s * velocity)
}

/// Hours left when `row_index` rows are done.
pub fn time_remaining_hours(
    slow_num: u32,
    row_index: u32,
    dwell: f64,
    fast_num: u32,
    row_overhead_s: f64,
) -> f64 {
    f64::from(slow_num.saturating_sub(row_index)) * (dwell * f64::from(fast_num) + row_overhead_s)
        / 3600.0
}

/// Motion parameters shared by every row of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RowGeometry {
    /// Signed fly velocity
    pub velocity: f64,
    /// Pre-roll distance
    pub delta: f64,
    /// Where the fast axis waits before flying
    pub pre_roll_start: f64,
    /// Where the fly move ends
    pub overshoot_end: f64,
    /// Triggers per row
    pub fast_num: u32,
    /// Seconds per point (as requested, never clamped)
    pub dwell: f64,
}

impl RowGeometry {
    /// Derive the row geometry of a validated request
    pub fn compute(request: &ScanRequest, motion: &MotionConfig) -> Self {
        let velocity = row_velocity(
            request.fast_start,
            request.fast_stop,
            request.fast_num,
            request.dwell,
        );
        let delta = request
            .delta
            .unwrap_or_else(|| pre_roll_delta(velocity.abs(), motion));
        // Pre-roll always sits behind the first trigger in the direction of travel.
        let direction = (request.fast_stop - request.fast_start).signum();
        Self {
            velocity,
            delta,
            pre_roll_start: request.fast_start - direction * delta,
            overshoot_end: request.fast_stop + direction * delta,
            fast_num: request.fast_num,
            dwell: request.dwell,
        }
    }

    /// Speed to command on the fast axis
    pub fn speed(&self) -> f64 {
        self.velocity.abs()
    }

    /// Fly-move duration at the row speed
    pub fn fly_seconds(&self) -> f64 {
        (self.overshoot_end - self.pre_roll_start).abs() / self.speed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn motion() -> MotionConfig {
        MotionConfig::default()
    }

    #[test]
    fn velocity_from_points_and_dwell() {
        assert_eq!(row_velocity(0.0, 10.0, 11, 0.5), 2.0);
    }

    #[test]
    fn delta_follows_velocity_with_floor() {
        assert_eq!(pre_roll_delta(2.0, &motion()), 2.0);
        assert_eq!(pre_roll_delta(0.001, &motion()), 0.002);
    }

    #[test]
    fn geometry_for_positive_row() {
        let request = ScanRequest::new((0.0, 10.0, 11), (0.0, 1.0, 2), 0.5);
        let g = RowGeometry::compute(&request, &motion());
        assert_eq!(g.velocity, 2.0);
        assert_eq!(g.delta, 2.0);
        assert_eq!(g.pre_roll_start, -2.0);
        assert_eq!(g.overshoot_end, 12.0);
        assert_eq!(g.fly_seconds(), 7.0);
    }

    #[test]
    fn slow_row_gets_minimum_delta() {
        // 0.001 / 1 / 10 = 1e-4 units/s, far below the floor
        let request = ScanRequest::new((0.0, 0.001, 2), (0.0, 0.0, 1), 10.0);
        let g = RowGeometry::compute(&request, &motion());
        assert!((g.velocity - 1e-4).abs() < 1e-15);
        assert_eq!(g.delta, 0.002);
        assert_eq!(g.pre_roll_start, -0.002);
        assert!((g.overshoot_end - 0.003).abs() < 1e-12);
    }

    #[test]
    fn supplied_delta_wins() {
        let mut request = ScanRequest::new((0.0, 10.0, 11), (0.0, 1.0, 2), 0.5);
        request.delta = Some(0.5);
        let g = RowGeometry::compute(&request, &motion());
        assert_eq!(g.pre_roll_start, -0.5);
        assert_eq!(g.overshoot_end, 10.5);
    }

    #[test]
    fn reversed_row_pre_rolls_from_above() {
        let request = ScanRequest::new((10.0, 0.0, 11), (0.0, 1.0, 2), 0.5);
        let g = RowGeometry::compute(&request, &motion());
        assert_eq!(g.velocity, -2.0);
        assert_eq!(g.speed(), 2.0);
        assert_eq!(g.pre_roll_start, 12.0);
        assert_eq!(g.overshoot_end, -2.0);
    }

    #[test]
    fn slow_positions_are_inclusive() {
        let request = ScanRequest::new((0.0, 1.0, 2), (0.0, 4.0, 5), 0.1);
        assert_eq!(request.slow_positions(), [0.0, 1.0, 2.0, 3.0, 4.0]);

        let single = ScanRequest::new((0.0, 1.0, 2), (3.0, 9.0, 1), 0.1);
        assert_eq!(single.slow_positions(), [3.0]);
    }

    #[test]
    fn time_remaining_estimate() {
        let hours = time_remaining_hours(10, 0, 0.1, 100, 3.8);
        assert!((hours - 10.0 * 13.8 / 3600.0).abs() < 1e-12);
        assert_eq!(time_remaining_hours(10, 10, 0.1, 100, 3.8), 0.0);
    }

    #[test]
    fn validation_rejects_bad_requests() {
        let ok = ScanRequest::new((0.0, 1.0, 11), (0.0, 1.0, 3), 0.1);
        assert!(ok.validate().is_ok());

        let cases = [
            ScanRequest::new((0.0, 1.0, 0), (0.0, 1.0, 3), 0.1),
            ScanRequest::new((0.0, 1.0, 11), (0.0, 1.0, 0), 0.1),
            ScanRequest::new((0.0, 1.0, 1), (0.0, 1.0, 3), 0.1),
            ScanRequest::new((0.0, 1.0, 11), (0.0, 1.0, 3), 0.0),
            ScanRequest::new((0.0, 1.0, 11), (0.0, 1.0, 3), f64::NAN),
            ScanRequest::new((0.0, f64::INFINITY, 11), (0.0, 1.0, 3), 0.1),
            ScanRequest::new((1.0, 1.0, 11), (0.0, 1.0, 3), 0.1),
        ];
        for request in cases {
            assert!(
                matches!(request.validate(), Err(FlyScanError::Configuration(_))),
                "{request:?} should be rejected"
            );
        }

        let mut negative_delta = ok.clone();
        negative_delta.delta = Some(-1.0);
        assert!(negative_delta.validate().is_err());
    }

    #[test]
    fn request_from_toml_uses_defaults() {
        let request: ScanRequest = toml::from_str(
            r#"
            fast_start = 0.0
            fast_stop = 10.0
            fast_num = 11
            slow_start = 0.0
            slow_stop = 4.0
            slow_num = 5
            dwell = 0.5

            [metadata]
            sample = "NIST 1832"
            "#,
        )
        .unwrap();
        assert!(request.shutter_control);
        assert!(!request.align_first);
        assert_eq!(request.delta, None);
        assert_eq!(request.metadata["sample"], "NIST 1832");
        assert_eq!(request.total_points(), 55);
    }
}
