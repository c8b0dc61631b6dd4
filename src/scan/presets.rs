//! Scan presets.
//!
//! A preset binds the fast and slow axes, the trigger buffer with the axis labels
//! it is configured for, and the default detector. Presets are plain records
//! resolved against a [`DeviceRegistry`]; the orchestrator never sees their names.

use serde::Serialize;

use crate::config::TimeoutConfig;
use crate::error::{FlyScanError, ScanResult};
use crate::hardware::detector::DetectorAdapter;
use crate::hardware::registry::DeviceRegistry;
use crate::hardware::trigger_buffer::TriggerBufferController;
use crate::scan::orchestrator::FlyScanDevices;

/// Registry id of the photon shutter
pub const SHUTTER_ID: &str = "shutter";
/// Registry id of the monochromator energy readout
pub const ENERGY_ID: &str = "energy";
/// Registry id of the peak-up routine
pub const ALIGNER_ID: &str = "peakup";

/// Static binding of axes, trigger buffer and default detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScanPreset {
    /// Preset name
    pub name: &'static str,
    /// Fast (flying) axis id
    pub fast_axis: &'static str,
    /// Slow (stepped) axis id
    pub slow_axis: &'static str,
    /// Trigger buffer id
    pub trigger_buffer: &'static str,
    /// Fast-axis label loaded into the trigger buffer
    pub fast_axis_label: &'static str,
    /// Slow-axis label loaded into the trigger buffer
    pub slow_axis_label: &'static str,
    /// Detector always included
    pub default_detector: &'static str,
}

/// Every known preset
pub const PRESETS: &[ScanPreset] = &[
    ScanPreset {
        name: "scan_and_fly",
        fast_axis: "hf_stage.x",
        slow_axis: "hf_stage.y",
        trigger_buffer: "flying_zebra",
        fast_axis_label: "HOR",
        slow_axis_label: "VER",
        default_detector: "xs",
    },
    ScanPreset {
        name: "y_scan_and_fly",
        fast_axis: "hf_stage.y",
        slow_axis: "hf_stage.x",
        trigger_buffer: "flying_zebra",
        fast_axis_label: "VER",
        slow_axis_label: "HOR",
        default_detector: "xs",
    },
    ScanPreset {
        name: "nano_scan_and_fly",
        fast_axis: "nano_stage.sx",
        slow_axis: "nano_stage.sy",
        trigger_buffer: "nano_flying_zebra",
        fast_axis_label: "NANOHOR",
        slow_axis_label: "NANOVER",
        default_detector: "xs2",
    },
    ScanPreset {
        name: "nano_y_scan_and_fly",
        fast_axis: "nano_stage.sy",
        slow_axis: "nano_stage.sx",
        trigger_buffer: "nano_flying_zebra",
        fast_axis_label: "NANOVER",
        slow_axis_label: "NANOHOR",
        default_detector: "xs2",
    },
    ScanPreset {
        name: "nano_z_scan_and_fly",
        fast_axis: "nano_stage.sz",
        slow_axis: "nano_stage.sx",
        trigger_buffer: "nano_flying_zebra",
        fast_axis_label: "NANOZ",
        slow_axis_label: "NANOHOR",
        default_detector: "xs2",
    },
    ScanPreset {
        name: "scan_and_fly_xs2",
        fast_axis: "hf_stage.x",
        slow_axis: "hf_stage.y",
        trigger_buffer: "flying_zebra_x_xs2",
        fast_axis_label: "HOR",
        slow_axis_label: "VER",
        default_detector: "xs2",
    },
    ScanPreset {
        name: "scan_and_fly_xs2_xz",
        fast_axis: "hf_stage.x",
        slow_axis: "hf_stage.z",
        trigger_buffer: "flying_zebra_x_xs2",
        fast_axis_label: "HOR",
        slow_axis_label: "VER",
        default_detector: "xs2",
    },
    ScanPreset {
        name: "y_scan_and_fly_xs2",
        fast_axis: "hf_stage.y",
        slow_axis: "hf_stage.x",
        trigger_buffer: "flying_zebra_y_xs2",
        fast_axis_label: "VER",
        slow_axis_label: "HOR",
        default_detector: "xs2",
    },
    ScanPreset {
        name: "y_scan_and_fly_xs2_yz",
        fast_axis: "hf_stage.y",
        slow_axis: "hf_stage.z",
        trigger_buffer: "flying_zebra_y_xs2",
        fast_axis_label: "VER",
        slow_axis_label: "HOR",
        default_detector: "xs2",
    },
];

/// Look up a preset by name
pub fn find_preset(name: &str) -> ScanResult<&'static ScanPreset> {
    PRESETS.iter().find(|p| p.name == name).ok_or_else(|| {
        FlyScanError::Configuration(format!(
            "Unknown preset '{name}'. Known presets: {}",
            PRESETS
                .iter()
                .map(|p| p.name)
                .collect::<Vec<_>>()
                .join(", ")
        ))
    })
}

impl ScanPreset {
    /// Resolve the preset's devices, plus `extra_detectors`, against a registry.
    ///
    /// The default detector comes first; duplicates are dropped. The shutter, energy
    /// readout and aligner are optional.
    pub fn resolve(
        &self,
        registry: &DeviceRegistry,
        extra_detectors: &[String],
        timeouts: &TimeoutConfig,
    ) -> ScanResult<FlyScanDevices> {
        let fast_axis = registry
            .get_axis(self.fast_axis)
            .ok_or_else(|| FlyScanError::UnknownDevice(self.fast_axis.to_string()))?;
        let slow_axis = registry
            .get_axis(self.slow_axis)
            .ok_or_else(|| FlyScanError::UnknownDevice(self.slow_axis.to_string()))?;
        let (buffer, scaler) = registry
            .get_trigger_buffer(self.trigger_buffer)
            .ok_or_else(|| FlyScanError::UnknownDevice(self.trigger_buffer.to_string()))?;

        let mut names: Vec<&str> = vec![self.default_detector];
        for extra in extra_detectors {
            if !names.contains(&extra.as_str()) {
                names.push(extra);
            }
        }
        let detectors = names
            .into_iter()
            .map(|name| {
                registry
                    .get_detector(name)
                    .map(DetectorAdapter::new)
                    .ok_or_else(|| FlyScanError::UnknownDevice(name.to_string()))
            })
            .collect::<ScanResult<Vec<_>>>()?;

        Ok(FlyScanDevices {
            plan_name: self.name.to_string(),
            fast_axis,
            slow_axis,
            fast_axis_label: self.fast_axis_label.to_string(),
            slow_axis_label: self.slow_axis_label.to_string(),
            trigger_buffer: TriggerBufferController::new(
                buffer,
                scaler,
                timeouts.kickoff(),
                timeouts.complete(),
            ),
            detectors,
            shutter: registry.get_shutter(SHUTTER_ID),
            aligner: registry.get_aligner(ALIGNER_ID),
            energy: registry.get_readable(ENERGY_ID),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::axis::AxisFamily;
    use crate::hardware::detector::DetectorKind;
    use crate::hardware::mock::CommandJournal;
    use crate::hardware::registry::create_mock_registry;

    #[test]
    fn test_preset_names_are_unique() {
        let mut names: Vec<_> = PRESETS.iter().map(|p| p.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), PRESETS.len());
    }

    #[test]
    fn test_unknown_preset() {
        assert!(matches!(
            find_preset("spiral"),
            Err(FlyScanError::Configuration(_))
        ));
    }

    #[test]
    fn test_resolve_nano_preset() {
        let registry = create_mock_registry(CommandJournal::new()).unwrap();
        let preset = find_preset("nano_scan_and_fly").unwrap();
        let devices = preset
            .resolve(&registry, &["merlin".to_string()], &TimeoutConfig::default())
            .unwrap();

        assert_eq!(devices.fast_axis.name(), "nano_stage.sx");
        assert_eq!(devices.fast_axis.profile().family, AxisFamily::NanoStage);
        assert_eq!(devices.fast_axis_label, "NANOHOR");
        assert_eq!(devices.trigger_buffer.name(), "nano_flying_zebra");
        let kinds: Vec<_> = devices.detectors.iter().map(|d| d.kind()).collect();
        assert_eq!(kinds, [DetectorKind::Xspress3Mini, DetectorKind::Merlin]);
        assert!(devices.shutter.is_some());
    }

    #[test]
    fn test_duplicate_detectors_dropped() {
        let registry = create_mock_registry(CommandJournal::new()).unwrap();
        let devices = find_preset("scan_and_fly")
            .unwrap()
            .resolve(&registry, &["xs".to_string()], &TimeoutConfig::default())
            .unwrap();
        assert_eq!(devices.detectors.len(), 1);
    }

    #[test]
    fn test_unknown_detector() {
        let registry = create_mock_registry(CommandJournal::new()).unwrap();
        let result = find_preset("scan_and_fly").unwrap().resolve(
            &registry,
            &["pilatus".to_string()],
            &TimeoutConfig::default(),
        );
        assert!(matches!(result, Err(FlyScanError::UnknownDevice(name)) if name == "pilatus"));
    }
}
