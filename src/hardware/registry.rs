//! Device Registry for Fly-Scan Hardware
//!
//! Central registry that maps device ids (e.g. `"hf_stage.x"`, `"flying_zebra"`,
//! `"merlin"`) to capability handles. Presets name devices by id and are resolved
//! against a registry at run time.
//!
//! Devices get in two ways:
//!
//! - From a [`DeviceConfig`] whose [`DriverType`] the registry knows how to
//!   instantiate (currently the simulated devices).
//! - By handing the registry an already-built capability object
//!   (`register_axis`, `register_detector`, ...), which is how tests inject mocks with
//!   failure modes and how real drivers are wired in.
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use flyscan::hardware::registry::{create_mock_registry, DeviceRegistry};
//!
//! let registry = create_mock_registry(CommandJournal::new())?;
//! let x = registry.get_axis("hf_stage.x").expect("registered");
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{FlyScanError, ScanResult};
use crate::hardware::axis::{AxisController, AxisFamily, AxisProfile};
use crate::hardware::capabilities::{
    BeamAligner, FlyDetector, MotionAxis, OverrideSlot, PositionBuffer, Readable, Scaler,
    ShutterControl,
};
use crate::hardware::detector::DetectorKind;
use crate::hardware::mock::{
    CommandJournal, MockAligner, MockAxis, MockDetector, MockReadable, MockScaler, MockShutter,
    MockTriggerBuffer,
};

/// Unique device identifier
pub type DeviceId = String;

/// Capabilities a registered device can provide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Stage axis (`MotionAxis`)
    Motion,
    /// Trigger buffer with its scaler
    PositionBuffer,
    /// Fly-scan detector
    Detector,
    /// Beam shutter
    Shutter,
    /// Scalar readout
    Readable,
    /// Beam alignment routine
    Aligner,
}

// =============================================================================
// Driver Types
// =============================================================================

/// Driver type and its settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriverType {
    /// Simulated stage axis
    MockAxis {
        /// Engineering units ("mm", "um", "deg")
        units: String,
        /// Axis family
        family: AxisFamily,
        /// Starting position
        #[serde(default)]
        initial_position: f64,
        /// Starting velocity
        #[serde(default = "default_velocity")]
        initial_velocity: f64,
        /// Controller velocity high limit
        #[serde(default)]
        velocity_high_limit: Option<f64>,
        /// Initial retry deadband, if the controller has that slot
        #[serde(default)]
        retry_deadband: Option<f64>,
        /// Initial backlash speed, if the controller has that slot
        #[serde(default)]
        backlash_speed: Option<f64>,
    },

    /// Simulated trigger buffer and scaler
    MockTriggerBuffer {
        /// Scaler identity
        scaler: String,
    },

    /// Simulated detector
    MockDetector {
        /// Detector kind
        kind: DetectorKind,
    },

    /// Simulated shutter
    MockShutter,

    /// Simulated peak-up routine
    MockAligner,

    /// Simulated scalar readout
    MockReadable {
        /// Fixed reading
        reading: f64,
    },
}

fn default_velocity() -> f64 {
    1.0
}

impl DriverType {
    /// Capabilities this driver type provides
    pub fn capabilities(&self) -> Vec<Capability> {
        match self {
            DriverType::MockAxis { .. } => vec![Capability::Motion],
            DriverType::MockTriggerBuffer { .. } => vec![Capability::PositionBuffer],
            DriverType::MockDetector { .. } => vec![Capability::Detector],
            DriverType::MockShutter => vec![Capability::Shutter],
            DriverType::MockAligner => vec![Capability::Aligner],
            DriverType::MockReadable { .. } => vec![Capability::Readable],
        }
    }

    /// Human-readable driver type name
    pub fn driver_name(&self) -> &'static str {
        match self {
            DriverType::MockAxis { .. } => "mock_axis",
            DriverType::MockTriggerBuffer { .. } => "mock_trigger_buffer",
            DriverType::MockDetector { .. } => "mock_detector",
            DriverType::MockShutter => "mock_shutter",
            DriverType::MockAligner => "mock_aligner",
            DriverType::MockReadable { .. } => "mock_readable",
        }
    }
}

/// Configuration for registering a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique identifier (e.g., "hf_stage.x", "flying_zebra")
    pub id: DeviceId,
    /// Human-readable name
    pub name: String,
    /// Driver type and configuration
    pub driver: DriverType,
}

/// Information about a registered device (returned by list operations)
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    /// Unique identifier
    pub id: DeviceId,
    /// Human-readable name
    pub name: String,
    /// Driver type name
    pub driver_type: String,
    /// Capabilities this device supports
    pub capabilities: Vec<Capability>,
}

// =============================================================================
// Registered Device (Internal)
// =============================================================================

#[derive(Default)]
struct RegisteredDevice {
    name: String,
    driver_type: String,
    axis: Option<AxisController>,
    buffer: Option<(Arc<dyn PositionBuffer>, Arc<dyn Scaler>)>,
    detector: Option<Arc<dyn FlyDetector>>,
    shutter: Option<Arc<dyn ShutterControl>>,
    readable: Option<Arc<dyn Readable>>,
    aligner: Option<Arc<dyn BeamAligner>>,
}

impl RegisteredDevice {
    fn capabilities(&self) -> Vec<Capability> {
        let mut caps = Vec::new();
        if self.axis.is_some() {
            caps.push(Capability::Motion);
        }
        if self.buffer.is_some() {
            caps.push(Capability::PositionBuffer);
        }
        if self.detector.is_some() {
            caps.push(Capability::Detector);
        }
        if self.shutter.is_some() {
            caps.push(Capability::Shutter);
        }
        if self.readable.is_some() {
            caps.push(Capability::Readable);
        }
        if self.aligner.is_some() {
            caps.push(Capability::Aligner);
        }
        caps
    }
}

// =============================================================================
// Device Registry
// =============================================================================

/// Central registry for fly-scan hardware
pub struct DeviceRegistry {
    devices: HashMap<DeviceId, RegisteredDevice>,
    journal: CommandJournal,
}

impl DeviceRegistry {
    /// Create a new empty device registry
    pub fn new() -> Self {
        Self::with_journal(CommandJournal::new())
    }

    /// Create an empty registry whose simulated devices share `journal`
    pub fn with_journal(journal: CommandJournal) -> Self {
        Self {
            devices: HashMap::new(),
            journal,
        }
    }

    /// Journal shared by simulated devices
    pub fn journal(&self) -> &CommandJournal {
        &self.journal
    }

    /// Register a device from configuration
    ///
    /// # Errors
    /// Returns `Configuration` if the device id is already registered.
    pub fn register(&mut self, config: DeviceConfig) -> ScanResult<()> {
        self.ensure_vacant(&config.id)?;
        let device = self.instantiate_device(&config);
        self.devices.insert(config.id, device);
        Ok(())
    }

    fn ensure_vacant(&self, id: &str) -> ScanResult<()> {
        if self.devices.contains_key(id) {
            return Err(FlyScanError::Configuration(format!(
                "Device '{id}' is already registered"
            )));
        }
        Ok(())
    }

    fn insert(&mut self, id: &str, device: RegisteredDevice) -> ScanResult<()> {
        self.ensure_vacant(id)?;
        self.devices.insert(id.to_string(), device);
        Ok(())
    }

    /// Register an axis
    pub fn register_axis(
        &mut self,
        id: &str,
        device: Arc<dyn MotionAxis>,
        profile: AxisProfile,
    ) -> ScanResult<()> {
        self.insert(
            id,
            RegisteredDevice {
                name: id.to_string(),
                driver_type: "external".into(),
                axis: Some(AxisController::new(id, device, profile)),
                ..Default::default()
            },
        )
    }

    /// Register a trigger buffer together with its scaler
    pub fn register_trigger_buffer(
        &mut self,
        id: &str,
        buffer: Arc<dyn PositionBuffer>,
        scaler: Arc<dyn Scaler>,
    ) -> ScanResult<()> {
        self.insert(
            id,
            RegisteredDevice {
                name: id.to_string(),
                driver_type: "external".into(),
                buffer: Some((buffer, scaler)),
                ..Default::default()
            },
        )
    }

    /// Register a detector
    pub fn register_detector(&mut self, id: &str, detector: Arc<dyn FlyDetector>) -> ScanResult<()> {
        self.insert(
            id,
            RegisteredDevice {
                name: id.to_string(),
                driver_type: "external".into(),
                detector: Some(detector),
                ..Default::default()
            },
        )
    }

    /// Register a shutter
    pub fn register_shutter(&mut self, id: &str, shutter: Arc<dyn ShutterControl>) -> ScanResult<()> {
        self.insert(
            id,
            RegisteredDevice {
                name: id.to_string(),
                driver_type: "external".into(),
                shutter: Some(shutter),
                ..Default::default()
            },
        )
    }

    /// Register a scalar readout
    pub fn register_readable(&mut self, id: &str, readable: Arc<dyn Readable>) -> ScanResult<()> {
        self.insert(
            id,
            RegisteredDevice {
                name: id.to_string(),
                driver_type: "external".into(),
                readable: Some(readable),
                ..Default::default()
            },
        )
    }

    /// Register a beam aligner
    pub fn register_aligner(&mut self, id: &str, aligner: Arc<dyn BeamAligner>) -> ScanResult<()> {
        self.insert(
            id,
            RegisteredDevice {
                name: id.to_string(),
                driver_type: "external".into(),
                aligner: Some(aligner),
                ..Default::default()
            },
        )
    }

    /// Unregister a device
    pub fn unregister(&mut self, id: &str) -> bool {
        self.devices.remove(id).is_some()
    }

    /// List all registered devices, sorted by id
    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        let mut infos: Vec<DeviceInfo> = self
            .devices
            .iter()
            .map(|(id, device)| DeviceInfo {
                id: id.clone(),
                name: device.name.clone(),
                driver_type: device.driver_type.clone(),
                capabilities: device.capabilities(),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Check if a device is registered
    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    /// Number of registered devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Axis controller for a device
    pub fn get_axis(&self, id: &str) -> Option<AxisController> {
        self.devices.get(id).and_then(|d| d.axis.clone())
    }

    /// Trigger buffer and scaler for a device
    pub fn get_trigger_buffer(&self, id: &str) -> Option<(Arc<dyn PositionBuffer>, Arc<dyn Scaler>)> {
        self.devices.get(id).and_then(|d| d.buffer.clone())
    }

    /// Detector for a device
    pub fn get_detector(&self, id: &str) -> Option<Arc<dyn FlyDetector>> {
        self.devices.get(id).and_then(|d| d.detector.clone())
    }

    /// Shutter for a device
    pub fn get_shutter(&self, id: &str) -> Option<Arc<dyn ShutterControl>> {
        self.devices.get(id).and_then(|d| d.shutter.clone())
    }

    /// Scalar readout for a device
    pub fn get_readable(&self, id: &str) -> Option<Arc<dyn Readable>> {
        self.devices.get(id).and_then(|d| d.readable.clone())
    }

    /// Beam aligner for a device
    pub fn get_aligner(&self, id: &str) -> Option<Arc<dyn BeamAligner>> {
        self.devices.get(id).and_then(|d| d.aligner.clone())
    }

    /// Ids of every device with a capability, sorted
    pub fn devices_with_capability(&self, capability: Capability) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self
            .devices
            .iter()
            .filter(|(_, d)| d.capabilities().contains(&capability))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn instantiate_device(&self, config: &DeviceConfig) -> RegisteredDevice {
        let journal = self.journal.clone();
        let mut device = RegisteredDevice {
            name: config.name.clone(),
            driver_type: config.driver.driver_name().to_string(),
            ..Default::default()
        };

        match &config.driver {
            DriverType::MockAxis {
                units,
                family,
                initial_position,
                initial_velocity,
                velocity_high_limit,
                retry_deadband,
                backlash_speed,
            } => {
                let mut axis = MockAxis::new(&config.id, units.as_str())
                    .with_journal(journal)
                    .with_position(*initial_position)
                    .with_velocity(*initial_velocity);
                if let Some(limit) = velocity_high_limit {
                    axis = axis.with_velocity_high_limit(*limit);
                }
                if let Some(value) = retry_deadband {
                    axis = axis.with_slot(OverrideSlot::RetryDeadband, *value);
                }
                if let Some(value) = backlash_speed {
                    axis = axis.with_slot(OverrideSlot::BacklashSpeed, *value);
                }
                device.axis = Some(AxisController::new(
                    &config.id,
                    Arc::new(axis),
                    AxisProfile::for_family(*family),
                ));
            }
            DriverType::MockTriggerBuffer { scaler } => {
                device.buffer = Some((
                    Arc::new(MockTriggerBuffer::new(&config.id, journal.clone())),
                    Arc::new(MockScaler::new(scaler, journal)),
                ));
            }
            DriverType::MockDetector { kind } => {
                device.detector = Some(Arc::new(MockDetector::new(&config.id, *kind, journal)));
            }
            DriverType::MockShutter => {
                device.shutter = Some(Arc::new(MockShutter::new(&config.id, journal)));
            }
            DriverType::MockAligner => {
                device.aligner = Some(Arc::new(MockAligner::new(&config.id, journal)));
            }
            DriverType::MockReadable { reading } => {
                device.readable = Some(Arc::new(MockReadable::new(*reading)));
            }
        }

        device
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Simulated Beamline
// =============================================================================

fn stage_axis(id: &str, units: &str, family: AxisFamily, velocity: f64) -> DeviceConfig {
    let hf = family == AxisFamily::HfStage;
    DeviceConfig {
        id: id.into(),
        name: format!("Simulated {family} axis {id}"),
        driver: DriverType::MockAxis {
            units: units.into(),
            family,
            initial_position: 0.0,
            initial_velocity: velocity,
            velocity_high_limit: None,
            retry_deadband: hf.then_some(0.001),
            backlash_speed: hf.then_some(velocity),
        },
    }
}

/// Create a registry holding the simulated beamline every preset resolves against
///
/// - `hf_stage.{x,y,z}` (mm) and `nano_stage.{sx,sy,sz}` (um)
/// - trigger buffers `flying_zebra`, `nano_flying_zebra`, `flying_zebra_x_xs2`,
///   `flying_zebra_y_xs2`
/// - detectors `xs`, `xs2`, `merlin`, `dexela`
/// - `shutter`, `energy` and `peakup`
pub fn create_mock_registry(journal: CommandJournal) -> ScanResult<DeviceRegistry> {
    let mut registry = DeviceRegistry::with_journal(journal);

    for axis in ["hf_stage.x", "hf_stage.y", "hf_stage.z"] {
        registry.register(stage_axis(axis, "mm", AxisFamily::HfStage, 1.0))?;
    }
    for axis in ["nano_stage.sx", "nano_stage.sy", "nano_stage.sz"] {
        registry.register(stage_axis(axis, "um", AxisFamily::NanoStage, 30.0))?;
    }

    for (buffer, scaler) in [
        ("flying_zebra", "sclr1"),
        ("nano_flying_zebra", "nano_sclr"),
        ("flying_zebra_x_xs2", "sclr1"),
        ("flying_zebra_y_xs2", "sclr1"),
    ] {
        registry.register(DeviceConfig {
            id: buffer.into(),
            name: format!("Simulated trigger buffer {buffer}"),
            driver: DriverType::MockTriggerBuffer {
                scaler: scaler.into(),
            },
        })?;
    }

    for (id, kind) in [
        ("xs", DetectorKind::Xspress3),
        ("xs2", DetectorKind::Xspress3Mini),
        ("merlin", DetectorKind::Merlin),
        ("dexela", DetectorKind::Dexela),
    ] {
        registry.register(DeviceConfig {
            id: id.into(),
            name: format!("Simulated {kind} detector"),
            driver: DriverType::MockDetector { kind },
        })?;
    }

    registry.register(DeviceConfig {
        id: "shutter".into(),
        name: "Simulated photon shutter".into(),
        driver: DriverType::MockShutter,
    })?;
    registry.register(DeviceConfig {
        id: "energy".into(),
        name: "Simulated monochromator energy".into(),
        driver: DriverType::MockReadable { reading: 12.0 },
    })?;
    registry.register(DeviceConfig {
        id: "peakup".into(),
        name: "Simulated fine peak-up".into(),
        driver: DriverType::MockAligner,
    })?;

    Ok(registry)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_mock_devices() {
        let registry = create_mock_registry(CommandJournal::new()).unwrap();
        assert_eq!(registry.len(), 17);
        assert!(registry.contains("hf_stage.x"));
        assert!(registry.contains("flying_zebra"));
    }

    #[test]
    fn test_capability_access() {
        let registry = create_mock_registry(CommandJournal::new()).unwrap();
        let x = registry.get_axis("hf_stage.x").unwrap();
        assert_eq!(x.profile().family, AxisFamily::HfStage);
        assert_eq!(x.deadband(), 0.0005);
        assert!(registry.get_axis("merlin").is_none());
        assert!(registry.get_detector("merlin").is_some());
        assert!(registry.get_trigger_buffer("nano_flying_zebra").is_some());
    }

    #[test]
    fn test_devices_with_capability() {
        let registry = create_mock_registry(CommandJournal::new()).unwrap();
        assert_eq!(
            registry.devices_with_capability(Capability::Detector),
            ["dexela", "merlin", "xs", "xs2"]
        );
        assert_eq!(registry.devices_with_capability(Capability::Shutter), ["shutter"]);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = DeviceRegistry::new();
        let config = DeviceConfig {
            id: "shutter".into(),
            name: "Shutter".into(),
            driver: DriverType::MockShutter,
        };
        registry.register(config.clone()).unwrap();
        assert!(matches!(
            registry.register(config),
            Err(FlyScanError::Configuration(_))
        ));
    }

    #[test]
    fn test_unregister() {
        let mut registry = create_mock_registry(CommandJournal::new()).unwrap();
        assert!(registry.unregister("dexela"));
        assert!(!registry.unregister("dexela"));
        assert!(registry.get_detector("dexela").is_none());
    }

    #[test]
    fn test_driver_config_from_toml() {
        let config: DeviceConfig = toml::from_str(
            r#"
            id = "e_tomo.y"
            name = "Tomography Y"
            [driver]
            type = "mock_axis"
            units = "mm"
            family = "e_tomo"
            velocity_high_limit = 2.5
            "#,
        )
        .unwrap();
        assert_eq!(config.driver.capabilities(), [Capability::Motion]);

        let mut registry = DeviceRegistry::new();
        registry.register(config).unwrap();
        let info = registry.list_devices();
        assert_eq!(info[0].driver_type, "mock_axis");
    }
}
