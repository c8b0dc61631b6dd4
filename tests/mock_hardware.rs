//! Integration tests for the simulated beamline
//!
//! These tests verify that the mock devices implement the capability traits with
//! realistic timing, and that every preset resolves against the mock registry.

use flyscan::config::{FlyScanConfig, TimeoutConfig};
use flyscan::hardware::axis::{AxisController, AxisProfile, ConvergencePolicy};
use flyscan::hardware::capabilities::{Movable, OverrideSlot, OverrideSlots, VelocityControl};
use flyscan::hardware::mock::{CommandJournal, MockAxis};
use flyscan::hardware::registry::{create_mock_registry, Capability, DeviceConfig, DriverType};
use flyscan::scan::presets::PRESETS;
use flyscan::FlyScanError;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

// =============================================================================
// MockAxis Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_mock_axis_travels_at_velocity() {
    let axis = MockAxis::new("hf_stage.x", "mm").with_velocity(2.0);

    // 4 mm at 2 mm/s
    let start = Instant::now();
    axis.move_abs(4.0).await.unwrap();
    assert_eq!(start.elapsed(), Duration::from_secs(2));
    assert_eq!(axis.position().await.unwrap(), 4.0);

    axis.set_velocity(4.0).await.unwrap();
    let start = Instant::now();
    axis.move_abs(0.0).await.unwrap();
    assert_eq!(start.elapsed(), Duration::from_secs(1));
}

#[tokio::test]
async fn test_mock_axis_rejects_non_positive_velocity() {
    let axis = MockAxis::new("hf_stage.x", "mm");
    assert!(axis.set_velocity(0.0).await.is_err());
    assert_eq!(axis.velocity().await.unwrap(), 1.0);
}

#[tokio::test]
async fn test_mock_axis_slots() {
    let journal = CommandJournal::new();
    let axis = MockAxis::new("hf_stage.x", "mm")
        .with_journal(journal.clone())
        .with_slot(OverrideSlot::RetryDeadband, 0.001);

    assert!(axis.supports_slot(OverrideSlot::RetryDeadband));
    assert!(axis.supports_slot(OverrideSlot::Velocity));
    assert!(!axis.supports_slot(OverrideSlot::BacklashSpeed));

    axis.write_slot(OverrideSlot::RetryDeadband, 2e-4).await.unwrap();
    assert_eq!(axis.read_slot(OverrideSlot::RetryDeadband).await.unwrap(), 2e-4);
    assert!(axis.write_slot(OverrideSlot::BacklashSpeed, 1.0).await.is_err());
    assert_eq!(journal.actions_for("hf_stage.x"), ["set_retry_deadband", "set_backlash_speed"]);
}

#[tokio::test(start_paused = true)]
async fn test_short_moves_converge_after_retries() {
    let axis = MockAxis::new("nano_stage.sx", "um")
        .with_short_moves(2, 0.5)
        .without_travel_time();
    let controller = AxisController::new(
        "nano_stage.sx",
        Arc::new(axis),
        AxisProfile::generic(),
    );

    controller.set_position(10.0).await.unwrap();
    let retries = controller
        .converge_to(10.0, &ConvergencePolicy::default())
        .await
        .unwrap();
    // First short landing came from set_position, the second from the first retry
    assert_eq!(retries, 2);
    assert_eq!(controller.position().await.unwrap(), 10.0);
}

// =============================================================================
// Registry Tests
// =============================================================================

#[test]
fn test_mock_registry_holds_beamline() {
    let registry = create_mock_registry(CommandJournal::new()).unwrap();
    assert_eq!(registry.len(), 17);

    let mut axes = registry.devices_with_capability(Capability::Motion);
    axes.sort();
    assert_eq!(
        axes,
        [
            "hf_stage.x",
            "hf_stage.y",
            "hf_stage.z",
            "nano_stage.sx",
            "nano_stage.sy",
            "nano_stage.sz"
        ]
    );
    assert_eq!(registry.devices_with_capability(Capability::Detector).len(), 4);
    assert_eq!(registry.get_axis("nano_stage.sx").unwrap().engineering_units(), "um");
}

#[test]
fn test_every_preset_resolves() {
    let registry = create_mock_registry(CommandJournal::new()).unwrap();
    for preset in PRESETS {
        let devices = preset
            .resolve(&registry, &[], &TimeoutConfig::default())
            .unwrap_or_else(|e| panic!("{}: {e}", preset.name));
        assert_eq!(devices.fast_axis.name(), preset.fast_axis);
        assert_eq!(devices.slow_axis.name(), preset.slow_axis);
        assert_eq!(devices.detectors[0].name(), preset.default_detector);
    }
}

#[test]
fn test_duplicate_registration_rejected() {
    let mut registry = create_mock_registry(CommandJournal::new()).unwrap();
    let result = registry.register(DeviceConfig {
        id: "shutter".into(),
        name: "Second shutter".into(),
        driver: DriverType::MockShutter,
    });
    assert!(matches!(result, Err(FlyScanError::Configuration(_))));
}

#[tokio::test]
async fn test_configured_axis_return_velocity() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flyscan.toml");
    std::fs::write(
        &path,
        r#"
[[simulation.devices]]
id = "theta"
name = "Tomography rotation"

[simulation.devices.driver]
type = "mock_axis"
units = "deg"
family = "e_tomo"
velocity_high_limit = 2.5
"#,
    )
    .unwrap();

    let config = FlyScanConfig::load_from(&path).unwrap();
    let mut registry = create_mock_registry(CommandJournal::new()).unwrap();
    for device in config.simulation.devices {
        registry.register(device).unwrap();
    }
    let theta = registry.get_axis("theta").unwrap();
    assert_eq!(theta.engineering_units(), "deg");
    assert_eq!(theta.return_velocity().await.unwrap(), 2.5);

    let nano = registry.get_axis("nano_stage.sx").unwrap();
    assert_eq!(nano.return_velocity().await.unwrap(), 30.0);
}
