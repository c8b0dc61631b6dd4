//! CLI entry point for flyscan
//!
//! Runs fly scans against the simulated beamline described by the configuration:
//!
//! ```bash
//! # Fly a raster described in a request file
//! flyscan run --request config/requests/xrf_map.toml --preset nano_scan_and_fly -d merlin
//!
//! # Print the row geometry and time estimate without touching hardware
//! flyscan plan --request config/requests/xrf_map.toml
//!
//! # List presets and simulated devices
//! flyscan presets
//! flyscan devices
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flyscan::config::{FlyScanConfig, DEFAULT_CONFIG_PATH};
use flyscan::hardware::mock::CommandJournal;
use flyscan::hardware::registry::{create_mock_registry, DeviceRegistry};
use flyscan::logging;
use flyscan::scan::hooks::{ScanRecordHook, TracingStatusSink};
use flyscan::scan::presets::{find_preset, PRESETS};
use flyscan::scan::request::{time_remaining_hours, RowGeometry};
use flyscan::{FlyScanOrchestrator, ScanRequest, ScanSettings};
use mimalloc::MiMalloc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "flyscan")]
#[command(about = "Hardware-synchronized 2D fly scans", long_about = None)]
struct Cli {
    /// Settings file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fly a scan on the simulated beamline
    Run {
        /// Scan request (TOML)
        #[arg(long)]
        request: PathBuf,

        /// Preset; defaults to `simulation.preset`
        #[arg(long)]
        preset: Option<String>,

        /// Extra detectors, in trigger order
        #[arg(short, long = "detector")]
        detectors: Vec<String>,
    },

    /// Print row geometry and time estimate for a request
    Plan {
        /// Scan request (TOML)
        #[arg(long)]
        request: PathBuf,
    },

    /// List presets
    Presets,

    /// List simulated devices
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = FlyScanConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate().map_err(anyhow::Error::msg)?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Run {
            request,
            preset,
            detectors,
        } => run_scan(&config, &request, preset, detectors).await,
        Commands::Plan { request } => plan(&config, &request),
        Commands::Presets => {
            list_presets();
            Ok(())
        }
        Commands::Devices => list_devices(&config),
    }
}

fn load_request(path: &Path) -> Result<ScanRequest> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let request: ScanRequest =
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(request)
}

fn build_registry(config: &FlyScanConfig) -> Result<DeviceRegistry> {
    let mut registry = create_mock_registry(CommandJournal::new())?;
    for device in &config.simulation.devices {
        if registry.unregister(&device.id) {
            info!(device = %device.id, "Replacing simulated device from configuration");
        }
        registry.register(device.clone())?;
    }
    Ok(registry)
}

async fn run_scan(
    config: &FlyScanConfig,
    request_path: &Path,
    preset: Option<String>,
    detectors: Vec<String>,
) -> Result<()> {
    let request = load_request(request_path)?;
    let registry = build_registry(config)?;

    let preset_name = preset.unwrap_or_else(|| config.simulation.preset.clone());
    let mut extra = config.simulation.extra_detectors.clone();
    extra.extend(detectors);
    let devices = find_preset(&preset_name)?.resolve(&registry, &extra, &config.timeouts)?;

    let orchestrator = Arc::new(
        FlyScanOrchestrator::new(devices, ScanSettings::from_config(config))
            .with_hook(Arc::new(ScanRecordHook::new(Arc::new(TracingStatusSink)))),
    );

    let abort = orchestrator.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, aborting scan");
            abort.abort("interrupted by operator");
        }
    });

    let result = orchestrator.run(&request).await?;

    println!("Scan {} ({}) finished", result.scan_id, result.run_uid);
    println!("  rows:     {}", result.rows_completed);
    println!("  samples:  {}", result.samples_collected);
    for violation in &result.timing_violations {
        println!(
            "  {} dwell clamped: {} s -> {} s",
            violation.detector, violation.requested_dwell, violation.effective_dwell
        );
    }
    Ok(())
}

fn plan(config: &FlyScanConfig, request_path: &Path) -> Result<()> {
    let request = load_request(request_path)?;
    request.validate()?;
    let geometry = RowGeometry::compute(&request, &config.motion);
    let hours = time_remaining_hours(
        request.slow_num,
        0,
        request.dwell,
        request.fast_num,
        config.motion.row_overhead_s,
    );

    println!("Grid:       {} x {} points", request.fast_num, request.slow_num);
    println!("Velocity:   {:.6} units/s", geometry.velocity);
    println!("Pre-roll:   {:.6}", geometry.delta);
    println!(
        "Fast span:  {:.6} -> {:.6}",
        geometry.pre_roll_start, geometry.overshoot_end
    );
    println!("Row time:   {:.2} s", geometry.fly_seconds());
    println!("Estimated:  {hours:.3} h");
    Ok(())
}

fn list_presets() {
    for preset in PRESETS {
        println!(
            "{:<24} fast={:<14} slow={:<14} buffer={:<20} detector={}",
            preset.name,
            preset.fast_axis,
            preset.slow_axis,
            preset.trigger_buffer,
            preset.default_detector
        );
    }
}

fn list_devices(config: &FlyScanConfig) -> Result<()> {
    let registry = build_registry(config)?;
    let mut devices = registry.list_devices();
    devices.sort_by(|a, b| a.id.cmp(&b.id));
    for device in devices {
        println!(
            "{:<22} {:<20} {:?}",
            device.id, device.driver_type, device.capabilities
        );
    }
    Ok(())
}
