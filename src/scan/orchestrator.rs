//! Fly-scan orchestrator.
//!
//! Drives one raster scan through the state machine in [`crate::scan::state`]:
//!
//! ```text
//! validate ─> install overrides ─> [align] ─> rows ─> restore overrides ─> done
//!                                             │
//!        row: setup ─> pre-roll ─> arm ─> fly ─> drain
//! ```
//!
//! Every row configures the detectors and the trigger buffer, converges the fast
//! axis on its pre-roll position, arms everything, then flies the fast axis past
//! the last trigger while waiting (bounded) on motion and every detector. The
//! trigger buffer's samples for the row are published as an event page.
//!
//! Whatever happens, overrides installed by the run are restored exactly once
//! and the shutter (if the run opened it) is closed last.
//!
//! # Usage
//!
//! ```rust,ignore
//! let orchestrator = FlyScanOrchestrator::new(devices, ScanSettings::default());
//! let mut docs = orchestrator.subscribe();
//! let abort = orchestrator.abort_handle();
//!
//! let result = orchestrator.run(&request).await?;
//! println!("{} rows, {} samples", result.rows_completed, result.samples_collected);
//! ```

use futures::future::try_join_all;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{FlyScanConfig, MotionConfig, TimeoutConfig};
use crate::error::{DetectorTimingViolation, FlyScanError, ScanResult};
use crate::hardware::acknowledge;
use crate::hardware::axis::{AxisController, ConvergencePolicy};
use crate::hardware::capabilities::{
    BeamAligner, OverrideSlot, Readable, ScalerCountMode, ShutterControl,
};
use crate::hardware::detector::{scan_type_for, DetectorAdapter};
use crate::hardware::trigger_buffer::{BufferPhase, RowBufferConfig, TriggerBufferController};
use crate::scan::document::{
    new_uid, now_ns, DataKey, DescriptorDoc, Document, EventPageDoc, StartDoc, StopDoc,
    FLY_STREAM,
};
use crate::scan::hooks::{LifecycleHook, RowContext};
use crate::scan::overrides::OverrideScope;
use crate::scan::request::{time_remaining_hours, RowGeometry, ScanRequest};
use crate::scan::state::OrchestratorState;

/// Capacity of the document broadcast channel
const DOCUMENT_CHANNEL_CAPACITY: usize = 1024;

/// Hardware a fly scan runs on
pub struct FlyScanDevices {
    /// Plan name recorded in the start document
    pub plan_name: String,
    /// Flying axis
    pub fast_axis: AxisController,
    /// Stepped axis
    pub slow_axis: AxisController,
    /// Fast-axis label loaded into the trigger buffer
    pub fast_axis_label: String,
    /// Slow-axis label loaded into the trigger buffer
    pub slow_axis_label: String,
    /// Trigger buffer and its scaler
    pub trigger_buffer: TriggerBufferController,
    /// Detectors in trigger order
    pub detectors: Vec<DetectorAdapter>,
    /// Shutter opened for the scan when requested
    pub shutter: Option<Arc<dyn ShutterControl>>,
    /// Peak-up routine for `align_first`
    pub aligner: Option<Arc<dyn BeamAligner>>,
    /// Monochromator energy recorded in the start document
    pub energy: Option<Arc<dyn Readable>>,
}

/// Tunables of the orchestrator
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanSettings {
    /// Row motion parameters
    pub motion: MotionConfig,
    /// Pre-roll convergence bounds
    pub convergence: ConvergencePolicy,
    /// Acknowledgment bounds
    pub timeouts: TimeoutConfig,
}

impl ScanSettings {
    /// Settings from the loaded configuration
    pub fn from_config(config: &FlyScanConfig) -> Self {
        Self {
            motion: config.motion.clone(),
            convergence: config.convergence.policy(),
            timeouts: config.timeouts.clone(),
        }
    }
}

/// Bound on the fly wait group for a row taking `fly_seconds` at fly speed
pub fn fly_timeout(fly_seconds: f64, margin: Duration) -> Duration {
    Duration::try_from_secs_f64(2.0 * fly_seconds)
        .unwrap_or(Duration::MAX)
        .saturating_add(margin)
}

// =============================================================================
// Abort handle
// =============================================================================

#[derive(Debug, Default)]
struct AbortState {
    requested: AtomicBool,
    reason: parking_lot::Mutex<Option<String>>,
    notify: Notify,
}

/// Lets another task abort the running scan.
///
/// The request is observed at every hardware wait and row boundary. Each run
/// starts with the request cleared.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    inner: Arc<AbortState>,
}

impl AbortHandle {
    /// Request an abort
    pub fn abort(&self, reason: impl Into<String>) {
        let reason = reason.into();
        info!(reason = %reason, "Abort requested");
        *self.inner.reason.lock() = Some(reason);
        self.inner.requested.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether an abort has been requested
    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.inner.requested.store(false, Ordering::SeqCst);
        *self.inner.reason.lock() = None;
    }

    fn error(&self) -> FlyScanError {
        let reason = self
            .inner
            .reason
            .lock()
            .clone()
            .unwrap_or_else(|| "abort requested".to_string());
        FlyScanError::Aborted(reason)
    }

    /// Resolves once an abort is requested
    async fn requested(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }
}

// =============================================================================
// Run bookkeeping
// =============================================================================

/// Summary of a successful run
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    /// Run uid (also the start document uid)
    pub run_uid: String,
    /// Run index on this orchestrator
    pub scan_id: u64,
    /// Always "success"
    pub exit_status: String,
    /// Rows flown and published
    pub rows_completed: u32,
    /// Trigger buffer samples collected over all rows
    pub samples_collected: u64,
    /// Detectors that ran with a clamped dwell
    pub timing_violations: Vec<DetectorTimingViolation>,
    /// Every state the run went through
    pub states: Vec<OrchestratorState>,
}

struct ScanRun {
    uid: String,
    scan_id: u64,
    state: OrchestratorState,
    states: Vec<OrchestratorState>,
    overrides: OverrideScope,
    descriptor_uid: String,
    rows_completed: u32,
    samples_collected: u64,
    violations: Vec<DetectorTimingViolation>,
}

impl ScanRun {
    fn new(scan_id: u64) -> Self {
        Self {
            uid: new_uid(),
            scan_id,
            state: OrchestratorState::Init,
            states: vec![OrchestratorState::Init],
            overrides: OverrideScope::new(),
            descriptor_uid: String::new(),
            rows_completed: 0,
            samples_collected: 0,
            violations: Vec::new(),
        }
    }

    fn enter(&mut self, next: OrchestratorState) {
        if !self.state.can_transition_to(next) {
            warn!(run_uid = %self.uid, from = %self.state, to = %next, "Unexpected state transition");
        }
        debug!(run_uid = %self.uid, from = %self.state, to = %next, "State transition");
        self.state = next;
        self.states.push(next);
    }

    fn record_violation(&mut self, violation: DetectorTimingViolation) {
        if !self
            .violations
            .iter()
            .any(|v| v.detector == violation.detector)
        {
            self.violations.push(violation);
        }
    }

    fn into_result(self) -> RunResult {
        RunResult {
            run_uid: self.uid.clone(),
            scan_id: self.scan_id,
            exit_status: "success".to_string(),
            rows_completed: self.rows_completed,
            samples_collected: self.samples_collected,
            timing_violations: self.violations.clone(),
            states: self.states.clone(),
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Runs fly scans on one set of devices, one scan at a time
pub struct FlyScanOrchestrator {
    devices: FlyScanDevices,
    settings: ScanSettings,
    hooks: Vec<Arc<dyn LifecycleHook>>,
    doc_sender: broadcast::Sender<Document>,
    abort: AbortHandle,
    run_lock: Mutex<()>,
    scan_counter: AtomicU64,
}

impl FlyScanOrchestrator {
    /// Create an orchestrator for `devices`
    pub fn new(devices: FlyScanDevices, settings: ScanSettings) -> Self {
        let (doc_sender, _) = broadcast::channel(DOCUMENT_CHANNEL_CAPACITY);
        Self {
            devices,
            settings,
            hooks: Vec::new(),
            doc_sender,
            abort: AbortHandle::default(),
            run_lock: Mutex::new(()),
            scan_counter: AtomicU64::new(0),
        }
    }

    /// Append a lifecycle hook; hooks run in the order they were added
    pub fn with_hook(mut self, hook: Arc<dyn LifecycleHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Subscribe to the document stream
    pub fn subscribe(&self) -> broadcast::Receiver<Document> {
        self.doc_sender.subscribe()
    }

    /// Handle for aborting the running scan from another task
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Devices this orchestrator drives
    pub fn devices(&self) -> &FlyScanDevices {
        &self.devices
    }

    /// Settings in use
    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    /// Run one fly scan.
    ///
    /// Fails with `Configuration` before touching any hardware if the request is
    /// invalid, and with `Busy` if another scan is running. On every other exit
    /// path the run's overrides are restored before this returns.
    #[instrument(skip_all, fields(plan = %self.devices.plan_name, run_uid = tracing::field::Empty))]
    pub async fn run(&self, request: &ScanRequest) -> ScanResult<RunResult> {
        let _busy = self.run_lock.try_lock().map_err(|_| FlyScanError::Busy)?;

        let scan_id = self.scan_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let mut run = ScanRun::new(scan_id);
        tracing::Span::current().record("run_uid", run.uid.as_str());

        run.enter(OrchestratorState::Validate);
        request.validate()?;
        self.validate_devices()?;
        let geometry = RowGeometry::compute(request, &self.settings.motion);
        self.abort.reset();

        info!(
            scan_id,
            fast_num = request.fast_num,
            slow_num = request.slow_num,
            dwell = request.dwell,
            velocity = geometry.velocity,
            delta = geometry.delta,
            "Starting fly scan"
        );

        let start = self.start_document(&run, request, &geometry).await;
        self.emit(Document::Start(start.clone()));
        let descriptor = self.descriptor(&run, request);
        run.descriptor_uid = descriptor.uid.clone();
        self.emit(Document::Descriptor(descriptor));
        for hook in &self.hooks {
            if let Err(e) = hook.on_start(&start).await {
                warn!(hook = hook.name(), error = %e, "on_start hook failed");
            }
        }

        let outcome = self.execute(&mut run, request, &geometry).await;
        if let Err(e) = &outcome {
            error!(state = %run.state, error = %e, "Fly scan failed");
            run.enter(OrchestratorState::Error);
        }

        let cleanup_errors = self.restore(&mut run).await;
        run.enter(OrchestratorState::Done);

        let result = match outcome {
            Err(e) => Err(e),
            Ok(()) => match cleanup_errors.into_iter().next() {
                Some(e) => Err(e),
                None => Ok(()),
            },
        };

        let stop = match &result {
            Ok(()) => StopDoc::success(&run.uid, run.rows_completed),
            Err(e) => StopDoc::with_status(&run.uid, e.exit_status(), &e.to_string(), run.rows_completed),
        };
        info!(exit_status = %stop.exit_status, rows = run.rows_completed, "Fly scan finished");
        self.emit(Document::Stop(stop.clone()));
        for hook in &self.hooks {
            if let Err(e) = hook.on_stop(&stop).await {
                warn!(hook = hook.name(), error = %e, "on_stop hook failed");
            }
        }

        result.map(|()| run.into_result())
    }

    fn validate_devices(&self) -> ScanResult<()> {
        let mut names = HashSet::new();
        for detector in &self.devices.detectors {
            if !names.insert(detector.name()) {
                return Err(FlyScanError::Configuration(format!(
                    "detector '{}' is listed twice",
                    detector.name()
                )));
            }
        }
        if self.devices.fast_axis.name() == self.devices.slow_axis.name() {
            return Err(FlyScanError::Configuration(format!(
                "fast and slow axis are both '{}'",
                self.devices.fast_axis.name()
            )));
        }
        Ok(())
    }

    fn emit(&self, doc: Document) {
        if self.doc_sender.send(doc).is_err() {
            debug!("No document subscribers");
        }
    }

    fn checkpoint(&self) -> ScanResult<()> {
        if self.abort.is_requested() {
            Err(self.abort.error())
        } else {
            Ok(())
        }
    }

    /// Await `fut` unless an abort is requested first
    async fn guarded<T, F>(&self, fut: F) -> ScanResult<T>
    where
        F: Future<Output = ScanResult<T>>,
    {
        tokio::select! {
            biased;
            _ = self.abort.requested() => Err(self.abort.error()),
            result = fut => result,
        }
    }

    async fn pause(&self, duration: Duration) -> ScanResult<()> {
        self.guarded(async {
            sleep(duration).await;
            Ok(())
        })
        .await
    }

    async fn start_document(
        &self,
        run: &ScanRun,
        request: &ScanRequest,
        geometry: &RowGeometry,
    ) -> StartDoc {
        let mut beamline_status = HashMap::new();
        if let Some(energy) = &self.devices.energy {
            match energy.read().await {
                Ok(value) => {
                    beamline_status.insert("energy".to_string(), value);
                }
                Err(e) => warn!(error = %e, "Could not read beamline energy"),
            }
        }

        StartDoc {
            uid: run.uid.clone(),
            scan_id: run.scan_id,
            plan_name: self.devices.plan_name.clone(),
            scan_type: scan_type_for(&self.devices.detectors).to_string(),
            detectors: self
                .devices
                .detectors
                .iter()
                .map(|d| d.name().to_string())
                .collect(),
            fast_axis: self.devices.fast_axis.name().to_string(),
            slow_axis: self.devices.slow_axis.name().to_string(),
            shape: (request.fast_num, request.slow_num),
            dwell: request.dwell,
            delta: geometry.delta,
            scan_params: vec![
                request.fast_start,
                request.fast_stop,
                f64::from(request.fast_num),
                request.slow_start,
                request.slow_stop,
                f64::from(request.slow_num),
                request.dwell,
            ],
            scan_input: serde_json::to_value(request).unwrap_or_default(),
            beamline_status,
            metadata: request.metadata.clone(),
            estimated_hours: time_remaining_hours(
                request.slow_num,
                0,
                request.dwell,
                request.fast_num,
                self.settings.motion.row_overhead_s,
            ),
            time_ns: now_ns(),
        }
    }

    fn descriptor(&self, run: &ScanRun, request: &ScanRequest) -> DescriptorDoc {
        let buffer = self.devices.trigger_buffer.name();
        let mut descriptor = DescriptorDoc::new(&run.uid, FLY_STREAM)
            .with_data_key(
                "enc1",
                DataKey::row(
                    buffer,
                    self.devices.fast_axis.engineering_units(),
                    request.fast_num,
                ),
            )
            .with_data_key("time", DataKey::row(buffer, "s", request.fast_num))
            .with_data_key(
                "slow_position",
                DataKey::scalar(
                    self.devices.slow_axis.name(),
                    self.devices.slow_axis.engineering_units(),
                ),
            )
            .with_config("fast_axis", &self.devices.fast_axis_label)
            .with_config("slow_axis", &self.devices.slow_axis_label);
        for detector in &self.devices.detectors {
            descriptor = descriptor.with_data_key(
                &format!("{}_frames", detector.name()),
                DataKey::count(detector.name()),
            );
        }
        descriptor
    }

    async fn execute(
        &self,
        run: &mut ScanRun,
        request: &ScanRequest,
        geometry: &RowGeometry,
    ) -> ScanResult<()> {
        run.enter(OrchestratorState::InstallOverrides);
        self.install_overrides(run, request).await?;

        if request.align_first {
            run.enter(OrchestratorState::Align);
            self.align(request, geometry).await?;
        }

        for (row_index, slow_position) in (0u32..).zip(request.slow_positions()) {
            self.checkpoint()?;
            self.run_row(run, request, geometry, row_index, slow_position)
                .await?;
            run.enter(OrchestratorState::RowDone);
        }
        Ok(())
    }

    async fn install_overrides(&self, run: &mut ScanRun, request: &ScanRequest) -> ScanResult<()> {
        let devices = &self.devices;

        // A cancelled run can leave a row armed.
        if devices.trigger_buffer.phase() != BufferPhase::Idle {
            devices.trigger_buffer.discard().await?;
        }

        for axis in [&devices.fast_axis, &devices.slow_axis] {
            let Some(deadband) = axis.profile().tightened_retry_deadband else {
                continue;
            };
            if axis.supports(OverrideSlot::RetryDeadband) {
                self.guarded(run.overrides.install(axis, OverrideSlot::RetryDeadband, deadband))
                    .await?;
            } else {
                warn!(axis = axis.name(), "Axis profile asks for a retry deadband the controller does not expose");
            }
        }

        for detector in &devices.detectors {
            if detector.wants_external_trigger() {
                self.guarded(run.overrides.install_trigger_source(detector, true))
                    .await?;
            }
            self.guarded(detector.set_total_points(request.fast_num))
                .await?;
        }

        let scaler = devices.trigger_buffer.scaler();
        self.guarded(run.overrides.install_scaler_mode(
            scaler,
            ScalerCountMode::OneShot,
            ScalerCountMode::AutoCount,
        ))
        .await?;

        if request.shutter_control {
            match &devices.shutter {
                Some(shutter) => {
                    run.overrides.register_shutter(shutter.clone());
                    info!("Opening shutter");
                    self.guarded(async { shutter.open_shutter().await.map_err(FlyScanError::from) })
                        .await?;
                }
                None => warn!("Shutter control requested but no shutter is configured"),
            }
        }
        Ok(())
    }

    async fn align(&self, request: &ScanRequest, geometry: &RowGeometry) -> ScanResult<()> {
        let devices = &self.devices;
        let limit = self.settings.convergence.timeout;
        let fast = devices.fast_axis.set_position_within(geometry.pre_roll_start, limit);
        let slow = devices.slow_axis.set_position_within(request.slow_start, limit);
        self.guarded(async { tokio::try_join!(fast, slow).map(|_| ()) })
            .await?;

        match &devices.aligner {
            Some(aligner) => {
                info!("Running peak-up before first row");
                self.guarded(async {
                    aligner
                        .peakup(request.shutter_control)
                        .await
                        .map_err(FlyScanError::from)
                })
                    .await
            }
            None => {
                warn!("Alignment requested but no aligner is configured");
                Ok(())
            }
        }
    }

    async fn run_row(
        &self,
        run: &mut ScanRun,
        request: &ScanRequest,
        geometry: &RowGeometry,
        row_index: u32,
        slow_position: f64,
    ) -> ScanResult<()> {
        let devices = &self.devices;
        let fast_axis = &devices.fast_axis;
        let buffer = &devices.trigger_buffer;
        let scaler = buffer.scaler();

        // ROW_SETUP
        run.enter(OrchestratorState::RowSetup);
        let remaining = time_remaining_hours(
            request.slow_num,
            row_index,
            request.dwell,
            request.fast_num,
            self.settings.motion.row_overhead_s,
        );
        info!(
            row = row_index + 1,
            of = request.slow_num,
            slow_position,
            time_remaining_hours = remaining,
            "Starting row"
        );
        let context = RowContext {
            run_uid: run.uid.clone(),
            row_index,
            slow_num: request.slow_num,
            slow_position,
            time_remaining_hours: remaining,
        };
        for hook in &self.hooks {
            if let Err(e) = hook.on_row_start(&context).await {
                warn!(hook = hook.name(), error = %e, "on_row_start hook failed");
            }
        }
        self.checkpoint()?;

        for detector in &devices.detectors {
            if let Some(violation) = self
                .guarded(detector.configure_exposure(request.dwell))
                .await?
            {
                run.record_violation(violation);
            }
        }
        self.guarded(buffer.configure(&RowBufferConfig {
            fast_axis: devices.fast_axis_label.clone(),
            slow_axis: devices.slow_axis_label.clone(),
            fast_start: request.fast_start,
            fast_stop: request.fast_stop,
            fast_num: request.fast_num,
            dwell: request.dwell,
        }))
        .await?;

        // PRE_ROLL
        run.enter(OrchestratorState::PreRoll);
        let limit = self.settings.convergence.timeout;
        let fast = fast_axis.set_position_within(geometry.pre_roll_start, limit);
        let slow = devices.slow_axis.set_position_within(slow_position, limit);
        self.guarded(async { tokio::try_join!(fast, slow).map(|_| ()) })
            .await?;
        self.guarded(fast_axis.converge_to(geometry.pre_roll_start, &self.settings.convergence))
            .await?;

        // ARM
        run.enter(OrchestratorState::Arm);
        let return_velocity = fast_axis.return_velocity().await?;
        let velocity = self
            .guarded(
                run.overrides
                    .install_row_velocity(fast_axis, geometry.speed(), return_velocity),
            )
            .await?;
        if fast_axis.profile().backlash_follows_velocity
            && fast_axis.supports(OverrideSlot::BacklashSpeed)
        {
            self.guarded(run.overrides.install(
                fast_axis,
                OverrideSlot::BacklashSpeed,
                geometry.speed(),
            ))
            .await?;
        }
        for detector in &devices.detectors {
            self.guarded(detector.set_row_frames(request.fast_num))
                .await?;
            self.guarded(detector.arm()).await?;
        }
        self.guarded(async { scaler.set_points(request.fast_num).await.map_err(FlyScanError::from) })
            .await?;
        self.guarded(buffer.kickoff()).await?;
        self.guarded(async { scaler.erase_start().await.map_err(FlyScanError::from) })
            .await?;

        // FLY
        run.enter(OrchestratorState::Fly);
        let mut acquisitions = Vec::with_capacity(devices.detectors.len());
        for detector in &devices.detectors {
            acquisitions.push(self.guarded(detector.trigger()).await?);
            let settle = detector.policy().settle_after_trigger;
            if !settle.is_zero() {
                self.pause(settle).await?;
            }
        }
        self.pause(self.settings.motion.pre_fly_settle()).await?;

        let bound = fly_timeout(geometry.fly_seconds(), self.settings.timeouts.fly_margin());
        let motion = fast_axis.set_position(geometry.overshoot_end);
        let detectors = async { try_join_all(acquisitions).await.map_err(FlyScanError::from) };
        self.guarded(acknowledge(
            format!("row {} motion and detector completion", row_index + 1),
            bound,
            async { tokio::try_join!(motion, detectors).map(|_| ()) },
        ))
        .await?;

        // DRAIN
        run.enter(OrchestratorState::Drain);
        self.guarded(async { scaler.stop_all().await.map_err(FlyScanError::from) })
            .await?;
        self.guarded(buffer.complete()).await?;
        let samples = self.guarded(buffer.collect()).await?;

        let mut page = EventPageDoc::from_samples(
            &run.uid,
            &run.descriptor_uid,
            row_index,
            slow_position,
            &samples,
        );
        for detector in &devices.detectors {
            page = page.with_frames(detector.name(), detector.frames_acquired().await?);
        }
        run.samples_collected += samples.len() as u64;
        run.rows_completed += 1;
        debug!(row = row_index + 1, samples = samples.len(), "Publishing event page");
        self.emit(Document::EventPage(page.clone()));
        for hook in &self.hooks {
            if let Err(e) = hook.on_event(&page).await {
                warn!(hook = hook.name(), error = %e, "on_event hook failed");
            }
        }

        run.overrides.restore(velocity).await?;
        Ok(())
    }

    /// Put the hardware back; runs on every exit path after validation
    async fn restore(&self, run: &mut ScanRun) -> Vec<FlyScanError> {
        run.enter(OrchestratorState::RestoreOverrides);
        let devices = &self.devices;
        let mut errors = Vec::new();

        if devices.trigger_buffer.phase() != BufferPhase::Idle {
            if let Err(e) = devices.trigger_buffer.discard().await {
                errors.push(e);
            }
        }

        let scaler = devices.trigger_buffer.scaler();
        match scaler.is_counting().await {
            Ok(true) => {
                if let Err(e) = scaler.stop_all().await {
                    errors.push(e.into());
                }
            }
            Ok(false) => {}
            Err(e) => errors.push(e.into()),
        }

        errors.extend(run.overrides.restore_overrides().await);

        if devices.fast_axis.profile().reset_defaults_on_finish {
            if let Err(e) = devices.fast_axis.reset_defaults().await {
                errors.push(e);
            }
        }

        if let Err(e) = run.overrides.close_shutter().await {
            errors.push(e);
        }

        for e in &errors {
            warn!(error = %e, "Cleanup step failed");
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fly_timeout() {
        assert_eq!(
            fly_timeout(7.0, Duration::from_secs(30)),
            Duration::from_secs(44)
        );
        assert_eq!(fly_timeout(f64::INFINITY, Duration::from_secs(1)), Duration::MAX);
    }

    #[tokio::test]
    async fn test_abort_handle_wakes_waiters() {
        let handle = AbortHandle::default();
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.requested().await })
        };
        tokio::task::yield_now().await;
        handle.abort("operator");
        waiter.await.unwrap();
        assert!(handle.is_requested());
        assert!(matches!(handle.error(), FlyScanError::Aborted(r) if r == "operator"));

        handle.reset();
        assert!(!handle.is_requested());
    }

    #[test]
    fn test_scan_run_records_each_violation_once() {
        let mut run = ScanRun::new(1);
        let violation = DetectorTimingViolation {
            detector: "merlin".into(),
            requested_dwell: 0.005,
            minimum_dwell: 0.0066392,
            effective_dwell: 0.007,
        };
        run.record_violation(violation.clone());
        run.record_violation(violation);
        assert_eq!(run.into_result().timing_violations.len(), 1);
    }
}
