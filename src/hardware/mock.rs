//! Mock Hardware Implementations
//!
//! Provides simulated fly-scan hardware for testing and for the CLI's simulated
//! beamline. All mock devices use async-safe operations (tokio::time::sleep, not
//! std::thread::sleep), so tests can run under `start_paused` virtual time.
//!
//! # Available Mocks
//!
//! - `MockAxis` - Stage axis travelling at its commanded velocity, with override slots
//! - `MockDetector` - Triggered detector with exposure and trigger-source control
//! - `MockTriggerBuffer` - Position-capture trigger buffer
//! - `MockScaler` - Counter clocked by the trigger buffer
//! - `MockShutter`, `MockAligner`, `MockReadable`
//!
//! Every mock writes the commands it receives into a shared [`CommandJournal`], so
//! tests can assert on ordering across devices (e.g. the shutter closing last).
//!
//! # Failure Injection
//!
//! - `MockAxis::with_short_moves` lands the next N moves short of target
//! - `MockAxis::stuck_at` never leaves a position
//! - `MockDetector::hanging` returns a status that never resolves
//! - `MockTriggerBuffer::with_silent_kickoff` / `with_silent_complete` never acknowledge

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

use crate::hardware::capabilities::{
    AcquisitionStatus, BeamAligner, CaptureCountConfigurable, ExposureConfigurable,
    ExternalTriggerControl, FlyDetector, FrameCountConfigurable, Movable, OverrideSlot,
    OverrideSlots, PositionBuffer, Readable, Scaler, ScalerCountMode, ShutterControl,
    Triggerable, VelocityControl,
};
use crate::hardware::detector::DetectorKind;
use crate::hardware::trigger_buffer::{BufferedSample, RowBufferConfig};

// =============================================================================
// CommandJournal - Shared command log
// =============================================================================

/// One command received by a mock device
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    /// Device identity
    pub device: String,
    /// Command name (e.g. "move_abs", "set_retry_deadband", "kickoff")
    pub action: String,
    /// Numeric argument, if any
    pub value: Option<f64>,
    /// When the command arrived (tokio clock, so paused tests see virtual time)
    pub at: Instant,
}

/// Ordered log of commands shared between mock devices
#[derive(Debug, Clone, Default)]
pub struct CommandJournal {
    entries: Arc<Mutex<Vec<JournalEntry>>>,
}

impl CommandJournal {
    /// Create an empty journal
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command
    pub fn record(&self, device: &str, action: &str, value: Option<f64>) {
        self.entries.lock().push(JournalEntry {
            device: device.to_string(),
            action: action.to_string(),
            value,
            at: Instant::now(),
        });
    }

    /// Snapshot of every command so far
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().clone()
    }

    /// Number of recorded commands
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Forget everything recorded so far
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Command names received by one device, in order
    pub fn actions_for(&self, device: &str) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.device == device)
            .map(|e| e.action.clone())
            .collect()
    }

    /// How many times a device received a command
    pub fn count(&self, device: &str, action: &str) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.device == device && e.action == action)
            .count()
    }

    /// Index of the first occurrence of a command
    pub fn first_index_of(&self, device: &str, action: &str) -> Option<usize> {
        self.entries
            .lock()
            .iter()
            .position(|e| e.device == device && e.action == action)
    }

    /// Index of the last occurrence of a command
    pub fn last_index_of(&self, device: &str, action: &str) -> Option<usize> {
        self.entries
            .lock()
            .iter()
            .rposition(|e| e.device == device && e.action == action)
    }

    /// Index of the last command on any device
    pub fn last_index(&self) -> Option<usize> {
        self.len().checked_sub(1)
    }
}

// =============================================================================
// MockAxis - Simulated stage axis
// =============================================================================

#[derive(Debug)]
struct AxisState {
    position: f64,
    velocity: f64,
    slots: HashMap<OverrideSlot, f64>,
    moves: Vec<f64>,
}

/// Mock stage axis
///
/// Travels at its commanded velocity (so a fly row takes as long as it would on
/// hardware under virtual time) and exposes whichever override slots it was built
/// with.
///
/// # Example
///
/// ```rust,ignore
/// let axis = MockAxis::new("hf_stage.x", "mm").with_slot(OverrideSlot::RetryDeadband, 0.01);
/// axis.move_abs(2.0).await?;
/// assert_eq!(axis.position().await?, 2.0);
/// ```
pub struct MockAxis {
    name: String,
    egu: String,
    state: Mutex<AxisState>,
    velocity_high_limit: Option<f64>,
    short_moves: AtomicU32,
    miss: f64,
    stuck_at: Option<f64>,
    travel_time: bool,
    journal: CommandJournal,
}

impl MockAxis {
    /// Create an axis at 0.0 moving at 1.0 units/s
    pub fn new(name: impl Into<String>, egu: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            egu: egu.into(),
            state: Mutex::new(AxisState {
                position: 0.0,
                velocity: 1.0,
                slots: HashMap::new(),
                moves: Vec::new(),
            }),
            velocity_high_limit: None,
            short_moves: AtomicU32::new(0),
            miss: 0.0,
            stuck_at: None,
            travel_time: true,
            journal: CommandJournal::new(),
        }
    }

    /// Record commands into a shared journal
    pub fn with_journal(mut self, journal: CommandJournal) -> Self {
        self.journal = journal;
        self
    }

    /// Start at a given position
    pub fn with_position(self, position: f64) -> Self {
        self.state.lock().position = position;
        self
    }

    /// Start with a given velocity
    pub fn with_velocity(self, velocity: f64) -> Self {
        self.state.lock().velocity = velocity;
        self
    }

    /// Expose a velocity high limit
    pub fn with_velocity_high_limit(mut self, limit: f64) -> Self {
        self.velocity_high_limit = Some(limit);
        self
    }

    /// Expose an override slot with an initial value
    pub fn with_slot(self, slot: OverrideSlot, value: f64) -> Self {
        self.state.lock().slots.insert(slot, value);
        self
    }

    /// Land the next `count` moves `miss` short of their target
    pub fn with_short_moves(mut self, count: u32, miss: f64) -> Self {
        self.short_moves = AtomicU32::new(count);
        self.miss = miss;
        self
    }

    /// Never leave `position`
    pub fn stuck_at(mut self, position: f64) -> Self {
        self.stuck_at = Some(position);
        self.state.lock().position = position;
        self
    }

    /// Complete moves instantly instead of travelling at the commanded velocity
    pub fn without_travel_time(mut self) -> Self {
        self.travel_time = false;
        self
    }

    /// Current value of an override slot
    pub fn slot_value(&self, slot: OverrideSlot) -> Option<f64> {
        let state = self.state.lock();
        match slot {
            OverrideSlot::Velocity => Some(state.velocity),
            _ => state.slots.get(&slot).copied(),
        }
    }

    /// Snapshot of every slot value, velocity included
    pub fn slot_snapshot(&self) -> HashMap<OverrideSlot, f64> {
        let state = self.state.lock();
        let mut snapshot = state.slots.clone();
        snapshot.insert(OverrideSlot::Velocity, state.velocity);
        snapshot
    }

    /// Number of moves commanded to exactly `target`
    pub fn moves_to(&self, target: f64) -> usize {
        self.state
            .lock()
            .moves
            .iter()
            .filter(|m| (**m - target).abs() < 1e-12)
            .count()
    }

    /// Every commanded target, in order
    pub fn moves(&self) -> Vec<f64> {
        self.state.lock().moves.clone()
    }
}

#[async_trait]
impl Movable for MockAxis {
    async fn move_abs(&self, target: f64) -> Result<()> {
        self.journal.record(&self.name, "move_abs", Some(target));
        let (current, velocity) = {
            let mut state = self.state.lock();
            state.moves.push(target);
            (state.position, state.velocity)
        };

        if self.travel_time && velocity > 0.0 {
            let secs = (target - current).abs() / velocity;
            sleep(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)).await;
        }

        let landed = if let Some(stuck) = self.stuck_at {
            stuck
        } else if self
            .short_moves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            target - self.miss
        } else {
            target
        };
        self.state.lock().position = landed;
        debug!(axis = %self.name, target, landed, "MockAxis move done");
        Ok(())
    }

    async fn position(&self) -> Result<f64> {
        Ok(self.state.lock().position)
    }

    fn engineering_units(&self) -> &str {
        &self.egu
    }

    async fn stop(&self) -> Result<()> {
        self.journal.record(&self.name, "stop", None);
        Ok(())
    }
}

#[async_trait]
impl VelocityControl for MockAxis {
    async fn set_velocity(&self, velocity: f64) -> Result<()> {
        if !velocity.is_finite() || velocity <= 0.0 {
            bail!("{}: invalid velocity {velocity}", self.name);
        }
        self.journal.record(&self.name, "set_velocity", Some(velocity));
        self.state.lock().velocity = velocity;
        Ok(())
    }

    async fn velocity(&self) -> Result<f64> {
        Ok(self.state.lock().velocity)
    }

    async fn velocity_high_limit(&self) -> Result<Option<f64>> {
        Ok(self.velocity_high_limit)
    }
}

#[async_trait]
impl OverrideSlots for MockAxis {
    fn supports_slot(&self, slot: OverrideSlot) -> bool {
        slot == OverrideSlot::Velocity || self.state.lock().slots.contains_key(&slot)
    }

    async fn read_slot(&self, slot: OverrideSlot) -> Result<f64> {
        self.slot_value(slot)
            .ok_or_else(|| anyhow!("{}: no {slot} slot", self.name))
    }

    async fn write_slot(&self, slot: OverrideSlot, value: f64) -> Result<()> {
        if slot == OverrideSlot::Velocity {
            return self.set_velocity(value).await;
        }
        self.journal
            .record(&self.name, &format!("set_{slot}"), Some(value));
        let mut state = self.state.lock();
        match state.slots.get_mut(&slot) {
            Some(current) => {
                *current = value;
                Ok(())
            }
            None => Err(anyhow!("{}: no {slot} slot", self.name)),
        }
    }

    async fn reset_defaults(&self) -> Result<()> {
        self.journal.record(&self.name, "reset_defaults", None);
        Ok(())
    }
}

// =============================================================================
// MockDetector - Simulated triggered detector
// =============================================================================

#[derive(Debug, Default)]
struct DetectorState {
    armed: bool,
    frame_count: u32,
    capture_count: u32,
    total_points: u32,
    exposure: Option<(f64, f64)>,
    external_trigger: bool,
    frames_acquired: u64,
    triggers: u32,
}

/// Mock detector
///
/// Must be armed before every trigger. The returned status resolves after the
/// acquisition time, at which point `frame_count` frames have been "acquired".
pub struct MockDetector {
    name: String,
    kind: DetectorKind,
    state: Arc<Mutex<DetectorState>>,
    acquisition_time: Duration,
    hanging: bool,
    journal: CommandJournal,
}

impl MockDetector {
    /// Create a detector of the given kind
    pub fn new(name: impl Into<String>, kind: DetectorKind, journal: CommandJournal) -> Self {
        Self {
            name: name.into(),
            kind,
            state: Arc::new(Mutex::new(DetectorState::default())),
            acquisition_time: Duration::from_millis(10),
            hanging: false,
            journal,
        }
    }

    /// Status futures never resolve
    pub fn hanging(mut self) -> Self {
        self.hanging = true;
        self
    }

    /// Last (exposure_time, exposure_period) written, if any
    pub fn exposure_settings(&self) -> Option<(f64, f64)> {
        self.state.lock().exposure
    }

    /// Whether external triggering is selected
    pub fn is_external_trigger(&self) -> bool {
        self.state.lock().external_trigger
    }

    /// (frame_count, capture_count, total_points)
    pub fn counts(&self) -> (u32, u32, u32) {
        let state = self.state.lock();
        (state.frame_count, state.capture_count, state.total_points)
    }

    /// Number of triggers received
    pub fn triggers(&self) -> u32 {
        self.state.lock().triggers
    }
}

#[async_trait]
impl Triggerable for MockDetector {
    async fn arm(&self) -> Result<()> {
        self.journal.record(&self.name, "arm", None);
        let mut state = self.state.lock();
        state.armed = true;
        state.frames_acquired = 0;
        Ok(())
    }

    async fn trigger(&self) -> Result<AcquisitionStatus> {
        self.journal.record(&self.name, "trigger", None);
        {
            let mut state = self.state.lock();
            if !state.armed {
                bail!("{}: triggered while not armed", self.name);
            }
            state.armed = false;
            state.triggers += 1;
        }

        if self.hanging {
            return Ok(futures::future::pending().boxed());
        }

        let state = self.state.clone();
        let acquisition_time = self.acquisition_time;
        Ok(async move {
            sleep(acquisition_time).await;
            let mut state = state.lock();
            state.frames_acquired = u64::from(state.frame_count);
            Ok(())
        }
        .boxed())
    }
}

#[async_trait]
impl FrameCountConfigurable for MockDetector {
    async fn set_frame_count(&self, frames: u32) -> Result<()> {
        self.journal
            .record(&self.name, "set_frame_count", Some(f64::from(frames)));
        self.state.lock().frame_count = frames;
        Ok(())
    }

    async fn frame_count(&self) -> Result<u32> {
        Ok(self.state.lock().frame_count)
    }

    async fn set_total_points(&self, points: u32) -> Result<()> {
        self.journal
            .record(&self.name, "set_total_points", Some(f64::from(points)));
        self.state.lock().total_points = points;
        Ok(())
    }
}

#[async_trait]
impl CaptureCountConfigurable for MockDetector {
    async fn set_capture_count(&self, captures: u32) -> Result<()> {
        self.journal
            .record(&self.name, "set_capture_count", Some(f64::from(captures)));
        self.state.lock().capture_count = captures;
        Ok(())
    }

    async fn capture_count(&self) -> Result<u32> {
        Ok(self.state.lock().capture_count)
    }
}

#[async_trait]
impl ExposureConfigurable for MockDetector {
    async fn set_exposure(&self, exposure_time: f64, exposure_period: f64) -> Result<()> {
        if exposure_time <= 0.0 || exposure_period <= 0.0 {
            bail!(
                "{}: invalid exposure {exposure_time}s / period {exposure_period}s",
                self.name
            );
        }
        self.journal
            .record(&self.name, "set_exposure", Some(exposure_time));
        self.state.lock().exposure = Some((exposure_time, exposure_period));
        Ok(())
    }

    async fn exposure(&self) -> Result<(f64, f64)> {
        self.state
            .lock()
            .exposure
            .ok_or_else(|| anyhow!("{}: exposure never set", self.name))
    }
}

#[async_trait]
impl ExternalTriggerControl for MockDetector {
    async fn set_external_trigger(&self, external: bool) -> Result<()> {
        self.journal.record(
            &self.name,
            "set_external_trigger",
            Some(if external { 1.0 } else { 0.0 }),
        );
        self.state.lock().external_trigger = external;
        Ok(())
    }

    async fn external_trigger(&self) -> Result<bool> {
        Ok(self.state.lock().external_trigger)
    }
}

#[async_trait]
impl FlyDetector for MockDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DetectorKind {
        self.kind
    }

    fn exposure_control(&self) -> Option<&dyn ExposureConfigurable> {
        Some(self)
    }

    fn trigger_source(&self) -> Option<&dyn ExternalTriggerControl> {
        Some(self)
    }

    async fn frames_acquired(&self) -> Result<u64> {
        Ok(self.state.lock().frames_acquired)
    }
}

// =============================================================================
// MockTriggerBuffer - Simulated position-capture box
// =============================================================================

/// Mock trigger buffer
///
/// `collect` returns one sample per configured trigger, evenly spaced between the
/// row's start and stop, `dwell` seconds apart.
pub struct MockTriggerBuffer {
    name: String,
    config: Mutex<Option<RowBufferConfig>>,
    history: Mutex<Vec<RowBufferConfig>>,
    silent_kickoff: bool,
    silent_complete: bool,
    journal: CommandJournal,
}

impl MockTriggerBuffer {
    /// Create a trigger buffer
    pub fn new(name: impl Into<String>, journal: CommandJournal) -> Self {
        Self {
            name: name.into(),
            config: Mutex::new(None),
            history: Mutex::new(Vec::new()),
            silent_kickoff: false,
            silent_complete: false,
            journal,
        }
    }

    /// Never acknowledge kickoff
    pub fn with_silent_kickoff(mut self) -> Self {
        self.silent_kickoff = true;
        self
    }

    /// Never acknowledge complete
    pub fn with_silent_complete(mut self) -> Self {
        self.silent_complete = true;
        self
    }

    /// Every row configuration received, in order
    pub fn configured_rows(&self) -> Vec<RowBufferConfig> {
        self.history.lock().clone()
    }
}

#[async_trait]
impl PositionBuffer for MockTriggerBuffer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn configure(&self, config: &RowBufferConfig) -> Result<()> {
        self.journal
            .record(&self.name, "configure", Some(f64::from(config.fast_num)));
        *self.config.lock() = Some(config.clone());
        self.history.lock().push(config.clone());
        Ok(())
    }

    async fn kickoff(&self) -> Result<()> {
        self.journal.record(&self.name, "kickoff", None);
        if self.silent_kickoff {
            return futures::future::pending().await;
        }
        Ok(())
    }

    async fn complete(&self) -> Result<()> {
        self.journal.record(&self.name, "complete", None);
        if self.silent_complete {
            return futures::future::pending().await;
        }
        Ok(())
    }

    async fn collect(&self) -> Result<Vec<BufferedSample>> {
        self.journal.record(&self.name, "collect", None);
        let config = self
            .config
            .lock()
            .clone()
            .ok_or_else(|| anyhow!("{}: collect before configure", self.name))?;
        let n = config.fast_num.max(1);
        let step = if n > 1 {
            (config.fast_stop - config.fast_start) / f64::from(n - 1)
        } else {
            0.0
        };
        Ok((0..n)
            .map(|i| BufferedSample {
                position: config.fast_start + step * f64::from(i),
                time: config.dwell * f64::from(i),
            })
            .collect())
    }

    async fn discard(&self) -> Result<()> {
        self.journal.record(&self.name, "discard", None);
        Ok(())
    }
}

// =============================================================================
// MockScaler
// =============================================================================

#[derive(Debug)]
struct ScalerState {
    points: u32,
    counting: bool,
    mode: ScalerCountMode,
}

/// Mock scaler, starts in auto-count mode
pub struct MockScaler {
    name: String,
    state: Mutex<ScalerState>,
    journal: CommandJournal,
}

impl MockScaler {
    /// Create a scaler
    pub fn new(name: impl Into<String>, journal: CommandJournal) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(ScalerState {
                points: 0,
                counting: false,
                mode: ScalerCountMode::AutoCount,
            }),
            journal,
        }
    }

    /// Configured points
    pub fn points(&self) -> u32 {
        self.state.lock().points
    }

    /// Current mode
    pub fn mode(&self) -> ScalerCountMode {
        self.state.lock().mode
    }
}

#[async_trait]
impl Scaler for MockScaler {
    async fn set_points(&self, points: u32) -> Result<()> {
        self.journal
            .record(&self.name, "set_points", Some(f64::from(points)));
        self.state.lock().points = points;
        Ok(())
    }

    async fn erase_start(&self) -> Result<()> {
        self.journal.record(&self.name, "erase_start", None);
        self.state.lock().counting = true;
        Ok(())
    }

    async fn stop_all(&self) -> Result<()> {
        self.journal.record(&self.name, "stop_all", None);
        self.state.lock().counting = false;
        Ok(())
    }

    async fn set_count_mode(&self, mode: ScalerCountMode) -> Result<()> {
        self.journal.record(&self.name, &format!("count_mode_{mode:?}"), None);
        self.state.lock().mode = mode;
        Ok(())
    }

    async fn count_mode(&self) -> Result<ScalerCountMode> {
        Ok(self.state.lock().mode)
    }

    async fn is_counting(&self) -> Result<bool> {
        Ok(self.state.lock().counting)
    }
}

// =============================================================================
// MockShutter, MockAligner, MockReadable
// =============================================================================

/// Mock shutter, starts closed
pub struct MockShutter {
    name: String,
    open: Mutex<bool>,
    journal: CommandJournal,
}

impl MockShutter {
    /// Create a closed shutter
    pub fn new(name: impl Into<String>, journal: CommandJournal) -> Self {
        Self {
            name: name.into(),
            open: Mutex::new(false),
            journal,
        }
    }

    /// Whether the shutter is open
    pub fn is_open(&self) -> bool {
        *self.open.lock()
    }
}

#[async_trait]
impl ShutterControl for MockShutter {
    async fn open_shutter(&self) -> Result<()> {
        self.journal.record(&self.name, "open", None);
        *self.open.lock() = true;
        Ok(())
    }

    async fn close_shutter(&self) -> Result<()> {
        self.journal.record(&self.name, "close", None);
        *self.open.lock() = false;
        Ok(())
    }

    async fn is_shutter_open(&self) -> Result<bool> {
        Ok(self.is_open())
    }
}

/// Mock beam aligner
pub struct MockAligner {
    name: String,
    journal: CommandJournal,
}

impl MockAligner {
    /// Create an aligner
    pub fn new(name: impl Into<String>, journal: CommandJournal) -> Self {
        Self {
            name: name.into(),
            journal,
        }
    }
}

#[async_trait]
impl BeamAligner for MockAligner {
    async fn peakup(&self, shutter: bool) -> Result<()> {
        self.journal
            .record(&self.name, "peakup", Some(if shutter { 1.0 } else { 0.0 }));
        sleep(Duration::from_millis(50)).await;
        Ok(())
    }
}

/// Mock scalar readout with a fixed value
pub struct MockReadable {
    value: f64,
}

impl MockReadable {
    /// Create a readout returning `value`
    pub fn new(value: f64) -> Self {
        Self { value }
    }
}

#[async_trait]
impl Readable for MockReadable {
    async fn read(&self) -> Result<f64> {
        Ok(self.value)
    }
}
