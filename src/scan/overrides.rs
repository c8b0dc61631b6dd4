//! Scoped hardware overrides.
//!
//! Retry deadbands, backlash speeds, trigger sources and scaler modes are shared by
//! everything that uses the hardware, so whatever a run changes it must put back.
//! [`OverrideScope`] records the value each override replaced and restores them
//! exactly once, newest first, on every exit path. The shutter registered with the
//! scope is closed after everything else.
//!
//! If a scope is dropped with work outstanding (the run future was cancelled), the
//! restoration is spawned onto the current tokio runtime.

use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::{FlyScanError, ScanResult};
use crate::hardware::axis::AxisController;
use crate::hardware::capabilities::{OverrideSlot, Scaler, ScalerCountMode, ShutterControl};
use crate::hardware::detector::DetectorAdapter;

/// Handle to one installed override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OverrideToken(u64);

enum Restoration {
    AxisSlot {
        axis: AxisController,
        slot: OverrideSlot,
        value: f64,
    },
    TriggerSource {
        detector: DetectorAdapter,
        external: bool,
    },
    ScalerMode {
        scaler: Arc<dyn Scaler>,
        mode: ScalerCountMode,
    },
}

impl fmt::Display for Restoration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Restoration::AxisSlot { axis, slot, value } => {
                write!(f, "{}.{slot} = {value}", axis.name())
            }
            Restoration::TriggerSource { detector, external } => {
                write!(f, "{}.external_trigger = {external}", detector.name())
            }
            Restoration::ScalerMode { mode, .. } => write!(f, "scaler.count_mode = {mode:?}"),
        }
    }
}

impl Restoration {
    async fn apply(&self) -> ScanResult<()> {
        match self {
            Restoration::AxisSlot { axis, slot, value } => {
                axis.restore_override(*slot, *value).await
            }
            Restoration::TriggerSource { detector, external } => {
                detector.set_external_trigger(*external).await
            }
            Restoration::ScalerMode { scaler, mode } => Ok(scaler.set_count_mode(*mode).await?),
        }
    }

    fn is_axis_slot(&self, name: &str, wanted: OverrideSlot) -> bool {
        matches!(self, Restoration::AxisSlot { axis, slot, .. } if axis.name() == name && *slot == wanted)
    }
}

struct Installed {
    token: OverrideToken,
    restoration: Restoration,
}

/// Overrides installed by one run, restored exactly once.
#[derive(Default)]
pub struct OverrideScope {
    installed: Vec<Installed>,
    shutter: Option<Arc<dyn ShutterControl>>,
    next_token: u64,
}

impl fmt::Debug for OverrideScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverrideScope")
            .field("outstanding", &self.installed.len())
            .field("shutter", &self.shutter.is_some())
            .finish()
    }
}

impl OverrideScope {
    /// Create an empty scope
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, restoration: Restoration) -> OverrideToken {
        let token = OverrideToken(self.next_token);
        self.next_token += 1;
        debug!(restore = %restoration, "Recorded override");
        self.installed.push(Installed { token, restoration });
        token
    }

    /// Write `value` into an axis slot, remembering the value it replaced.
    ///
    /// Installing the same slot twice keeps the first prior value and returns the
    /// original token.
    pub async fn install(
        &mut self,
        axis: &AxisController,
        slot: OverrideSlot,
        value: f64,
    ) -> ScanResult<OverrideToken> {
        if let Some(existing) = self
            .installed
            .iter()
            .find(|i| i.restoration.is_axis_slot(axis.name(), slot))
        {
            let token = existing.token;
            axis.write_override(slot, value).await?;
            return Ok(token);
        }
        let prior = axis.install_override(slot, value).await?;
        Ok(self.push(Restoration::AxisSlot {
            axis: axis.clone(),
            slot,
            value: prior,
        }))
    }

    /// Set a row's fly velocity; releasing the token sets `restore_to`.
    pub async fn install_row_velocity(
        &mut self,
        axis: &AxisController,
        velocity: f64,
        restore_to: f64,
    ) -> ScanResult<OverrideToken> {
        axis.set_velocity(velocity).await?;
        Ok(self.push(Restoration::AxisSlot {
            axis: axis.clone(),
            slot: OverrideSlot::Velocity,
            value: restore_to,
        }))
    }

    /// Select a detector's trigger source, remembering the previous selection.
    ///
    /// Returns `None` when the detector exposes no trigger selection.
    pub async fn install_trigger_source(
        &mut self,
        detector: &DetectorAdapter,
        external: bool,
    ) -> ScanResult<Option<OverrideToken>> {
        let Some(prior) = detector.external_trigger().await? else {
            return Ok(None);
        };
        detector.set_external_trigger(external).await?;
        Ok(Some(self.push(Restoration::TriggerSource {
            detector: detector.clone(),
            external: prior,
        })))
    }

    /// Put the scaler in `during`; it is set to `after` on restoration.
    pub async fn install_scaler_mode(
        &mut self,
        scaler: &Arc<dyn Scaler>,
        during: ScalerCountMode,
        after: ScalerCountMode,
    ) -> ScanResult<OverrideToken> {
        scaler.set_count_mode(during).await?;
        Ok(self.push(Restoration::ScalerMode {
            scaler: scaler.clone(),
            mode: after,
        }))
    }

    /// Close `shutter` after every override has been restored
    pub fn register_shutter(&mut self, shutter: Arc<dyn ShutterControl>) {
        self.shutter = Some(shutter);
    }

    /// Restore one override now. Restoring an already-restored token is a no-op.
    pub async fn restore(&mut self, token: OverrideToken) -> ScanResult<()> {
        let Some(index) = self.installed.iter().position(|i| i.token == token) else {
            return Ok(());
        };
        let installed = self.installed.remove(index);
        installed.restoration.apply().await
    }

    /// Overrides not yet restored
    pub fn outstanding(&self) -> usize {
        self.installed.len()
    }

    /// Whether a shutter is waiting to be closed
    pub fn holds_shutter(&self) -> bool {
        self.shutter.is_some()
    }

    /// Restore every outstanding override, newest first.
    ///
    /// Every restoration is attempted; failures are logged and returned.
    pub async fn restore_overrides(&mut self) -> Vec<FlyScanError> {
        restore_newest_first(&mut self.installed).await
    }

    /// Close the registered shutter, if any
    pub async fn close_shutter(&mut self) -> ScanResult<()> {
        close(self.shutter.take()).await
    }

    /// Restore every override, then close the shutter
    pub async fn restore_all(&mut self) -> Vec<FlyScanError> {
        let mut errors = self.restore_overrides().await;
        if let Err(e) = self.close_shutter().await {
            warn!(error = %e, "Failed to close shutter");
            errors.push(e);
        }
        errors
    }
}

async fn restore_newest_first(pending: &mut Vec<Installed>) -> Vec<FlyScanError> {
    let mut errors = Vec::new();
    while let Some(installed) = pending.pop() {
        if let Err(e) = installed.restoration.apply().await {
            warn!(restore = %installed.restoration, error = %e, "Failed to restore override");
            errors.push(e);
        }
    }
    errors
}

async fn close(shutter: Option<Arc<dyn ShutterControl>>) -> ScanResult<()> {
    if let Some(shutter) = shutter {
        info!("Closing shutter");
        shutter.close_shutter().await?;
    }
    Ok(())
}

/// Work taken out of a dropped scope. Has no `Drop` of its own, so a background
/// task that never gets polled simply discards it.
struct Orphaned {
    installed: Vec<Installed>,
    shutter: Option<Arc<dyn ShutterControl>>,
}

impl Orphaned {
    async fn restore(mut self) {
        let mut failures = restore_newest_first(&mut self.installed).await.len();
        if let Err(e) = close(self.shutter.take()).await {
            warn!(error = %e, "Failed to close shutter");
            failures += 1;
        }
        if failures > 0 {
            error!(failures, "Background override restoration incomplete");
        }
    }
}

impl Drop for OverrideScope {
    fn drop(&mut self) {
        if self.installed.is_empty() && self.shutter.is_none() {
            return;
        }
        let orphan = Orphaned {
            installed: std::mem::take(&mut self.installed),
            shutter: self.shutter.take(),
        };
        warn!(
            outstanding = orphan.installed.len(),
            shutter = orphan.shutter.is_some(),
            "Override scope dropped before restoration, restoring in background"
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(orphan.restore());
            }
            Err(_) => error!(
                outstanding = orphan.installed.len(),
                "No tokio runtime, overrides left installed"
            ),
        }
    }
}
