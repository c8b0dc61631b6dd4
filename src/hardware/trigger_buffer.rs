//! Trigger buffer controller.
//!
//! The trigger buffer fans out detector triggers from encoder positions and keeps a
//! timestamped copy of every position it triggered on. Each row follows a strict
//! cycle:
//!
//! ```text
//! Idle --configure--> Configured --kickoff--> Kickedoff --complete--> Completed --collect--> Idle
//! ```
//!
//! Calling an operation out of order is a [`FlyScanError::BufferProtocol`] error.
//! `discard` is the only operation allowed from any phase; it drops buffered data
//! after an aborted row so that partial output is never reported.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{FlyScanError, ScanResult};
use crate::hardware::acknowledge;
use crate::hardware::capabilities::{PositionBuffer, Scaler};

/// Row parameters loaded into the trigger buffer before kickoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowBufferConfig {
    /// Fast-axis label understood by the trigger buffer
    pub fast_axis: String,
    /// Slow-axis label understood by the trigger buffer
    pub slow_axis: String,
    /// First fast-axis trigger position
    pub fast_start: f64,
    /// Last fast-axis trigger position
    pub fast_stop: f64,
    /// Triggers per row
    pub fast_num: u32,
    /// Time between triggers in seconds
    pub dwell: f64,
}

/// One buffered trigger.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BufferedSample {
    /// Encoder position at the trigger
    pub position: f64,
    /// Seconds since kickoff
    pub time: f64,
}

/// Phase of the trigger buffer cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferPhase {
    /// Nothing configured
    Idle,
    /// Row parameters loaded
    Configured,
    /// Buffering
    Kickedoff,
    /// Buffering stopped, data waiting to be collected
    Completed,
}

impl fmt::Display for BufferPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferPhase::Idle => write!(f, "idle"),
            BufferPhase::Configured => write!(f, "configured"),
            BufferPhase::Kickedoff => write!(f, "kicked off"),
            BufferPhase::Completed => write!(f, "completed"),
        }
    }
}

/// Enforces the configure/kickoff/complete/collect cycle on a trigger buffer
/// and its companion scaler.
pub struct TriggerBufferController {
    device: Arc<dyn PositionBuffer>,
    scaler: Arc<dyn Scaler>,
    phase: Mutex<BufferPhase>,
    kickoff_timeout: Duration,
    complete_timeout: Duration,
}

impl fmt::Debug for TriggerBufferController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerBufferController")
            .field("device", &self.device.name())
            .field("phase", &*self.phase.lock())
            .finish()
    }
}

impl TriggerBufferController {
    /// Wrap a trigger buffer and scaler with the given acknowledgment bounds
    pub fn new(
        device: Arc<dyn PositionBuffer>,
        scaler: Arc<dyn Scaler>,
        kickoff_timeout: Duration,
        complete_timeout: Duration,
    ) -> Self {
        Self {
            device,
            scaler,
            phase: Mutex::new(BufferPhase::Idle),
            kickoff_timeout,
            complete_timeout,
        }
    }

    /// Device identity
    pub fn name(&self) -> &str {
        self.device.name()
    }

    /// Companion scaler
    pub fn scaler(&self) -> &Arc<dyn Scaler> {
        &self.scaler
    }

    /// Current phase
    pub fn phase(&self) -> BufferPhase {
        *self.phase.lock()
    }

    fn expect_phase(&self, attempted: &'static str, allowed: &[BufferPhase]) -> ScanResult<()> {
        let phase = self.phase();
        if allowed.contains(&phase) {
            Ok(())
        } else {
            Err(FlyScanError::BufferProtocol { attempted, phase })
        }
    }

    fn enter(&self, phase: BufferPhase) {
        debug!(buffer = %self.device.name(), %phase, "Trigger buffer phase");
        *self.phase.lock() = phase;
    }

    /// Load row parameters. Re-configuring before kickoff is allowed.
    pub async fn configure(&self, config: &RowBufferConfig) -> ScanResult<()> {
        self.expect_phase("configure", &[BufferPhase::Idle, BufferPhase::Configured])?;
        self.device.configure(config).await?;
        self.enter(BufferPhase::Configured);
        Ok(())
    }

    /// Arm buffering and wait (bounded) for the device to acknowledge
    pub async fn kickoff(&self) -> ScanResult<()> {
        self.expect_phase("kickoff", &[BufferPhase::Configured])?;
        acknowledge(
            format!("{} kickoff", self.device.name()),
            self.kickoff_timeout,
            self.device.kickoff(),
        )
        .await?;
        self.enter(BufferPhase::Kickedoff);
        Ok(())
    }

    /// Stop buffering and wait (bounded) for the device to acknowledge
    pub async fn complete(&self) -> ScanResult<()> {
        self.expect_phase("complete", &[BufferPhase::Kickedoff])?;
        acknowledge(
            format!("{} complete", self.device.name()),
            self.complete_timeout,
            self.device.complete(),
        )
        .await?;
        self.enter(BufferPhase::Completed);
        Ok(())
    }

    /// Read out the row's samples
    pub async fn collect(&self) -> ScanResult<Vec<BufferedSample>> {
        self.expect_phase("collect", &[BufferPhase::Completed])?;
        let samples = self.device.collect().await?;
        self.enter(BufferPhase::Idle);
        debug!(buffer = %self.device.name(), samples = samples.len(), "Collected row");
        Ok(samples)
    }

    /// Drop whatever the device holds and return to `Idle`.
    ///
    /// A no-op when already idle.
    pub async fn discard(&self) -> ScanResult<()> {
        let phase = self.phase();
        if phase == BufferPhase::Idle {
            return Ok(());
        }
        warn!(buffer = %self.device.name(), %phase, "Discarding partial trigger buffer data");
        // Always leave the controller idle, even if the device refuses.
        self.enter(BufferPhase::Idle);
        self.device.discard().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{CommandJournal, MockScaler, MockTriggerBuffer};

    fn row() -> RowBufferConfig {
        RowBufferConfig {
            fast_axis: "HOR".into(),
            slow_axis: "VER".into(),
            fast_start: 0.0,
            fast_stop: 1.0,
            fast_num: 5,
            dwell: 0.1,
        }
    }

    fn controller(buffer: MockTriggerBuffer) -> TriggerBufferController {
        let journal = CommandJournal::new();
        TriggerBufferController::new(
            Arc::new(buffer),
            Arc::new(MockScaler::new("sclr", journal)),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn full_cycle_returns_to_idle() {
        let ctrl = controller(MockTriggerBuffer::new("zebra", CommandJournal::new()));
        ctrl.configure(&row()).await.unwrap();
        ctrl.kickoff().await.unwrap();
        ctrl.complete().await.unwrap();
        let samples = ctrl.collect().await.unwrap();
        assert_eq!(samples.len(), 5);
        assert_eq!(ctrl.phase(), BufferPhase::Idle);
    }

    #[tokio::test]
    async fn out_of_order_calls_are_rejected() {
        let ctrl = controller(MockTriggerBuffer::new("zebra", CommandJournal::new()));
        assert!(matches!(
            ctrl.kickoff().await,
            Err(FlyScanError::BufferProtocol {
                attempted: "kickoff",
                phase: BufferPhase::Idle
            })
        ));
        ctrl.configure(&row()).await.unwrap();
        assert!(matches!(
            ctrl.collect().await,
            Err(FlyScanError::BufferProtocol {
                attempted: "collect",
                ..
            })
        ));
        ctrl.kickoff().await.unwrap();
        assert!(matches!(
            ctrl.configure(&row()).await,
            Err(FlyScanError::BufferProtocol { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_kickoff_times_out() {
        let ctrl = controller(
            MockTriggerBuffer::new("zebra", CommandJournal::new()).with_silent_kickoff(),
        );
        ctrl.configure(&row()).await.unwrap();
        let err = ctrl.kickoff().await.unwrap_err();
        assert!(matches!(
            err,
            FlyScanError::HardwareAcknowledgmentTimeout { .. }
        ));
        assert_eq!(ctrl.phase(), BufferPhase::Configured);
    }

    #[tokio::test]
    async fn discard_from_any_phase() {
        let ctrl = controller(MockTriggerBuffer::new("zebra", CommandJournal::new()));
        ctrl.discard().await.unwrap();
        ctrl.configure(&row()).await.unwrap();
        ctrl.kickoff().await.unwrap();
        ctrl.discard().await.unwrap();
        assert_eq!(ctrl.phase(), BufferPhase::Idle);
        ctrl.configure(&row()).await.unwrap();
    }
}
