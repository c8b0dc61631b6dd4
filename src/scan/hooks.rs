//! Lifecycle hooks.
//!
//! Hooks run in registration order at four points of a run: after the start
//! document, at the start of each row, after each row's event page, and after the
//! stop document. A failing hook is logged and never fails the scan.
//!
//! [`ScanRecordHook`] turns those callbacks into the beamline's scan-record
//! telemetry and delivers it to a [`StatusSink`].

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::scan::document::{EventPageDoc, StartDoc, StopDoc};

/// Context handed to `on_row_start`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowContext {
    /// Run the row belongs to
    pub run_uid: String,
    /// 0-based row index
    pub row_index: u32,
    /// Total rows
    pub slow_num: u32,
    /// Slow-axis position of the row
    pub slow_position: f64,
    /// Estimated hours left, counting this row
    pub time_remaining_hours: f64,
}

/// Callbacks observing a run
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    /// Hook identity used in logs
    fn name(&self) -> &str;

    /// After the start document is published
    async fn on_start(&self, _start: &StartDoc) -> Result<()> {
        Ok(())
    }

    /// Before a row is configured
    async fn on_row_start(&self, _row: &RowContext) -> Result<()> {
        Ok(())
    }

    /// After a row's event page is published
    async fn on_event(&self, _page: &EventPageDoc) -> Result<()> {
        Ok(())
    }

    /// After overrides are restored and the stop document is published
    async fn on_stop(&self, _stop: &StopDoc) -> Result<()> {
        Ok(())
    }
}

/// Scan-record telemetry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusUpdate {
    /// Published when a run starts
    ScanStarted {
        /// First six characters of the run uid
        current_scan: String,
        /// Run index
        current_scan_id: u64,
        /// Scan type
        current_type: String,
        /// Always true
        scanning: bool,
        /// Estimated hours for the whole scan
        time_remaining_hours: f64,
    },
    /// Published at the start of each row
    TimeRemaining {
        /// Estimated hours left
        time_remaining_hours: f64,
    },
    /// Published when a run ends, successful or not
    ScanFinished {
        /// Always false
        scanning: bool,
        /// Always zero
        time_remaining_hours: f64,
    },
    /// Detailed completion record
    Completion {
        /// Run uid
        run_uid: String,
        /// Run index
        scan_id: u64,
        /// Scan type
        scan_type: String,
        /// Plan name
        plan_name: String,
        /// "success", "abort" or "fail"
        exit_status: String,
        /// Failure reason, empty on success
        reason: String,
        /// Rows published
        num_events: u32,
    },
}

/// Destination for scan-record telemetry
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// Deliver one update
    async fn publish(&self, update: StatusUpdate) -> Result<()>;
}

/// Keeps every update in memory
#[derive(Debug, Default, Clone)]
pub struct MemoryStatusSink {
    updates: Arc<Mutex<Vec<StatusUpdate>>>,
}

impl MemoryStatusSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Every update received so far
    pub fn updates(&self) -> Vec<StatusUpdate> {
        self.updates.lock().clone()
    }
}

#[async_trait]
impl StatusSink for MemoryStatusSink {
    async fn publish(&self, update: StatusUpdate) -> Result<()> {
        self.updates.lock().push(update);
        Ok(())
    }
}

/// Logs every update through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStatusSink;

#[async_trait]
impl StatusSink for TracingStatusSink {
    async fn publish(&self, update: StatusUpdate) -> Result<()> {
        match &update {
            StatusUpdate::ScanStarted {
                current_scan,
                current_scan_id,
                current_type,
                time_remaining_hours,
                ..
            } => info!(
                %current_scan,
                current_scan_id,
                %current_type,
                time_remaining_hours,
                "Scan started"
            ),
            StatusUpdate::TimeRemaining {
                time_remaining_hours,
            } => info!(time_remaining_hours, "Scan progress"),
            StatusUpdate::ScanFinished { .. } => info!("Scan finished"),
            StatusUpdate::Completion {
                run_uid,
                exit_status,
                num_events,
                ..
            } => info!(%run_uid, %exit_status, num_events, "Scan record"),
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct ActiveScan {
    scan_id: u64,
    scan_type: String,
    plan_name: String,
}

/// Publishes scan-record telemetry for every run
pub struct ScanRecordHook {
    sink: Arc<dyn StatusSink>,
    active: Mutex<Option<ActiveScan>>,
}

impl ScanRecordHook {
    /// Deliver telemetry to `sink`
    pub fn new(sink: Arc<dyn StatusSink>) -> Self {
        Self {
            sink,
            active: Mutex::new(None),
        }
    }
}

#[async_trait]
impl LifecycleHook for ScanRecordHook {
    fn name(&self) -> &str {
        "scan_record"
    }

    async fn on_start(&self, start: &StartDoc) -> Result<()> {
        *self.active.lock() = Some(ActiveScan {
            scan_id: start.scan_id,
            scan_type: start.scan_type.clone(),
            plan_name: start.plan_name.clone(),
        });
        self.sink
            .publish(StatusUpdate::ScanStarted {
                current_scan: start.uid.chars().take(6).collect(),
                current_scan_id: start.scan_id,
                current_type: start.scan_type.clone(),
                scanning: true,
                time_remaining_hours: start.estimated_hours,
            })
            .await
    }

    async fn on_row_start(&self, row: &RowContext) -> Result<()> {
        self.sink
            .publish(StatusUpdate::TimeRemaining {
                time_remaining_hours: row.time_remaining_hours,
            })
            .await
    }

    async fn on_stop(&self, stop: &StopDoc) -> Result<()> {
        self.sink
            .publish(StatusUpdate::ScanFinished {
                scanning: false,
                time_remaining_hours: 0.0,
            })
            .await?;

        let active = self.active.lock().take();
        let (scan_id, scan_type, plan_name) = match active {
            Some(a) => (a.scan_id, a.scan_type, a.plan_name),
            None => (0, String::new(), String::new()),
        };
        self.sink
            .publish(StatusUpdate::Completion {
                run_uid: stop.run_uid.clone(),
                scan_id,
                scan_type,
                plan_name,
                exit_status: stop.exit_status.clone(),
                reason: stop.reason.clone(),
                num_events: stop.num_events,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn start_doc() -> StartDoc {
        StartDoc {
            uid: "abcdef123456".into(),
            scan_id: 7,
            plan_name: "scan_and_fly".into(),
            scan_type: "XRF_fly".into(),
            detectors: vec!["xs".into()],
            fast_axis: "hf_stage.x".into(),
            slow_axis: "hf_stage.y".into(),
            shape: (11, 5),
            dwell: 0.1,
            delta: 0.002,
            scan_params: vec![],
            scan_input: serde_json::Value::Null,
            beamline_status: HashMap::new(),
            metadata: HashMap::new(),
            estimated_hours: 0.5,
            time_ns: 0,
        }
    }

    #[tokio::test]
    async fn test_scan_record_sequence() {
        let sink = MemoryStatusSink::new();
        let hook = ScanRecordHook::new(Arc::new(sink.clone()));

        hook.on_start(&start_doc()).await.unwrap();
        hook.on_row_start(&RowContext {
            run_uid: "abcdef123456".into(),
            row_index: 1,
            slow_num: 5,
            slow_position: 1.0,
            time_remaining_hours: 0.4,
        })
        .await
        .unwrap();
        hook.on_stop(&StopDoc::success("abcdef123456", 5))
            .await
            .unwrap();

        let updates = sink.updates();
        assert_eq!(updates.len(), 4);
        assert!(matches!(
            &updates[0],
            StatusUpdate::ScanStarted { current_scan, current_scan_id: 7, scanning: true, .. }
                if current_scan == "abcdef"
        ));
        assert_eq!(
            updates[1],
            StatusUpdate::TimeRemaining {
                time_remaining_hours: 0.4
            }
        );
        assert_eq!(
            updates[2],
            StatusUpdate::ScanFinished {
                scanning: false,
                time_remaining_hours: 0.0
            }
        );
        assert!(matches!(
            &updates[3],
            StatusUpdate::Completion { scan_id: 7, exit_status, num_events: 5, .. }
                if exit_status == "success"
        ));
    }
}
