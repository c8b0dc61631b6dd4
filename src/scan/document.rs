//! Document model for fly-scan data.
//!
//! Bluesky-style documents decouple acquisition from storage and visualization:
//!
//! - **StartDoc**: scan intent, shape, detectors and beamline status
//! - **DescriptorDoc**: schema of the `stream0` fly stream
//! - **EventPageDoc**: one per completed row, holding the trigger buffer's samples
//! - **StopDoc**: exit status (`success`, `abort`, `fail`) and reason
//!
//! ```text
//! StartDoc (1)
//!    │
//!    ├── DescriptorDoc (1, "stream0")
//!    │       │
//!    │       └── EventPageDoc (one per completed row)
//!    │
//! StopDoc (1)
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::hardware::trigger_buffer::BufferedSample;

/// Name of the fly data stream
pub const FLY_STREAM: &str = "stream0";

/// Generate a new unique document ID
pub fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Current timestamp in nanoseconds since Unix epoch
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

/// Documents published by the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Document {
    /// Run start
    Start(StartDoc),
    /// Stream schema
    Descriptor(DescriptorDoc),
    /// One row of fly data
    EventPage(EventPageDoc),
    /// Run stop
    Stop(StopDoc),
}

impl Document {
    /// Get the document UID
    pub fn uid(&self) -> &str {
        match self {
            Document::Start(d) => &d.uid,
            Document::Descriptor(d) => &d.uid,
            Document::EventPage(d) => &d.uid,
            Document::Stop(d) => &d.uid,
        }
    }

    /// Get the run UID this document belongs to
    pub fn run_uid(&self) -> &str {
        match self {
            Document::Start(d) => &d.uid,
            Document::Descriptor(d) => &d.run_uid,
            Document::EventPage(d) => &d.run_uid,
            Document::Stop(d) => &d.run_uid,
        }
    }

    /// Get the timestamp in nanoseconds
    pub fn timestamp_ns(&self) -> u64 {
        match self {
            Document::Start(d) => d.time_ns,
            Document::Descriptor(d) => d.time_ns,
            Document::EventPage(d) => d.time_ns,
            Document::Stop(d) => d.time_ns,
        }
    }
}

/// Start document, emitted once the request is validated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartDoc {
    /// Unique run identifier (this IS the run_uid)
    pub uid: String,
    /// Orchestrator-local run counter
    pub scan_id: u64,
    /// Plan that generated this run (the preset name when run through one)
    pub plan_name: String,
    /// Scan type recorded for the run (e.g. `XRF_fly`)
    pub scan_type: String,
    /// Detector names in trigger order
    pub detectors: Vec<String>,
    /// Fast-axis identity
    pub fast_axis: String,
    /// Slow-axis identity
    pub slow_axis: String,
    /// (fast_num, slow_num)
    pub shape: (u32, u32),
    /// Seconds per point
    pub dwell: f64,
    /// Pre-roll distance in use
    pub delta: f64,
    /// `[fast_start, fast_stop, fast_num, slow_start, slow_stop, slow_num, dwell]`
    pub scan_params: Vec<f64>,
    /// The request as submitted
    pub scan_input: serde_json::Value,
    /// Beamline readouts at start (e.g. `energy`)
    pub beamline_status: HashMap<String, f64>,
    /// User-provided metadata
    pub metadata: HashMap<String, String>,
    /// Estimated duration of the whole scan
    pub estimated_hours: f64,
    /// Timestamp when run started
    pub time_ns: u64,
}

/// Descriptor document, defines the schema of event pages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorDoc {
    /// Unique descriptor ID
    pub uid: String,
    /// Links to StartDoc
    pub run_uid: String,
    /// Stream name
    pub name: String,
    /// Schema for data fields
    pub data_keys: HashMap<String, DataKey>,
    /// Device configuration at descriptor creation time
    pub configuration: HashMap<String, String>,
    /// Timestamp
    pub time_ns: u64,
}

impl DescriptorDoc {
    /// Create an empty descriptor for a stream
    pub fn new(run_uid: &str, name: &str) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            name: name.to_string(),
            data_keys: HashMap::new(),
            configuration: HashMap::new(),
            time_ns: now_ns(),
        }
    }

    /// Add a data key
    pub fn with_data_key(mut self, name: &str, key: DataKey) -> Self {
        self.data_keys.insert(name.to_string(), key);
        self
    }

    /// Add a configuration entry
    pub fn with_config(mut self, key: &str, value: &str) -> Self {
        self.configuration
            .insert(key.to_string(), value.to_string());
        self
    }
}

/// Schema for a data field within event pages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataKey {
    /// Data type: "number", "integer", "array"
    pub dtype: String,
    /// Shape for arrays (empty for scalars)
    pub shape: Vec<u32>,
    /// Source device ID
    pub source: String,
    /// Physical units
    pub units: String,
}

impl DataKey {
    /// Per-row array of numbers
    pub fn row(source: &str, units: &str, len: u32) -> Self {
        Self {
            dtype: "array".to_string(),
            shape: vec![len],
            source: source.to_string(),
            units: units.to_string(),
        }
    }

    /// Scalar number
    pub fn scalar(source: &str, units: &str) -> Self {
        Self {
            dtype: "number".to_string(),
            shape: vec![],
            source: source.to_string(),
            units: units.to_string(),
        }
    }

    /// Scalar integer count
    pub fn count(source: &str) -> Self {
        Self {
            dtype: "integer".to_string(),
            shape: vec![],
            source: source.to_string(),
            units: String::new(),
        }
    }
}

/// One completed row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPageDoc {
    /// Unique page ID
    pub uid: String,
    /// Links to StartDoc
    pub run_uid: String,
    /// Links to DescriptorDoc
    pub descriptor_uid: String,
    /// 1-based sequence number within the stream
    pub seq_num: u32,
    /// 0-based row index
    pub row_index: u32,
    /// Slow-axis position of the row
    pub slow_position: f64,
    /// Encoder positions captured by the trigger buffer
    pub positions: Vec<f64>,
    /// Seconds since kickoff for each position
    pub times: Vec<f64>,
    /// Frames each detector reported for the row
    pub detector_frames: HashMap<String, u64>,
    /// Timestamp
    pub time_ns: u64,
}

impl EventPageDoc {
    /// Build a page from the trigger buffer's samples
    pub fn from_samples(
        run_uid: &str,
        descriptor_uid: &str,
        row_index: u32,
        slow_position: f64,
        samples: &[BufferedSample],
    ) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            descriptor_uid: descriptor_uid.to_string(),
            seq_num: row_index + 1,
            row_index,
            slow_position,
            positions: samples.iter().map(|s| s.position).collect(),
            times: samples.iter().map(|s| s.time).collect(),
            detector_frames: HashMap::new(),
            time_ns: now_ns(),
        }
    }

    /// Record a detector's frame count
    pub fn with_frames(mut self, detector: &str, frames: u64) -> Self {
        self.detector_frames.insert(detector.to_string(), frames);
        self
    }

    /// Number of samples in the page
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Whether the page holds no samples
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// Stop document, emitted after overrides are restored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopDoc {
    /// Unique stop doc ID
    pub uid: String,
    /// Links to StartDoc
    pub run_uid: String,
    /// Exit status: "success", "abort", "fail"
    pub exit_status: String,
    /// Reason for abort/failure
    pub reason: String,
    /// Timestamp when run ended
    pub time_ns: u64,
    /// Total event pages emitted
    pub num_events: u32,
}

impl StopDoc {
    /// Successful completion
    pub fn success(run_uid: &str, num_events: u32) -> Self {
        Self::with_status(run_uid, "success", "", num_events)
    }

    /// Terminated with the given status ("abort" or "fail")
    pub fn with_status(run_uid: &str, exit_status: &str, reason: &str, num_events: u32) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            exit_status: exit_status.to_string(),
            reason: reason.to_string(),
            time_ns: now_ns(),
            num_events,
        }
    }

    /// Whether the run succeeded
    pub fn is_success(&self) -> bool {
        self.exit_status == "success"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_page_from_samples() {
        let samples = [
            BufferedSample {
                position: 0.0,
                time: 0.0,
            },
            BufferedSample {
                position: 0.5,
                time: 0.1,
            },
        ];
        let page = EventPageDoc::from_samples("run", "desc", 2, 1.5, &samples)
            .with_frames("merlin", 2);
        assert_eq!(page.seq_num, 3);
        assert_eq!(page.positions, [0.0, 0.5]);
        assert_eq!(page.times, [0.0, 0.1]);
        assert_eq!(page.detector_frames["merlin"], 2);
        assert_eq!(page.len(), 2);
    }

    #[test]
    fn test_document_serialization_is_tagged() {
        let doc = Document::Stop(StopDoc::with_status("run", "abort", "operator", 1));
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["type"], "stop");
        assert_eq!(json["exit_status"], "abort");
        assert_eq!(doc.run_uid(), "run");
    }

    #[test]
    fn test_descriptor_keys() {
        let desc = DescriptorDoc::new("run", FLY_STREAM)
            .with_data_key("enc1", DataKey::row("flying_zebra", "mm", 11))
            .with_config("fast_axis", "HOR");
        assert_eq!(desc.data_keys["enc1"].shape, [11]);
        assert_eq!(desc.configuration["fast_axis"], "HOR");
        assert_ne!(desc.uid, "run");
    }
}
