use crate::error::{NeuroLayerError, Result};

use chrono::{DateTime, Local};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Observer for everything the engine pushes outward.
pub trait Presentation: Send + Sync {
    /// New contents for the selected view: x axis in ms and a `(channels, time)` matrix.
    fn on_sources_updated(&self, x_axis: &[f64], matrix: &Array2<f64>);

    /// A new selectable view (an event label or a group name).
    fn on_new_event_option(&self, label: &str);

    /// The per-session event cap was reached.
    fn on_acquisition_must_stop(&self);
}

/// Presentation that drops every update.
pub struct NullPresentation;

impl Presentation for NullPresentation {
    fn on_sources_updated(&self, _x_axis: &[f64], _matrix: &Array2<f64>) {}
    fn on_new_event_option(&self, _label: &str) {}
    fn on_acquisition_must_stop(&self) {}
}

/// Remote control of the external recorder.
pub trait AcquisitionControl: Send + Sync {
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn status(&self) -> Result<String>;
    fn set_record_path(&self, node_id: u32, path: &Path) -> Result<()>;
    fn set_base_text(&self, name: &str) -> Result<()>;
}

/// A TTL transition reported by the recorder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EventNotification {
    pub line: u8,
    pub sample_number: u64,
    pub sample_rate: f64,
    pub state: bool,
}

impl EventNotification {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| NeuroLayerError::Control(format!("bad event notification: {}", e)))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| NeuroLayerError::Control(format!("could not encode event: {}", e)))
    }

    pub fn seconds(&self) -> f64 {
        if self.sample_rate > 0.0 {
            self.sample_number as f64 / self.sample_rate
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone)]
pub struct AcquisitionSession {
    pub folder: PathBuf,
    pub subfolder: String,
    pub started_at: DateTime<Local>,
    pub running: bool,
}

impl AcquisitionSession {
    /// Session under `folder`, named after the current local time.
    pub fn new<P: Into<PathBuf>>(folder: P) -> Self {
        let started_at = Local::now();
        Self {
            folder: folder.into(),
            subfolder: started_at.format("%Y-%m-%d_%H-%M-%S").to_string(),
            started_at,
            running: false,
        }
    }

    /// Directory the recorder writes this session into.
    pub fn data_path(&self) -> PathBuf {
        self.folder.join(&self.subfolder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_from_json() {
        let json = r#"{"line": 8, "sample_number": 19531, "sample_rate": 1953.12, "state": true, "processor": "NI-DAQmx"}"#;
        let event = EventNotification::from_json(json).unwrap();
        assert_eq!(event.line, 8);
        assert_eq!(event.sample_number, 19531);
        assert!(event.state);
        assert!((event.seconds() - 10.0).abs() < 1e-3);

        assert!(EventNotification::from_json("{\"line\": 1}").is_err());
    }

    #[test]
    fn test_session_paths() {
        let session = AcquisitionSession::new("/data");
        assert_eq!(session.subfolder.len(), "2024-01-01_00-00-00".len());
        assert_eq!(session.data_path(), Path::new("/data").join(&session.subfolder));
        assert!(!session.running);
    }
}
