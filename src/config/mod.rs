// src/config/mod.rs
use crate::error::{NeuroLayerError, Result};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_SAMPLE_RATE: f64 = 1953.12;
pub const TRIGGER_LINES: usize = 32;

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub stream: StreamConfig,
    pub filter: FilterConfig,
    pub snapshot: SnapshotConfig,
    pub events: EventsConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    pub sample_rate: f64,
    pub probe: ProbeGeometry,
    pub max_buffer_seconds: f64,
    pub poll_interval_ms: u64,
    pub wait_poll_ms: u64,
    // 0 waits forever
    pub slice_timeout_ms: u64,
    pub stall_retries: u32,
    pub file_pattern: String,
    pub record_node_id: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            probe: ProbeGeometry::default(),
            max_buffer_seconds: 30.0,
            poll_interval_ms: 100,
            wait_poll_ms: 50,
            slice_timeout_ms: 10_000,
            stall_retries: 2,
            file_pattern: "continuous.".to_string(),
            record_node_id: 103,
        }
    }
}

impl StreamConfig {
    pub fn max_buffer_samples(&self) -> usize {
        (self.max_buffer_seconds * self.sample_rate).max(0.0) as usize
    }
}

/// Physical probe grid plus the super-pixel block size used for display.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct ProbeGeometry {
    pub rows: usize,
    pub cols: usize,
    pub row_divider: usize,
    pub col_divider: usize,
}

impl Default for ProbeGeometry {
    fn default() -> Self {
        Self {
            rows: 32,
            cols: 96,
            row_divider: 4,
            col_divider: 4,
        }
    }
}

impl ProbeGeometry {
    pub fn new(rows: usize, cols: usize, row_divider: usize, col_divider: usize) -> Result<Self> {
        let geometry = Self {
            rows,
            cols,
            row_divider,
            col_divider,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rows == 0 || self.cols == 0 {
            return Err(NeuroLayerError::InvalidGeometry(format!(
                "probe must have at least one row and column, got {}x{}",
                self.rows, self.cols
            )));
        }
        if self.row_divider == 0 || self.rows % self.row_divider != 0 {
            return Err(NeuroLayerError::InvalidGeometry(format!(
                "row divider {} does not divide {} rows",
                self.row_divider, self.rows
            )));
        }
        if self.col_divider == 0 || self.cols % self.col_divider != 0 {
            return Err(NeuroLayerError::InvalidGeometry(format!(
                "column divider {} does not divide {} columns",
                self.col_divider, self.cols
            )));
        }
        Ok(())
    }

    pub fn channels(&self) -> usize {
        self.rows * self.cols
    }

    pub fn frame_bytes(&self) -> usize {
        self.channels() * std::mem::size_of::<i16>()
    }

    pub fn super_rows(&self) -> usize {
        self.rows / self.row_divider
    }

    pub fn super_cols(&self) -> usize {
        self.cols / self.col_divider
    }

    pub fn super_channels(&self) -> usize {
        self.super_rows() * self.super_cols()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct FilterConfig {
    pub low_hz: f64,
    pub high_hz: f64,
    pub order: i32,
    pub notches: Vec<NotchConfig>,
    pub denoise: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            low_hz: 1.0,
            high_hz: 200.0,
            order: 4,
            notches: Vec::new(),
            denoise: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct NotchConfig {
    pub frequency: f64,
    pub harmonics: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SnapshotConfig {
    // half-window either side of the event
    pub duration_ms: f64,
    pub normalize: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            duration_ms: 100.0,
            normalize: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct EventsConfig {
    // 0 means unlimited
    pub max_events: usize,
    pub enabled_lines: Vec<u8>,
    pub groups: BTreeMap<String, Vec<u64>>,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            max_events: 4,
            enabled_lines: vec![0],
            groups: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub save_path: Option<PathBuf>,
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let config_str = fs::read_to_string(path)
        .map_err(|e| NeuroLayerError::Config(format!("Failed to read config file: {}", e)))?;

    parse_config(&config_str)
}

pub fn parse_config(yaml: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(yaml)
        .map_err(|e| NeuroLayerError::Config(format!("Failed to parse config file: {}", e)))?;
    config.stream.probe.validate()?;
    Ok(config)
}

pub fn save_config<P: AsRef<Path>>(config: &Config, path: P) -> Result<()> {
    let yaml = serde_yaml::to_string(config)
        .map_err(|e| NeuroLayerError::Config(format!("Failed to serialize config: {}", e)))?;

    fs::write(path, yaml)
        .map_err(|e| NeuroLayerError::Config(format!("Failed to write config file: {}", e)))
}
