use crate::config::ProbeGeometry;
use crate::error::{NeuroLayerError, Result};

use ndarray::Array3;
use std::collections::VecDeque;

/// Bounded window over the most recent frames of the stream.
///
/// Frames are stored flat and interleaved exactly as on disk. `start_sample` is the
/// absolute index of the oldest frame held, so `start_sample + len` always equals the
/// number of frames ever appended.
#[derive(Debug, Clone)]
pub struct RollingBuffer {
    geometry: ProbeGeometry,
    data: VecDeque<i16>,
    start_sample: u64,
    max_samples: usize,
}

impl RollingBuffer {
    pub fn new(geometry: ProbeGeometry, max_samples: usize) -> Self {
        Self {
            geometry,
            data: VecDeque::new(),
            start_sample: 0,
            max_samples,
        }
    }

    pub fn geometry(&self) -> &ProbeGeometry {
        &self.geometry
    }

    /// Number of frames currently held.
    pub fn len(&self) -> usize {
        self.data.len() / self.geometry.channels()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn start_sample(&self) -> u64 {
        self.start_sample
    }

    /// Absolute index one past the newest frame.
    pub fn end_sample(&self) -> u64 {
        self.start_sample + self.len() as u64
    }

    pub fn total_appended(&self) -> u64 {
        self.end_sample()
    }

    pub fn max_samples(&self) -> usize {
        self.max_samples
    }

    /// Appends whole frames and evicts from the front past the limit.
    /// Returns the number of frames evicted.
    pub fn append(&mut self, samples: &[i16]) -> Result<usize> {
        let channels = self.geometry.channels();
        if samples.len() % channels != 0 {
            return Err(NeuroLayerError::ShapeMismatch(format!(
                "append of {} samples is not a whole number of {}-channel frames",
                samples.len(),
                channels
            )));
        }
        self.data.extend(samples.iter().copied());

        let held = self.len();
        if held <= self.max_samples {
            return Ok(0);
        }
        let excess = held - self.max_samples;
        self.data.drain(..excess * channels);
        self.start_sample += excess as u64;
        Ok(excess)
    }

    /// Copy of the absolute range `[start, stop)` if it lies entirely in memory.
    pub fn copy_range(&self, start: u64, stop: u64) -> Option<Array3<i16>> {
        if start > stop || start < self.start_sample || stop > self.end_sample() {
            return None;
        }
        let channels = self.geometry.channels();
        let from = (start - self.start_sample) as usize * channels;
        let to = (stop - self.start_sample) as usize * channels;
        let flat: Vec<i16> = self.data.range(from..to).copied().collect();
        Array3::from_shape_vec(
            ((stop - start) as usize, self.geometry.rows, self.geometry.cols),
            flat,
        )
        .ok()
    }

    /// Everything currently held, as (time, rows, cols), with its absolute start.
    pub fn to_array(&self) -> (u64, Array3<i16>) {
        let start = self.start_sample;
        let stop = self.end_sample();
        let block = self
            .copy_range(start, stop)
            .unwrap_or_else(|| Array3::zeros((0, self.geometry.rows, self.geometry.cols)));
        (start, block)
    }

    /// Empties the buffer and restarts the absolute index at `start_sample`.
    pub fn reset(&mut self, start_sample: u64) {
        self.data.clear();
        self.start_sample = start_sample;
    }
}
