use crate::config::ProbeGeometry;
use crate::error::{NeuroLayerError, Result};
use crate::filters::FilterDesign;
use crate::stream::ContinuousStream;
use crate::utils::sync::{read, write};

use log::{debug, warn};
use ndarray::{s, Array1, Array2, Array3, Axis};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

pub type Snapshot = Arc<Array2<f64>>;

/// Progress of a single event through the snapshot pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotStage {
    Pending,
    Extracted,
    Filtered,
    Downsampled,
    Cached,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnapshotSettings {
    pub duration_ms: f64,
    pub half_window: usize,
    pub normalize: bool,
}

impl SnapshotSettings {
    /// `duration_ms` is the half-window on either side of the event.
    pub fn new(duration_ms: f64, fs: f64, normalize: bool) -> Result<Self> {
        let half_window = if duration_ms.is_finite() && duration_ms > 0.0 {
            (duration_ms / 1000.0 * fs) as usize
        } else {
            0
        };
        if half_window == 0 {
            return Err(NeuroLayerError::InvalidSnapshotDuration(duration_ms));
        }
        Ok(Self {
            duration_ms,
            half_window,
            normalize,
        })
    }

    pub fn window_len(&self) -> usize {
        2 * self.half_window
    }

    /// Milliseconds relative to the event, endpoints included.
    pub fn x_axis(&self) -> Vec<f64> {
        Array1::linspace(-self.duration_ms, self.duration_ms, self.window_len()).to_vec()
    }
}

/// Averages each `row_divider x col_divider` block of the probe into one channel.
///
/// `(time, rows, cols)` -> `(super_rows * super_cols, time)`, channels row-major over
/// (super-row, super-col).
pub fn downsample(block: Array3<f64>, geometry: &ProbeGeometry) -> Result<Array2<f64>> {
    let (time, rows, cols) = block.dim();
    if rows != geometry.rows || cols != geometry.cols {
        return Err(NeuroLayerError::ShapeMismatch(format!(
            "block is {}x{}, probe is {}x{}",
            rows, cols, geometry.rows, geometry.cols
        )));
    }
    let (super_rows, super_cols) = (geometry.super_rows(), geometry.super_cols());

    let blocks = block
        .as_standard_layout()
        .into_owned()
        .into_shape((time, super_rows, geometry.row_divider, super_cols, geometry.col_divider))?
        .permuted_axes([1, 3, 0, 2, 4]);

    let meaned = blocks
        .mean_axis(Axis(4))
        .and_then(|m| m.mean_axis(Axis(3)))
        .ok_or_else(|| NeuroLayerError::ShapeMismatch("empty divider axis".to_string()))?;

    Ok(meaned
        .as_standard_layout()
        .into_owned()
        .into_shape((super_rows * super_cols, time))?)
}

/// Per-channel z-score; flat channels are only centred.
pub fn normalize_channels(snapshot: &mut Array2<f64>) {
    for mut channel in snapshot.rows_mut() {
        let n = channel.len();
        if n == 0 {
            continue;
        }
        let mean = channel.sum() / n as f64;
        let std = (channel.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64).sqrt();
        channel.mapv_inplace(|v| {
            if std > 0.0 {
                (v - mean) / std
            } else {
                v - mean
            }
        });
    }
}

/// Extracts, filters and downsamples event windows, and caches the results by timestamp.
pub struct SnapshotEngine {
    stream: Arc<ContinuousStream>,
    geometry: ProbeGeometry,
    settings: RwLock<SnapshotSettings>,
    cache: RwLock<BTreeMap<u64, Snapshot>>,
}

impl SnapshotEngine {
    pub fn new(stream: Arc<ContinuousStream>, settings: SnapshotSettings) -> Self {
        Self {
            geometry: *stream.geometry(),
            stream,
            settings: RwLock::new(settings),
            cache: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn settings(&self) -> SnapshotSettings {
        *read(&self.settings)
    }

    pub fn set_settings(&self, settings: SnapshotSettings) {
        *write(&self.settings) = settings;
    }

    /// Snapshot shape `(channels, time)` for the current settings.
    pub fn shape(&self) -> (usize, usize) {
        (self.geometry.super_channels(), self.settings().window_len())
    }

    pub fn zeros(&self) -> Array2<f64> {
        Array2::zeros(self.shape())
    }

    pub fn x_axis(&self) -> Vec<f64> {
        self.settings().x_axis()
    }

    /// Runs one event through the pipeline. Blocks until the window exists on disk.
    /// With `wait`, blocks until the whole window is on disk; otherwise the part past
    /// the end of the recording is zero-padded.
    pub fn compute(
        &self,
        ts: u64,
        filter: Option<&FilterDesign>,
        settings: &SnapshotSettings,
        wait: bool,
    ) -> Result<Array2<f64>> {
        debug!("event {}: {:?}", ts, SnapshotStage::Pending);
        let half = settings.half_window as u64;
        let start = ts.saturating_sub(half);
        let stop = ts.checked_add(half).ok_or_else(|| {
            NeuroLayerError::ShapeMismatch(format!("event {} window ends past the last sample index", ts))
        })?;
        let raw = self.stream.slice(start, stop, wait)?;

        // Events closer to the stream start than the half-window are padded at the front.
        let mut window = Array3::<f64>::zeros((settings.window_len(), self.geometry.rows, self.geometry.cols));
        let offset = (half - (ts - start)) as usize;
        window
            .slice_mut(s![offset.., .., ..])
            .assign(&raw.mapv(f64::from));
        debug!("event {}: {:?}", ts, SnapshotStage::Extracted);

        let filtered = match filter {
            Some(design) => design.apply(window),
            None => window,
        };
        debug!("event {}: {:?}", ts, SnapshotStage::Filtered);

        let mut snapshot = match downsample(filtered, &self.geometry) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("event {}: downsample failed ({}), using zeros", ts, e);
                Array2::zeros((self.geometry.super_channels(), settings.window_len()))
            }
        };
        if settings.normalize {
            normalize_channels(&mut snapshot);
        }
        debug!("event {}: {:?}", ts, SnapshotStage::Downsampled);
        Ok(snapshot)
    }

    pub fn insert(&self, ts: u64, snapshot: Array2<f64>) {
        write(&self.cache).insert(ts, Arc::new(snapshot));
        debug!("event {}: {:?}", ts, SnapshotStage::Cached);
    }

    pub fn get(&self, ts: u64) -> Option<Snapshot> {
        read(&self.cache).get(&ts).cloned()
    }

    pub fn contains(&self, ts: u64) -> bool {
        read(&self.cache).contains_key(&ts)
    }

    pub fn len(&self) -> usize {
        read(&self.cache).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.cache).is_empty()
    }

    pub fn timestamps(&self) -> Vec<u64> {
        read(&self.cache).keys().copied().collect()
    }

    /// Copies out the cached snapshots for `timestamps` that exist.
    pub fn collect(&self, timestamps: &[u64]) -> Vec<Snapshot> {
        let cache = read(&self.cache);
        timestamps.iter().filter_map(|ts| cache.get(ts).cloned()).collect()
    }

    pub fn clear(&self) {
        write(&self.cache).clear();
    }

    /// Recomputes every listed event from its raw window, in parallel.
    /// Events that fail are logged and left out of the result.
    pub fn recompute(
        &self,
        timestamps: &[u64],
        filter: Option<&FilterDesign>,
        settings: &SnapshotSettings,
        wait: bool,
    ) -> BTreeMap<u64, Snapshot> {
        timestamps
            .par_iter()
            .filter_map(|&ts| match self.compute(ts, filter, settings, wait) {
                Ok(snapshot) => Some((ts, Arc::new(snapshot))),
                Err(NeuroLayerError::StreamStalled { .. }) if wait => self
                    .compute(ts, filter, settings, false)
                    .ok()
                    .map(|snapshot| (ts, Arc::new(snapshot))),
                Err(e) => {
                    warn!("event {}: recompute failed: {}", ts, e);
                    None
                }
            })
            .collect()
    }

    /// Swaps in a freshly computed cache in one step.
    pub fn replace_all(&self, snapshots: BTreeMap<u64, Snapshot>) {
        *write(&self.cache) = snapshots;
    }
}
