pub mod buffer;
pub mod file;
pub mod reshape;
pub mod watcher;

pub use buffer::RollingBuffer;
pub use file::SampleFile;
pub use watcher::FileWatcher;

use crate::config::{ProbeGeometry, StreamConfig};
use crate::error::{NeuroLayerError, Result};
use crate::utils::sync::{lock, read, write};
use reshape::reshape_samples;

use log::{debug, info};
use ndarray::Array3;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub sample_rate: f64,
    pub max_samples: usize,
    pub wait_poll: Duration,
    pub slice_timeout: Option<Duration>,
    pub file_pattern: String,
}

impl From<&StreamConfig> for StreamSettings {
    fn from(config: &StreamConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            max_samples: config.max_buffer_samples(),
            wait_poll: Duration::from_millis(config.wait_poll_ms.max(1)),
            slice_timeout: match config.slice_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            file_pattern: config.file_pattern.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct Source {
    root: Option<PathBuf>,
    file: Option<SampleFile>,
    frames_read: u64,
}

/// The growing recording: an in-memory rolling window backed by the file on disk.
pub struct ContinuousStream {
    geometry: ProbeGeometry,
    settings: StreamSettings,
    buffer: RwLock<RollingBuffer>,
    source: Mutex<Source>,
    epoch: AtomicU64,
}

impl ContinuousStream {
    pub fn new(geometry: ProbeGeometry, settings: StreamSettings) -> Result<Self> {
        geometry.validate()?;
        Ok(Self {
            buffer: RwLock::new(RollingBuffer::new(geometry, settings.max_samples)),
            geometry,
            settings,
            source: Mutex::new(Source::default()),
            epoch: AtomicU64::new(0),
        })
    }

    pub fn geometry(&self) -> &ProbeGeometry {
        &self.geometry
    }

    pub fn sample_rate(&self) -> f64 {
        self.settings.sample_rate
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    /// Forgets all buffered data and points the stream at a new session directory.
    /// Any `slice` blocked waiting on the previous source gives up.
    pub fn reset(&self, root: Option<PathBuf>) {
        let mut source = lock(&self.source);
        write(&self.buffer).reset(0);
        *source = Source {
            root,
            file: None,
            frames_read: 0,
        };
        self.epoch.fetch_add(1, Ordering::SeqCst);
        info!("Stream reset, watching {:?}", source.root);
    }

    /// Uses `path` directly instead of discovering it under the session directory.
    pub fn attach_file<P: AsRef<Path>>(&self, path: P) {
        let path = path.as_ref().to_path_buf();
        self.reset(path.parent().map(Path::to_path_buf));
        lock(&self.source).file = Some(SampleFile::new(path, self.geometry.frame_bytes()));
    }

    pub fn file_path(&self) -> Option<PathBuf> {
        self.current_file().map(|f| f.path().to_path_buf())
    }

    fn resolve(&self, source: &mut Source) -> Option<SampleFile> {
        if source.file.is_none() {
            let root = source.root.as_ref()?;
            let path = file::discover(root, &self.settings.file_pattern)?;
            info!("Found recording at {}", path.display());
            source.file = Some(SampleFile::new(path, self.geometry.frame_bytes()));
        }
        source.file.clone()
    }

    fn current_file(&self) -> Option<SampleFile> {
        let mut source = lock(&self.source);
        self.resolve(&mut source)
    }

    /// Reads whatever whole frames were appended since the last call into the buffer.
    /// A backlog longer than the buffer is skipped so only the newest window is read.
    pub fn ingest(&self) -> Result<usize> {
        let mut source = lock(&self.source);
        let file = match self.resolve(&mut source) {
            Some(file) => file,
            None => return Ok(0),
        };

        let available = file.frames_available()?;
        if available <= source.frames_read {
            return Ok(0);
        }
        let start = source
            .frames_read
            .max(available.saturating_sub(self.settings.max_samples as u64));
        let samples = file.read_frames(start, available - start)?;
        let frames = samples.len() / self.geometry.channels();

        {
            let mut buffer = write(&self.buffer);
            if start > buffer.end_sample() {
                debug!("Skipping {} frames of backlog", start - buffer.end_sample());
                buffer.reset(start);
            }
            buffer.append(&samples)?;
        }
        source.frames_read = start + frames as u64;
        Ok(frames)
    }

    fn wait_for(&self, stop: u64) -> Result<()> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let deadline = self.settings.slice_timeout.map(|t| Instant::now() + t);
        loop {
            let available = match self.current_file() {
                Some(file) => file.frames_available().unwrap_or(0),
                None => 0,
            };
            if available >= stop {
                return Ok(());
            }
            let timed_out = deadline.map_or(false, |d| Instant::now() >= d);
            if timed_out || self.epoch.load(Ordering::SeqCst) != epoch {
                return Err(NeuroLayerError::StreamStalled {
                    needed: stop,
                    available,
                });
            }
            thread::sleep(self.settings.wait_poll);
        }
    }

    /// Frames `[start, stop)` as (time, rows, cols).
    ///
    /// With `wait`, blocks until the file holds `stop` frames (or the timeout fires).
    /// Served from memory when the range is buffered, otherwise read from the file
    /// and zero-padded to the exact requested length.
    pub fn slice(&self, start: u64, stop: u64, wait: bool) -> Result<Array3<i16>> {
        if stop < start {
            return Err(NeuroLayerError::ShapeMismatch(format!(
                "slice stop {} is before start {}",
                stop, start
            )));
        }
        if wait {
            self.wait_for(stop)?;
        }

        if let Some(block) = read(&self.buffer).copy_range(start, stop) {
            return Ok(block);
        }

        let count = stop - start;
        let samples = match self.current_file() {
            Some(file) => file.read_frames_padded(start, count)?,
            None => vec![0; count as usize * self.geometry.channels()],
        };
        reshape_samples(samples, &self.geometry)
    }

    /// Copy of the whole buffer with the absolute index of its first frame.
    pub fn snapshot(&self) -> (u64, Array3<i16>) {
        read(&self.buffer).to_array()
    }

    /// `(start_sample, len)` of the buffer.
    pub fn extent(&self) -> (u64, usize) {
        let buffer = read(&self.buffer);
        (buffer.start_sample(), buffer.len())
    }
}
