use crate::config::{Config, EventsConfig, FilterConfig, SessionConfig, SnapshotConfig, StreamConfig};
use crate::error::{NeuroLayerError, Result};
use crate::filters::{FilterBank, FilterHandle};
use crate::processing::groups::{mean_of, GroupMembers};
use crate::processing::spectrum::welch_psd_db;
use crate::processing::{
    Admission, Dispatcher, EventRecord, EventRegistry, Snapshot, SnapshotEngine, SnapshotSettings,
    AVERAGE,
};
use crate::session::{AcquisitionControl, AcquisitionSession, EventNotification, Presentation};
use crate::stream::{ContinuousStream, FileWatcher};
use crate::utils::sync::lock;

use log::{debug, info, warn};
use ndarray::{s, Array2, Array3, Axis};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct SessionState {
    registry: EventRegistry,
    view: String,
    session: Option<AcquisitionSession>,
    save_path: Option<PathBuf>,
}

struct Shared {
    stream_config: StreamConfig,
    stream: Arc<ContinuousStream>,
    snapshots: SnapshotEngine,
    filters: Mutex<FilterBank>,
    state: Mutex<SessionState>,
    generation: AtomicU64,
    presentation: Arc<dyn Presentation>,
    control: Option<Arc<dyn AcquisitionControl>>,
}

/// Owns the stream, the filter bank, the snapshot cache and the event registry.
///
/// Every mutation goes through a single dispatcher worker so effects are applied in
/// the order they were requested. Starting a new session bumps a generation counter;
/// work queued for an older generation is dropped when it reaches the worker, and
/// results computed for it are never committed.
pub struct Engine {
    shared: Arc<Shared>,
    dispatcher: Dispatcher,
    watcher: Mutex<Option<FileWatcher>>,
}

impl Engine {
    pub fn new(
        config: &Config,
        presentation: Arc<dyn Presentation>,
        control: Option<Arc<dyn AcquisitionControl>>,
    ) -> Result<Self> {
        let stream = Arc::new(ContinuousStream::new(
            config.stream.probe,
            (&config.stream).into(),
        )?);
        let fs = stream.sample_rate();

        let settings =
            SnapshotSettings::new(config.snapshot.duration_ms, fs, config.snapshot.normalize)?;
        let snapshots = SnapshotEngine::new(Arc::clone(&stream), settings);

        let mut filters = FilterBank::new(fs);
        filters.configure(&config.filter)?;

        let mut registry = EventRegistry::new(&config.events.enabled_lines, config.events.max_events);
        for (name, members) in &config.events.groups {
            registry.add_group(name, members.clone());
        }

        let shared = Arc::new(Shared {
            stream_config: config.stream.clone(),
            stream,
            snapshots,
            filters: Mutex::new(filters),
            state: Mutex::new(SessionState {
                registry,
                view: AVERAGE.to_string(),
                session: None,
                save_path: config.session.save_path.clone(),
            }),
            generation: AtomicU64::new(0),
            presentation,
            control,
        });

        Ok(Self {
            shared,
            dispatcher: Dispatcher::new()?,
            watcher: Mutex::new(None),
        })
    }

    pub fn stream(&self) -> &Arc<ContinuousStream> {
        &self.shared.stream
    }

    pub fn snapshots(&self) -> &SnapshotEngine {
        &self.shared.snapshots
    }

    pub fn filter(&self) -> Option<FilterHandle> {
        self.shared.filter_handle()
    }

    pub fn events(&self) -> Vec<EventRecord> {
        lock(&self.shared.state).registry.records().to_vec()
    }

    pub fn snapshot(&self, ts: u64) -> Option<Snapshot> {
        self.shared.snapshots.get(ts)
    }

    pub fn session(&self) -> Option<AcquisitionSession> {
        lock(&self.shared.state).session.clone()
    }

    pub fn view(&self) -> String {
        lock(&self.shared.state).view.clone()
    }

    /// Blocks until every operation queued so far has been applied.
    pub fn flush(&self) -> Result<()> {
        self.dispatcher.flush()
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Entry point for the event transport. Only rising edges are registered.
    pub fn handle_notification(&self, notification: &EventNotification) -> Result<()> {
        if !notification.state {
            debug!("Falling edge on line {} ignored", notification.line);
            return Ok(());
        }
        let fs = self.shared.stream.sample_rate();
        if notification.sample_rate > 0.0 && (notification.sample_rate - fs).abs() > 1e-3 * fs {
            warn!(
                "Event sample rate {} differs from stream rate {}",
                notification.sample_rate, fs
            );
        }
        self.register_event(notification.sample_number, notification.line)
    }

    pub fn register_event(&self, ts: u64, line: u8) -> Result<()> {
        let generation = self.shared.generation();
        let shared = Arc::clone(&self.shared);
        self.dispatcher.submit(&format!("event {}", ts), move || {
            shared.process_event(generation, ts, line)
        })
    }

    // ------------------------------------------------------------------
    // Parameters
    // ------------------------------------------------------------------

    /// Designs the cascade now, so a bad config is rejected to the caller; installing it
    /// and recomputing every snapshot happens on the worker.
    pub fn configure_filter(&self, config: &FilterConfig) -> Result<()> {
        let handle = lock(&self.shared.filters).design(config)?;
        info!(
            "Filter {}-{} Hz order {} with {} notch sections",
            config.low_hz,
            config.high_hz,
            config.order,
            handle.notch_sections()
        );
        self.submit_task("configure filter", move |shared| {
            lock(&shared.filters).install(handle);
            shared.recompute_all()
        })
    }

    pub fn set_snapshot_duration(&self, duration_ms: f64) -> Result<()> {
        let window = SnapshotSettings::new(duration_ms, self.shared.stream.sample_rate(), false)?;
        self.submit_task("snapshot duration", move |shared| {
            let normalize = shared.snapshots.settings().normalize;
            shared.recompute_with(SnapshotSettings { normalize, ..window })
        })
    }

    pub fn set_normalize(&self, normalize: bool) -> Result<()> {
        self.submit_task("snapshot normalize", move |shared| {
            let current = shared.snapshots.settings();
            shared.recompute_with(SnapshotSettings { normalize, ..current })
        })
    }

    fn set_snapshot_settings(&self, duration_ms: f64, normalize: bool) -> Result<()> {
        let settings =
            SnapshotSettings::new(duration_ms, self.shared.stream.sample_rate(), normalize)?;
        self.submit_task("snapshot settings", move |shared| {
            shared.recompute_with(settings)
        })
    }

    pub fn set_max_events(&self, max_events: usize) -> Result<()> {
        self.submit_task("max events", move |shared| {
            lock(&shared.state).registry.set_max_events(max_events);
            Ok(())
        })
    }

    pub fn enable_line(&self, line: u8) -> Result<()> {
        self.set_line(line, true)
    }

    pub fn disable_line(&self, line: u8) -> Result<()> {
        self.set_line(line, false)
    }

    fn set_line(&self, line: u8, enabled: bool) -> Result<()> {
        self.submit_task("trigger line", move |shared| {
            lock(&shared.state).registry.set_line(line, enabled);
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Groups and views
    // ------------------------------------------------------------------

    pub fn add_group(&self, name: &str, timestamps: Vec<u64>) -> Result<()> {
        let name = name.to_string();
        let generation = self.shared.generation();
        let shared = Arc::clone(&self.shared);
        self.dispatcher.submit(&format!("group {}", name), move || {
            {
                let mut state = lock(&shared.state);
                if !shared.is_current(generation) {
                    return Ok(());
                }
                if !state.registry.add_group(&name, timestamps) {
                    drop(state);
                    shared.publish();
                    return Ok(());
                }
            }
            shared.presentation.on_new_event_option(&name);
            shared.publish();
            Ok(())
        })
    }

    /// Leaves `ts` out of (or puts it back into) the "Average" view.
    pub fn exclude_event(&self, ts: u64, excluded: bool) -> Result<()> {
        let generation = self.shared.generation();
        let shared = Arc::clone(&self.shared);
        self.dispatcher.submit("exclude event", move || {
            {
                let mut state = lock(&shared.state);
                if !shared.is_current(generation) {
                    return Ok(());
                }
                if excluded {
                    state.registry.exclude(ts);
                } else {
                    state.registry.include(ts);
                }
            }
            shared.publish();
            Ok(())
        })
    }

    pub fn select_view(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.submit_task("select view", move |shared| {
            lock(&shared.state).view = name;
            shared.publish();
            Ok(())
        })
    }

    /// `(x_axis, mean matrix)` for a view name; zeros when it has no snapshots.
    pub fn grouped_view(&self, name: &str) -> (Vec<f64>, Array2<f64>) {
        self.shared.value_of(name)
    }

    pub fn current_view(&self) -> (Vec<f64>, Array2<f64>) {
        let view = self.view();
        self.shared.value_of(&view)
    }

    /// The buffered signal, filtered with the active cascade, with its time axis in seconds.
    pub fn full_signal(&self) -> (Vec<f64>, Array3<f64>) {
        let (start, raw) = self.shared.stream.snapshot();
        let signal = raw.mapv(f64::from);
        let signal = match self.shared.filter_handle() {
            Some(design) => design.apply(signal),
            None => signal,
        };
        let fs = self.shared.stream.sample_rate();
        let time = (0..signal.len_of(Axis(0)))
            .map(|i| (start + i as u64) as f64 / fs)
            .collect();
        (time, signal)
    }

    /// Welch spectrum (dB) of one electrode of the full signal.
    pub fn channel_psd(&self, row: usize, col: usize, nperseg: usize) -> Result<(Vec<f64>, Vec<f64>)> {
        let geometry = self.shared.stream.geometry();
        if row >= geometry.rows || col >= geometry.cols {
            return Err(NeuroLayerError::InvalidGeometry(format!(
                "electrode ({}, {}) is outside the {}x{} probe",
                row, col, geometry.rows, geometry.cols
            )));
        }
        let (_, signal) = self.full_signal();
        let lane = signal.slice(s![.., row, col]).to_vec();
        Ok(welch_psd_db(&lane, self.shared.stream.sample_rate(), nperseg))
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    /// Clears every event, snapshot and group, points the stream at a fresh
    /// timestamped directory under `folder`, and starts the recorder.
    pub fn start_session<P: Into<PathBuf>>(&self, folder: P) -> Result<AcquisitionSession> {
        self.stop_watcher();
        let mut session = AcquisitionSession::new(folder);
        self.shared.reset_session(Some(session.clone()));
        self.shared.stream.reset(Some(session.data_path()));
        self.start_watcher()?;

        if let Some(control) = &self.shared.control {
            control.set_record_path(self.shared.stream_config.record_node_id, &session.folder)?;
            control.set_base_text(&session.subfolder)?;
            control.start()?;
        }
        session.running = true;
        lock(&self.shared.state).session = Some(session.clone());
        info!("Session started in {}", session.data_path().display());

        self.shared.publish();
        Ok(session)
    }

    pub fn stop_session(&self) -> Result<()> {
        if let Some(control) = &self.shared.control {
            control.stop()?;
        }
        if let Some(session) = lock(&self.shared.state).session.as_mut() {
            session.running = false;
        }
        info!("Session stopped");
        Ok(())
    }

    /// Reads an existing recording instead of a live session.
    pub fn attach_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(NeuroLayerError::SourceUnavailable(path.display().to_string()));
        }
        self.stop_watcher();
        self.shared.reset_session(None);
        self.shared.stream.attach_file(path);
        self.shared.stream.ingest()?;
        self.start_watcher()?;
        self.shared.publish();
        Ok(())
    }

    fn start_watcher(&self) -> Result<()> {
        let mut slot = lock(&self.watcher);
        if slot.is_none() {
            let mut watcher = FileWatcher::new(Arc::clone(&self.shared.stream));
            watcher.start(Duration::from_millis(self.shared.stream_config.poll_interval_ms.max(1)))?;
            *slot = Some(watcher);
        }
        Ok(())
    }

    fn stop_watcher(&self) {
        if let Some(mut watcher) = lock(&self.watcher).take() {
            watcher.stop();
        }
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Re-applies every section of `config`. Each section is independent and applying
    /// the same document twice leaves the engine unchanged.
    pub fn apply_config(&self, config: &Config) -> Result<()> {
        self.apply_stream(&config.stream)?;
        self.apply_filter(&config.filter)?;
        self.apply_snapshot(&config.snapshot)?;
        self.apply_events(&config.events)?;
        self.apply_session(&config.session);
        Ok(())
    }

    pub fn apply_stream(&self, stream: &StreamConfig) -> Result<()> {
        let current = &self.shared.stream_config;
        if stream.probe != current.probe || stream.sample_rate != current.sample_rate {
            return Err(NeuroLayerError::Config(
                "probe geometry and sample rate are fixed for the lifetime of the engine".to_string(),
            ));
        }
        Ok(())
    }

    pub fn apply_filter(&self, filter: &FilterConfig) -> Result<()> {
        self.configure_filter(filter)
    }

    pub fn apply_snapshot(&self, snapshot: &SnapshotConfig) -> Result<()> {
        self.set_snapshot_settings(snapshot.duration_ms, snapshot.normalize)
    }

    pub fn apply_events(&self, events: &EventsConfig) -> Result<()> {
        let lines = events.enabled_lines.clone();
        let max_events = events.max_events;
        self.submit_task("event settings", move |shared| {
            let mut state = lock(&shared.state);
            state.registry.set_enabled_lines(&lines);
            state.registry.set_max_events(max_events);
            Ok(())
        })?;
        for (name, members) in &events.groups {
            self.add_group(name, members.clone())?;
        }
        Ok(())
    }

    pub fn apply_session(&self, session: &SessionConfig) {
        lock(&self.shared.state).save_path = session.save_path.clone();
    }

    /// Live parameters as a config document.
    pub fn export_config(&self) -> Config {
        let filter = self
            .shared
            .filter_handle()
            .map(|design| design.config().clone())
            .unwrap_or_default();
        let settings = self.shared.snapshots.settings();
        let state = lock(&self.shared.state);
        let save_path = state
            .session
            .as_ref()
            .map(|s| s.folder.clone())
            .or_else(|| state.save_path.clone());

        Config {
            stream: self.shared.stream_config.clone(),
            filter,
            snapshot: SnapshotConfig {
                duration_ms: settings.duration_ms,
                normalize: settings.normalize,
            },
            events: EventsConfig {
                max_events: state.registry.max_events(),
                enabled_lines: state.registry.enabled_lines(),
                groups: state.registry.groups().clone(),
            },
            session: SessionConfig { save_path },
        }
    }

    fn submit_task<F>(&self, label: &str, task: F) -> Result<()>
    where
        F: FnOnce(&Shared) -> Result<()> + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        self.dispatcher.submit(label, move || task(&shared))
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop_watcher();
    }
}

impl Shared {
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    // Only a running session can still grow its recording.
    fn is_live(&self) -> bool {
        lock(&self.state).session.as_ref().map_or(false, |s| s.running)
    }

    fn filter_handle(&self) -> Option<FilterHandle> {
        lock(&self.filters).handle()
    }

    fn reset_session(&self, session: Option<AcquisitionSession>) {
        let mut state = lock(&self.state);
        self.generation.fetch_add(1, Ordering::SeqCst);
        state.registry.clear();
        state.view = AVERAGE.to_string();
        state.session = session;
        self.snapshots.clear();
    }

    fn process_event(&self, generation: u64, ts: u64, line: u8) -> Result<()> {
        let cap_reached = {
            let mut state = lock(&self.state);
            if !self.is_current(generation) {
                debug!("event {} belongs to a previous session, dropped", ts);
                return Ok(());
            }
            match state.registry.register_event(ts, line) {
                Admission::Accepted { cap_reached } => cap_reached,
                Admission::Ignored(reason) => {
                    debug!("event {} on line {} ignored: {:?}", ts, line, reason);
                    return Ok(());
                }
            }
        };
        info!(
            "Event occurred on TTL line {} at {:.3} seconds",
            line,
            ts as f64 / self.stream.sample_rate()
        );

        let snapshot = self.compute_with_retry(generation, ts);
        {
            let _state = lock(&self.state);
            if !self.is_current(generation) {
                debug!("event {} belongs to a previous session, dropped", ts);
                return Ok(());
            }
            if let Some(snapshot) = snapshot {
                self.snapshots.insert(ts, snapshot);
            }
        }

        if cap_reached {
            info!("Event cap reached, acquisition must stop");
            self.presentation.on_acquisition_must_stop();
        }
        self.presentation.on_new_event_option(&ts.to_string());
        self.publish();
        Ok(())
    }

    fn compute_with_retry(&self, generation: u64, ts: u64) -> Option<Array2<f64>> {
        let retries = self.stream_config.stall_retries;
        let mut attempt = 0;
        loop {
            let filter = self.filter_handle();
            let settings = self.snapshots.settings();
            let wait = self.is_live();
            match self.snapshots.compute(ts, filter.as_deref(), &settings, wait) {
                Ok(snapshot) => return Some(snapshot),
                Err(NeuroLayerError::StreamStalled { .. }) if !self.is_current(generation) => return None,
                Err(NeuroLayerError::StreamStalled { needed, available }) if attempt < retries => {
                    attempt += 1;
                    warn!(
                        "event {}: stream stalled at {} of {} frames, retry {}/{}",
                        ts, available, needed, attempt, retries
                    );
                }
                Err(NeuroLayerError::StreamStalled { needed, available }) => {
                    warn!(
                        "event {}: stream stalled at {} of {} frames, zero-padding the tail",
                        ts, available, needed
                    );
                    return match self.snapshots.compute(ts, filter.as_deref(), &settings, false) {
                        Ok(snapshot) => Some(snapshot),
                        Err(e) => {
                            warn!("event {}: kept without snapshot: {}", ts, e);
                            None
                        }
                    };
                }
                Err(e) => {
                    warn!("event {}: kept without snapshot: {}", ts, e);
                    return None;
                }
            }
        }
    }

    fn recompute_all(&self) -> Result<()> {
        let settings = self.snapshots.settings();
        self.recompute_with(settings)
    }

    // Recomputes from raw windows and swaps the whole cache (and settings) at once.
    fn recompute_with(&self, settings: SnapshotSettings) -> Result<()> {
        let generation = self.generation();
        let timestamps = lock(&self.state).registry.timestamps();
        let filter = self.filter_handle();
        let fresh = self
            .snapshots
            .recompute(&timestamps, filter.as_deref(), &settings, self.is_live());

        {
            let _state = lock(&self.state);
            if !self.is_current(generation) {
                return Ok(());
            }
            self.snapshots.set_settings(settings);
            self.snapshots.replace_all(fresh);
        }
        debug!("recomputed {} snapshots", timestamps.len());
        self.publish();
        Ok(())
    }

    // Holds the state lock throughout so a recompute cannot swap the cache midway.
    fn value_of(&self, name: &str) -> (Vec<f64>, Array2<f64>) {
        let state = lock(&self.state);
        let shape = self.snapshots.shape();
        let matrix = match state.registry.members(name) {
            GroupMembers::Known(timestamps) => mean_of(&self.snapshots.collect(&timestamps), shape),
            GroupMembers::Unknown => {
                debug!("view '{}' is unknown, showing zeros", name);
                Array2::zeros(shape)
            }
        };
        let x_axis = self.snapshots.x_axis();
        drop(state);
        (x_axis, matrix)
    }

    fn publish(&self) {
        let view = lock(&self.state).view.clone();
        let (x_axis, matrix) = self.value_of(&view);
        self.presentation.on_sources_updated(&x_axis, &matrix);
    }
}
