use ndarray::{s, Array2};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use neurolayer::config::{Config, FilterConfig, NotchConfig, ProbeGeometry};
use neurolayer::processing::AVERAGE;
use neurolayer::session::{EventNotification, Presentation};
use neurolayer::stream::reshape::decode_le_i16;
use neurolayer::{Engine, NeuroLayerError};

const FS: f64 = 1000.0;

#[derive(Default)]
struct RecordingPresentation {
    updates: Mutex<Vec<(Vec<f64>, Array2<f64>)>>,
    options: Mutex<Vec<String>>,
    stops: AtomicUsize,
}

impl Presentation for RecordingPresentation {
    fn on_sources_updated(&self, x_axis: &[f64], matrix: &Array2<f64>) {
        self.updates.lock().unwrap().push((x_axis.to_vec(), matrix.clone()));
    }

    fn on_new_event_option(&self, label: &str) {
        self.options.lock().unwrap().push(label.to_string());
    }

    fn on_acquisition_must_stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

fn sample(t: u64, c: usize) -> i16 {
    ((t * 7919 + c as u64 * 104_729) % 2000) as i16 - 1000
}

fn append_frames(path: &Path, from: u64, to: u64, channels: usize) {
    let mut file = OpenOptions::new().create(true).append(true).open(path).unwrap();
    let mut bytes = Vec::new();
    for t in from..to {
        for c in 0..channels {
            bytes.extend_from_slice(&sample(t, c).to_le_bytes());
        }
    }
    file.write_all(&bytes).unwrap();
}

fn small_config() -> Config {
    let mut config = Config::default();
    config.stream.sample_rate = FS;
    config.stream.probe = ProbeGeometry::new(4, 4, 2, 2).unwrap();
    config.stream.slice_timeout_ms = 200;
    config.stream.stall_retries = 1;
    config.stream.poll_interval_ms = 10;
    config.snapshot.duration_ms = 20.0;
    config.events.enabled_lines = vec![8];
    config.events.max_events = 4;
    config
}

fn engine_on_file(config: &Config, frames: u64) -> (tempfile::TempDir, PathBuf, Engine, Arc<RecordingPresentation>) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("continuous.dat");
    append_frames(&path, 0, frames, config.stream.probe.channels());

    let presentation = Arc::new(RecordingPresentation::default());
    let engine = Engine::new(config, presentation.clone(), None).unwrap();
    engine.attach_file(&path).unwrap();
    (dir, path, engine, presentation)
}

#[test]
fn test_event_cap_scenario() {
    let (_dir, _path, engine, presentation) = engine_on_file(&small_config(), 6000);

    for ts in [1000, 2000, 3000] {
        engine.register_event(ts, 8).unwrap();
    }
    engine.flush().unwrap();
    assert_eq!(presentation.stops.load(Ordering::SeqCst), 0);

    engine.register_event(4000, 8).unwrap();
    engine.flush().unwrap();
    assert_eq!(presentation.stops.load(Ordering::SeqCst), 1);

    let options_before = presentation.options.lock().unwrap().len();
    engine.register_event(5000, 8).unwrap();
    engine.flush().unwrap();

    let timestamps: Vec<u64> = engine.events().iter().map(|e| e.timestamp).collect();
    assert_eq!(timestamps, vec![1000, 2000, 3000, 4000]);
    assert_eq!(engine.snapshots().timestamps(), vec![1000, 2000, 3000, 4000]);
    assert!(engine.snapshot(5000).is_none());
    assert_eq!(presentation.stops.load(Ordering::SeqCst), 1);
    assert_eq!(presentation.options.lock().unwrap().len(), options_before);
}

#[test]
fn test_disabled_line_never_snapshots() {
    let (_dir, _path, engine, _presentation) = engine_on_file(&small_config(), 3000);

    engine.register_event(1000, 2).unwrap();
    engine
        .handle_notification(&EventNotification {
            line: 8,
            sample_number: 1500,
            sample_rate: FS,
            state: false,
        })
        .unwrap();
    engine.flush().unwrap();
    assert!(engine.events().is_empty());
    assert!(engine.snapshots().is_empty());

    engine.enable_line(2).unwrap();
    engine.register_event(1000, 2).unwrap();
    engine.flush().unwrap();
    assert_eq!(engine.events().len(), 1);
    assert!(engine.snapshot(1000).is_some());
}

#[test]
fn test_empty_average_is_zeros() {
    let config = small_config();
    let (_dir, _path, engine, _presentation) = engine_on_file(&config, 100);

    let (x_axis, matrix) = engine.grouped_view(AVERAGE);
    assert_eq!(x_axis.len(), 40);
    assert_eq!(matrix.dim(), (4, 40));
    assert!(matrix.iter().all(|&v| v == 0.0));

    let (_, unknown) = engine.grouped_view("nothing here");
    assert_eq!(unknown.dim(), (4, 40));
}

#[test]
fn test_average_and_groups() {
    let (_dir, _path, engine, presentation) = engine_on_file(&small_config(), 5000);
    for ts in [1000, 2000, 3000] {
        engine.register_event(ts, 8).unwrap();
    }
    engine.add_group("pair", vec![1000, 3000]).unwrap();
    engine.select_view("pair").unwrap();
    engine.flush().unwrap();

    let a = engine.snapshot(1000).unwrap();
    let b = engine.snapshot(3000).unwrap();
    let expected = (a.as_ref() + b.as_ref()) / 2.0;
    let (_, pair) = engine.grouped_view("pair");
    assert_eq!(pair, expected);

    let (_, last) = presentation.updates.lock().unwrap().last().cloned().unwrap();
    assert_eq!(last, expected);
    assert!(presentation.options.lock().unwrap().contains(&"pair".to_string()));

    engine.exclude_event(2000, true).unwrap();
    engine.flush().unwrap();
    let (_, average) = engine.grouped_view(AVERAGE);
    assert_eq!(average, expected);

    let (_, single) = engine.grouped_view("2000");
    assert_eq!(single, *engine.snapshot(2000).unwrap());
}

#[test]
fn test_refilter_is_idempotent() {
    let config = small_config();
    let (_dir, _path, engine, _presentation) = engine_on_file(&config, 4000);
    for ts in [1000, 2500] {
        engine.register_event(ts, 8).unwrap();
    }

    let filter = FilterConfig {
        low_hz: 5.0,
        high_hz: 150.0,
        order: 3,
        notches: vec![NotchConfig {
            frequency: 50.0,
            harmonics: 3,
        }],
        denoise: true,
    };
    engine.configure_filter(&filter).unwrap();
    engine.flush().unwrap();
    let first = engine.snapshot(1000).unwrap();

    engine.configure_filter(&filter).unwrap();
    engine.flush().unwrap();
    let second = engine.snapshot(1000).unwrap();

    assert_eq!(*first, *second);
    assert_eq!(engine.filter().unwrap().section_count(), 3 + 3);
}

#[test]
fn test_invalid_filter_keeps_previous() {
    let config = small_config();
    let (_dir, _path, engine, _presentation) = engine_on_file(&config, 3000);
    engine.register_event(1000, 8).unwrap();
    engine.flush().unwrap();
    let before = engine.snapshot(1000).unwrap();

    let mut bad = config.filter.clone();
    bad.low_hz = 300.0;
    bad.high_hz = 100.0;
    assert!(matches!(
        engine.configure_filter(&bad),
        Err(NeuroLayerError::InvalidFilterConfig(_))
    ));
    bad.high_hz = 600.0;
    assert!(engine.configure_filter(&bad).is_err());
    engine.flush().unwrap();

    assert_eq!(engine.filter().unwrap().config(), &config.filter);
    assert_eq!(*engine.snapshot(1000).unwrap(), *before);
}

#[test]
fn test_duration_change_recomputes_every_snapshot() {
    let (_dir, _path, engine, _presentation) = engine_on_file(&small_config(), 4000);
    for ts in [1000, 2000] {
        engine.register_event(ts, 8).unwrap();
    }
    engine.set_normalize(true).unwrap();
    engine.set_snapshot_duration(50.0).unwrap();
    engine.flush().unwrap();

    let settings = engine.snapshots().settings();
    assert!(settings.normalize);
    assert_eq!(settings.half_window, 50);
    for ts in [1000, 2000] {
        assert_eq!(engine.snapshot(ts).unwrap().dim(), (4, 100));
    }
    assert_eq!(engine.grouped_view(AVERAGE).1.dim(), (4, 100));
    assert!(matches!(
        engine.set_snapshot_duration(0.0),
        Err(NeuroLayerError::InvalidSnapshotDuration(_))
    ));
}

#[test]
fn test_buffered_slice_matches_file() {
    let mut config = small_config();
    config.stream.max_buffer_seconds = 1.0;
    let (_dir, path, engine, _presentation) = engine_on_file(&config, 2500);

    let (start, len) = engine.stream().extent();
    assert_eq!((start, len), (1500, 1000));

    let block = engine.stream().slice(1800, 1900, false).unwrap();
    let bytes = std::fs::read(&path).unwrap();
    let frame = config.stream.probe.frame_bytes();
    let expected = decode_le_i16(&bytes[1800 * frame..1900 * frame]);
    assert_eq!(block.iter().copied().collect::<Vec<i16>>(), expected);

    // evicted range comes from the file and matches as well
    let old = engine.stream().slice(10, 20, false).unwrap();
    let expected = decode_le_i16(&bytes[10 * frame..20 * frame]);
    assert_eq!(old.iter().copied().collect::<Vec<i16>>(), expected);
}

#[test]
fn test_full_probe_has_192_super_pixels() {
    let mut config = small_config();
    config.stream.probe = ProbeGeometry::new(32, 96, 4, 4).unwrap();
    config.snapshot.duration_ms = 30.0;
    let (_dir, _path, engine, _presentation) = engine_on_file(&config, 200);

    engine.register_event(100, 8).unwrap();
    engine.flush().unwrap();
    let snapshot = engine.snapshot(100).unwrap();
    assert_eq!(snapshot.dim(), (192, 60));

    let (time, signal) = engine.full_signal();
    assert_eq!(signal.shape(), &[200, 32, 96]);
    assert_eq!(time.len(), 200);
    assert!((time[199] - 0.199).abs() < 1e-12);
}

fn live_session(config: &Config) -> (tempfile::TempDir, PathBuf, Engine, Arc<RecordingPresentation>) {
    let dir = tempfile::tempdir().unwrap();
    let presentation = Arc::new(RecordingPresentation::default());
    let engine = Engine::new(config, presentation.clone(), None).unwrap();
    let session = engine.start_session(dir.path().join("live")).unwrap();
    std::fs::create_dir_all(session.data_path()).unwrap();
    let path = session.data_path().join("continuous.dat");
    (dir, path, engine, presentation)
}

#[test]
fn test_stalled_event_is_padded_then_recomputed() {
    let config = small_config();
    let (_dir, path, engine, _presentation) = live_session(&config);
    append_frames(&path, 0, 100, config.stream.probe.channels());

    engine.register_event(500, 8).unwrap();
    engine.flush().unwrap();
    assert_eq!(engine.events().len(), 1);
    let padded = engine.snapshot(500).unwrap();
    assert_eq!(padded.shape(), &[4, 40]);

    append_frames(&path, 100, 1000, config.stream.probe.channels());
    engine.configure_filter(&config.filter).unwrap();
    engine.flush().unwrap();
    let complete = engine.snapshot(500).unwrap();

    let (_full_dir, _full_path, reference, _) = engine_on_file(&config, 1000);
    reference.register_event(500, 8).unwrap();
    reference.flush().unwrap();
    assert_eq!(*complete, *reference.snapshot(500).unwrap());
    assert_ne!(*complete, *padded);
}

#[test]
fn test_event_at_end_of_recording_is_zero_padded() {
    let config = small_config();
    let (_dir, _path, engine, _presentation) = engine_on_file(&config, 1000);

    let started = Instant::now();
    engine.register_event(990, 8).unwrap();
    engine.flush().unwrap();
    // a finished recording never waits for the slice timeout
    assert!(started.elapsed() < Duration::from_millis(config.stream.slice_timeout_ms));

    let snapshot = engine.snapshot(990).unwrap();
    assert_eq!(snapshot.shape(), &[4, 40]);
    let raw = engine.stream().slice(970, 1010, false).unwrap();
    assert_eq!(raw.shape(), &[40, 4, 4]);
    assert!(raw.slice(s![30.., .., ..]).iter().all(|&v| v == 0));
    assert_eq!(raw[[29, 1, 2]], sample(999, 6));
}

#[test]
fn test_new_session_cancels_in_flight_event() {
    let mut config = small_config();
    config.events.max_events = 1;
    let (dir, path, engine, presentation) = live_session(&config);
    append_frames(&path, 0, 100, config.stream.probe.channels());

    // the window of 500 is not on disk yet, so the event waits on the stream
    engine.register_event(500, 8).unwrap();
    thread::sleep(Duration::from_millis(50));
    engine.start_session(dir.path().join("next")).unwrap();
    engine.flush().unwrap();

    assert!(presentation.options.lock().unwrap().is_empty());
    assert_eq!(presentation.stops.load(Ordering::SeqCst), 0);
    assert!(engine.events().is_empty());
    assert!(engine.snapshots().is_empty());
}

#[test]
fn test_new_session_clears_everything() {
    let (dir, _path, engine, _presentation) = engine_on_file(&small_config(), 3000);
    engine.register_event(1000, 8).unwrap();
    engine.add_group("g", vec![1000]).unwrap();
    engine.select_view("g").unwrap();
    engine.flush().unwrap();
    assert_eq!(engine.events().len(), 1);

    let session = engine.start_session(dir.path().join("sessions")).unwrap();
    assert!(session.running);
    assert!(engine.events().is_empty());
    assert!(engine.snapshots().is_empty());
    assert_eq!(engine.view(), AVERAGE);
    assert!(engine.export_config().events.groups.is_empty());
    assert_eq!(engine.stream().extent(), (0, 0));

    engine.stop_session().unwrap();
    assert!(!engine.session().unwrap().running);
}

#[test]
fn test_config_reapplication_is_idempotent() {
    let (_dir, _path, engine, presentation) = engine_on_file(&small_config(), 3000);
    engine.register_event(1000, 8).unwrap();
    engine.add_group("stim", vec![1000]).unwrap();
    engine.flush().unwrap();

    let exported = engine.export_config();
    let before = engine.snapshot(1000).unwrap();
    let options = presentation.options.lock().unwrap().clone();
    engine.apply_config(&exported).unwrap();
    engine.apply_config(&exported).unwrap();
    engine.flush().unwrap();

    assert_eq!(*presentation.options.lock().unwrap(), options);

    assert_eq!(engine.export_config(), exported);
    assert_eq!(*engine.snapshot(1000).unwrap(), *before);

    let mut other = exported.clone();
    other.stream.probe = ProbeGeometry::new(8, 8, 2, 2).unwrap();
    assert!(matches!(
        engine.apply_config(&other),
        Err(NeuroLayerError::Config(_))
    ));
}

#[test]
fn test_channel_spectrum_and_current_view() {
    let (_dir, _path, engine, _presentation) = engine_on_file(&small_config(), 3000);
    let (freqs, psd_db) = engine.channel_psd(1, 2, 256).unwrap();
    assert_eq!(freqs.len(), 129);
    assert_eq!(psd_db.len(), 129);
    assert!(psd_db.iter().all(|p| p.is_finite()));
    assert!(matches!(
        engine.channel_psd(4, 0, 256),
        Err(NeuroLayerError::InvalidGeometry(_))
    ));

    engine.register_event(1500, 8).unwrap();
    engine.flush().unwrap();
    let (x_axis, matrix) = engine.current_view();
    assert_eq!(x_axis.first().copied(), Some(-20.0));
    assert_eq!(matrix, *engine.snapshot(1500).unwrap());
}
