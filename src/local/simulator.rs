use crate::config::ProbeGeometry;
use crate::error::{NeuroLayerError, Result};
use crate::session::{AcquisitionControl, EventNotification};
use crate::utils::sync::lock;

use crossbeam::channel::Sender;
use log::{info, warn};
use rand::Rng;
use std::f64::consts::PI;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

// -----------------------------------------------------------------------------
// SETUP FOR THE SIMULATED SIGNALS
// -----------------------------------------------------------------------------

const BASELINE_AMPLITUDE: f64 = 70.0;
const SLEEP_TIME: u64 = 50;

const BACKGROUND_I_FREQ: f64 = 0.5;
const BACKGROUND_II_FREQ: f64 = 8.0;
const BACKGROUND_III_FREQ: f64 = 50.0;
const SHARP_WAVE_RIPPLE_FREQ: f64 = 130.0;
const INTERICTAL_SPIKE_FREQ: f64 = 30.0;
const SLOW_WAVE_FREQ: f64 = 1.5;

const STREAM_DIR: &str = "Simulated-100.Rhythm";

#[derive(Debug, Clone, Copy)]
pub struct PulseParams {
    amplitude: f64,
    frequency: f64,
    samples: usize,
    start_phase: f64,
}

impl PulseParams {
    fn new(amplitude: f64, frequency: f64, samples: usize, start_phase: f64) -> Self {
        Self {
            amplitude,
            frequency,
            samples,
            start_phase,
        }
    }

    fn random<R: Rng>(rng: &mut R, fs: f64) -> Self {
        match rng.gen_range(0..3) {
            0 => PulseParams::new(30.0, SHARP_WAVE_RIPPLE_FREQ, (0.08 * fs) as usize, 0.0),
            1 => PulseParams::new(40.0, INTERICTAL_SPIKE_FREQ, (0.05 * fs) as usize, PI),
            _ => PulseParams::new(30.0, SLOW_WAVE_FREQ, (0.5 * fs) as usize, 0.0),
        }
    }

    fn value(&self, offset: usize, fs: f64) -> f64 {
        let t = offset as f64 / fs;
        self.amplitude * (2.0 * PI * self.frequency * t + self.start_phase).sin()
    }
}

#[derive(Debug, Clone)]
pub struct SimulatorSettings {
    pub geometry: ProbeGeometry,
    pub sample_rate: f64,
    pub ttl_line: u8,
    // chance per chunk of a pulse + TTL event
    pub event_probability: f64,
}

/// Where the simulated recorder writes a session, mirroring the real recorder's tree.
pub fn recording_path(base: &Path, session: &str, node_id: u32) -> PathBuf {
    base.join(session)
        .join(format!("Record Node {}", node_id))
        .join("experiment1")
        .join("recording1")
        .join("continuous")
        .join(STREAM_DIR)
        .join("continuous.dat")
}

/// Stand-in for the external recorder: writes a growing `continuous.dat` and emits a
/// TTL notification in the middle of every pulse it injects.
pub struct SimulatedRecorder {
    settings: SimulatorSettings,
    events: Sender<EventNotification>,
    record_path: Mutex<Option<(u32, PathBuf)>>,
    base_text: Mutex<String>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedRecorder {
    pub fn new(settings: SimulatorSettings, events: Sender<EventNotification>) -> Self {
        Self {
            settings,
            events,
            record_path: Mutex::new(None),
            base_text: Mutex::new(String::new()),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    pub fn output_file(&self) -> Result<PathBuf> {
        let (node_id, base) = lock(&self.record_path)
            .clone()
            .ok_or_else(|| NeuroLayerError::Control("record path not set".to_string()))?;
        Ok(recording_path(&base, &lock(&self.base_text), node_id))
    }
}

impl AcquisitionControl for SimulatedRecorder {
    fn start(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        let path = self.output_file()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        File::create(&path)?;
        info!("Simulated recording to {}", path.display());

        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let settings = self.settings.clone();
        let events = self.events.clone();
        let handle = thread::Builder::new()
            .name("simulated-recorder".to_string())
            .spawn(move || {
                if let Err(e) = simulated_loop(&path, &settings, &events, &running) {
                    warn!("Simulated recorder stopped: {}", e);
                }
            })?;
        *lock(&self.worker) = Some(handle);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = lock(&self.worker).take() {
            handle
                .join()
                .map_err(|_| NeuroLayerError::Control("recorder thread panicked".to_string()))?;
        }
        Ok(())
    }

    fn status(&self) -> Result<String> {
        Ok(if self.running.load(Ordering::SeqCst) {
            "RECORD".to_string()
        } else {
            "IDLE".to_string()
        })
    }

    fn set_record_path(&self, node_id: u32, path: &Path) -> Result<()> {
        *lock(&self.record_path) = Some((node_id, path.to_path_buf()));
        Ok(())
    }

    fn set_base_text(&self, name: &str) -> Result<()> {
        *lock(&self.base_text) = name.to_string();
        Ok(())
    }
}

impl Drop for SimulatedRecorder {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

// -----------------------------------------------------------------------------
// SIMULATING DATA
// -----------------------------------------------------------------------------

fn simulated_loop(
    path: &Path,
    settings: &SimulatorSettings,
    events: &Sender<EventNotification>,
    running: &AtomicBool,
) -> Result<()> {
    let mut rng = rand::thread_rng();
    let fs = settings.sample_rate;
    let channels = settings.geometry.channels();
    let chunk = ((SLEEP_TIME as f64 / 1000.0) * fs).max(1.0) as usize;

    let mut file = OpenOptions::new().append(true).open(path)?;
    let mut sample_index: u64 = 0;
    let mut pulse: Option<(PulseParams, usize)> = None;

    while running.load(Ordering::SeqCst) {
        let mut bytes = Vec::with_capacity(chunk * channels * 2);
        for _ in 0..chunk {
            let time = sample_index as f64 / fs;
            let background = 10.0 * (2.0 * PI * BACKGROUND_I_FREQ * time).sin()
                + BASELINE_AMPLITUDE / 2.0 * (2.0 * PI * BACKGROUND_II_FREQ * time).sin()
                + 5.0 * (2.0 * PI * BACKGROUND_III_FREQ * time).sin();

            let mut burst = 0.0;
            if let Some((params, offset)) = pulse {
                burst = params.value(offset, fs);
                pulse = if offset + 1 < params.samples {
                    Some((params, offset + 1))
                } else {
                    None
                };
            }

            for channel in 0..channels {
                let noise = rng.gen_range(-10.0..10.0);
                // bursts fade across the probe so super-pixels differ
                let weight = 1.0 - channel as f64 / channels as f64;
                let value = BASELINE_AMPLITUDE + background + weight * burst + noise;
                bytes.extend_from_slice(&(value as i16).to_le_bytes());
            }
            sample_index += 1;
        }
        file.write_all(&bytes)?;
        file.flush()?;

        // Determine if a pulse should be sent
        if pulse.is_none() && rng.gen_bool(settings.event_probability.clamp(0.0, 1.0)) {
            let params = PulseParams::random(&mut rng, fs);
            let notification = EventNotification {
                line: settings.ttl_line,
                sample_number: sample_index + (params.samples / 2) as u64,
                sample_rate: fs,
                state: true,
            };
            pulse = Some((params, 0));
            if events.send(notification).is_err() {
                break;
            }
        }

        thread::sleep(Duration::from_millis(SLEEP_TIME));
    }
    Ok(())
}
