pub mod bandpass;
pub mod notch;
pub mod sos;

use crate::config::FilterConfig;
use crate::error::{NeuroLayerError, Result};
use sos::SosCascade;

use log::{debug, warn};
use ndarray::{Array, Axis, Dimension};
use std::sync::Arc;

/// Optional stage run after the bandpass/notch cascade.
pub trait DenoiseStage: Send + Sync {
    fn name(&self) -> &str;
    fn denoise(&self, lane: &mut [f64]);
}

/// Identity stage; the slot for a real denoiser.
pub struct PassThrough;

impl DenoiseStage for PassThrough {
    fn name(&self) -> &str {
        "pass-through"
    }

    fn denoise(&self, _lane: &mut [f64]) {}
}

/// A designed bandpass + notch cascade, immutable once built.
pub struct FilterDesign {
    config: FilterConfig,
    cascade: SosCascade,
    bandpass_sections: usize,
    denoiser: Option<Arc<dyn DenoiseStage>>,
}

pub type FilterHandle = Arc<FilterDesign>;

impl FilterDesign {
    /// Validates `config` and designs the cascade: bandpass sections first, then every
    /// notch harmonic below Nyquist.
    pub fn new(config: &FilterConfig, fs: f64) -> Result<Self> {
        validate(config, fs)?;

        let mut sections =
            bandpass::butterworth(config.order as usize, config.low_hz, config.high_hz, fs)?;
        let bandpass_sections = sections.len();
        for notch_cfg in &config.notches {
            sections.extend(notch::harmonic_notches(notch_cfg.frequency, notch_cfg.harmonics, fs)?);
        }

        let denoiser: Option<Arc<dyn DenoiseStage>> = if config.denoise {
            Some(Arc::new(PassThrough))
        } else {
            None
        };

        debug!(
            "designed cascade: {} bandpass + {} notch sections",
            bandpass_sections,
            sections.len() - bandpass_sections
        );

        Ok(Self {
            config: config.clone(),
            cascade: SosCascade::new(sections),
            bandpass_sections,
            denoiser,
        })
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    pub fn cascade(&self) -> &SosCascade {
        &self.cascade
    }

    pub fn section_count(&self) -> usize {
        self.cascade.len()
    }

    pub fn bandpass_sections(&self) -> usize {
        self.bandpass_sections
    }

    pub fn notch_sections(&self) -> usize {
        self.cascade.len() - self.bandpass_sections
    }

    /// Detrends and zero-phase filters every lane along axis 0 (time).
    ///
    /// Any numerical failure is logged and the block comes back untouched.
    pub fn apply<D: Dimension>(&self, block: Array<f64, D>) -> Array<f64, D> {
        if block.ndim() == 0 || block.len_of(Axis(0)) == 0 {
            return block;
        }

        let mut filtered = block.clone();
        for mut lane in filtered.lanes_mut(Axis(0)) {
            let mut samples = lane.to_vec();
            detrend_linear(&mut samples);
            match self.cascade.filtfilt(&samples) {
                Ok(mut out) => {
                    if let Some(stage) = &self.denoiser {
                        stage.denoise(&mut out);
                    }
                    for (dst, src) in lane.iter_mut().zip(out) {
                        *dst = src;
                    }
                }
                Err(e) => {
                    warn!("Filtering skipped, passing block through unfiltered: {}", e);
                    return block;
                }
            }
        }
        filtered
    }
}

fn validate(config: &FilterConfig, fs: f64) -> Result<()> {
    let nyquist = fs / 2.0;
    if !(config.low_hz > 0.0 && config.high_hz > 0.0) {
        return Err(NeuroLayerError::InvalidFilterConfig(format!(
            "cutoffs must be positive, got {} and {}",
            config.low_hz, config.high_hz
        )));
    }
    if config.low_hz >= config.high_hz {
        return Err(NeuroLayerError::InvalidFilterConfig(format!(
            "low cutoff {} must be below high cutoff {}",
            config.low_hz, config.high_hz
        )));
    }
    if config.high_hz >= nyquist {
        return Err(NeuroLayerError::InvalidFilterConfig(format!(
            "high cutoff {} must be below Nyquist {}",
            config.high_hz, nyquist
        )));
    }
    if config.order <= 0 {
        return Err(NeuroLayerError::InvalidFilterConfig(format!(
            "order must be positive, got {}",
            config.order
        )));
    }
    if let Some(bad) = config
        .notches
        .iter()
        .find(|n| n.harmonics > 0 && !(n.frequency > 0.0))
    {
        return Err(NeuroLayerError::InvalidFilterConfig(format!(
            "notch frequency must be positive, got {}",
            bad.frequency
        )));
    }
    Ok(())
}

/// Removes the least-squares line from `samples`.
pub fn detrend_linear(samples: &mut [f64]) {
    let n = samples.len();
    if n < 2 {
        if let Some(v) = samples.first_mut() {
            *v = 0.0;
        }
        return;
    }
    let n_f = n as f64;
    let mean_t = (n_f - 1.0) / 2.0;
    let mean_y = samples.iter().sum::<f64>() / n_f;
    let (mut cov, mut var) = (0.0, 0.0);
    for (i, &y) in samples.iter().enumerate() {
        let dt = i as f64 - mean_t;
        cov += dt * (y - mean_y);
        var += dt * dt;
    }
    let slope = cov / var;
    for (i, y) in samples.iter_mut().enumerate() {
        *y -= mean_y + slope * (i as f64 - mean_t);
    }
}

/// Holds the active cascade; replaced wholesale on every parameter change.
pub struct FilterBank {
    fs: f64,
    current: Option<FilterHandle>,
}

impl FilterBank {
    pub fn new(fs: f64) -> Self {
        Self { fs, current: None }
    }

    pub fn sample_rate(&self) -> f64 {
        self.fs
    }

    /// Designs first; the active cascade is only replaced when design succeeds.
    pub fn configure(&mut self, config: &FilterConfig) -> Result<FilterHandle> {
        let handle = self.design(config)?;
        self.install(handle.clone());
        Ok(handle)
    }

    pub fn design(&self, config: &FilterConfig) -> Result<FilterHandle> {
        Ok(Arc::new(FilterDesign::new(config, self.fs)?))
    }

    pub fn install(&mut self, handle: FilterHandle) {
        self.current = Some(handle);
    }

    pub fn handle(&self) -> Option<FilterHandle> {
        self.current.clone()
    }

    pub fn apply<D: Dimension>(&self, block: Array<f64, D>) -> Array<f64, D> {
        match &self.current {
            Some(design) => design.apply(block),
            None => block,
        }
    }
}
