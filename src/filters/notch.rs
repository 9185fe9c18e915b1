use super::sos::SecondOrderSection;
use crate::error::{NeuroLayerError, Result};

use std::f64::consts::PI;

/// Quality factor used for every mains/harmonic notch.
pub const NOTCH_Q: f64 = 40.0;

/// Second-order IIR notch at `freq_hz` with -3 dB bandwidth `freq_hz / q`.
pub fn notch(freq_hz: f64, q: f64, fs: f64) -> Result<SecondOrderSection> {
    let w0 = 2.0 * freq_hz / fs;
    if !(w0 > 0.0 && w0 < 1.0) || q <= 0.0 {
        return Err(NeuroLayerError::InvalidFilterConfig(format!(
            "notch at {} Hz (Q {}) is outside (0, {})",
            freq_hz,
            q,
            fs / 2.0
        )));
    }

    let bandwidth = w0 / q * PI;
    let w0 = w0 * PI;

    // With the -3 dB attenuation convention beta reduces to tan(bw / 2).
    let beta = (bandwidth / 2.0).tan();
    let gain = 1.0 / (1.0 + beta);
    let cos_w0 = w0.cos();

    SecondOrderSection::new(
        [gain, -2.0 * gain * cos_w0, gain],
        [1.0, -2.0 * gain * cos_w0, 2.0 * gain - 1.0],
    )
}

/// Notch sections for `base_hz * k`, `k = 1..=harmonics`, dropping any at or above Nyquist.
pub fn harmonic_notches(base_hz: f64, harmonics: u32, fs: f64) -> Result<Vec<SecondOrderSection>> {
    (1..=harmonics)
        .map(|k| base_hz * k as f64)
        .take_while(|&f| f < fs / 2.0)
        .map(|f| notch(f, NOTCH_Q, fs))
        .collect()
}
