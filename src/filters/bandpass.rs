use super::sos::SecondOrderSection;
use crate::error::{NeuroLayerError, Result};

use rustfft::num_complex::Complex64;
use std::f64::consts::PI;

// Bilinear transform is done at fs = 2, so the analog axis is s = 4 (z - 1) / (z + 1).
const BILINEAR_K: f64 = 4.0;

/// Butterworth bandpass of the given order as `order` second-order sections.
///
/// Analog prototype -> lowpass-to-bandpass transform -> bilinear transform, with both
/// cutoffs pre-warped so the digital -3 dB points land exactly on `low_hz`/`high_hz`.
/// Sections are ordered so the poles closest to the unit circle come last.
pub fn butterworth(order: usize, low_hz: f64, high_hz: f64, fs: f64) -> Result<Vec<SecondOrderSection>> {
    let nyquist = fs / 2.0;
    if order == 0 || !(0.0 < low_hz && low_hz < high_hz && high_hz < nyquist) {
        return Err(NeuroLayerError::InvalidFilterConfig(format!(
            "bandpass needs 0 < {} < {} < {} and order > 0",
            low_hz, high_hz, nyquist
        )));
    }

    let warp = |f: f64| BILINEAR_K * (PI * (f / nyquist) / 2.0).tan();
    let (w_low, w_high) = (warp(low_hz), warp(high_hz));
    let bandwidth = w_high - w_low;
    let centre = (w_low * w_high).sqrt();

    // Prototype poles sit on the left half of the unit circle.
    let n = order as f64;
    let prototype = (0..order).map(|i| {
        let m = -n + 1.0 + 2.0 * i as f64;
        -Complex64::from_polar(1.0, PI * m / (2.0 * n))
    });

    let mut analog = Vec::with_capacity(2 * order);
    for p in prototype {
        let p_lp = p * (bandwidth / 2.0);
        let root = (p_lp * p_lp - centre * centre).sqrt();
        analog.push(p_lp + root);
        analog.push(p_lp - root);
    }

    let k = Complex64::new(BILINEAR_K, 0.0);
    let digital: Vec<Complex64> = analog.iter().map(|p| (k + p) / (k - p)).collect();

    // `order` zeros at s = 0 map to z = +1 and the remaining `order` zeros go to z = -1.
    let denominator: Complex64 = analog.iter().map(|p| k - p).product();
    let numerator = Complex64::new(BILINEAR_K.powi(order as i32), 0.0);
    let gain = bandwidth.powi(order as i32) * (numerator / denominator).re;

    let mut sections = pair_poles(&digital, order)?
        .into_iter()
        .map(|(radius, a)| (radius, SecondOrderSection::new([1.0, 0.0, -1.0], a)))
        .collect::<Vec<_>>();
    sections.sort_by(|x, y| x.0.partial_cmp(&y.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut out = Vec::with_capacity(order);
    for (idx, (_, section)) in sections.into_iter().enumerate() {
        let mut section = section?;
        if idx == 0 {
            section.b = section.b.map(|c| c * gain);
        }
        out.push(section);
    }
    Ok(out)
}

// Groups the 2*order digital poles into conjugate (or real) pairs and returns the
// denominator of each pair along with its largest pole radius.
fn pair_poles(poles: &[Complex64], order: usize) -> Result<Vec<(f64, [f64; 3])>> {
    let tolerance = 1e-10;
    let upper: Vec<&Complex64> = poles.iter().filter(|p| p.im > tolerance).collect();
    let mut real: Vec<f64> = poles
        .iter()
        .filter(|p| p.im.abs() <= tolerance)
        .map(|p| p.re)
        .collect();

    if upper.len() * 2 + real.len() != 2 * order || real.len() % 2 != 0 {
        return Err(NeuroLayerError::FilterFailure(format!(
            "could not pair {} poles into {} sections",
            poles.len(),
            order
        )));
    }

    let mut pairs: Vec<(f64, [f64; 3])> = upper
        .iter()
        .map(|p| (p.norm(), [1.0, -2.0 * p.re, p.norm_sqr()]))
        .collect();

    real.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    for chunk in real.chunks(2) {
        let (r0, r1) = (chunk[0], chunk[1]);
        pairs.push((r0.abs().max(r1.abs()), [1.0, -(r0 + r1), r0 * r1]));
    }
    Ok(pairs)
}
