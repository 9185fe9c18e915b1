use ndarray::Array2;
use rustfft::num_complex::Complex64;
use rustfft::FftPlanner;
use std::f64::consts::PI;

pub const DEFAULT_NPERSEG: usize = 1024;

/// Symmetric Hann window.
pub fn hann(len: usize) -> Vec<f64> {
    match len {
        0 => Vec::new(),
        1 => vec![1.0],
        _ => (0..len)
            .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f64 / (len - 1) as f64).cos())
            .collect(),
    }
}

/// One-sided Welch power spectral density in dB.
///
/// Hann-windowed segments of `nperseg` samples (clamped to the signal length) with
/// 50% overlap, mean removed per segment, density scaling, segment mean.
/// Returns `(frequencies, psd_db)`.
pub fn welch_psd_db(signal: &[f64], fs: f64, nperseg: usize) -> (Vec<f64>, Vec<f64>) {
    let nperseg = nperseg.min(signal.len());
    if nperseg == 0 {
        return (Vec::new(), Vec::new());
    }
    let step = nperseg - nperseg / 2;
    let window = hann(nperseg);
    let scale = 1.0 / (fs * window.iter().map(|w| w * w).sum::<f64>());

    let bins = nperseg / 2 + 1;
    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(nperseg);

    let mut psd = vec![0.0; bins];
    let mut segments = 0usize;
    let mut start = 0usize;
    while start + nperseg <= signal.len() {
        let segment = &signal[start..start + nperseg];
        let mean = segment.iter().sum::<f64>() / nperseg as f64;
        let mut spectrum: Vec<Complex64> = segment
            .iter()
            .zip(&window)
            .map(|(x, w)| Complex64::new((x - mean) * w, 0.0))
            .collect();
        fft.process(&mut spectrum);

        for (k, value) in spectrum.iter().take(bins).enumerate() {
            psd[k] += value.norm_sqr() * scale;
        }
        segments += 1;
        start += step;
    }

    let nyquist_bin = if nperseg % 2 == 0 { Some(bins - 1) } else { None };
    let freqs = (0..bins).map(|k| k as f64 * fs / nperseg as f64).collect();
    let psd_db = psd
        .into_iter()
        .enumerate()
        .map(|(k, p)| {
            let one_sided = if k == 0 || Some(k) == nyquist_bin { 1.0 } else { 2.0 };
            let p = p * one_sided / segments as f64;
            10.0 * p.max(f64::MIN_POSITIVE).log10()
        })
        .collect();
    (freqs, psd_db)
}

/// [`welch_psd_db`] for each row of a `(channels, time)` matrix.
pub fn welch_psd_db_rows(channels: &Array2<f64>, fs: f64, nperseg: usize) -> (Vec<f64>, Array2<f64>) {
    let mut freqs = Vec::new();
    let mut rows = Vec::with_capacity(channels.nrows());
    for row in channels.rows() {
        let (f, p) = welch_psd_db(&row.to_vec(), fs, nperseg);
        freqs = f;
        rows.push(p);
    }
    let bins = freqs.len();
    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    let psd = Array2::from_shape_vec((channels.nrows(), bins), flat)
        .unwrap_or_else(|_| Array2::zeros((channels.nrows(), bins)));
    (freqs, psd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_hann_endpoints() {
        let w = hann(5);
        assert_eq!(w.len(), 5);
        assert!(w[0].abs() < 1e-15 && w[4].abs() < 1e-15);
        assert!((w[2] - 1.0).abs() < 1e-15);
    }

    #[test]
    fn test_sine_peak_and_power() {
        let fs = 1000.0;
        let amplitude = 3.0;
        let signal: Vec<f64> = (0..4096)
            .map(|i| amplitude * (2.0 * PI * 125.0 * i as f64 / fs).sin())
            .collect();
        let (freqs, psd_db) = welch_psd_db(&signal, fs, DEFAULT_NPERSEG);
        assert_eq!(freqs.len(), 513);

        let peak = psd_db
            .iter()
            .enumerate()
            .fold((0, f64::MIN), |best, (k, &p)| if p > best.1 { (k, p) } else { best });
        assert_relative_eq!(freqs[peak.0], 125.0, epsilon = 1e-9);

        // density scaling preserves the mean square
        let df = fs / DEFAULT_NPERSEG as f64;
        let power: f64 = psd_db.iter().map(|db| 10f64.powf(db / 10.0) * df).sum();
        assert_relative_eq!(power, amplitude * amplitude / 2.0, max_relative = 0.01);
    }

    #[test]
    fn test_short_signal_clamps_segment() {
        let signal = vec![1.0, -1.0, 1.0, -1.0, 1.0, -1.0];
        let (freqs, psd) = welch_psd_db(&signal, 6.0, DEFAULT_NPERSEG);
        assert_eq!(freqs.len(), 4);
        assert_eq!(psd.len(), 4);
        assert!(welch_psd_db(&[], 6.0, 16).0.is_empty());
    }

    #[test]
    fn test_rows() {
        let channels = Array2::from_shape_fn((3, 256), |(c, t)| ((t * (c + 1)) as f64).sin());
        let (freqs, psd) = welch_psd_db_rows(&channels, 100.0, 64);
        assert_eq!(freqs.len(), 33);
        assert_eq!(psd.dim(), (3, 33));
    }
}
