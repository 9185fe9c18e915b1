use crate::error::{NeuroLayerError, Result};

use rustfft::num_complex::Complex64;

/// A single biquad stage, normalised so that `a[0] == 1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SecondOrderSection {
    pub b: [f64; 3],
    pub a: [f64; 3],
}

impl SecondOrderSection {
    pub fn new(b: [f64; 3], a: [f64; 3]) -> Result<Self> {
        if a[0] == 0.0 || b.iter().chain(a.iter()).any(|c| !c.is_finite()) {
            return Err(NeuroLayerError::FilterFailure(format!(
                "degenerate section b={:?} a={:?}",
                b, a
            )));
        }
        let a0 = a[0];
        Ok(Self {
            b: [b[0] / a0, b[1] / a0, b[2] / a0],
            a: [1.0, a[1] / a0, a[2] / a0],
        })
    }

    /// Row in the usual `[b0, b1, b2, a0, a1, a2]` layout.
    pub fn as_row(&self) -> [f64; 6] {
        [self.b[0], self.b[1], self.b[2], self.a[0], self.a[1], self.a[2]]
    }

    // Initial state giving a unit step response with no transient.
    fn unit_step_state(&self) -> Option<[f64; 2]> {
        let [b0, b1, b2] = self.b;
        let [_, a1, a2] = self.a;
        let det = 1.0 + a1 + a2;
        if det.abs() < f64::EPSILON {
            return None;
        }
        let rhs0 = b1 - a1 * b0;
        let rhs1 = b2 - a2 * b0;
        Some([(rhs0 + rhs1) / det, ((1.0 + a1) * rhs1 - a2 * rhs0) / det])
    }

    fn dc_gain(&self) -> Option<f64> {
        let den: f64 = self.a.iter().sum();
        if den.abs() < f64::EPSILON {
            None
        } else {
            Some(self.b.iter().sum::<f64>() / den)
        }
    }

    // Transposed direct form II, in place.
    fn run(&self, signal: &mut [f64], state: [f64; 2]) {
        let [b0, b1, b2] = self.b;
        let [_, a1, a2] = self.a;
        let (mut z0, mut z1) = (state[0], state[1]);
        for sample in signal.iter_mut() {
            let x = *sample;
            let y = b0 * x + z0;
            z0 = b1 * x - a1 * y + z1;
            z1 = b2 * x - a2 * y;
            *sample = y;
        }
    }

    pub fn response(&self, omega: f64) -> Complex64 {
        let z1 = Complex64::from_polar(1.0, -omega);
        let z2 = z1 * z1;
        let num = Complex64::new(self.b[0], 0.0) + z1 * self.b[1] + z2 * self.b[2];
        let den = Complex64::new(self.a[0], 0.0) + z1 * self.a[1] + z2 * self.a[2];
        num / den
    }
}

/// Cascade of second-order sections applied in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SosCascade {
    sections: Vec<SecondOrderSection>,
}

impl SosCascade {
    pub fn new(sections: Vec<SecondOrderSection>) -> Self {
        Self { sections }
    }

    pub fn sections(&self) -> &[SecondOrderSection] {
        &self.sections
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Odd-extension length used on each side by [`SosCascade::filtfilt`].
    pub fn pad_len(&self) -> usize {
        let zero_b2 = self.sections.iter().filter(|s| s.b[2] == 0.0).count();
        let zero_a2 = self.sections.iter().filter(|s| s.a[2] == 0.0).count();
        let taps = 2 * self.sections.len() + 1 - zero_b2.min(zero_a2);
        3 * taps
    }

    /// Per-section initial states for a unit step input.
    pub fn steady_state(&self) -> Result<Vec<[f64; 2]>> {
        let mut scale = 1.0;
        let mut states = Vec::with_capacity(self.sections.len());
        for (idx, section) in self.sections.iter().enumerate() {
            let state = section.unit_step_state().ok_or_else(|| {
                NeuroLayerError::FilterFailure(format!("section {} has a pole at z = 1", idx))
            })?;
            states.push([scale * state[0], scale * state[1]]);
            scale *= section.dc_gain().ok_or_else(|| {
                NeuroLayerError::FilterFailure(format!("section {} has no finite DC gain", idx))
            })?;
        }
        Ok(states)
    }

    /// Causal filtering with every section state scaled by `initial`.
    pub fn filter_in_place(&self, signal: &mut [f64], states: &[[f64; 2]], initial: f64) {
        for (section, state) in self.sections.iter().zip(states) {
            section.run(signal, [state[0] * initial, state[1] * initial]);
        }
    }

    /// Forward-backward (zero-phase) filtering with odd-extension padding.
    pub fn filtfilt(&self, signal: &[f64]) -> Result<Vec<f64>> {
        if self.sections.is_empty() {
            return Ok(signal.to_vec());
        }

        let edge = self.pad_len();
        let n = signal.len();
        if n <= edge {
            return Err(NeuroLayerError::FilterFailure(format!(
                "block of {} samples is not longer than the pad length {}",
                n, edge
            )));
        }

        let states = self.steady_state()?;
        let mut extended = odd_extend(signal, edge);

        let x0 = extended[0];
        self.filter_in_place(&mut extended, &states, x0);
        extended.reverse();

        let y0 = extended[0];
        self.filter_in_place(&mut extended, &states, y0);
        extended.reverse();

        let filtered = extended[edge..edge + n].to_vec();
        if filtered.iter().any(|v| !v.is_finite()) {
            return Err(NeuroLayerError::FilterFailure(
                "cascade produced non-finite output".to_string(),
            ));
        }
        Ok(filtered)
    }

    /// Magnitude of the cascade's frequency response at `freq_hz`.
    pub fn magnitude(&self, freq_hz: f64, fs: f64) -> f64 {
        let omega = 2.0 * std::f64::consts::PI * freq_hz / fs;
        self.sections
            .iter()
            .map(|s| s.response(omega))
            .fold(Complex64::new(1.0, 0.0), |acc, h| acc * h)
            .norm()
    }
}

fn odd_extend(signal: &[f64], edge: usize) -> Vec<f64> {
    let n = signal.len();
    let first = signal[0];
    let last = signal[n - 1];

    let mut extended = Vec::with_capacity(n + 2 * edge);
    extended.extend((1..=edge).rev().map(|i| 2.0 * first - signal[i]));
    extended.extend_from_slice(signal);
    extended.extend((1..=edge).map(|i| 2.0 * last - signal[n - 1 - i]));
    extended
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn smoothing_section() -> SecondOrderSection {
        // gentle low-pass with unity DC gain
        SecondOrderSection::new([0.225, 0.45, 0.225], [1.0, -0.2, 0.1]).unwrap()
    }

    #[test]
    fn test_normalises_leading_coefficient() {
        let section = SecondOrderSection::new([2.0, 0.0, 0.0], [2.0, 1.0, 0.5]).unwrap();
        assert_eq!(section.as_row(), [1.0, 0.0, 0.0, 1.0, 0.5, 0.25]);
    }

    #[test]
    fn test_zero_leading_denominator_rejected() {
        assert!(SecondOrderSection::new([1.0, 0.0, 0.0], [0.0, 1.0, 0.0]).is_err());
    }

    #[test]
    fn test_odd_extension() {
        let ext = odd_extend(&[1.0, 2.0, 4.0, 7.0], 2);
        assert_eq!(ext, vec![-2.0, 0.0, 1.0, 2.0, 4.0, 7.0, 10.0, 12.0]);
    }

    #[test]
    fn test_pad_len_counts_sections() {
        let cascade = SosCascade::new(vec![smoothing_section(); 3]);
        assert_eq!(cascade.pad_len(), 3 * 7);
    }

    #[test]
    fn test_steady_state_keeps_constant_input_flat() {
        let cascade = SosCascade::new(vec![smoothing_section(); 2]);
        let states = cascade.steady_state().unwrap();
        let mut signal = vec![3.0; 50];
        cascade.filter_in_place(&mut signal, &states, 3.0);
        for v in signal {
            assert_abs_diff_eq!(v, 3.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_filtfilt_preserves_constant() {
        let cascade = SosCascade::new(vec![smoothing_section()]);
        let out = cascade.filtfilt(&vec![-5.0; 40]).unwrap();
        assert_eq!(out.len(), 40);
        for v in out {
            assert_abs_diff_eq!(v, -5.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_filtfilt_rejects_short_block() {
        let cascade = SosCascade::new(vec![smoothing_section(); 2]);
        let short = vec![1.0; cascade.pad_len()];
        assert!(matches!(
            cascade.filtfilt(&short),
            Err(NeuroLayerError::FilterFailure(_))
        ));
    }

    #[test]
    fn test_filtfilt_has_no_phase_shift() {
        let cascade = SosCascade::new(vec![smoothing_section(); 2]);
        let period = 32.0;
        let signal: Vec<f64> = (0..160)
            .map(|i| (2.0 * std::f64::consts::PI * i as f64 / period).sin())
            .collect();
        let out = cascade.filtfilt(&signal).unwrap();

        // forward-backward squares the magnitude and cancels the phase
        let gain = cascade.magnitude(1.0 / period, 1.0).powi(2);
        for i in 48..112 {
            assert_abs_diff_eq!(out[i], gain * signal[i], epsilon = 1e-6);
        }
    }
}
