use std::f64::consts::PI;

/// Q values of the two second-order sections of a 4th-order Butterworth.
const BUTTERWORTH4_Q: [f64; 2] = [0.541_196_100_146_197, 1.306_562_964_876_376_8];

#[derive(Clone, Copy, Debug, PartialEq)]
struct BiquadCoeffs {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

#[derive(Clone, Copy, Debug, Default)]
struct BiquadState {
    z1: f64,
    z2: f64,
}

#[derive(Clone, Copy, Debug)]
struct BiquadFilter {
    coeffs: BiquadCoeffs,
    state: BiquadState,
}

impl BiquadFilter {
    fn new(coeffs: BiquadCoeffs) -> Self {
        Self {
            coeffs,
            state: BiquadState::default(),
        }
    }

    fn process(&mut self, input: f64) -> f64 {
        // Transposed direct form II
        let y = self.coeffs.b0 * input + self.state.z1;
        self.state.z1 = self.coeffs.b1 * input - self.coeffs.a1 * y + self.state.z2;
        self.state.z2 = self.coeffs.b2 * input - self.coeffs.a2 * y;
        y
    }

    fn dc_gain(&self) -> f64 {
        let c = self.coeffs;
        (c.b0 + c.b1 + c.b2) / (1.0 + c.a1 + c.a2)
    }

    /// Sets the state a constant input `value` would settle to.
    fn settle_at(&mut self, value: f64) {
        let c = self.coeffs;
        let y = self.dc_gain() * value;
        self.state.z2 = c.b2 * value - c.a2 * y;
        self.state.z1 = c.b1 * value - c.a1 * y + self.state.z2;
    }
}

/// Cascade of low-pass biquads.
#[derive(Clone, Debug)]
pub struct LowPass {
    sections: Vec<BiquadFilter>,
}

impl LowPass {
    /// 4th-order Butterworth at `cutoff_hz`. The cutoff is clamped below Nyquist.
    pub fn butterworth4(cutoff_hz: f64, sample_rate_hz: f64) -> Self {
        let nyquist = sample_rate_hz * 0.5;
        let cutoff = cutoff_hz.clamp(nyquist * 1e-6, nyquist * 0.999);
        let sections = BUTTERWORTH4_Q
            .iter()
            .map(|&q| BiquadFilter::new(lowpass(cutoff, sample_rate_hz, q)))
            .collect();
        Self { sections }
    }

    pub fn process_sample(&mut self, mut value: f64) -> f64 {
        for section in &mut self.sections {
            value = section.process(value);
        }
        value
    }

    /// Primes every section as if `value` had been the input forever.
    pub fn settle_at(&mut self, value: f64) {
        let mut v = value;
        for section in &mut self.sections {
            section.settle_at(v);
            v *= section.dc_gain();
        }
    }

    /// Zero-phase filtering: one pass forward, one pass backward.
    pub fn filtfilt(&self, signal: &[f64]) -> Vec<f64> {
        let (Some(&first), Some(&last)) = (signal.first(), signal.last()) else {
            return Vec::new();
        };
        let mut forward = self.clone();
        forward.settle_at(first);
        let mut out: Vec<f64> = signal.iter().map(|&v| forward.process_sample(v)).collect();

        let mut backward = self.clone();
        let tail = out.last().copied().unwrap_or(last);
        backward.settle_at(tail);
        for v in out.iter_mut().rev() {
            *v = backward.process_sample(*v);
        }
        out
    }
}

fn lowpass(freq_hz: f64, sample_rate_hz: f64, q: f64) -> BiquadCoeffs {
    let w0 = 2.0 * PI * freq_hz / sample_rate_hz;
    let alpha = w0.sin() / (2.0 * q);
    let cos_w0 = w0.cos();
    let b0 = (1.0 - cos_w0) * 0.5;
    let b1 = 1.0 - cos_w0;
    let b2 = b0;
    let a0 = 1.0 + alpha;
    let a1 = -2.0 * cos_w0;
    let a2 = 1.0 - alpha;
    normalize(b0, b1, b2, a0, a1, a2)
}

fn normalize(b0: f64, b1: f64, b2: f64, a0: f64, a1: f64, a2: f64) -> BiquadCoeffs {
    let a0_inv = 1.0 / a0;
    BiquadCoeffs {
        b0: b0 * a0_inv,
        b1: b1 * a0_inv,
        b2: b2 * a0_inv,
        a1: a1 * a0_inv,
        a2: a2 * a0_inv,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_signal_passes_unchanged() {
        let filter = LowPass::butterworth4(0.1, 10.0);
        let out = filter.filtfilt(&[42.0; 200]);
        assert_eq!(out.len(), 200);
        assert!(out.iter().all(|v| (v - 42.0).abs() < 1e-6));
    }

    #[test]
    fn attenuates_high_frequency_noise() {
        let fs = 100.0;
        let signal: Vec<f64> = (0..2000)
            .map(|i| {
                let t = i as f64 / fs;
                10.0 + (2.0 * PI * 0.05 * t).sin() + 2.0 * (2.0 * PI * 20.0 * t).sin()
            })
            .collect();
        let out = LowPass::butterworth4(1.0, fs).filtfilt(&signal);
        // Compare against the slow component only, away from the edges.
        let worst = (200..1800)
            .map(|i| {
                let t = i as f64 / fs;
                (out[i] - (10.0 + (2.0 * PI * 0.05 * t).sin())).abs()
            })
            .fold(0.0f64, f64::max);
        assert!(worst < 0.05, "residual {worst}");
    }

    #[test]
    fn empty_input_gives_empty_output() {
        assert!(LowPass::butterworth4(1.0, 10.0).filtfilt(&[]).is_empty());
    }

    #[test]
    fn dc_gain_is_unity() {
        let c = lowpass(5.0, 100.0, BUTTERWORTH4_Q[0]);
        let gain = (c.b0 + c.b1 + c.b2) / (1.0 + c.a1 + c.a2);
        assert!((gain - 1.0).abs() < 1e-12);
    }
}
