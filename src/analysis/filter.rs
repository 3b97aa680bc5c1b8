//! Offline trace conditioning.
//!
//! - Median filter with an amplitude threshold: only samples that stick out from
//!   their window median by more than the threshold are replaced, so single-point
//!   rig noise goes away while fast biological events keep their shape.
//! - Zero-phase low-pass: 4th-order Butterworth built from two RBJ biquad
//!   sections, run forward then backward over an odd-reflected extension of the
//!   trace so edges start in steady state.
use std::f64::consts::PI;

use crate::analysis::AnalysisError;
use crate::types::Trace;

/// Q of each second-order section of a 4th-order Butterworth response.
const BUTTERWORTH4_Q: [f64; 2] = [0.541_196_100_146_197, 1.306_562_964_876_376_5];

pub fn median_filter(
    trace: &Trace,
    window_size: usize,
    amplitude_threshold: f64,
) -> Result<Trace, AnalysisError> {
    if window_size == 0 {
        return Err(AnalysisError::invalid("window_size", "must be at least 1"));
    }
    Ok(trace.with_samples(threshold_median(
        trace.samples(),
        window_size,
        amplitude_threshold,
    )))
}

pub(crate) fn threshold_median(samples: &[f64], window_size: usize, threshold: f64) -> Vec<f64> {
    let before = (window_size - 1) / 2;
    let after = window_size - 1 - before;
    let mut scratch = Vec::with_capacity(window_size);
    samples
        .iter()
        .enumerate()
        .map(|(i, &x)| {
            let lo = i.saturating_sub(before);
            let hi = (i + after + 1).min(samples.len());
            scratch.clear();
            scratch.extend_from_slice(&samples[lo..hi]);
            let median = median_of(&mut scratch);
            if (median - x).abs() > threshold {
                median
            } else {
                x
            }
        })
        .collect()
}

fn median_of(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}

pub fn low_pass_filter(trace: &Trace, cutoff_hz: f64) -> Result<Trace, AnalysisError> {
    Ok(trace.with_samples(zero_phase_low_pass(
        trace.samples(),
        trace.sample_rate(),
        cutoff_hz,
    )?))
}

pub(crate) fn zero_phase_low_pass(
    samples: &[f64],
    sample_rate_hz: f64,
    cutoff_hz: f64,
) -> Result<Vec<f64>, AnalysisError> {
    let nyquist = sample_rate_hz * 0.5;
    if !(cutoff_hz > 0.0 && cutoff_hz < nyquist) {
        return Err(AnalysisError::invalid(
            "cutoff_frequency",
            format!("must lie in (0, {nyquist}) Hz, got {cutoff_hz}"),
        ));
    }
    if samples.len() < 2 {
        return Ok(samples.to_vec());
    }
    let sections: Vec<BiquadCoeffs> = BUTTERWORTH4_Q
        .iter()
        .map(|&q| lowpass(cutoff_hz, sample_rate_hz, q))
        .collect();
    let pad = (3 * (2 * sections.len() + 1)).min(samples.len() - 1);
    let mut work = odd_extension(samples, pad);
    run_cascade(&sections, &mut work);
    work.reverse();
    run_cascade(&sections, &mut work);
    work.reverse();
    Ok(work[pad..pad + samples.len()].to_vec())
}

fn odd_extension(samples: &[f64], pad: usize) -> Vec<f64> {
    let first = samples[0];
    let last = samples[samples.len() - 1];
    let mut out = Vec::with_capacity(samples.len() + 2 * pad);
    out.extend((1..=pad).rev().map(|k| 2.0 * first - samples[k]));
    out.extend_from_slice(samples);
    out.extend((1..=pad).map(|k| 2.0 * last - samples[samples.len() - 1 - k]));
    out
}

fn run_cascade(sections: &[BiquadCoeffs], data: &mut [f64]) {
    for coeffs in sections {
        let mut section = BiquadFilter::settled(*coeffs, data[0]);
        for value in data.iter_mut() {
            *value = section.process(*value);
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct BiquadCoeffs {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

#[derive(Clone, Copy, Debug)]
struct BiquadFilter {
    coeffs: BiquadCoeffs,
    z1: f64,
    z2: f64,
}

impl BiquadFilter {
    /// State as if `input` had been applied forever.
    fn settled(coeffs: BiquadCoeffs, input: f64) -> Self {
        let gain = (coeffs.b0 + coeffs.b1 + coeffs.b2) / (1.0 + coeffs.a1 + coeffs.a2);
        let output = gain * input;
        let z2 = coeffs.b2 * input - coeffs.a2 * output;
        let z1 = coeffs.b1 * input - coeffs.a1 * output + z2;
        Self { coeffs, z1, z2 }
    }
    fn process(&mut self, input: f64) -> f64 {
        // Transposed direct form II
        let y = self.coeffs.b0 * input + self.z1;
        self.z1 = self.coeffs.b1 * input - self.coeffs.a1 * y + self.z2;
        self.z2 = self.coeffs.b2 * input - self.coeffs.a2 * y;
        y
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
    fn trace(samples: Vec<f64>, dt: f64) -> Trace {
        Trace::new(samples, dt, 0.0).unwrap()
    }
    #[test]
    fn median_replaces_only_outliers() {
        let t = trace(vec![1.0, 1.0, 9.0, 1.0, 1.0, 1.2, 1.0], 1e-3);
        let out = median_filter(&t, 3, 0.5).unwrap();
        assert_eq!(out.samples(), &[1.0, 1.0, 1.0, 1.0, 1.0, 1.2, 1.0]);
        assert_eq!(out.sample_interval(), t.sample_interval());
    }
    #[test]
    fn median_rejects_empty_window() {
        let t = trace(vec![0.0; 8], 1e-3);
        assert!(matches!(
            median_filter(&t, 0, 1.0),
            Err(AnalysisError::InvalidParameter { .. })
        ));
    }
    #[test]
    fn low_pass_keeps_dc_and_length() {
        let t = trace(vec![-0.07; 500], 1e-4);
        let out = low_pass_filter(&t, 300.0).unwrap();
        assert_eq!(out.len(), 500);
        assert!(out.samples().iter().all(|v| (v + 0.07).abs() < 1e-9));
    }
    #[test]
    fn low_pass_attenuates_high_frequency() {
        let dt = 1e-4;
        let slow: Vec<f64> = (0..4000).map(|i| (2.0 * PI * 10.0 * i as f64 * dt).sin()).collect();
        let fast: Vec<f64> = (0..4000).map(|i| (2.0 * PI * 2000.0 * i as f64 * dt).sin()).collect();
        let mixed: Vec<f64> = slow.iter().zip(&fast).map(|(a, b)| a + b).collect();
        let out = low_pass_filter(&trace(mixed, dt), 200.0).unwrap();
        let err = out.samples()[500..3500]
            .iter()
            .zip(&slow[500..3500])
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f64, f64::max);
        assert!(err < 0.02, "max deviation {err}");
    }
    #[test]
    fn low_pass_is_zero_phase() {
        let dt = 1e-4;
        let bump: Vec<f64> = (0..2000)
            .map(|i| (-((i as f64 - 1000.0) * dt / 0.003).powi(2)).exp())
            .collect();
        let out = low_pass_filter(&trace(bump, dt), 500.0).unwrap();
        let peak = out
            .samples()
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, 1000);
    }
    #[test]
    fn cutoff_must_be_below_nyquist() {
        let t = trace(vec![0.0; 100], 1e-3);
        assert!(low_pass_filter(&t, 500.0).is_err());
        assert!(low_pass_filter(&t, 0.0).is_err());
        assert!(low_pass_filter(&t, 499.0).is_ok());
    }
}
