//! Miniature synaptic event detection.
//!
//! Pipeline over the analysis window: sign flip, thresholded median filter,
//! scaling, removal of a least-squares linear drift, zero-phase low-pass.
//! Rises are upward crossings of `riseSlope` by the filtered derivative and the
//! peak is the next slope reversal. Candidates that rise fast enough and clear
//! `minAmp` over the preceding baseline are grouped into stacks when their peaks
//! sit closer than `stackWin`. Each member's onset is located by a single
//! double-exponential fit on its own stretch of the stack, with the earlier
//! members' fits subtracted. With the onsets held there, the whole stack is
//! refitted at once: one component per member on top of a shared constant.
use serde::Serialize;

use crate::analysis::filter::{threshold_median, zero_phase_low_pass};
use crate::analysis::fit::{double_exponential, double_exponential_peak, levenberg_marquardt, Bounds};
use crate::analysis::{AnalysisError, TraceAnalysis};
use crate::observer::{emit, AnalysisObserver, Verbosity};
use crate::params::MiniParams;
use crate::types::{mean, MiniEvent, Trace, Trial};

/// Parameters per component in the joint stack fit: amplitude, decay tau and
/// rise tau. Onsets are held.
const COMPONENT_PARAMS: usize = 3;
/// Lower bound on both time constants, in samples.
const TAU_FLOOR: f64 = 0.1;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MiniTrialResult {
    pub events: Vec<MiniEvent>,
    /// Length of the analyzed window (s).
    pub duration: f64,
}

pub struct MiniDetector {
    params: MiniParams,
}

#[derive(Clone, Copy, Debug)]
struct Candidate {
    rise: usize,
    peak: usize,
}

#[derive(Clone, Debug)]
struct Stack {
    baseline: f64,
    members: Vec<Candidate>,
}

/// One fitted component, time in samples from the segment start.
#[derive(Clone, Copy, Debug)]
struct Component {
    onset: f64,
    tau_decay: f64,
    tau_rise: f64,
    height: f64,
}

struct StackFit {
    start: usize,
    components: Vec<Component>,
    residual: f64,
}

/// Subtracts the least-squares line through `x` (index as abscissa).
fn remove_linear_drift(x: &mut [f64]) {
    let n = x.len();
    if n < 2 {
        return;
    }
    let t_mean = (n - 1) as f64 / 2.0;
    let x_mean = mean(x);
    let (mut cov, mut var) = (0.0, 0.0);
    for (i, v) in x.iter().enumerate() {
        let dt = i as f64 - t_mean;
        cov += dt * (v - x_mean);
        var += dt * dt;
    }
    let slope = cov / var;
    for (i, v) in x.iter_mut().enumerate() {
        *v -= x_mean + slope * (i as f64 - t_mean);
    }
}

/// Amplitude, decay tau, rise tau, onset.
fn single_component(p: &[f64], t: f64) -> f64 {
    double_exponential(p[0], p[1], p[2], p[3], t)
}

/// Held `onsets` plus `COMPONENT_PARAMS` per component and a trailing constant.
fn stack_model(onsets: &[f64], p: &[f64], t: f64) -> f64 {
    let mut value = p[p.len() - 1];
    for (c, &onset) in p.chunks_exact(COMPONENT_PARAMS).zip(onsets) {
        value += double_exponential(c[0], c[1], c[2], onset, t);
    }
    value
}

impl MiniDetector {
    pub fn new(params: MiniParams) -> Self {
        Self { params }
    }
    pub fn params(&self) -> &MiniParams {
        &self.params
    }

    pub fn detect(
        &self,
        trace: &Trace,
        observer: &dyn AnalysisObserver,
    ) -> Result<MiniTrialResult, AnalysisError> {
        let p = &self.params;
        let range = match p.win {
            Some((start, end)) => trace.window_range(start, end)?,
            None => 0..trace.len(),
        };
        let rate = trace.sample_rate();
        let duration = range.len() as f64 / rate;
        let raw: Vec<f64> = trace.samples()[range.clone()].iter().map(|v| v * p.sign).collect();
        let mut x = threshold_median(&raw, p.median_window, p.median_threshold);
        for v in x.iter_mut() {
            *v *= p.scale;
        }
        remove_linear_drift(&mut x);
        let fx = zero_phase_low_pass(&x, rate, p.low_band_width)?;
        let stacks = self.find_candidates(&x, &fx, rate, observer);
        let mut events = Vec::new();
        for (s, stack) in stacks.iter().enumerate() {
            let next_rise = stacks.get(s + 1).map(|n| n.members[0].rise);
            let fit = match self.fit_stack(&x, stack, next_rise, rate) {
                Ok(fit) => fit,
                Err(err) => {
                    emit(observer, Verbosity::Detail, || {
                        format!(
                            "stack of {} at {:.4}s discarded: {err}",
                            stack.members.len(),
                            trace.time_at(range.start + stack.members[0].rise)
                        )
                    });
                    continue;
                }
            };
            let segment_time = trace.time_at(range.start + fit.start);
            for (member, component) in stack.members.iter().zip(&fit.components) {
                let onset_time = segment_time + component.onset / rate;
                let tau_decay = component.tau_decay / rate;
                let accepted = component.height > 0.0
                    && tau_decay >= p.min_tau
                    && fit.residual <= p.residual;
                if !accepted {
                    emit(observer, Verbosity::Detail, || {
                        format!(
                            "candidate at {onset_time:.4}s rejected: tau_decay {tau_decay:.2e}s, residual {:.3}",
                            fit.residual
                        )
                    });
                    continue;
                }
                let peak_time = trace.time_at(range.start + member.peak);
                events.push(MiniEvent {
                    onset_time,
                    peak_time,
                    amplitude: component.height / p.scale,
                    rise_time: peak_time - onset_time,
                    tau_decay,
                    tau_rise: component.tau_rise / rate,
                    residual: fit.residual,
                    stack_size: stack.members.len(),
                });
            }
        }
        Ok(MiniTrialResult { events, duration })
    }

    fn find_candidates(
        &self,
        x: &[f64],
        fx: &[f64],
        rate: f64,
        observer: &dyn AnalysisObserver,
    ) -> Vec<Stack> {
        let n = fx.len();
        if n < 3 {
            return Vec::new();
        }
        let p = &self.params;
        let slope = |i: usize| (fx[i + 1] - fx[i]) * rate;
        let rise_slope = p.rise_slope * p.scale;
        let min_amp = p.min_amp * p.scale;
        let max_rise = p.rise_time * rate;
        let stack_win = p.stack_win * rate;
        let baseline_len = ((p.baseline_win * rate).round() as usize).max(1);
        let mut stacks: Vec<Stack> = Vec::new();
        let mut i = 1;
        while i < n - 1 {
            if !(slope(i - 1) <= rise_slope && slope(i) > rise_slope) {
                i += 1;
                continue;
            }
            let rise = i;
            let mut peak = rise;
            while peak < n - 1 && slope(peak) > 0.0 {
                peak += 1;
            }
            i = peak.max(rise + 1);
            if (peak - rise) as f64 > max_rise {
                emit(observer, Verbosity::Trace, || {
                    format!("rise at sample {rise} too slow ({} samples)", peak - rise)
                });
                continue;
            }
            let stacked = stacks
                .last()
                .and_then(|s| s.members.last())
                .map_or(false, |last| ((peak - last.peak) as f64) < stack_win);
            let baseline = match stacks.last() {
                Some(s) if stacked => s.baseline,
                _ => mean(&x[rise.saturating_sub(baseline_len)..rise]),
            };
            let amp = fx[peak] - baseline;
            if amp < min_amp {
                emit(observer, Verbosity::Trace, || {
                    format!("rise at sample {rise} too small ({amp:.3})")
                });
                continue;
            }
            let candidate = Candidate { rise, peak };
            match stacks.last_mut() {
                Some(s) if stacked => s.members.push(candidate),
                _ => stacks.push(Stack {
                    baseline,
                    members: vec![candidate],
                }),
            }
        }
        stacks
    }

    fn fit_stack(
        &self,
        x: &[f64],
        stack: &Stack,
        next_rise: Option<usize>,
        rate: f64,
    ) -> Result<StackFit, AnalysisError> {
        let p = &self.params;
        let margin = (p.rise_time * rate).ceil() as usize;
        let first = stack.members[0];
        let last = stack.members[stack.members.len() - 1];
        let start = first.rise.saturating_sub(margin);
        let tail = (10.0 * p.off_tau_ini).ceil() as usize;
        let mut end = (last.rise + tail).min(x.len());
        if let Some(next) = next_rise {
            end = end.min(next);
        }
        let end = end.max(last.peak + 1).min(x.len());
        let unit_peak = match double_exponential_peak(p.off_tau_ini, p.on_tau_ini) {
            h if h > 0.0 => h,
            _ => 1.0,
        };
        let min_amp = p.min_amp * p.scale;
        let max_rise = margin.max(1) as f64;
        let count = stack.members.len();
        let y = &x[start..end];
        // Seeds in segment samples: amplitude, decay tau, rise tau, onset.
        let mut seeds: Vec<[f64; 4]> = Vec::with_capacity(count);
        let mut iterations = 0;
        let mut previous_peak = start;
        for (k, m) in stack.members.iter().enumerate() {
            let earliest = m.rise.saturating_sub(margin).max(previous_peak) - start;
            let latest = m.peak - start;
            let until = stack.members.get(k + 1).map_or(end, |next| next.rise);
            let until = (until.max(m.peak + 1) - start).max(earliest + 5).min(y.len());
            let t: Vec<f64> = (earliest..until).map(|i| i as f64).collect();
            let own: Vec<f64> = (earliest..until)
                .map(|i| {
                    let earlier: f64 = seeds
                        .iter()
                        .map(|s| double_exponential(s[0], s[1], s[2], s[3], i as f64))
                        .sum();
                    y[i] - stack.baseline - earlier
                })
                .collect();
            let height = own[..=(latest - earliest).min(own.len() - 1)]
                .iter()
                .copied()
                .fold(min_amp, f64::max);
            let onset = ((m.rise - start) as f64 - 1.0).clamp(earliest as f64, latest as f64);
            let bounds = Bounds {
                lower: vec![0.0, TAU_FLOOR, TAU_FLOOR, earliest as f64],
                upper: vec![f64::INFINITY, f64::INFINITY, max_rise, latest as f64],
            };
            let seed = levenberg_marquardt(
                single_component,
                &t,
                &own,
                &[height / unit_peak, p.off_tau_ini, p.on_tau_ini, onset],
                &bounds,
                p.max_iterations,
            )?;
            iterations += seed.iterations;
            seeds.push([seed.params[0], seed.params[1], seed.params[2], seed.params[3]]);
            previous_peak = m.peak;
        }
        let onsets: Vec<f64> = seeds.iter().map(|s| s[3]).collect();
        let mut initial = Vec::with_capacity(count * COMPONENT_PARAMS + 1);
        let mut bounds = Bounds {
            lower: Vec::with_capacity(initial.capacity()),
            upper: Vec::with_capacity(initial.capacity()),
        };
        for s in &seeds {
            initial.extend_from_slice(&s[..COMPONENT_PARAMS]);
            bounds.lower.extend([0.0, TAU_FLOOR, TAU_FLOOR]);
            bounds.upper.extend([f64::INFINITY, f64::INFINITY, max_rise]);
        }
        initial.push(stack.baseline);
        bounds.lower.push(f64::NEG_INFINITY);
        bounds.upper.push(f64::INFINITY);
        let t: Vec<f64> = (0..y.len()).map(|i| i as f64).collect();
        let outcome = levenberg_marquardt(
            |q: &[f64], ti: f64| stack_model(&onsets, q, ti),
            &t,
            y,
            &initial,
            &bounds,
            p.max_iterations,
        )?;
        iterations += outcome.iterations;
        let components: Vec<Component> = outcome
            .params
            .chunks_exact(COMPONENT_PARAMS)
            .zip(&onsets)
            .map(|(c, &onset)| Component {
                onset,
                tau_decay: c[1],
                tau_rise: c[2],
                height: c[0] * double_exponential_peak(c[1], c[2]),
            })
            .collect();
        let largest = components.iter().map(|c| c.height).fold(0.0, f64::max);
        let residual = if largest > 0.0 {
            outcome.rms(y.len()) / largest
        } else {
            f64::INFINITY
        };
        log::trace!(
            "stack of {count} fitted in {iterations} iterations, residual {residual:.4}"
        );
        Ok(StackFit {
            start,
            components,
            residual,
        })
    }
}

impl TraceAnalysis for MiniDetector {
    type Output = MiniTrialResult;
    fn name(&self) -> &'static str {
        "mini detection"
    }
    fn analyze(
        &self,
        trial: &Trial,
        observer: &dyn AnalysisObserver,
    ) -> Result<MiniTrialResult, AnalysisError> {
        self.detect(&trial.trace, observer)
    }
}
