//! Passive membrane properties from step responses.
//!
//! Seal test: a small command step (`ampV` in voltage clamp, `ampI` in current
//! clamp) whose relaxation is fitted by `xs + (x0 - xs) * exp(-t / tau)`.
//! - voltage clamp: Rs = ampV / (x0 - baseline), Rin = ampV / (xs - baseline) - Rs,
//!   Cm = tau * (Rin + Rs) / (Rin * Rs)
//! - current clamp: Rs = (x0 - baseline) / ampI, Rin = (xs - baseline) / ampI - Rs,
//!   Cm = tau / Rin
//!
//! Subthreshold steps use the trial's own stimulation amplitude and take Rin
//! from the measured steady state instead of the fitted asymptote.
//!
//! Fits run on the trace multiplied by `scaleV`/`scaleI`; everything reported
//! is back in recorded units.
use ndarray::Array1;

use crate::analysis::filter::{median_filter, threshold_median};
use crate::analysis::fit::fit_exp_decay;
use crate::analysis::{AnalysisError, TraceAnalysis};
use crate::observer::{emit, AnalysisObserver, Verbosity};
use crate::params::{IvParams, SealTestParams, SubthresholdParams};
use crate::table::{Table, Value};
use crate::types::{mean, same_amplitude, Cell, ClampMode, PassiveFitResult, Trace, Trial};

/// Fitted relaxation in recorded units, tau in seconds.
#[derive(Clone, Copy, Debug)]
struct Relaxation {
    x0: f64,
    xs: f64,
    tau: f64,
}

fn fit_relaxation(
    trace: &Trace,
    start: usize,
    end_time: f64,
    scale: f64,
    max_iterations: usize,
) -> Result<Relaxation, AnalysisError> {
    let range = trace.window_range(trace.time_at(start), end_time)?;
    let scaled: Vec<f64> = trace.samples()[range].iter().map(|v| v * scale).collect();
    let decay = fit_exp_decay(&scaled, max_iterations)?;
    Ok(Relaxation {
        x0: decay.x0 / scale,
        xs: decay.xs / scale,
        tau: decay.tau * trace.sample_interval(),
    })
}

/// Input resistance from a steady-state deflection alone.
fn steady_state_resistance(clamp: ClampMode, amp: f64, delta: f64) -> f64 {
    match clamp {
        ClampMode::Voltage => amp / delta,
        ClampMode::Current => delta / amp,
    }
}

pub fn fit_seal_test(
    trace: &Trace,
    clamp: ClampMode,
    params: &SealTestParams,
) -> Result<PassiveFitResult, AnalysisError> {
    let baseline = trace.window_mean(params.baseline_start, params.baseline_end)?;
    let steady_state = trace.window_mean(params.steady_state_start, params.steady_state_end)?;
    let (amp, scale) = match clamp {
        ClampMode::Voltage => (params.amp_v, params.scale_v),
        ClampMode::Current => (params.amp_i, params.scale_i),
    };
    if params.comp {
        return Ok(PassiveFitResult {
            baseline,
            steady_state,
            tau: None,
            input_resistance: steady_state_resistance(clamp, amp, steady_state - baseline),
            access_resistance: None,
            capacitance: None,
            sag: None,
            stim_amplitude: amp,
            fit_accepted: false,
        });
    }
    let start = match clamp {
        // Capacitive transient peak
        ClampMode::Voltage => {
            let range = trace.window_range(params.seal_test_start, params.steady_state_start)?;
            let sign = amp.signum();
            let offset = trace.samples()[range.clone()]
                .iter()
                .enumerate()
                .max_by(|a, b| (a.1 * sign).total_cmp(&(b.1 * sign)))
                .map(|(i, _)| i)
                .unwrap_or(0);
            range.start + offset
        }
        ClampMode::Current => trace.window_range(params.seal_test_start, params.fit_end)?.start,
    };
    let fit = fit_relaxation(trace, start, params.fit_end, scale, params.max_iterations)?;
    if fit.tau < params.min_tau {
        return Err(AnalysisError::rejected(format!(
            "tau {:.3e}s below minimum {:.3e}s",
            fit.tau, params.min_tau
        )));
    }
    let (rs, rin, cm) = match clamp {
        ClampMode::Voltage => {
            let rs = amp / (fit.x0 - baseline);
            let rin = amp / (fit.xs - baseline) - rs;
            (rs, rin, fit.tau * (rin + rs) / (rin * rs))
        }
        ClampMode::Current => {
            let rs = (fit.x0 - baseline) / amp;
            let rin = (fit.xs - baseline) / amp - rs;
            (rs, rin, fit.tau / rin)
        }
    };
    Ok(PassiveFitResult {
        baseline,
        steady_state,
        tau: Some(fit.tau),
        input_resistance: rin,
        access_resistance: Some(rs),
        capacitance: Some(cm),
        sag: None,
        stim_amplitude: amp,
        fit_accepted: true,
    })
}

/// Subthreshold step response of one trial. A fit whose tau falls below
/// `minTau` is ignored and the trial keeps its steady-state Rin and sag.
pub fn fit_subthreshold(
    trial: &Trial,
    params: &SubthresholdParams,
) -> Result<PassiveFitResult, AnalysisError> {
    let meta = &trial.metadata;
    let amp = meta.stim_amplitude;
    if amp == 0.0 || !amp.is_finite() {
        return Err(AnalysisError::invalid(
            "stim_amplitude",
            format!("subthreshold analysis needs a non-zero step, got {amp}"),
        ));
    }
    let trace = median_filter(&trial.trace, params.median_window, params.median_threshold)?;
    let t0 = meta.stim_start;
    let baseline = trace.window_mean(t0 + params.baseline_start, t0 + params.baseline_end)?;
    let steady_state =
        trace.window_mean(t0 + params.steady_state_start, t0 + params.steady_state_end)?;
    let sign = amp.signum();
    let sag_window = trace.window(t0 + params.fit_end, t0 + params.steady_state_start)?;
    let directed = sag_window.iter().map(|v| v * sign);
    let extreme = sign
        * match meta.clamp {
            ClampMode::Voltage => directed.fold(f64::INFINITY, f64::min),
            ClampMode::Current => directed.fold(f64::NEG_INFINITY, f64::max),
        };
    let sag = (extreme - steady_state) / (baseline - steady_state);
    let steady_rin = steady_state_resistance(meta.clamp, amp, steady_state - baseline);
    let mut result = PassiveFitResult {
        baseline,
        steady_state,
        tau: None,
        input_resistance: steady_rin,
        access_resistance: None,
        capacitance: None,
        sag: Some(sag),
        stim_amplitude: amp,
        fit_accepted: false,
    };
    if params.comp {
        return Ok(result);
    }
    let scale = match meta.clamp {
        ClampMode::Voltage => params.scale_v,
        ClampMode::Current => params.scale_i,
    };
    let start = trace.window_range(t0 + params.fit_start, t0 + params.fit_end)?.start;
    let fit = fit_relaxation(&trace, start, t0 + params.fit_end, scale, params.max_iterations)?;
    if fit.tau < params.min_tau {
        log::debug!(
            "trial {}: tau {:.3e}s below {:.3e}s, keeping steady-state values",
            meta.trial,
            fit.tau,
            params.min_tau
        );
        return Ok(result);
    }
    let (rs, rin, cm) = match meta.clamp {
        ClampMode::Voltage => {
            let rs = amp / (fit.x0 - baseline);
            let rin = steady_rin - rs;
            (rs, rin, fit.tau * (rin + rs) / (rin * rs))
        }
        ClampMode::Current => {
            let rs = (fit.x0 - baseline) / amp;
            let rin = steady_rin - rs;
            (rs, rin, fit.tau / rin)
        }
    };
    result.tau = Some(fit.tau);
    result.input_resistance = rin;
    result.access_resistance = Some(rs);
    result.capacitance = Some(cm);
    result.fit_accepted = true;
    Ok(result)
}

/// Runs [`fit_subthreshold`] over a stimulation series, one outcome per trial.
pub fn fit_subthreshold_series<'a, I>(
    trials: I,
    params: &SubthresholdParams,
) -> Vec<(u32, f64, Result<PassiveFitResult, AnalysisError>)>
where
    I: IntoIterator<Item = &'a Trial>,
{
    trials
        .into_iter()
        .map(|trial| {
            let meta = &trial.metadata;
            (meta.trial, meta.stim_amplitude, fit_subthreshold(trial, params))
        })
        .collect()
}

pub struct SealTestAnalysis {
    pub params: SealTestParams,
}

impl TraceAnalysis for SealTestAnalysis {
    type Output = PassiveFitResult;
    fn name(&self) -> &'static str {
        "seal test"
    }
    fn analyze(
        &self,
        trial: &Trial,
        observer: &dyn AnalysisObserver,
    ) -> Result<PassiveFitResult, AnalysisError> {
        let result = fit_seal_test(&trial.trace, trial.metadata.clamp, &self.params);
        if let Err(err) = &result {
            emit(observer, Verbosity::Detail, || {
                format!("seal test trial {}: {err}", trial.metadata.trial)
            });
        }
        result
    }
}

pub struct SubthresholdAnalysis {
    pub params: SubthresholdParams,
}

impl TraceAnalysis for SubthresholdAnalysis {
    type Output = PassiveFitResult;
    fn name(&self) -> &'static str {
        "subthreshold"
    }
    fn analyze(
        &self,
        trial: &Trial,
        observer: &dyn AnalysisObserver,
    ) -> Result<PassiveFitResult, AnalysisError> {
        let result = fit_subthreshold(trial, &self.params)?;
        if !result.fit_accepted && !self.params.comp {
            emit(observer, Verbosity::Detail, || {
                format!("subthreshold trial {}: fit ignored", trial.metadata.trial)
            });
        }
        Ok(result)
    }
}

fn selected<'a>(cells: &'a [Cell], ids: &'a [u32]) -> impl Iterator<Item = &'a Cell> + 'a {
    cells.iter().filter(move |c| ids.is_empty() || ids.contains(&c.id))
}

/// Per-(cell, amplitude) groups of values, in first-seen order.
fn push_grouped(groups: &mut Vec<(f64, Vec<f64>)>, amp: f64, value: f64) {
    match groups.iter_mut().find(|(a, _)| same_amplitude(*a, amp)) {
        Some((_, values)) => values.push(value),
        None => groups.push((amp, vec![value])),
    }
}

/// Response amplitude against stimulation amplitude, averaged per cell.
/// Trials whose windows fall outside the trace are skipped.
pub fn iv_curve(cells: &[Cell], protocol: &str, cell_ids: &[u32], params: &IvParams) -> Table {
    let mut table = Table::with_columns(&["cell", "type", "stim", "response", "trials"]);
    for cell in selected(cells, cell_ids) {
        let mut groups = Vec::new();
        for trial in cell.trials_in(protocol) {
            let t0 = trial.metadata.stim_start;
            let response = trial
                .trace
                .window_mean(t0 + params.baseline.0, t0 + params.baseline.1)
                .and_then(|baseline| {
                    let window = trial.trace.window(t0 + params.window.0, t0 + params.window.1)?;
                    Ok(params.measure.apply(window) - baseline)
                });
            match response {
                Ok(value) => push_grouped(&mut groups, trial.metadata.stim_amplitude, value),
                Err(err) => log::warn!("cell {} trial {}: {err}", cell.id, trial.metadata.trial),
            }
        }
        groups.sort_by(|a, b| a.0.total_cmp(&b.0));
        for (amp, values) in groups {
            table.push([
                ("cell", Value::from(cell.id)),
                ("type", Value::from(cell.cell_type.as_deref())),
                ("stim", Value::from(amp)),
                ("response", Value::from(mean(&values))),
                ("trials", Value::from(values.len())),
            ]);
        }
    }
    table
}

/// Baseline-normalized, median-filtered average of the trials at one amplitude.
/// Trials whose length differs from the first usable one are left out.
fn mean_response<'a, I>(
    trials: I,
    params: &SubthresholdParams,
) -> Option<(Array1<f64>, &'a Trial)>
where
    I: IntoIterator<Item = &'a Trial>,
{
    let mut sum: Option<Array1<f64>> = None;
    let mut first: Option<&'a Trial> = None;
    let mut count = 0usize;
    for trial in trials {
        let t0 = trial.metadata.stim_start;
        let baseline = match trial
            .trace
            .window_mean(t0 + params.baseline_start, t0 + params.baseline_end)
        {
            Ok(b) => b,
            Err(err) => {
                log::warn!("trial {}: {err}", trial.metadata.trial);
                continue;
            }
        };
        let filtered = Array1::from(threshold_median(
            trial.trace.samples(),
            params.median_window,
            params.median_threshold,
        )) - baseline;
        if let Some(acc) = sum.as_mut() {
            if acc.len() != filtered.len() {
                log::warn!(
                    "trial {}: {} samples where trial {} has {}, left out of the average",
                    trial.metadata.trial,
                    filtered.len(),
                    first.map_or(0, |t| t.metadata.trial),
                    acc.len()
                );
                continue;
            }
            *acc += &filtered;
        } else {
            sum = Some(filtered);
            first = Some(trial);
        }
        count += 1;
    }
    Some((sum? / count as f64, first?))
}

/// Trials of `cell` under `protocol` stimulated at `amp`.
fn at_amplitude<'a>(cell: &'a Cell, protocol: &str, amp: f64) -> Vec<&'a Trial> {
    cell.trials_in(protocol)
        .filter(|t| same_amplitude(t.metadata.stim_amplitude, amp))
        .collect()
}

/// Difference (protocol1 - protocol0) of the averaged responses at each
/// amplitude recorded under `protocol0`, measured over the steady-state window.
pub fn subtract_protocols(
    cells: &[Cell],
    protocol0: &str,
    protocol1: &str,
    cell_ids: &[u32],
    stims: &[f64],
    params: &SubthresholdParams,
) -> Table {
    let mut table = Table::with_columns(&["cell", "type", "stim", "amp"]);
    for cell in selected(cells, cell_ids) {
        let mut amplitudes: Vec<f64> = Vec::new();
        for trial in cell.trials_in(protocol0) {
            let amp = trial.metadata.stim_amplitude;
            let wanted = stims.is_empty() || stims.iter().any(|s| same_amplitude(*s, amp));
            if wanted && !amplitudes.iter().any(|a| same_amplitude(*a, amp)) {
                amplitudes.push(amp);
            }
        }
        amplitudes.sort_by(f64::total_cmp);
        for amp in amplitudes {
            let before = mean_response(at_amplitude(cell, protocol0, amp), params);
            let after = mean_response(at_amplitude(cell, protocol1, amp), params);
            let ((before, reference), (after, _)) = match (before, after) {
                (Some(b), Some(a)) => (b, a),
                _ => {
                    log::warn!(
                        "cell {}: no usable {protocol0}/{protocol1} pair at {amp:.3e}",
                        cell.id
                    );
                    continue;
                }
            };
            if after.len() != before.len() {
                log::warn!(
                    "cell {}: {protocol1} averages {} samples against {} in {protocol0} at {amp:.3e}",
                    cell.id,
                    after.len(),
                    before.len()
                );
                continue;
            }
            let diff_trace = reference.trace.with_samples((&after - &before).to_vec());
            let t0 = reference.metadata.stim_start;
            match diff_trace
                .window_mean(t0 + params.steady_state_start, t0 + params.steady_state_end)
            {
                Ok(value) => table.push([
                    ("cell", Value::from(cell.id)),
                    ("type", Value::from(cell.cell_type.as_deref())),
                    ("stim", Value::from(amp)),
                    ("amp", Value::from(value)),
                ]),
                Err(err) => log::warn!("cell {}: {err}", cell.id),
            }
        }
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TrialMetadata;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::f64::consts::PI;

    fn gaussian(rng: &mut StdRng, sigma: f64) -> f64 {
        let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = rng.gen();
        sigma * (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
    }

    /// Current-clamp step at `step` samples: V jumps by amp*Rs, then relaxes
    /// towards amp*(Rs + Rin) with time constant tau.
    fn cc_step(n: usize, dt: f64, step: usize, amp: f64, rs: f64, rin: f64, tau: f64) -> Vec<f64> {
        (0..n)
            .map(|i| {
                if i < step {
                    -0.07
                } else {
                    let s = (i - step) as f64 * dt;
                    -0.07 + amp * rs + amp * rin * (1.0 - (-s / tau).exp())
                }
            })
            .collect()
    }

    fn cc_params() -> SealTestParams {
        SealTestParams::default()
    }

    #[test]
    fn voltage_clamp_recovers_rs_rin_cm() {
        let (dt, rs, rin, tau) = (1e-5, 10e6, 200e6, 2e-3);
        let amp = -0.005;
        let (peak, steady) = (amp / rs, amp / (rs + rin));
        let samples: Vec<f64> = (0..25_000)
            .map(|i| {
                let hold = -20e-12;
                if i < 5000 {
                    hold
                } else {
                    let s = (i - 5000) as f64 * dt;
                    hold + steady + (peak - steady) * (-s / tau).exp()
                }
            })
            .collect();
        let trace = Trace::new(samples, dt, 0.0).unwrap();
        let r = fit_seal_test(&trace, ClampMode::Voltage, &SealTestParams::default()).unwrap();
        assert!(r.fit_accepted);
        assert!((r.access_resistance.unwrap() / rs - 1.0).abs() < 0.01);
        assert!((r.input_resistance / rin - 1.0).abs() < 0.01);
        let cm = tau * (rin + rs) / (rin * rs);
        assert!((r.capacitance.unwrap() / cm - 1.0).abs() < 0.02);
        assert!((r.tau.unwrap() / tau - 1.0).abs() < 0.01);
        assert!((r.baseline + 20e-12).abs() < 1e-15);
    }

    #[test]
    fn current_clamp_tau_within_five_percent_under_noise() {
        let (dt, tau) = (1e-4, 20e-3);
        let mut rng = StdRng::seed_from_u64(7);
        let samples: Vec<f64> = cc_step(2500, dt, 500, -25e-12, 10e6, 400e6, tau)
            .into_iter()
            .map(|v| v + gaussian(&mut rng, 5e-5))
            .collect();
        let trace = Trace::new(samples, dt, 0.0).unwrap();
        let r = fit_seal_test(&trace, ClampMode::Current, &cc_params()).unwrap();
        assert!((r.tau.unwrap() / tau - 1.0).abs() < 0.05, "tau {:?}", r.tau);
        assert!((r.input_resistance / 400e6 - 1.0).abs() < 0.05);
        assert!((r.capacitance.unwrap() - r.tau.unwrap() / r.input_resistance).abs() < 1e-15);
    }

    #[test]
    fn fast_relaxation_is_rejected() {
        let trace = Trace::new(cc_step(2500, 1e-4, 500, -25e-12, 10e6, 400e6, 5e-4), 1e-4, 0.0)
            .unwrap();
        let err = fit_seal_test(&trace, ClampMode::Current, &cc_params()).unwrap_err();
        assert!(matches!(err, AnalysisError::ToleranceRejected { .. }));
        assert!(err.is_exclusion());
    }

    #[test]
    fn compensated_seal_test_uses_steady_state_only() {
        let trace = Trace::new(cc_step(2500, 1e-4, 500, -25e-12, 0.0, 400e6, 5e-3), 1e-4, 0.0)
            .unwrap();
        let params = SealTestParams {
            comp: true,
            ..cc_params()
        };
        let r = fit_seal_test(&trace, ClampMode::Current, &params).unwrap();
        assert!(!r.fit_accepted);
        assert_eq!(r.tau, None);
        assert_eq!(r.access_resistance, None);
        assert!((r.input_resistance / 400e6 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn seal_test_window_outside_trace() {
        let trace = Trace::new(vec![0.0; 1000], 1e-4, 0.0).unwrap();
        let err = fit_seal_test(&trace, ClampMode::Current, &cc_params()).unwrap_err();
        assert!(matches!(err, AnalysisError::InsufficientWindow { .. }));
    }

    fn step_trial(samples: Vec<f64>, amp: f64, trial: u32, protocol: &str) -> Trial {
        Trial {
            trace: Trace::new(samples, 1e-4, 0.0).unwrap(),
            metadata: TrialMetadata {
                clamp: ClampMode::Current,
                stim_amplitude: amp,
                stim_start: 0.1,
                stim_end: 0.9,
                protocol: protocol.into(),
                trial,
            },
        }
    }

    /// Hyperpolarizing response with a slow depolarizing sag component.
    fn sag_response(amp: f64, rin: f64, tau: f64, sag: f64) -> Vec<f64> {
        (0..10_000)
            .map(|i| {
                if i < 1000 {
                    -0.07
                } else {
                    let s = (i - 1000) as f64 * 1e-4;
                    -0.07 + amp * rin * (1.0 - (-s / tau).exp()) + sag * (1.0 - (-s / 0.15).exp())
                }
            })
            .collect()
    }

    #[test]
    fn subthreshold_recovers_tau_and_rin() {
        let trial = step_trial(sag_response(-50e-12, 200e6, 10e-3, 0.0), -50e-12, 1, "sub");
        let r = fit_subthreshold(&trial, &SubthresholdParams::default()).unwrap();
        assert!(r.fit_accepted);
        assert!((r.tau.unwrap() / 10e-3 - 1.0).abs() < 0.05, "tau {:?}", r.tau);
        let total = r.input_resistance + r.access_resistance.unwrap();
        assert!((total / 200e6 - 1.0).abs() < 0.01);
        assert!((r.capacitance.unwrap() - r.tau.unwrap() / r.input_resistance).abs() < 1e-15);
    }

    #[test]
    fn subthreshold_sag_uses_extreme_before_steady_state() {
        let trial = step_trial(sag_response(-50e-12, 200e6, 10e-3, 0.003), -50e-12, 1, "sub");
        let params = SubthresholdParams {
            comp: true,
            ..SubthresholdParams::default()
        };
        let r = fit_subthreshold(&trial, &params).unwrap();
        let samples = trial.trace.samples();
        let trough = samples[1070..7000].iter().copied().fold(f64::INFINITY, f64::min);
        let expected = (trough - r.steady_state) / (r.baseline - r.steady_state);
        assert!((r.sag.unwrap() - expected).abs() < 1e-5);
        assert!(trough < r.steady_state);
        assert!((r.input_resistance - (r.steady_state - r.baseline) / -50e-12).abs() < 1.0);
    }

    #[test]
    fn subthreshold_fit_below_min_tau_is_ignored() {
        let trial = step_trial(sag_response(-50e-12, 200e6, 10e-3, 0.0), -50e-12, 1, "sub");
        let params = SubthresholdParams {
            min_tau: 0.5,
            ..SubthresholdParams::default()
        };
        let r = fit_subthreshold(&trial, &params).unwrap();
        assert!(!r.fit_accepted);
        assert_eq!(r.tau, None);
        assert_eq!(r.access_resistance, None);
        assert_eq!(r.capacitance, None);
        let steady = fit_subthreshold(
            &trial,
            &SubthresholdParams {
                comp: true,
                ..params.clone()
            },
        )
        .unwrap();
        assert_eq!(r.input_resistance, steady.input_resistance);
        assert_eq!(r.sag, steady.sag);
        assert!((r.input_resistance / 200e6 - 1.0).abs() < 0.01);
        let analysis = SubthresholdAnalysis { params };
        let via_trait = analysis.analyze(&trial, &crate::observer::SilentObserver).unwrap();
        assert!(!via_trait.fit_accepted);
    }

    #[test]
    fn subthreshold_needs_a_step() {
        let trial = step_trial(vec![-0.07; 10_000], 0.0, 1, "sub");
        assert!(matches!(
            fit_subthreshold(&trial, &SubthresholdParams::default()),
            Err(AnalysisError::InvalidParameter { .. })
        ));
        let series = fit_subthreshold_series([&trial], &SubthresholdParams::default());
        assert_eq!(series.len(), 1);
        assert!(series[0].2.is_err());
    }

    fn flat_step(level: f64, trial: u32, amp: f64, protocol: &str) -> Trial {
        let samples = (0..10_000)
            .map(|i| if i < 1000 { -0.07 } else { -0.07 + level })
            .collect();
        step_trial(samples, amp, trial, protocol)
    }

    #[test]
    fn iv_curve_averages_per_amplitude() {
        let cell = Cell {
            id: 4,
            cell_type: Some("pyr".into()),
            trials: vec![
                flat_step(-0.004, 1, -20e-12, "iv"),
                flat_step(-0.006, 2, -20e-12, "iv"),
                flat_step(0.003, 3, 10e-12, "iv"),
                flat_step(0.5, 4, 10e-12, "other"),
            ],
        };
        let table = iv_curve(&[cell], "iv", &[], &IvParams::default());
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows[0]["stim"], Value::from(-20e-12));
        assert!((table.rows[0]["response"].as_f64().unwrap() + 0.005).abs() < 1e-12);
        assert_eq!(table.rows[0]["trials"], Value::from(2usize));
        assert!((table.rows[1]["response"].as_f64().unwrap() - 0.003).abs() < 1e-12);
        assert_eq!(table.rows[1]["type"], Value::from("pyr"));
    }

    #[test]
    fn subtraction_isolates_added_component() {
        let cell = Cell {
            id: 1,
            cell_type: None,
            trials: vec![
                flat_step(-0.010, 1, -50e-12, "ctrl"),
                flat_step(-0.012, 2, -50e-12, "ctrl"),
                flat_step(-0.014, 3, -50e-12, "drug"),
                flat_step(0.005, 4, 20e-12, "ctrl"),
            ],
        };
        let table = subtract_protocols(
            &[cell],
            "ctrl",
            "drug",
            &[],
            &[],
            &SubthresholdParams::default(),
        );
        assert_eq!(table.len(), 1);
        assert!((table.rows[0]["amp"].as_f64().unwrap() + 0.003).abs() < 1e-12);
        assert_eq!(table.rows[0]["stim"], Value::from(-50e-12));
    }

    #[test]
    fn mismatched_trial_lengths_are_left_out_of_the_average() {
        let short = step_trial(
            (0..8000).map(|i| if i < 1000 { -0.07 } else { -0.09 }).collect(),
            -50e-12,
            3,
            "ctrl",
        );
        let trials = [
            flat_step(-0.010, 1, -50e-12, "ctrl"),
            short,
            flat_step(-0.012, 2, -50e-12, "ctrl"),
        ];
        let (avg, reference) = mean_response(&trials, &SubthresholdParams::default()).unwrap();
        assert_eq!(avg.len(), 10_000);
        assert_eq!(reference.metadata.trial, 1);
        assert!((avg[9000] + 0.011).abs() < 1e-12);

        let cell = Cell {
            id: 2,
            cell_type: None,
            trials: vec![
                flat_step(-0.010, 1, -50e-12, "ctrl"),
                step_trial(
                    (0..8000).map(|i| if i < 1000 { -0.07 } else { -0.08 }).collect(),
                    -50e-12,
                    2,
                    "drug",
                ),
            ],
        };
        let table = subtract_protocols(
            &[cell],
            "ctrl",
            "drug",
            &[],
            &[],
            &SubthresholdParams::default(),
        );
        assert!(table.is_empty());
    }
}
