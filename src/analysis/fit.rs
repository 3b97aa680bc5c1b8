//! Bounded Levenberg-Marquardt least squares.
//!
//! Models are plain closures `f(params, t)`. The Jacobian is taken by central
//! differences and the damped normal equations are LU-solved; parameters are
//! projected back into their bounds after each step. A fit has converged when
//! the step or the relative drop in squared error stalls. Every fit runs under
//! an iteration cap; running out of iterations or producing non-finite values
//! is a `FitDivergence`.
use nalgebra::{DMatrix, DVector};

use crate::analysis::AnalysisError;

const LAMBDA_START: f64 = 1e-3;
const LAMBDA_MAX: f64 = 1e16;
const STEP_TOLERANCE: f64 = 1e-8;
const COST_TOLERANCE: f64 = 1e-9;

#[derive(Clone, Debug, PartialEq)]
pub struct Bounds {
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

impl Bounds {
    pub fn unbounded(n: usize) -> Self {
        Self {
            lower: vec![f64::NEG_INFINITY; n],
            upper: vec![f64::INFINITY; n],
        }
    }
    fn project(&self, params: &mut [f64]) {
        for ((p, lo), hi) in params.iter_mut().zip(&self.lower).zip(&self.upper) {
            *p = p.clamp(*lo, *hi);
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FitOutcome {
    pub params: Vec<f64>,
    /// Sum of squared residuals at `params`.
    pub sse: f64,
    pub iterations: usize,
}

impl FitOutcome {
    pub fn rms(&self, points: usize) -> f64 {
        if points == 0 {
            return 0.0;
        }
        (self.sse / points as f64).sqrt()
    }
}

pub fn levenberg_marquardt<F>(
    model: F,
    t: &[f64],
    y: &[f64],
    initial: &[f64],
    bounds: &Bounds,
    max_iterations: usize,
) -> Result<FitOutcome, AnalysisError>
where
    F: Fn(&[f64], f64) -> f64,
{
    let m = initial.len();
    if t.len() != y.len() || t.len() < m {
        return Err(AnalysisError::invalid(
            "fit_window",
            format!("{} points cannot constrain {m} parameters", t.len()),
        ));
    }
    let diverged = |iterations| AnalysisError::FitDivergence { iterations };
    let mut params = initial.to_vec();
    bounds.project(&mut params);
    let mut sse = sum_squares(&model, &params, t, y);
    if !sse.is_finite() {
        return Err(diverged(0));
    }
    let mut lambda = LAMBDA_START;
    for iteration in 1..=max_iterations {
        let jacobian = jacobian(&model, &params, t);
        if jacobian.iter().any(|v| !v.is_finite()) {
            return Err(diverged(iteration));
        }
        let residual = DVector::from_iterator(
            t.len(),
            t.iter().zip(y).map(|(&ti, &yi)| yi - model(&params, ti)),
        );
        let normal = jacobian.tr_mul(&jacobian);
        let gradient = jacobian.tr_mul(&residual);
        loop {
            let mut damped = normal.clone();
            for k in 0..m {
                damped[(k, k)] += lambda * normal[(k, k)].max(1e-12);
            }
            let step = damped
                .lu()
                .solve(&gradient)
                .filter(|step| step.iter().all(|v| v.is_finite()));
            let candidate = step.as_ref().map(|step| {
                let mut next: Vec<f64> = params.iter().zip(step.iter()).map(|(p, d)| p + d).collect();
                bounds.project(&mut next);
                let next_sse = sum_squares(&model, &next, t, y);
                (next, next_sse)
            });
            match candidate {
                Some((next, next_sse)) if next_sse.is_finite() && next_sse <= sse => {
                    let step_norm = norm(next.iter().zip(&params).map(|(a, b)| a - b));
                    let param_norm = norm(params.iter().copied());
                    let improvement = sse - next_sse;
                    params = next;
                    let converged = step_norm <= STEP_TOLERANCE * (param_norm + STEP_TOLERANCE)
                        || improvement <= COST_TOLERANCE * sse
                        || next_sse == 0.0;
                    sse = next_sse;
                    if converged {
                        return Ok(FitOutcome {
                            params,
                            sse,
                            iterations: iteration,
                        });
                    }
                    lambda = (lambda * 0.1).max(1e-12);
                    break;
                }
                _ => {
                    lambda *= 10.0;
                    if lambda > LAMBDA_MAX {
                        // No downhill step left: stationary point.
                        return Ok(FitOutcome {
                            params,
                            sse,
                            iterations: iteration,
                        });
                    }
                }
            }
        }
    }
    Err(diverged(max_iterations))
}

fn sum_squares<F: Fn(&[f64], f64) -> f64>(model: &F, params: &[f64], t: &[f64], y: &[f64]) -> f64 {
    t.iter()
        .zip(y)
        .map(|(&ti, &yi)| {
            let r = yi - model(params, ti);
            r * r
        })
        .sum()
}

fn jacobian<F: Fn(&[f64], f64) -> f64>(model: &F, params: &[f64], t: &[f64]) -> DMatrix<f64> {
    let mut out = DMatrix::<f64>::zeros(t.len(), params.len());
    let mut shifted = params.to_vec();
    for j in 0..params.len() {
        let h = 1e-6 * params[j].abs().max(1e-3);
        for (i, &ti) in t.iter().enumerate() {
            shifted[j] = params[j] + h;
            let up = model(&shifted, ti);
            shifted[j] = params[j] - h;
            let down = model(&shifted, ti);
            out[(i, j)] = (up - down) / (2.0 * h);
        }
        shifted[j] = params[j];
    }
    out
}

fn norm(values: impl Iterator<Item = f64>) -> f64 {
    values.map(|v| v * v).sum::<f64>().sqrt()
}

/// `xs + (x0 - xs) * exp(-t / tau)`, time in samples.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ExpDecay {
    pub x0: f64,
    pub tau: f64,
    pub xs: f64,
}

impl ExpDecay {
    pub fn eval(&self, t: f64) -> f64 {
        exp_decay(&[self.x0, self.tau, self.xs], t)
    }
}

fn exp_decay(p: &[f64], t: f64) -> f64 {
    p[2] + (p[0] - p[2]) * (-t / p[1]).exp()
}

/// Fits a single exponential relaxation to `samples` (index = time in samples).
/// Seeds from the first/last values and the first 1/e crossing.
pub fn fit_exp_decay(samples: &[f64], max_iterations: usize) -> Result<ExpDecay, AnalysisError> {
    if samples.len() < 4 {
        return Err(AnalysisError::invalid(
            "fit_window",
            format!("needs at least 4 samples, got {}", samples.len()),
        ));
    }
    let first = samples[0];
    let last = samples[samples.len() - 1];
    let target = (first - last).abs() / std::f64::consts::E;
    let tau_guess = samples
        .iter()
        .position(|v| (v - last).abs() < target)
        .unwrap_or(samples.len() / 3)
        .max(1) as f64;
    let t: Vec<f64> = (0..samples.len()).map(|i| i as f64).collect();
    let mut bounds = Bounds::unbounded(3);
    bounds.lower[1] = 1e-6;
    let outcome = levenberg_marquardt(
        exp_decay,
        &t,
        samples,
        &[first, tau_guess, last],
        &bounds,
        max_iterations,
    )?;
    Ok(ExpDecay {
        x0: outcome.params[0],
        tau: outcome.params[1],
        xs: outcome.params[2],
    })
}

/// `a * (exp(-(t - t0) / tau_decay) - exp(-(t - t0) / tau_rise))` for `t >= t0`.
pub fn double_exponential(a: f64, tau_decay: f64, tau_rise: f64, onset: f64, t: f64) -> f64 {
    let dt = t - onset;
    if dt <= 0.0 {
        return 0.0;
    }
    a * ((-dt / tau_decay).exp() - (-dt / tau_rise).exp())
}

/// Height of the unit-amplitude double exponential at its maximum.
pub fn double_exponential_peak(tau_decay: f64, tau_rise: f64) -> f64 {
    // Equal constants cancel exactly.
    if (tau_decay - tau_rise).abs() < 1e-12 * tau_decay.max(tau_rise) {
        return 0.0;
    }
    let t_peak = (tau_decay / tau_rise).ln() * tau_decay * tau_rise / (tau_decay - tau_rise);
    (-t_peak / tau_decay).exp() - (-t_peak / tau_rise).exp()
}
