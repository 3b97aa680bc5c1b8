//! Action potential detection in current-clamp step responses.
//!
//! A spike starts where dV/dt crosses the slope threshold upwards inside the
//! stimulation window and peaks at the first slope reversal after that. A rise
//! already above threshold when the window opens starts at the window's first
//! sample. A spike is kept when its height over the onset voltage beats the
//! peak threshold and its full width at half height is within the half-width
//! threshold. Scanning resumes at the peak, so one rising edge yields at most
//! one spike.
use serde::Serialize;

use crate::analysis::{AnalysisError, TraceAnalysis};
use crate::observer::{emit, AnalysisObserver, Verbosity};
use crate::params::SpikeParams;
use crate::types::{mean, ActionPotentialEvent, Trace, Trial, TrialMetadata};

/// Spikes of one trial plus the trial-level measures derived from them.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SpikeTrainResult {
    pub events: Vec<ActionPotentialEvent>,
    /// Spike count over stimulation duration (Hz).
    pub rate: f64,
    pub stim_amplitude: f64,
    pub sahp: f64,
    /// mAHP following the last spike.
    pub mahp: Option<f64>,
}

pub struct SpikeDetector {
    params: SpikeParams,
}

struct Candidate {
    onset: usize,
    peak: usize,
    amplitude: f64,
    max_slope: f64,
    /// Fractional sample positions of the half-height crossings.
    half_left: f64,
    half_right: f64,
}

impl SpikeDetector {
    pub fn new(params: SpikeParams) -> Self {
        Self { params }
    }
    pub fn params(&self) -> &SpikeParams {
        &self.params
    }

    pub fn detect(
        &self,
        trace: &Trace,
        metadata: &TrialMetadata,
    ) -> Result<Vec<ActionPotentialEvent>, AnalysisError> {
        let range = trace.window_range(metadata.stim_start, metadata.stim_end)?;
        let x: Vec<f64> = trace.samples().iter().map(|v| v * self.params.sign).collect();
        let candidates = self.scan(&x, trace.sample_rate(), range);
        Ok(self.to_events(trace, metadata, &x, &candidates))
    }

    fn scan(&self, x: &[f64], rate: f64, range: std::ops::Range<usize>) -> Vec<Candidate> {
        let n = x.len();
        if n < 3 {
            return Vec::new();
        }
        let slope = |i: usize| (x[i + 1] - x[i]) * rate;
        let threshold = self.params.slope_threshold;
        let limit = range.end.min(n - 1);
        let mut accepted = Vec::new();
        let mut i = range.start;
        while i < limit {
            let crossing =
                slope(i) > threshold && (i == range.start || slope(i - 1) <= threshold);
            if !crossing {
                i += 1;
                continue;
            }
            let onset = i;
            let mut peak = onset;
            let mut max_slope = f64::MIN;
            while peak < n - 1 && slope(peak) >= 0.0 {
                max_slope = max_slope.max(slope(peak));
                peak += 1;
            }
            let amplitude = x[peak] - x[onset];
            if amplitude > self.params.peak_threshold {
                if let Some((half_left, half_right)) = half_crossings(x, onset, peak) {
                    let width = (half_right - half_left) / rate;
                    if width <= self.params.half_width_threshold {
                        accepted.push(Candidate {
                            onset,
                            peak,
                            amplitude,
                            max_slope,
                            half_left,
                            half_right,
                        });
                    } else {
                        log::trace!("candidate at sample {onset} too wide ({width:.5}s)");
                    }
                }
            }
            i = peak.max(onset + 1);
        }
        accepted
    }

    fn to_events(
        &self,
        trace: &Trace,
        metadata: &TrialMetadata,
        x: &[f64],
        candidates: &[Candidate],
    ) -> Vec<ActionPotentialEvent> {
        let dt = trace.sample_interval();
        let position_time = |pos: f64| trace.start_time() + pos * dt;
        let peak_times: Vec<f64> = candidates.iter().map(|c| trace.time_at(c.peak)).collect();
        candidates
            .iter()
            .enumerate()
            .map(|(k, c)| {
                let neighbour = if k > 0 {
                    Some(peak_times[k] - peak_times[k - 1])
                } else if candidates.len() > 1 {
                    Some(peak_times[1] - peak_times[0])
                } else {
                    None
                };
                let spike_end = position_time(c.half_right);
                let mut window_end = spike_end + self.params.mahp_end;
                if let Some(next) = candidates.get(k + 1) {
                    window_end = window_end.min(trace.time_at(next.onset));
                }
                let mahp = clipped_mean(trace, x, spike_end + self.params.mahp_begin, window_end)
                    .map(|m| x[c.onset] - m);
                let onset_time = trace.time_at(c.onset);
                ActionPotentialEvent {
                    onset_time,
                    peak_time: peak_times[k],
                    amplitude: c.amplitude,
                    threshold: x[c.onset] * self.params.sign,
                    half_width: (c.half_right - c.half_left) * dt,
                    max_slope: c.max_slope,
                    latency: onset_time - metadata.stim_start,
                    instantaneous_rate: neighbour.filter(|isi| *isi > 0.0).map(|isi| 1.0 / isi),
                    mahp,
                }
            })
            .collect()
    }

    pub fn analyze_trial(&self, trial: &Trial) -> Result<SpikeTrainResult, AnalysisError> {
        let meta = &trial.metadata;
        let duration = meta.stim_duration();
        if duration <= 0.0 {
            return Err(AnalysisError::invalid(
                "stim_end",
                format!("stimulation must end after it starts ({duration}s)"),
            ));
        }
        let events = self.detect(&trial.trace, meta)?;
        let trace = &trial.trace;
        let sign = self.params.sign;
        let baseline =
            sign * trace.window_mean(meta.stim_start - self.params.baseline, meta.stim_start)?;
        let after = sign
            * trace.window_mean(
                meta.stim_end + self.params.sahp_begin,
                meta.stim_end + self.params.sahp_end,
            )?;
        Ok(SpikeTrainResult {
            rate: events.len() as f64 / duration,
            stim_amplitude: meta.stim_amplitude,
            sahp: baseline - after,
            mahp: events.last().and_then(|e| e.mahp),
            events,
        })
    }
}

impl TraceAnalysis for SpikeDetector {
    type Output = SpikeTrainResult;
    fn name(&self) -> &'static str {
        "spike detection"
    }
    fn analyze(
        &self,
        trial: &Trial,
        observer: &dyn AnalysisObserver,
    ) -> Result<SpikeTrainResult, AnalysisError> {
        let result = self.analyze_trial(trial)?;
        emit(observer, Verbosity::Detail, || {
            format!(
                "trial {}: {} spikes at {:.3e}",
                trial.metadata.trial,
                result.events.len(),
                trial.metadata.stim_amplitude
            )
        });
        Ok(result)
    }
}

/// Interpolated positions where the spike crosses half height on the way up
/// and on the way down; `None` when it never comes back down.
fn half_crossings(x: &[f64], onset: usize, peak: usize) -> Option<(f64, f64)> {
    let half = 0.5 * (x[onset] + x[peak]);
    let up = (onset + 1..=peak).find(|&k| x[k] >= half)?;
    let left = (up - 1) as f64 + (half - x[up - 1]) / (x[up] - x[up - 1]);
    let down = (peak + 1..x.len()).find(|&k| x[k] < half)?;
    let right = (down - 1) as f64 + (x[down - 1] - half) / (x[down - 1] - x[down]);
    Some((left, right))
}

/// Mean of `x` over `[start, end)` clipped to the trace; `None` when empty.
fn clipped_mean(trace: &Trace, x: &[f64], start: f64, end: f64) -> Option<f64> {
    let first = trace.index_at(start).max(0) as usize;
    let last = (trace.index_at(end).max(0) as usize).min(x.len());
    if first >= last {
        return None;
    }
    Some(mean(&x[first..last]))
}
