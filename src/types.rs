// src/types.rs
use serde::{Deserialize, Serialize};

use crate::analysis::AnalysisError;

/// Which quantity the amplifier holds fixed.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Serialize, Deserialize)]
pub enum ClampMode {
    #[serde(rename = "v", alias = "voltage")]
    Voltage,
    #[serde(rename = "i", alias = "current")]
    Current,
}

/// Decoded samples of one recording sweep.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "RawTrace")]
pub struct Trace {
    samples: Vec<f64>,
    sample_interval: f64,
    start_time: f64,
}

#[derive(Deserialize)]
struct RawTrace {
    samples: Vec<f64>,
    sample_interval: f64,
    #[serde(default)]
    start_time: f64,
}

impl TryFrom<RawTrace> for Trace {
    type Error = AnalysisError;
    fn try_from(raw: RawTrace) -> Result<Self, Self::Error> {
        Trace::new(raw.samples, raw.sample_interval, raw.start_time)
    }
}

impl Trace {
    pub fn new(
        samples: Vec<f64>,
        sample_interval: f64,
        start_time: f64,
    ) -> Result<Self, AnalysisError> {
        if !(sample_interval.is_finite() && sample_interval > 0.0) {
            return Err(AnalysisError::invalid(
                "sample_interval",
                format!("must be positive, got {sample_interval}"),
            ));
        }
        Ok(Self {
            samples,
            sample_interval,
            start_time,
        })
    }
    /// New trace on the same timebase with different samples.
    pub(crate) fn with_samples(&self, samples: Vec<f64>) -> Self {
        Self {
            samples,
            sample_interval: self.sample_interval,
            start_time: self.start_time,
        }
    }
    pub fn samples(&self) -> &[f64] {
        &self.samples
    }
    pub fn sample_interval(&self) -> f64 {
        self.sample_interval
    }
    pub fn sample_rate(&self) -> f64 {
        1.0 / self.sample_interval
    }
    pub fn start_time(&self) -> f64 {
        self.start_time
    }
    pub fn len(&self) -> usize {
        self.samples.len()
    }
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 * self.sample_interval
    }
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration()
    }
    pub fn time_at(&self, index: usize) -> f64 {
        self.start_time + index as f64 * self.sample_interval
    }
    /// Sample index of an absolute time, rounded to the nearest sample.
    pub fn index_at(&self, time: f64) -> isize {
        ((time - self.start_time) / self.sample_interval).round() as isize
    }
    /// Half-open index range covering `[start, end)` in absolute time.
    pub fn window_range(
        &self,
        start: f64,
        end: f64,
    ) -> Result<std::ops::Range<usize>, AnalysisError> {
        let outside = AnalysisError::InsufficientWindow {
            start,
            end,
            trace_start: self.start_time,
            trace_end: self.end_time(),
        };
        if !(start.is_finite() && end.is_finite()) || end < start {
            return Err(outside);
        }
        let first = self.index_at(start);
        let last = self.index_at(end);
        if first < 0 || last as usize > self.samples.len() || first >= last {
            return Err(outside);
        }
        Ok(first as usize..last as usize)
    }
    pub fn window(&self, start: f64, end: f64) -> Result<&[f64], AnalysisError> {
        let range = self.window_range(start, end)?;
        Ok(&self.samples[range])
    }
    pub fn window_mean(&self, start: f64, end: f64) -> Result<f64, AnalysisError> {
        Ok(mean(self.window(start, end)?))
    }
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Amplitudes read back from acquisition headers differ in the last bits.
pub(crate) fn same_amplitude(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs())
}

/// Stimulation and bookkeeping attached 1:1 to a trace.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrialMetadata {
    pub clamp: ClampMode,
    pub stim_amplitude: f64,
    pub stim_start: f64,
    pub stim_end: f64,
    #[serde(default)]
    pub protocol: String,
    pub trial: u32,
}

impl TrialMetadata {
    pub fn stim_duration(&self) -> f64 {
        self.stim_end - self.stim_start
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Trial {
    pub trace: Trace,
    pub metadata: TrialMetadata,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Cell {
    pub id: u32,
    #[serde(default, rename = "type")]
    pub cell_type: Option<String>,
    #[serde(default)]
    pub trials: Vec<Trial>,
}

impl Cell {
    /// Trials recorded under `protocol`; an empty tag matches every trial.
    pub fn trials_in<'a, 'b>(&'a self, protocol: &'b str) -> impl Iterator<Item = &'a Trial> + 'b
    where
        'a: 'b,
    {
        self.trials
            .iter()
            .filter(move |t| protocol.is_empty() || t.metadata.protocol == protocol)
    }
}

/// One detected action potential.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ActionPotentialEvent {
    pub onset_time: f64,
    pub peak_time: f64,
    /// Peak minus the voltage at the slope-threshold crossing.
    pub amplitude: f64,
    /// Voltage at the slope-threshold crossing.
    pub threshold: f64,
    pub half_width: f64,
    pub max_slope: f64,
    /// Onset time relative to the stimulus start.
    pub latency: f64,
    /// Inverse of the interval to the previous spike (next one for the first spike).
    pub instantaneous_rate: Option<f64>,
    pub mahp: Option<f64>,
}

/// One accepted miniature synaptic event.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MiniEvent {
    pub onset_time: f64,
    pub peak_time: f64,
    pub amplitude: f64,
    pub rise_time: f64,
    pub tau_decay: f64,
    pub tau_rise: f64,
    pub residual: f64,
    /// Number of events fitted together with this one (1 for an isolated event).
    pub stack_size: usize,
}

/// Outcome of a seal-test or subthreshold step analysis.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PassiveFitResult {
    pub baseline: f64,
    pub steady_state: f64,
    pub tau: Option<f64>,
    pub input_resistance: f64,
    pub access_resistance: Option<f64>,
    pub capacitance: Option<f64>,
    pub sag: Option<f64>,
    pub stim_amplitude: f64,
    /// True when an exponential fit ran and passed the minimum-tau check.
    pub fit_accepted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn rejects_non_positive_interval() {
        assert!(Trace::new(vec![0.0; 4], 0.0, 0.0).is_err());
        assert!(Trace::new(vec![0.0; 4], -1e-4, 0.0).is_err());
    }
    #[test]
    fn window_bounds_are_checked() {
        let trace = Trace::new((0..100).map(f64::from).collect(), 0.01, 0.5).unwrap();
        assert_eq!(trace.window_range(0.5, 0.6).unwrap(), 0..10);
        assert_eq!(trace.window(0.6, 0.62).unwrap(), &[10.0, 11.0]);
        assert!(matches!(
            trace.window(0.4, 0.6),
            Err(AnalysisError::InsufficientWindow { .. })
        ));
        assert!(trace.window(1.4, 1.6).is_err());
        assert!((trace.window_mean(0.5, 0.54).unwrap() - 1.5).abs() < 1e-12);
    }
    #[test]
    fn trace_deserializes_with_validation() {
        let ok: Trace =
            serde_json::from_str(r#"{"samples":[1.0,2.0],"sample_interval":0.001}"#).unwrap();
        assert_eq!(ok.len(), 2);
        assert_eq!(ok.start_time(), 0.0);
        let bad = serde_json::from_str::<Trace>(r#"{"samples":[1.0],"sample_interval":0.0}"#);
        assert!(bad.is_err());
    }
    #[test]
    fn clamp_mode_uses_short_tags() {
        let v: ClampMode = serde_json::from_str("\"v\"").unwrap();
        let i: ClampMode = serde_json::from_str("\"current\"").unwrap();
        assert_eq!(v, ClampMode::Voltage);
        assert_eq!(i, ClampMode::Current);
    }
    #[test]
    fn protocol_filter_outlives_its_tag() {
        let trial = |protocol: &str, n: u32| Trial {
            trace: Trace::new(vec![0.0; 4], 1e-3, 0.0).unwrap(),
            metadata: TrialMetadata {
                clamp: ClampMode::Current,
                stim_amplitude: 10.0,
                stim_start: 0.0,
                stim_end: 0.002,
                protocol: protocol.to_string(),
                trial: n,
            },
        };
        let cell = Cell {
            id: 1,
            cell_type: None,
            trials: vec![trial("ctrl", 1), trial("drug", 2), trial("ctrl", 3)],
        };
        let picked: Vec<&Trial> = {
            let tag = String::from("ctrl");
            cell.trials_in(&tag).collect()
        };
        assert_eq!(picked.iter().map(|t| t.metadata.trial).collect::<Vec<_>>(), [1, 3]);
        assert_eq!(cell.trials_in("").count(), 3);
    }
}
