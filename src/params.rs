//! Analysis parameters.
//!
//! String keys exist only here: callers hand over an [`AnalysisParameters`]
//! mapping (usually deserialized from JSON) and each analysis pulls a typed,
//! validated config out of its scope. Missing keys fall back to the defaults
//! below; keys of the wrong type or out of domain are `InvalidParameter`.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::analysis::AnalysisError;
use crate::types::mean;

pub const SCOPE_AP: &str = "ap";
pub const SCOPE_SEAL_TEST: &str = "sealTest";
pub const SCOPE_MINI: &str = "mini";
pub const SCOPE_SUB: &str = "sub";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<f64>),
}

/// Parameters of one analysis scope.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamSet {
    values: HashMap<String, ParamValue>,
}

/// Scope name -> parameter set.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnalysisParameters {
    scopes: HashMap<String, ParamSet>,
}

impl AnalysisParameters {
    pub fn scope(&self, name: &str) -> Option<&ParamSet> {
        self.scopes.get(name)
    }
    pub fn set_scope(&mut self, name: impl Into<String>, params: ParamSet) {
        self.scopes.insert(name.into(), params);
    }
}

fn wrong_type(key: &str, expected: &str, got: &ParamValue) -> AnalysisError {
    AnalysisError::invalid(key, format!("expected {expected}, got {got:?}"))
}

impl ParamSet {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with(mut self, key: impl Into<String>, value: ParamValue) -> Self {
        self.values.insert(key.into(), value);
        self
    }
    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.values.get(key)
    }
    pub fn f64_or(&self, key: &str, default: f64) -> Result<f64, AnalysisError> {
        match self.values.get(key) {
            None => Ok(default),
            Some(ParamValue::Float(v)) if v.is_finite() => Ok(*v),
            Some(ParamValue::Int(v)) => Ok(*v as f64),
            Some(other) => Err(wrong_type(key, "a finite number", other)),
        }
    }
    pub fn int_or(&self, key: &str, default: i64) -> Result<i64, AnalysisError> {
        match self.values.get(key) {
            None => Ok(default),
            Some(ParamValue::Int(v)) => Ok(*v),
            Some(ParamValue::Float(v)) if v.fract() == 0.0 && v.is_finite() => Ok(*v as i64),
            Some(other) => Err(wrong_type(key, "an integer", other)),
        }
    }
    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool, AnalysisError> {
        match self.values.get(key) {
            None => Ok(default),
            Some(ParamValue::Bool(v)) => Ok(*v),
            Some(ParamValue::Int(v)) => Ok(*v != 0),
            Some(other) => Err(wrong_type(key, "a boolean", other)),
        }
    }
    pub fn text_or(&self, key: &str, default: &str) -> Result<String, AnalysisError> {
        match self.values.get(key) {
            None => Ok(default.to_owned()),
            Some(ParamValue::Text(v)) => Ok(v.clone()),
            Some(other) => Err(wrong_type(key, "a string", other)),
        }
    }
    pub fn list_or(&self, key: &str, default: &[f64]) -> Result<Vec<f64>, AnalysisError> {
        match self.values.get(key) {
            None => Ok(default.to_vec()),
            Some(ParamValue::List(v)) => Ok(v.clone()),
            Some(ParamValue::Float(v)) => Ok(vec![*v]),
            Some(ParamValue::Int(v)) => Ok(vec![*v as f64]),
            Some(other) => Err(wrong_type(key, "a list of numbers", other)),
        }
    }
    /// Two-element list.
    pub fn range_or(&self, key: &str, default: (f64, f64)) -> Result<(f64, f64), AnalysisError> {
        match self.values.get(key) {
            None => Ok(default),
            Some(ParamValue::List(v)) if v.len() == 2 => Ok((v[0], v[1])),
            Some(other) => Err(wrong_type(key, "a [low, high] pair", other)),
        }
    }
    pub fn ids_or(&self, key: &str) -> Result<Vec<u32>, AnalysisError> {
        self.list_or(key, &[])?
            .into_iter()
            .map(|v| {
                if v >= 0.0 && v.fract() == 0.0 && v <= u32::MAX as f64 {
                    Ok(v as u32)
                } else {
                    Err(AnalysisError::invalid(key, format!("{v} is not a valid id")))
                }
            })
            .collect()
    }
}

fn require_positive(key: &str, value: f64) -> Result<f64, AnalysisError> {
    if value > 0.0 {
        Ok(value)
    } else {
        Err(AnalysisError::invalid(key, format!("must be positive, got {value}")))
    }
}

fn require_sign(key: &str, value: i64) -> Result<f64, AnalysisError> {
    match value {
        1 => Ok(1.0),
        -1 => Ok(-1.0),
        _ => Err(AnalysisError::invalid(key, format!("must be 1 or -1, got {value}"))),
    }
}

fn require_order(start_key: &str, start: f64, end_key: &str, end: f64) -> Result<(), AnalysisError> {
    if start < end {
        Ok(())
    } else {
        Err(AnalysisError::invalid(
            end_key,
            format!("must be later than {start_key} ({start} >= {end})"),
        ))
    }
}

fn require_iterations(params: &ParamSet, default: i64) -> Result<usize, AnalysisError> {
    let value = params.int_or("max_iterations", default)?;
    if value > 0 {
        Ok(value as usize)
    } else {
        Err(AnalysisError::invalid("max_iterations", "must be positive"))
    }
}

/// Spike detection and AHP windows (scope `ap`).
#[derive(Clone, Debug, PartialEq)]
pub struct SpikeParams {
    /// dV/dt that marks a spike onset (V/s).
    pub slope_threshold: f64,
    /// Minimum peak height above the onset voltage (V).
    pub peak_threshold: f64,
    /// Maximum full width at half amplitude (s).
    pub half_width_threshold: f64,
    pub sign: f64,
    /// Pre-stimulus baseline length used for sAHP (s).
    pub baseline: f64,
    pub mahp_begin: f64,
    pub mahp_end: f64,
    pub sahp_begin: f64,
    pub sahp_end: f64,
}

impl Default for SpikeParams {
    fn default() -> Self {
        Self {
            slope_threshold: 20.0,
            peak_threshold: 0.02,
            half_width_threshold: 0.004,
            sign: 1.0,
            baseline: 0.1,
            mahp_begin: 0.01,
            mahp_end: 0.2,
            sahp_begin: 0.2,
            sahp_end: 0.5,
        }
    }
}

impl SpikeParams {
    pub fn from_params(params: &ParamSet) -> Result<Self, AnalysisError> {
        let d = Self::default();
        let out = Self {
            slope_threshold: require_positive(
                "spike_slope_threshold",
                params.f64_or("spike_slope_threshold", d.slope_threshold)?,
            )?,
            peak_threshold: require_positive(
                "spike_peak_threshold",
                params.f64_or("spike_peak_threshold", d.peak_threshold)?,
            )?,
            half_width_threshold: require_positive(
                "half_width_threshold",
                params.f64_or("half_width_threshold", d.half_width_threshold)?,
            )?,
            sign: require_sign("sign", params.int_or("sign", 1)?)?,
            baseline: require_positive("baseline", params.f64_or("baseline", d.baseline)?)?,
            mahp_begin: params.f64_or("mAHP_begin", d.mahp_begin)?,
            mahp_end: params.f64_or("mAHP_end", d.mahp_end)?,
            sahp_begin: params.f64_or("sAHP_begin", d.sahp_begin)?,
            sahp_end: params.f64_or("sAHP_end", d.sahp_end)?,
        };
        require_order("mAHP_begin", out.mahp_begin, "mAHP_end", out.mahp_end)?;
        require_order("sAHP_begin", out.sahp_begin, "sAHP_end", out.sahp_end)?;
        Ok(out)
    }
}

/// Seal test in absolute trace time (scope `sealTest`).
#[derive(Clone, Debug, PartialEq)]
pub struct SealTestParams {
    pub baseline_start: f64,
    pub baseline_end: f64,
    pub steady_state_start: f64,
    pub steady_state_end: f64,
    pub seal_test_start: f64,
    pub fit_end: f64,
    pub scale_v: f64,
    pub scale_i: f64,
    /// Command step in voltage clamp (V).
    pub amp_v: f64,
    /// Command step in current clamp (A).
    pub amp_i: f64,
    pub min_tau: f64,
    /// Series resistance / capacitance already compensated on the amplifier.
    pub comp: bool,
    pub max_iterations: usize,
}

impl Default for SealTestParams {
    fn default() -> Self {
        Self {
            baseline_start: 0.04,
            baseline_end: 0.045,
            steady_state_start: 0.15,
            steady_state_end: 0.2,
            seal_test_start: 0.05,
            fit_end: 0.15,
            scale_v: 1e12,
            scale_i: 1e3,
            amp_v: -0.005,
            amp_i: -25e-12,
            min_tau: 1e-3,
            comp: false,
            max_iterations: 200,
        }
    }
}

impl SealTestParams {
    pub fn from_params(params: &ParamSet) -> Result<Self, AnalysisError> {
        let d = Self::default();
        let out = Self {
            baseline_start: params.f64_or("baseline_start", d.baseline_start)?,
            baseline_end: params.f64_or("baseline_end", d.baseline_end)?,
            steady_state_start: params.f64_or("steady_state_start", d.steady_state_start)?,
            steady_state_end: params.f64_or("steady_state_end", d.steady_state_end)?,
            seal_test_start: params.f64_or("seal_test_start", d.seal_test_start)?,
            fit_end: params.f64_or("fit_end", d.fit_end)?,
            scale_v: require_positive("scaleV", params.f64_or("scaleV", d.scale_v)?)?,
            scale_i: require_positive("scaleI", params.f64_or("scaleI", d.scale_i)?)?,
            amp_v: params.f64_or("ampV", d.amp_v)?,
            amp_i: params.f64_or("ampI", d.amp_i)?,
            min_tau: params.f64_or("minTau", d.min_tau)?,
            comp: params.bool_or("comp", d.comp)?,
            max_iterations: require_iterations(params, d.max_iterations as i64)?,
        };
        require_order("baseline_start", out.baseline_start, "baseline_end", out.baseline_end)?;
        require_order(
            "steady_state_start",
            out.steady_state_start,
            "steady_state_end",
            out.steady_state_end,
        )?;
        require_order("seal_test_start", out.seal_test_start, "fit_end", out.fit_end)?;
        if out.amp_v == 0.0 {
            return Err(AnalysisError::invalid("ampV", "command step must be non-zero"));
        }
        if out.amp_i == 0.0 {
            return Err(AnalysisError::invalid("ampI", "command step must be non-zero"));
        }
        Ok(out)
    }
}

/// Subthreshold steps, times relative to stimulus start (scope `sub`).
#[derive(Clone, Debug, PartialEq)]
pub struct SubthresholdParams {
    pub baseline_start: f64,
    pub baseline_end: f64,
    pub steady_state_start: f64,
    pub steady_state_end: f64,
    pub fit_start: f64,
    pub fit_end: f64,
    pub scale_v: f64,
    pub scale_i: f64,
    pub min_tau: f64,
    pub comp: bool,
    /// Spike-noise removal applied before fitting.
    pub median_window: usize,
    pub median_threshold: f64,
    pub max_iterations: usize,
}

impl Default for SubthresholdParams {
    fn default() -> Self {
        Self {
            baseline_start: -0.05,
            baseline_end: -0.005,
            steady_state_start: 0.6,
            steady_state_end: 0.605,
            fit_start: 0.0002,
            fit_end: 0.007,
            scale_v: 1e12,
            scale_i: 1e3,
            min_tau: 1e-3,
            comp: false,
            median_window: 5,
            median_threshold: 5e-10,
            max_iterations: 200,
        }
    }
}

impl SubthresholdParams {
    pub fn from_params(params: &ParamSet) -> Result<Self, AnalysisError> {
        let d = Self::default();
        let median_window = params.int_or("median_window", d.median_window as i64)?;
        if median_window <= 0 {
            return Err(AnalysisError::invalid("median_window", "must be positive"));
        }
        let out = Self {
            baseline_start: params.f64_or("baseline_start", d.baseline_start)?,
            baseline_end: params.f64_or("baseline_end", d.baseline_end)?,
            steady_state_start: params.f64_or("steady_state_start", d.steady_state_start)?,
            steady_state_end: params.f64_or("steady_state_end", d.steady_state_end)?,
            fit_start: params.f64_or("fit_start", d.fit_start)?,
            fit_end: params.f64_or("fit_end", d.fit_end)?,
            scale_v: require_positive("scaleV", params.f64_or("scaleV", d.scale_v)?)?,
            scale_i: require_positive("scaleI", params.f64_or("scaleI", d.scale_i)?)?,
            min_tau: params.f64_or("minTau", d.min_tau)?,
            comp: params.bool_or("comp", d.comp)?,
            median_window: median_window as usize,
            median_threshold: params.f64_or("median_threshold", d.median_threshold)?,
            max_iterations: require_iterations(params, d.max_iterations as i64)?,
        };
        require_order("baseline_start", out.baseline_start, "baseline_end", out.baseline_end)?;
        require_order(
            "steady_state_start",
            out.steady_state_start,
            "steady_state_end",
            out.steady_state_end,
        )?;
        require_order("fit_start", out.fit_start, "fit_end", out.fit_end)?;
        Ok(out)
    }
}

/// How the response window of an IV curve is reduced to one number.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IvMeasure {
    Mean,
    Min,
    Max,
}

impl IvMeasure {
    pub fn apply(self, values: &[f64]) -> f64 {
        match self {
            IvMeasure::Mean => mean(values),
            IvMeasure::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            IvMeasure::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        }
    }
}

/// IV curve windows relative to stimulus start (scope `sub`).
#[derive(Clone, Debug, PartialEq)]
pub struct IvParams {
    pub window: (f64, f64),
    pub baseline: (f64, f64),
    pub measure: IvMeasure,
}

impl Default for IvParams {
    fn default() -> Self {
        let sub = SubthresholdParams::default();
        Self {
            window: (sub.steady_state_start, sub.steady_state_end),
            baseline: (sub.baseline_start, sub.baseline_end),
            measure: IvMeasure::Mean,
        }
    }
}

impl IvParams {
    pub fn from_params(params: &ParamSet) -> Result<Self, AnalysisError> {
        let sub = SubthresholdParams::from_params(params)?;
        let window = params.range_or("iv_window", (sub.steady_state_start, sub.steady_state_end))?;
        let baseline = params.range_or("iv_baseline", (sub.baseline_start, sub.baseline_end))?;
        require_order("iv_window start", window.0, "iv_window", window.1)?;
        require_order("iv_baseline start", baseline.0, "iv_baseline", baseline.1)?;
        let measure = match params.text_or("iv_measure", "mean")?.to_ascii_lowercase().as_str() {
            "mean" => IvMeasure::Mean,
            "min" => IvMeasure::Min,
            "max" => IvMeasure::Max,
            other => {
                return Err(AnalysisError::invalid(
                    "iv_measure",
                    format!("expected mean, min or max, got {other:?}"),
                ))
            }
        };
        Ok(Self {
            window,
            baseline,
            measure,
        })
    }
}

/// Mini detection (scope `mini`). Amplitude-like thresholds are in recorded
/// units and get multiplied by `scale` inside the detector.
#[derive(Clone, Debug, PartialEq)]
pub struct MiniParams {
    pub sign: f64,
    pub median_window: usize,
    pub median_threshold: f64,
    /// Low-pass cutoff (Hz).
    pub low_band_width: f64,
    /// Minimum rising slope (units/s).
    pub rise_slope: f64,
    /// Maximum onset-to-peak time (s).
    pub rise_time: f64,
    pub baseline_win: f64,
    pub min_amp: f64,
    pub min_tau: f64,
    /// Maximum RMS fit error relative to the fitted peak.
    pub residual: f64,
    /// Initial rise time constant, in samples.
    pub on_tau_ini: f64,
    /// Initial decay time constant, in samples.
    pub off_tau_ini: f64,
    pub stack_win: f64,
    pub scale: f64,
    pub max_iterations: usize,
    /// Analysis window in trace time; `None` analyzes the whole trace.
    pub win: Option<(f64, f64)>,
}

impl Default for MiniParams {
    fn default() -> Self {
        Self {
            sign: -1.0,
            median_window: 5,
            median_threshold: 30e-12,
            low_band_width: 300.0,
            rise_slope: 4.5e-9,
            rise_time: 5e-3,
            baseline_win: 10e-3,
            min_amp: 1e-11,
            min_tau: 1.2e-3,
            residual: 0.2,
            on_tau_ini: 1.0,
            off_tau_ini: 20.0,
            stack_win: 7e-3,
            scale: 1e12,
            max_iterations: 400,
            win: None,
        }
    }
}

impl MiniParams {
    pub fn from_params(params: &ParamSet) -> Result<Self, AnalysisError> {
        let d = Self::default();
        let median_window = params.int_or("medianFilterWinSize", d.median_window as i64)?;
        if median_window <= 0 {
            return Err(AnalysisError::invalid("medianFilterWinSize", "must be positive"));
        }
        let win = match params.range_or("win", (0.0, 0.0))? {
            (a, b) if a == b => None,
            (a, b) if a < b => Some((a, b)),
            (a, b) => {
                return Err(AnalysisError::invalid(
                    "win",
                    format!("window end {b} precedes start {a}"),
                ))
            }
        };
        Ok(Self {
            sign: require_sign("sign", params.int_or("sign", -1)?)?,
            median_window: median_window as usize,
            median_threshold: params.f64_or("medianFilterThresh", d.median_threshold)?,
            low_band_width: require_positive(
                "lowBandWidth",
                params.f64_or("lowBandWidth", d.low_band_width)?,
            )?,
            rise_slope: require_positive("riseSlope", params.f64_or("riseSlope", d.rise_slope)?)?,
            rise_time: require_positive("riseTime", params.f64_or("riseTime", d.rise_time)?)?,
            baseline_win: require_positive(
                "baseLineWin",
                params.f64_or("baseLineWin", d.baseline_win)?,
            )?,
            min_amp: params.f64_or("minAmp", d.min_amp)?,
            min_tau: params.f64_or("minTau", d.min_tau)?,
            residual: require_positive("residual", params.f64_or("residual", d.residual)?)?,
            on_tau_ini: require_positive("onTauIni", params.f64_or("onTauIni", d.on_tau_ini)?)?,
            off_tau_ini: require_positive(
                "offTauIni",
                params.f64_or("offTauIni", d.off_tau_ini)?,
            )?,
            stack_win: params.f64_or("stackWin", d.stack_win)?,
            scale: require_positive("scale", params.f64_or("scale", d.scale)?)?,
            max_iterations: require_iterations(params, d.max_iterations as i64)?,
            win,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn missing_keys_take_defaults() {
        let spike = SpikeParams::from_params(&ParamSet::new()).unwrap();
        assert_eq!(spike, SpikeParams::default());
        let mini = MiniParams::from_params(&ParamSet::new()).unwrap();
        assert_eq!(mini.win, None);
        assert_eq!(mini.sign, -1.0);
    }
    #[test]
    fn parses_scoped_json() {
        let params: AnalysisParameters = serde_json::from_str(
            r#"{"ap": {"sign": -1, "spike_peak_threshold": 0.03},
                "mini": {"win": [1.0, 5.0], "medianFilterWinSize": 7}}"#,
        )
        .unwrap();
        let spike = SpikeParams::from_params(params.scope(SCOPE_AP).unwrap()).unwrap();
        assert_eq!(spike.sign, -1.0);
        assert!((spike.peak_threshold - 0.03).abs() < 1e-15);
        let mini = MiniParams::from_params(params.scope(SCOPE_MINI).unwrap()).unwrap();
        assert_eq!(mini.win, Some((1.0, 5.0)));
        assert_eq!(mini.median_window, 7);
        assert!(params.scope(SCOPE_SUB).is_none());
    }
    #[test]
    fn rejects_out_of_domain_values() {
        let zero_window = ParamSet::new().with("medianFilterWinSize", ParamValue::Int(0));
        assert!(matches!(
            MiniParams::from_params(&zero_window),
            Err(AnalysisError::InvalidParameter { .. })
        ));
        let bad_sign = ParamSet::new().with("sign", ParamValue::Int(2));
        assert!(SpikeParams::from_params(&bad_sign).is_err());
        let wrong_type = ParamSet::new().with("minTau", ParamValue::Text("fast".into()));
        assert!(SealTestParams::from_params(&wrong_type).is_err());
        let reversed = ParamSet::new()
            .with("baseline_start", ParamValue::Float(0.2))
            .with("baseline_end", ParamValue::Float(0.1));
        assert!(SubthresholdParams::from_params(&reversed).is_err());
    }
    #[test]
    fn iv_defaults_follow_subthreshold_windows() {
        let iv = IvParams::from_params(&ParamSet::new()).unwrap();
        assert_eq!(iv, IvParams::default());
        assert_eq!(iv.window, (0.6, 0.605));
        let custom = ParamSet::new()
            .with("iv_measure", ParamValue::Text("Min".into()))
            .with("iv_window", ParamValue::List(vec![0.01, 0.05]));
        let iv = IvParams::from_params(&custom).unwrap();
        assert_eq!(iv.measure, IvMeasure::Min);
        assert_eq!(iv.measure.apply(&[3.0, -1.0, 2.0]), -1.0);
        let bad = ParamSet::new().with("iv_measure", ParamValue::Text("median".into()));
        assert!(IvParams::from_params(&bad).is_err());
    }
    #[test]
    fn id_lists_must_be_whole_numbers() {
        let ok = ParamSet::new().with("cells", ParamValue::List(vec![1.0, 4.0]));
        assert_eq!(ok.ids_or("cells").unwrap(), vec![1, 4]);
        let bad = ParamSet::new().with("cells", ParamValue::List(vec![1.5]));
        assert!(bad.ids_or("cells").is_err());
    }
}
