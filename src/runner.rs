//! Drives the analyses configured in an [`AnalysisParameters`] document over a
//! dataset and collects the named result tables.
//!
//! Besides the detector settings, each scope may carry job keys:
//!
//! | scope      | keys                                                              |
//! |------------|-------------------------------------------------------------------|
//! | `ap`       | `protocol`, `cells`, `stims`, `rateRange`, `idRange`, `earlyAp`, `lateAp` |
//! | `sealTest` | `protocol`, `cells`, `RinTh`, `numTh`                             |
//! | `sub`      | `protocol`, `cells`, `stimRange`, `RinTh`, `numTh`, `protocol0`, `protocol1`, `stims` |
//! | `mini`     | `protocol`, `cells`, `RinTh`, `numTh`                             |
//!
//! plus `verbose` (0..=3) everywhere. A scope without a `protocol` only
//! validates its parameters.
use std::collections::BTreeMap;

use crate::analysis::{
    aggregate_minis, aggregate_passive, iv_curve, run_batch, subtract_protocols, AnalysisError,
    FiringAnalyzer, InclusionThresholds, MiniDetector, SealTestAnalysis, SpikeDetector,
    SubthresholdAnalysis,
};
use crate::observer::{LogObserver, Verbosity};
use crate::params::{
    AnalysisParameters, IvParams, MiniParams, ParamSet, SealTestParams, SpikeParams,
    SubthresholdParams, SCOPE_AP, SCOPE_MINI, SCOPE_SEAL_TEST, SCOPE_SUB,
};
use crate::table::Table;
use crate::types::Cell;

/// Table name -> table, e.g. `fr_steps` or `diff_ctrl_drug`.
pub type Tables = BTreeMap<String, Table>;

const DEFAULT_EARLY_AP: i64 = 1;
const DEFAULT_LATE_AP: i64 = 4;

fn observer_for(scope: &ParamSet) -> Result<LogObserver, AnalysisError> {
    let level = scope.int_or("verbose", 0)?;
    Ok(LogObserver::new(Verbosity::from_level(level)))
}

fn protocol_of(scope: &ParamSet, key: &str) -> Result<Option<String>, AnalysisError> {
    let protocol = scope.text_or(key, "")?;
    Ok(Some(protocol).filter(|p| !p.is_empty()))
}

fn thresholds_of(scope: &ParamSet) -> Result<InclusionThresholds, AnalysisError> {
    let rin_th = scope.f64_or("RinTh", 0.0)?;
    if rin_th < 0.0 {
        return Err(AnalysisError::invalid("RinTh", "must not be negative"));
    }
    let num_th = scope.int_or("numTh", 0)?;
    if num_th < 0 {
        return Err(AnalysisError::invalid("numTh", "must not be negative"));
    }
    Ok(InclusionThresholds {
        rin_th,
        num_th: num_th as usize,
    })
}

fn ordinal(scope: &ParamSet, key: &str, default: i64) -> Result<usize, AnalysisError> {
    match scope.int_or(key, default)? {
        n if n >= 1 => Ok(n as usize),
        n => Err(AnalysisError::invalid(key, format!("counted from 1, got {n}"))),
    }
}

/// Runs every configured scope. Parameter mistakes abort the run; per-trial
/// failures only drop the affected trials from the tables.
pub fn run(cells: &[Cell], params: &AnalysisParameters) -> Result<Tables, AnalysisError> {
    let mut tables = Tables::new();
    if let Some(scope) = params.scope(SCOPE_AP) {
        run_spikes(cells, scope, &mut tables)?;
    }
    if let Some(scope) = params.scope(SCOPE_SEAL_TEST) {
        run_seal_tests(cells, scope, &mut tables)?;
    }
    if let Some(scope) = params.scope(SCOPE_SUB) {
        run_subthreshold(cells, scope, &mut tables)?;
    }
    if let Some(scope) = params.scope(SCOPE_MINI) {
        run_minis(cells, scope, params.scope(SCOPE_SEAL_TEST), &mut tables)?;
    }
    log::info!("{} tables produced", tables.len());
    Ok(tables)
}

fn run_spikes(cells: &[Cell], scope: &ParamSet, tables: &mut Tables) -> Result<(), AnalysisError> {
    let detector = SpikeDetector::new(SpikeParams::from_params(scope)?);
    let ids = scope.ids_or("cells")?;
    let stims = scope.list_or("stims", &[])?;
    let rate_range = scope.range_or("rateRange", (0.0, 0.0))?;
    let id_range = scope.range_or("idRange", (0.0, 0.0))?;
    let early_ap = ordinal(scope, "earlyAp", DEFAULT_EARLY_AP)?;
    let late_ap = ordinal(scope, "lateAp", DEFAULT_LATE_AP)?;
    let observer = observer_for(scope)?;
    let Some(protocol) = protocol_of(scope, "protocol")? else {
        log::info!("{SCOPE_AP}: no protocol given, nothing to run");
        return Ok(());
    };

    let outcomes = run_batch(&detector, cells, &protocol, &ids, &observer);
    let analyzer = FiringAnalyzer::from_outcomes(outcomes);
    tables.insert(format!("fr_{protocol}"), analyzer.firing_rate(&ids, &stims));
    tables.insert(format!("rheo_{protocol}"), analyzer.rheobase(&ids));
    tables.insert(
        format!("accom_{protocol}"),
        analyzer.accommodation(&ids, rate_range, early_ap, late_ap)?,
    );
    tables.insert(
        format!("ap_{protocol}"),
        analyzer.properties(&ids, rate_range, id_range),
    );
    Ok(())
}

fn run_seal_tests(
    cells: &[Cell],
    scope: &ParamSet,
    tables: &mut Tables,
) -> Result<(), AnalysisError> {
    let analysis = SealTestAnalysis {
        params: SealTestParams::from_params(scope)?,
    };
    let ids = scope.ids_or("cells")?;
    let thresholds = thresholds_of(scope)?;
    let observer = observer_for(scope)?;
    let Some(protocol) = protocol_of(scope, "protocol")? else {
        log::info!("{SCOPE_SEAL_TEST}: no protocol given, nothing to run");
        return Ok(());
    };

    let outcomes = run_batch(&analysis, cells, &protocol, &ids, &observer);
    tables.insert(
        format!("st_{protocol}"),
        aggregate_passive(&outcomes, &ids, thresholds, (0.0, 0.0)),
    );
    Ok(())
}

fn run_subthreshold(
    cells: &[Cell],
    scope: &ParamSet,
    tables: &mut Tables,
) -> Result<(), AnalysisError> {
    let params = SubthresholdParams::from_params(scope)?;
    let iv = IvParams::from_params(scope)?;
    let ids = scope.ids_or("cells")?;
    let stims = scope.list_or("stims", &[])?;
    let stim_range = scope.range_or("stimRange", (0.0, 0.0))?;
    let thresholds = thresholds_of(scope)?;
    let observer = observer_for(scope)?;

    if let Some(protocol) = protocol_of(scope, "protocol")? {
        let analysis = SubthresholdAnalysis {
            params: params.clone(),
        };
        let outcomes = run_batch(&analysis, cells, &protocol, &ids, &observer);
        tables.insert(
            format!("sub_{protocol}"),
            aggregate_passive(&outcomes, &ids, thresholds, stim_range),
        );
        tables.insert(format!("iv_{protocol}"), iv_curve(cells, &protocol, &ids, &iv));
    }
    match (protocol_of(scope, "protocol0")?, protocol_of(scope, "protocol1")?) {
        (Some(p0), Some(p1)) => {
            tables.insert(
                format!("diff_{p0}_{p1}"),
                subtract_protocols(cells, &p0, &p1, &ids, &stims, &params),
            );
        }
        (None, None) => {}
        _ => {
            return Err(AnalysisError::invalid(
                "protocol1",
                "protocol subtraction needs both protocol0 and protocol1",
            ))
        }
    }
    Ok(())
}

/// Mini trials are screened by the seal tests recorded in the same traces, so
/// the seal test runs over the mini protocol whenever `RinTh` is set.
fn run_minis(
    cells: &[Cell],
    scope: &ParamSet,
    seal_scope: Option<&ParamSet>,
    tables: &mut Tables,
) -> Result<(), AnalysisError> {
    let detector = MiniDetector::new(MiniParams::from_params(scope)?);
    let seal_params = match seal_scope {
        Some(s) => SealTestParams::from_params(s)?,
        None => SealTestParams::default(),
    };
    let ids = scope.ids_or("cells")?;
    let thresholds = thresholds_of(scope)?;
    let observer = observer_for(scope)?;
    let Some(protocol) = protocol_of(scope, "protocol")? else {
        log::info!("{SCOPE_MINI}: no protocol given, nothing to run");
        return Ok(());
    };

    let minis = run_batch(&detector, cells, &protocol, &ids, &observer);
    let seal_tests = if thresholds.rin_th > 0.0 {
        let analysis = SealTestAnalysis {
            params: seal_params,
        };
        run_batch(&analysis, cells, &protocol, &ids, &observer)
    } else {
        Vec::new()
    };
    tables.insert(
        format!("mini_{protocol}"),
        aggregate_minis(&minis, &seal_tests, &ids, thresholds),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamValue;
    use crate::table::Value;
    use crate::types::{ClampMode, Trace, Trial, TrialMetadata};

    const DT: f64 = 1e-3;
    const STIM_START: f64 = 0.1;
    const STIM_END: f64 = 0.8;

    /// Current step of `amp` through a purely resistive cell.
    fn step_trial(protocol: &str, trial: u32, amp: f64, resistance: f64) -> Trial {
        let samples = (0..1400)
            .map(|i| {
                let t = i as f64 * DT;
                if (STIM_START..STIM_END).contains(&t) {
                    amp * resistance
                } else {
                    0.0
                }
            })
            .collect();
        Trial {
            trace: Trace::new(samples, DT, 0.0).unwrap(),
            metadata: TrialMetadata {
                clamp: ClampMode::Current,
                stim_amplitude: amp,
                stim_start: STIM_START,
                stim_end: STIM_END,
                protocol: protocol.into(),
                trial,
            },
        }
    }

    fn dataset() -> Vec<Cell> {
        let amps = [-20e-12, -10e-12, 10e-12];
        let mut trials = Vec::new();
        for (i, &amp) in amps.iter().enumerate() {
            trials.push(step_trial("ctrl", i as u32 + 1, amp, 1e8));
            trials.push(step_trial("drug", i as u32 + 1, amp, 2e8));
        }
        vec![Cell {
            id: 4,
            cell_type: Some("pyr".into()),
            trials,
        }]
    }

    fn text(value: &str) -> ParamValue {
        ParamValue::Text(value.into())
    }

    #[test]
    fn subthreshold_scope_produces_sub_iv_and_diff_tables() {
        let mut params = AnalysisParameters::default();
        params.set_scope(
            SCOPE_SUB,
            ParamSet::new()
                .with("protocol", text("ctrl"))
                .with("comp", ParamValue::Bool(true))
                .with("protocol0", text("ctrl"))
                .with("protocol1", text("drug")),
        );
        let tables = run(&dataset(), &params).unwrap();
        let names: Vec<&str> = tables.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["diff_ctrl_drug", "iv_ctrl", "sub_ctrl"]);

        let sub = &tables["sub_ctrl"];
        assert_eq!(sub.len(), 1);
        let rin = sub.rows[0]["Rin"].as_f64().unwrap();
        assert!((rin - 1e8).abs() / 1e8 < 1e-9);
        assert_eq!(sub.rows[0]["trials"], Value::from(3usize));
        assert_eq!(sub.rows[0]["type"], Value::from("pyr"));

        let iv = &tables["iv_ctrl"];
        assert_eq!(iv.len(), 3);
        let response = iv.rows[0]["response"].as_f64().unwrap();
        assert!((response + 2e-3).abs() < 1e-12);

        let diff = &tables["diff_ctrl_drug"];
        assert_eq!(diff.len(), 3);
        for row in &diff.rows {
            let stim = row["stim"].as_f64().unwrap();
            let amp = row["amp"].as_f64().unwrap();
            assert!((amp - stim * 1e8).abs() < 1e-12);
        }
    }

    #[test]
    fn spike_scope_on_quiet_steps_reports_zero_rates() {
        let mut params = AnalysisParameters::default();
        params.set_scope(SCOPE_AP, ParamSet::new().with("protocol", text("ctrl")));
        let tables = run(&dataset(), &params).unwrap();
        let fr = &tables["fr_ctrl"];
        assert_eq!(fr.len(), 3);
        assert!(fr.column("rate").iter().all(|v| v.as_f64() == Some(0.0)));
        assert!(tables["rheo_ctrl"].is_empty());
        assert!(tables["accom_ctrl"].is_empty());
    }

    #[test]
    fn scopes_without_protocol_only_validate() {
        let mut params = AnalysisParameters::default();
        params.set_scope(SCOPE_MINI, ParamSet::new());
        params.set_scope(SCOPE_SEAL_TEST, ParamSet::new());
        assert!(run(&dataset(), &params).unwrap().is_empty());

        params.set_scope(
            SCOPE_AP,
            ParamSet::new().with("lateAp", ParamValue::Int(0)),
        );
        let err = run(&dataset(), &params).unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidParameter { ref name, .. } if name == "lateAp"));
    }

    #[test]
    fn half_configured_subtraction_is_rejected() {
        let mut params = AnalysisParameters::default();
        params.set_scope(SCOPE_SUB, ParamSet::new().with("protocol0", text("ctrl")));
        assert!(matches!(
            run(&dataset(), &params),
            Err(AnalysisError::InvalidParameter { .. })
        ));
    }
}
