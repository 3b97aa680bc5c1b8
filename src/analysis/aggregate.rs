//! Per-cell averages of per-trial passive and mini results.
//!
//! Per-trial results are only read. A trial that failed never qualifies, a
//! trial whose input resistance exceeds `RinTh` does not qualify, and a cell
//! needs at least `numTh` qualifying trials to get a row at all.
use std::collections::{BTreeMap, HashMap};

use crate::analysis::batch::TrialOutcome;
use crate::analysis::firing::in_range;
use crate::analysis::mini::MiniTrialResult;
use crate::table::{Table, Value};
use crate::types::{mean, MiniEvent, PassiveFitResult};

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct InclusionThresholds {
    /// Maximum input resistance of a qualifying trial; 0 disables the check.
    pub rin_th: f64,
    /// Minimum number of qualifying trials per cell.
    pub num_th: usize,
}

impl InclusionThresholds {
    fn rin_ok(&self, rin: f64) -> bool {
        self.rin_th <= 0.0 || rin <= self.rin_th
    }
}

/// Mean of the present values; missing when nothing is present.
fn mean_of<I: IntoIterator<Item = Option<f64>>>(values: I) -> Value {
    let present: Vec<f64> = values.into_iter().flatten().filter(|v| v.is_finite()).collect();
    if present.is_empty() {
        Value::Missing
    } else {
        Value::from(mean(&present))
    }
}

fn group_by_cell<'a, T>(
    outcomes: &'a [TrialOutcome<T>],
    cells: &[u32],
) -> BTreeMap<u32, Vec<&'a TrialOutcome<T>>> {
    let mut groups: BTreeMap<u32, Vec<&TrialOutcome<T>>> = BTreeMap::new();
    for o in outcomes.iter().filter(|o| cells.is_empty() || cells.contains(&o.cell)) {
        groups.entry(o.cell).or_default().push(o);
    }
    groups
}

fn cell_type<T>(outcomes: &[&TrialOutcome<T>]) -> Value {
    Value::from(outcomes.iter().find_map(|o| o.cell_type.as_deref()))
}

/// Seal-test or subthreshold results averaged per cell, optionally only over
/// trials whose stimulation amplitude lies in `stim_range`.
pub fn aggregate_passive(
    outcomes: &[TrialOutcome<PassiveFitResult>],
    cells: &[u32],
    thresholds: InclusionThresholds,
    stim_range: (f64, f64),
) -> Table {
    let mut table = Table::with_columns(&[
        "cell",
        "type",
        "baseline",
        "steady_state",
        "tau",
        "Rin",
        "Rs",
        "Cm",
        "sag",
        "stim",
        "trials",
    ]);
    for (cell, group) in group_by_cell(outcomes, cells) {
        let qualifying: Vec<&PassiveFitResult> = group
            .iter()
            .filter_map(|o| o.ok())
            .filter(|r| in_range(r.stim_amplitude, stim_range))
            .filter(|r| thresholds.rin_ok(r.input_resistance))
            .collect();
        if qualifying.is_empty() || qualifying.len() < thresholds.num_th {
            log::debug!("cell {cell}: {} qualifying trials, no row", qualifying.len());
            continue;
        }
        table.push([
            ("cell", Value::from(cell)),
            ("type", cell_type(&group)),
            ("baseline", mean_of(qualifying.iter().map(|r| Some(r.baseline)))),
            ("steady_state", mean_of(qualifying.iter().map(|r| Some(r.steady_state)))),
            ("tau", mean_of(qualifying.iter().map(|r| r.tau))),
            ("Rin", mean_of(qualifying.iter().map(|r| Some(r.input_resistance)))),
            ("Rs", mean_of(qualifying.iter().map(|r| r.access_resistance))),
            ("Cm", mean_of(qualifying.iter().map(|r| r.capacitance))),
            ("sag", mean_of(qualifying.iter().map(|r| r.sag))),
            ("stim", mean_of(qualifying.iter().map(|r| Some(r.stim_amplitude)))),
            ("trials", Value::from(qualifying.len())),
        ]);
    }
    table
}

/// Mini kinetics per cell: the mean over qualifying trials of each trial's
/// event means, plus the event rate over the total analyzed time. Trials
/// qualify by the seal test recorded for the same (cell, trial).
pub fn aggregate_minis(
    minis: &[TrialOutcome<MiniTrialResult>],
    seal_tests: &[TrialOutcome<PassiveFitResult>],
    cells: &[u32],
    thresholds: InclusionThresholds,
) -> Table {
    let mut table = Table::with_columns(&[
        "cell",
        "type",
        "amplitude",
        "tau_decay",
        "tau_rise",
        "rise_time",
        "rate",
        "events",
        "trials",
    ]);
    let rin: HashMap<(u32, u32), Option<f64>> = seal_tests
        .iter()
        .map(|o| ((o.cell, o.trial()), o.ok().map(|r| r.input_resistance)))
        .collect();
    let check_rin = thresholds.rin_th > 0.0 && !rin.is_empty();
    if thresholds.rin_th > 0.0 && rin.is_empty() {
        log::warn!("no seal test results supplied, Rin threshold not applied");
    }
    for (cell, group) in group_by_cell(minis, cells) {
        let qualifying: Vec<&MiniTrialResult> = group
            .iter()
            .filter(|o| {
                !check_rin
                    || matches!(rin.get(&(o.cell, o.trial())), Some(Some(r)) if thresholds.rin_ok(*r))
            })
            .filter_map(|o| o.ok())
            .collect();
        if qualifying.is_empty() || qualifying.len() < thresholds.num_th {
            log::debug!("cell {cell}: {} qualifying trials, no row", qualifying.len());
            continue;
        }
        let trial_mean = |field: fn(&MiniEvent) -> f64| {
            mean_of(qualifying.iter().map(|r| {
                if r.events.is_empty() {
                    None
                } else {
                    Some(mean(&r.events.iter().map(field).collect::<Vec<_>>()))
                }
            }))
        };
        let events: usize = qualifying.iter().map(|r| r.events.len()).sum();
        let duration: f64 = qualifying.iter().map(|r| r.duration).sum();
        let rate = if duration > 0.0 {
            Value::from(events as f64 / duration)
        } else {
            Value::Missing
        };
        table.push([
            ("cell", Value::from(cell)),
            ("type", cell_type(&group)),
            ("amplitude", trial_mean(|e| e.amplitude)),
            ("tau_decay", trial_mean(|e| e.tau_decay)),
            ("tau_rise", trial_mean(|e| e.tau_rise)),
            ("rise_time", trial_mean(|e| e.rise_time)),
            ("rate", rate),
            ("events", Value::from(events)),
            ("trials", Value::from(qualifying.len())),
        ]);
    }
    table
}
