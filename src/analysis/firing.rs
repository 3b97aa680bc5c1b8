//! Cell-level firing summaries built from per-trial spike trains.
//!
//! Selectors follow one convention throughout: an empty cell or amplitude list
//! means every cell or amplitude, and a `(low, high)` range is closed unless its
//! bounds are equal, in which case it does not restrict anything.
use std::collections::BTreeMap;

use serde::Serialize;

use crate::analysis::batch::TrialOutcome;
use crate::analysis::spike::SpikeTrainResult;
use crate::analysis::AnalysisError;
use crate::table::{Table, Value};
use crate::types::{mean, same_amplitude};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SpikeTrialRecord {
    pub cell: u32,
    pub cell_type: Option<String>,
    pub trial: u32,
    pub result: SpikeTrainResult,
}

pub(crate) fn in_range(value: f64, range: (f64, f64)) -> bool {
    range.0 == range.1 || (range.0 <= value && value <= range.1)
}

/// Running means of optional quantities; absent values are skipped.
#[derive(Default)]
struct Means {
    sums: BTreeMap<&'static str, (f64, usize)>,
}

impl Means {
    fn add(&mut self, key: &'static str, value: Option<f64>) {
        let entry = self.sums.entry(key).or_insert((0.0, 0));
        if let Some(v) = value.filter(|v| v.is_finite()) {
            entry.0 += v;
            entry.1 += 1;
        }
    }
    fn get(&self, key: &str) -> Value {
        match self.sums.get(key) {
            Some(&(sum, n)) if n > 0 => Value::from(sum / n as f64),
            _ => Value::Missing,
        }
    }
}

pub struct FiringAnalyzer {
    records: Vec<SpikeTrialRecord>,
}

impl FiringAnalyzer {
    pub fn new(records: Vec<SpikeTrialRecord>) -> Self {
        Self { records }
    }
    /// Keeps the trials that were analyzed successfully.
    pub fn from_outcomes(outcomes: Vec<TrialOutcome<SpikeTrainResult>>) -> Self {
        let records = outcomes
            .into_iter()
            .filter_map(|o| {
                let trial = o.trial();
                o.result.ok().map(|result| SpikeTrialRecord {
                    cell: o.cell,
                    cell_type: o.cell_type,
                    trial,
                    result,
                })
            })
            .collect();
        Self { records }
    }
    pub fn records(&self) -> &[SpikeTrialRecord] {
        &self.records
    }
    pub fn cells(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.records.iter().map(|r| r.cell).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
    pub fn stims(&self) -> Vec<f64> {
        let mut amps: Vec<f64> = Vec::new();
        for r in &self.records {
            if !amps.iter().any(|a| same_amplitude(*a, r.result.stim_amplitude)) {
                amps.push(r.result.stim_amplitude);
            }
        }
        amps.sort_by(f64::total_cmp);
        amps
    }

    /// Records grouped by cell in ascending id order.
    fn by_cell<'a>(&'a self, cells: &'a [u32]) -> BTreeMap<u32, Vec<&'a SpikeTrialRecord>> {
        let mut groups: BTreeMap<u32, Vec<&SpikeTrialRecord>> = BTreeMap::new();
        for r in self
            .records
            .iter()
            .filter(|r| cells.is_empty() || cells.contains(&r.cell))
        {
            groups.entry(r.cell).or_default().push(r);
        }
        groups
    }

    fn type_of(records: &[&SpikeTrialRecord]) -> Value {
        Value::from(records.iter().find_map(|r| r.cell_type.as_deref()))
    }

    /// Mean firing rate per (cell, stimulation amplitude).
    pub fn firing_rate(&self, cells: &[u32], stims: &[f64]) -> Table {
        let mut table = Table::with_columns(&["cell", "type", "stim", "rate", "trials"]);
        for (cell, records) in self.by_cell(cells) {
            let mut groups: Vec<(f64, Vec<f64>)> = Vec::new();
            for r in &records {
                let amp = r.result.stim_amplitude;
                if !stims.is_empty() && !stims.iter().any(|s| same_amplitude(*s, amp)) {
                    continue;
                }
                match groups.iter_mut().find(|(a, _)| same_amplitude(*a, amp)) {
                    Some((_, rates)) => rates.push(r.result.rate),
                    None => groups.push((amp, vec![r.result.rate])),
                }
            }
            groups.sort_by(|a, b| a.0.total_cmp(&b.0));
            for (amp, rates) in groups {
                table.push([
                    ("cell", Value::from(cell)),
                    ("type", Self::type_of(&records)),
                    ("stim", Value::from(amp)),
                    ("rate", Value::from(mean(&rates))),
                    ("trials", Value::from(rates.len())),
                ]);
            }
        }
        table
    }

    /// Smallest amplitude that made each cell fire, with the mean rate of the
    /// trials at that amplitude. Cells that never fired get no row.
    pub fn rheobase(&self, cells: &[u32]) -> Table {
        let mut table = Table::with_columns(&["cell", "type", "rheobase", "rate"]);
        for (cell, records) in self.by_cell(cells) {
            let Some(rheobase) = records
                .iter()
                .filter(|r| r.result.rate > 0.0)
                .map(|r| r.result.stim_amplitude)
                .min_by(f64::total_cmp)
            else {
                continue;
            };
            let rates: Vec<f64> = records
                .iter()
                .filter(|r| same_amplitude(r.result.stim_amplitude, rheobase))
                .map(|r| r.result.rate)
                .collect();
            table.push([
                ("cell", Value::from(cell)),
                ("type", Self::type_of(&records)),
                ("rheobase", Value::from(rheobase)),
                ("rate", Value::from(mean(&rates))),
            ]);
        }
        table
    }

    /// Ratio of the instantaneous rate at the `late_ap`-th interspike interval
    /// to the one at the `early_ap`-th (both 1-based), averaged per cell over
    /// trials whose rate lies in `rate_range`.
    pub fn accommodation(
        &self,
        cells: &[u32],
        rate_range: (f64, f64),
        early_ap: usize,
        late_ap: usize,
    ) -> Result<Table, AnalysisError> {
        if early_ap == 0 {
            return Err(AnalysisError::invalid("earlyAp", "intervals are counted from 1"));
        }
        if late_ap == 0 {
            return Err(AnalysisError::invalid("lateAp", "intervals are counted from 1"));
        }
        let mut table = Table::with_columns(&["cell", "type", "accommodation", "trials"]);
        for (cell, records) in self.by_cell(cells) {
            let ratios: Vec<f64> = records
                .iter()
                .filter(|r| in_range(r.result.rate, rate_range))
                .filter_map(|r| {
                    let rate_at = |isi: usize| r.result.events.get(isi)?.instantaneous_rate;
                    Some(rate_at(late_ap)? / rate_at(early_ap)?)
                })
                .filter(|v| v.is_finite())
                .collect();
            if ratios.is_empty() {
                continue;
            }
            table.push([
                ("cell", Value::from(cell)),
                ("type", Self::type_of(&records)),
                ("accommodation", Value::from(mean(&ratios))),
                ("trials", Value::from(ratios.len())),
            ]);
        }
        Ok(table)
    }

    /// Per-cell mean spike shape over spikes whose 1-based ordinal lies in
    /// `id_range`, from trials whose rate lies in `rate_range`, plus the mean
    /// sAHP of those trials.
    pub fn properties(&self, cells: &[u32], rate_range: (f64, f64), id_range: (f64, f64)) -> Table {
        let mut table = Table::with_columns(&[
            "cell",
            "type",
            "amplitude",
            "half_width",
            "threshold",
            "max_slope",
            "mAHP",
            "sAHP",
            "spikes",
            "trials",
        ]);
        for (cell, records) in self.by_cell(cells) {
            let trials: Vec<&&SpikeTrialRecord> = records
                .iter()
                .filter(|r| in_range(r.result.rate, rate_range))
                .collect();
            let mut means = Means::default();
            let mut spikes = 0usize;
            for r in &trials {
                for (k, event) in r.result.events.iter().enumerate() {
                    if !in_range((k + 1) as f64, id_range) {
                        continue;
                    }
                    spikes += 1;
                    means.add("amplitude", Some(event.amplitude));
                    means.add("half_width", Some(event.half_width));
                    means.add("threshold", Some(event.threshold));
                    means.add("max_slope", Some(event.max_slope));
                    means.add("mAHP", event.mahp);
                }
            }
            if spikes == 0 {
                continue;
            }
            let sahp: Vec<f64> = trials.iter().map(|r| r.result.sahp).collect();
            table.push([
                ("cell", Value::from(cell)),
                ("type", Self::type_of(&records)),
                ("amplitude", means.get("amplitude")),
                ("half_width", means.get("half_width")),
                ("threshold", means.get("threshold")),
                ("max_slope", means.get("max_slope")),
                ("mAHP", means.get("mAHP")),
                ("sAHP", Value::from(mean(&sahp))),
                ("spikes", Value::from(spikes)),
                ("trials", Value::from(trials.len())),
            ]);
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ActionPotentialEvent;

    fn spike(peak_time: f64, rate: Option<f64>, amplitude: f64) -> ActionPotentialEvent {
        ActionPotentialEvent {
            onset_time: peak_time - 5e-4,
            peak_time,
            amplitude,
            threshold: -0.045,
            half_width: 1e-3,
            max_slope: 150.0,
            latency: peak_time - 0.1,
            instantaneous_rate: rate,
            mahp: Some(0.005),
        }
    }

    /// Spike train with the given interspike intervals.
    fn train(isis: &[f64], amplitude: f64) -> Vec<ActionPotentialEvent> {
        if isis.is_empty() {
            return Vec::new();
        }
        let mut t = 0.12;
        let mut events = vec![spike(t, Some(1.0 / isis[0]), amplitude)];
        for isi in isis {
            t += isi;
            events.push(spike(t, Some(1.0 / isi), amplitude));
        }
        events
    }

    fn record(cell: u32, trial: u32, amp: f64, isis: &[f64]) -> SpikeTrialRecord {
        let events = train(isis, 0.08);
        SpikeTrialRecord {
            cell,
            cell_type: Some(format!("type{}", cell % 2)),
            trial,
            result: SpikeTrainResult {
                rate: events.len() as f64,
                events,
                stim_amplitude: amp,
                sahp: 0.002,
                mahp: Some(0.005),
            },
        }
    }

    fn silent(cell: u32, trial: u32, amp: f64) -> SpikeTrialRecord {
        record(cell, trial, amp, &[])
    }

    fn dataset() -> FiringAnalyzer {
        FiringAnalyzer::new(vec![
            silent(1, 1, 10e-12),
            silent(1, 2, 20e-12),
            record(1, 3, 30e-12, &[0.1, 0.2]),
            record(1, 4, 30e-12, &[0.1]),
            record(1, 5, 40e-12, &[0.05, 0.1, 0.2]),
            silent(2, 1, 10e-12),
            record(2, 2, 20e-12, &[0.1]),
            silent(3, 1, 40e-12),
        ])
    }

    #[test]
    fn rheobase_is_first_firing_amplitude() {
        let table = dataset().rheobase(&[]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows[0]["rheobase"], Value::from(30e-12));
        assert_eq!(table.rows[0]["rate"], Value::from(2.5));
        assert_eq!(table.rows[1]["rheobase"], Value::from(20e-12));
        assert_eq!(table.rows_for_cell(3).count(), 0);
    }

    #[test]
    fn empty_selectors_mean_everything() {
        let analyzer = dataset();
        let all = analyzer.firing_rate(&[], &[]);
        let explicit = analyzer.firing_rate(&analyzer.cells(), &analyzer.stims());
        assert_eq!(all, explicit);
        assert_eq!(all.len(), 7);
        let some = analyzer.firing_rate(&[1], &[30e-12]);
        assert_eq!(some.len(), 1);
        assert_eq!(some.rows[0]["trials"], Value::from(2usize));
        assert_eq!(some.rows[0]["type"], Value::from("type1"));
    }

    #[test]
    fn accommodation_compares_interval_rates() {
        let analyzer = dataset();
        let table = analyzer.accommodation(&[], (0.0, 0.0), 1, 3).unwrap();
        assert_eq!(table.len(), 1);
        let ratio = table.rows[0]["accommodation"].as_f64().unwrap();
        assert!((ratio - 0.25).abs() < 1e-12);
        assert!(analyzer.accommodation(&[], (0.0, 0.0), 0, 2).is_err());
        let restricted = analyzer.accommodation(&[], (1.0, 3.0), 1, 2).unwrap();
        let ratio = restricted.rows[0]["accommodation"].as_f64().unwrap();
        assert!((ratio - 0.5).abs() < 1e-12);
    }

    #[test]
    fn properties_respect_spike_ordinals() {
        let analyzer = dataset();
        let table = analyzer.properties(&[1], (0.0, 0.0), (2.0, 3.0));
        assert_eq!(table.len(), 1);
        assert_eq!(table.rows[0]["spikes"], Value::from(5usize));
        assert_eq!(table.rows[0]["trials"], Value::from(5usize));
        assert!((table.rows[0]["amplitude"].as_f64().unwrap() - 0.08).abs() < 1e-12);
        let none = analyzer.properties(&[3], (0.0, 0.0), (0.0, 0.0));
        assert!(none.is_empty());
    }
}
