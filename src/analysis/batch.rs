use rayon::prelude::*;

use crate::analysis::{AnalysisError, TraceAnalysis};
use crate::observer::{emit, AnalysisObserver, Verbosity};
use crate::types::{Cell, Trial, TrialMetadata};

/// Result of one analysis on one trial, tagged with where it came from.
#[derive(Clone, Debug)]
pub struct TrialOutcome<T> {
    pub cell: u32,
    pub cell_type: Option<String>,
    pub metadata: TrialMetadata,
    pub result: Result<T, AnalysisError>,
}

impl<T> TrialOutcome<T> {
    pub fn trial(&self) -> u32 {
        self.metadata.trial
    }
    pub fn ok(&self) -> Option<&T> {
        self.result.as_ref().ok()
    }
}

/// Runs `analysis` on every trial of `protocol` in the selected cells (all
/// cells when `cell_ids` is empty). Trials are processed on the rayon pool;
/// outcomes come back in cell/trial order and a failing trial never stops the
/// others.
pub fn run_batch<A>(
    analysis: &A,
    cells: &[Cell],
    protocol: &str,
    cell_ids: &[u32],
    observer: &dyn AnalysisObserver,
) -> Vec<TrialOutcome<A::Output>>
where
    A: TraceAnalysis,
{
    let jobs: Vec<(&Cell, &Trial)> = cells
        .iter()
        .filter(|c| cell_ids.is_empty() || cell_ids.contains(&c.id))
        .flat_map(|c| c.trials_in(protocol).map(move |t| (c, t)))
        .collect();
    emit(observer, Verbosity::Progress, || {
        format!("{}: {} trials in protocol {protocol:?}", analysis.name(), jobs.len())
    });
    let outcomes: Vec<TrialOutcome<A::Output>> = jobs
        .par_iter()
        .map(|&(cell, trial)| {
            emit(observer, Verbosity::Progress, || {
                format!("Cell {} Trial {}", cell.id, trial.metadata.trial)
            });
            let result = analysis.analyze(trial, observer);
            if let Err(err) = &result {
                if err.is_exclusion() {
                    log::debug!("cell {} trial {}: {err}", cell.id, trial.metadata.trial);
                } else {
                    log::warn!("cell {} trial {}: {err}", cell.id, trial.metadata.trial);
                }
            }
            TrialOutcome {
                cell: cell.id,
                cell_type: cell.cell_type.clone(),
                metadata: trial.metadata.clone(),
                result,
            }
        })
        .collect();
    let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
    if failed > 0 {
        log::info!("{}: {failed} of {} trials failed", analysis.name(), outcomes.len());
    }
    outcomes
}
