// src/analysis/mod.rs
pub mod aggregate;
pub mod batch;
pub mod error;
pub mod filter;
pub mod firing;
pub mod fit;
pub mod mini;
pub mod passive;
pub mod spike;
// Re-exports for callers outside the engine
pub use aggregate::{aggregate_minis, aggregate_passive, InclusionThresholds};
pub use batch::{run_batch, TrialOutcome};
pub use error::AnalysisError;
pub use filter::{low_pass_filter, median_filter};
pub use firing::{FiringAnalyzer, SpikeTrialRecord};
pub use fit::{levenberg_marquardt, Bounds, FitOutcome};
pub use mini::{MiniDetector, MiniTrialResult};
pub use passive::{
    fit_seal_test, fit_subthreshold, fit_subthreshold_series, iv_curve, subtract_protocols,
    SealTestAnalysis, SubthresholdAnalysis,
};
pub use spike::{SpikeDetector, SpikeTrainResult};

use crate::observer::AnalysisObserver;
use crate::types::Trial;

/// One per-trial analysis. Implementors are pure: the output depends only on
/// the trial and the configuration held by `self`.
pub trait TraceAnalysis: Sync {
    type Output: Send;
    fn name(&self) -> &'static str;
    fn analyze(
        &self,
        trial: &Trial,
        observer: &dyn AnalysisObserver,
    ) -> Result<Self::Output, AnalysisError>;
}
