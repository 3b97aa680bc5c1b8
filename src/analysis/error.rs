use thiserror::Error;
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AnalysisError {
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: String, reason: String },
    #[error("window {start}s..{end}s lies outside the trace span {trace_start}s..{trace_end}s")]
    InsufficientWindow {
        start: f64,
        end: f64,
        trace_start: f64,
        trace_end: f64,
    },
    #[error("least-squares fit did not converge within {iterations} iterations")]
    FitDivergence { iterations: usize },
    #[error("fit rejected: {reason}")]
    ToleranceRejected { reason: String },
}
impl AnalysisError {
    pub fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        AnalysisError::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }
    pub fn rejected(reason: impl Into<String>) -> Self {
        AnalysisError::ToleranceRejected {
            reason: reason.into(),
        }
    }
    /// Rejections and divergences exclude the item from aggregation but are not
    /// configuration mistakes.
    pub fn is_exclusion(&self) -> bool {
        matches!(
            self,
            AnalysisError::ToleranceRejected { .. } | AnalysisError::FitDivergence { .. }
        )
    }
}
