mod analyzer;
mod bisection;
mod first_failure;
mod grouping;
mod rerun;
mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use analyzer::{AnalysisSettings, AnalyzeOutcome, FailureAnalyzer};
pub use types::{
    AnalysisContext, AtomicFailureInfo, DetailedFailures, FirstFailures, GroupMatches,
    RegressionRange, StepFailure, StepFirstFailures, TickReport,
};
