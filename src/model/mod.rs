mod analysis;
mod build;
mod failure;

pub use analysis::{
    AnalysisId, AnalysisStatus, Culprit, CulpritKey, FailureAnalysis, RerunBuild,
};
pub use build::{
    Build, BuildId, BuildRef, BuildStatus, BuilderId, Commit, GitilesCommit, GitilesRepo, Step,
};
pub use failure::{AtomicFailure, FailureGroup, FailureIdentifier, FailureKey, FailureKind};
