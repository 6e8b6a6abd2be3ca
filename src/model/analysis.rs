use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::build::{BuildId, BuilderId, BuildStatus, Commit, GitilesRepo};
use super::failure::{AtomicFailure, FailureIdentifier, FailureKey, FailureKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnalysisId(pub u64);

impl fmt::Display for AnalysisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisStatus {
    #[default]
    Running,
    Completed,
    Error,
}

impl AnalysisStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// One bisection effort for the first failures of a build, per failure kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureAnalysis {
    pub id: AnalysisId,
    pub kind: FailureKind,
    pub luci_project: String,
    pub build_id: BuildId,
    pub builder: BuilderId,
    pub repo: GitilesRepo,
    pub last_passed_commit: Commit,
    pub first_failed_commit: Commit,
    pub rerun_builder_id: String,
    pub failure_keys: Vec<FailureKey>,
    pub status: AnalysisStatus,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// A build triggered on a candidate commit to check whether failures reproduce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerunBuild {
    pub build_id: BuildId,
    pub analysis_id: AnalysisId,
    pub commit: Commit,
    pub status: BuildStatus,
    /// Failed steps and the identifiers that failed in them. An empty list for
    /// a step means the step failed without finer detail.
    #[serde(default)]
    pub failures: BTreeMap<String, Vec<FailureIdentifier>>,
    pub create_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl RerunBuild {
    pub fn is_completed(&self) -> bool {
        self.status.is_conclusive()
    }

    /// Whether `failure` showed up again in this rerun.
    pub fn reproduces(&self, failure: &AtomicFailure) -> bool {
        let Some(step_failures) = self.failures.get(&failure.step_name) else {
            return false;
        };

        if failure.identifier.is_step_level() || step_failures.is_empty() {
            // Only step-level information on one side: the step failing again
            // is the best signal available.
            return true;
        }

        step_failures.contains(&failure.identifier)
    }
}

/// Gitiles hash of the culprit commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CulpritKey(pub String);

impl fmt::Display for CulpritKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A commit found to cause one or more failures. Shared across analyses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Culprit {
    pub key: CulpritKey,
    pub repo: GitilesRepo,
    pub commit: Commit,
    pub failure_keys: BTreeSet<FailureKey>,
    pub analysis_ids: BTreeSet<AnalysisId>,
}
