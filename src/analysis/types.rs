use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{CulpritError, Result};
use crate::model::{
    AnalysisId, AnalysisStatus, Build, BuildId, BuildRef, Commit, Culprit, FailureIdentifier,
    FailureKey, GitilesRepo,
};

/// Where a failed build ran: its project and the commit it was built at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisContext {
    pub luci_project: String,
    pub repo: GitilesRepo,
    pub gitiles_id: String,
}

impl AnalysisContext {
    pub fn from_build(build: &Build) -> Self {
        Self {
            luci_project: build.builder.project.clone(),
            repo: build.gitiles_commit.repo(),
            gitiles_id: build.gitiles_commit.id.clone(),
        }
    }
}

/// One target/test set that failed within a step, with its bounds in history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AtomicFailureInfo {
    pub identifier: FailureIdentifier,
    pub properties: Map<String, Value>,
    pub first_failed: BuildRef,
    pub last_passed: Option<BuildRef>,
}

impl AtomicFailureInfo {
    pub fn new(
        identifier: FailureIdentifier,
        properties: Map<String, Value>,
        build: &BuildRef,
    ) -> Self {
        Self {
            identifier,
            properties,
            first_failed: build.clone(),
            last_passed: None,
        }
    }
}

/// A failed step of a build.
///
/// `failures` is empty when nothing finer than the step itself is known.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepFailure {
    pub failures: Vec<AtomicFailureInfo>,
    pub properties: Map<String, Value>,
    pub first_failed: BuildRef,
    pub last_passed: Option<BuildRef>,
}

impl StepFailure {
    pub fn new(build: &BuildRef) -> Self {
        Self {
            failures: Vec::new(),
            properties: Map::new(),
            first_failed: build.clone(),
            last_passed: None,
        }
    }

    pub fn is_step_level(&self) -> bool {
        self.failures.is_empty()
    }

    /// Identifiers of the atomic failures in this step.
    pub fn identifiers(&self) -> Vec<FailureIdentifier> {
        self.failures.iter().map(|f| f.identifier.clone()).collect()
    }
}

/// Failed steps of one build, keyed by step name in the order the policy
/// reported them.
pub type DetailedFailures = IndexMap<String, StepFailure>;

/// Failures of one step that first failed in the current build.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepFirstFailures {
    pub identifiers: Vec<FailureIdentifier>,
    pub last_passed: BuildRef,
}

/// The first failures of a build and the widest last-passed bound across
/// them.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FirstFailures {
    pub steps: IndexMap<String, StepFirstFailures>,
    pub last_passed: Option<BuildRef>,
}

impl FirstFailures {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn contains(&self, step_name: &str, identifier: &FailureIdentifier) -> bool {
        self.steps
            .get(step_name)
            .is_some_and(|step| step.identifiers.contains(identifier))
    }

    /// Recomputes `last_passed` as the earliest bound over the current steps.
    pub fn recompute_last_passed(&mut self) {
        self.last_passed = self
            .steps
            .values()
            .fold(None, |earliest, step| Some(BuildRef::earliest(earliest, &step.last_passed)));
    }
}

/// Step name to failure identifier to the build id of the matching group.
pub type GroupMatches = BTreeMap<String, BTreeMap<FailureIdentifier, BuildId>>;

/// The half-open range `(last_passed, first_failed]` known to hold a culprit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RegressionRange {
    pub last_passed: Commit,
    pub first_failed: Commit,
}

impl RegressionRange {
    /// # Errors
    ///
    /// Returns an invariant error unless `last_passed` is strictly before
    /// `first_failed`.
    pub fn new(last_passed: Commit, first_failed: Commit) -> Result<Self> {
        if last_passed.commit_position >= first_failed.commit_position {
            return Err(CulpritError::Invariant(format!(
                "Malformed regression range: last passed {last_passed} is not before first failed {first_failed}"
            )));
        }
        Ok(Self {
            last_passed,
            first_failed,
        })
    }

    pub fn width(&self) -> u64 {
        self.first_failed.commit_position - self.last_passed.commit_position
    }

    pub fn is_culprit_found(&self) -> bool {
        self.width() == 1
    }

    pub fn bisect_position(&self) -> u64 {
        self.last_passed.commit_position + self.width() / 2
    }

    /// Whether a rerun at `position` can still narrow this range. Reruns on
    /// either boundary or outside it cannot.
    pub fn can_narrow_at(&self, position: u64) -> bool {
        self.last_passed.commit_position < position && position < self.first_failed.commit_position
    }

    /// A rerun at `commit` passed: the culprit is after it.
    pub fn raise_last_passed(&mut self, commit: &Commit) {
        if commit.commit_position > self.last_passed.commit_position {
            self.last_passed = commit.clone();
        }
    }

    /// A rerun at `commit` reproduced the failure: the culprit is at or
    /// before it.
    pub fn lower_first_failed(&mut self, commit: &Commit) {
        if commit.commit_position < self.first_failed.commit_position {
            self.first_failed = commit.clone();
        }
    }
}

impl std::fmt::Display for RegressionRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({}, {}]",
            self.last_passed.commit_position, self.first_failed.commit_position
        )
    }
}

/// What one bisection tick did.
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub analysis_id: AnalysisId,
    pub status: AnalysisStatus,
    pub culprits: Vec<Culprit>,
    /// Commit positions with a rerun build triggered or already in flight.
    pub reruns: Vec<u64>,
    /// Failures still lacking a culprit, with their narrowed ranges.
    pub open_ranges: Vec<(Vec<FailureKey>, RegressionRange)>,
    pub errors: Vec<String>,
}
