use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::analysis::CulpritKey;
use super::build::{BuildId, Commit, GitilesRepo};

/// Kind of failure an analysis handles. Each kind has its own failure policy.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Compile,
    Test,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compile => f.write_str("compile"),
            Self::Test => f.write_str("test"),
        }
    }
}

/// Names of the targets or tests that make up one atomic failure.
///
/// Empty for step-level failures, where nothing finer than the step is known.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FailureIdentifier(BTreeSet<String>);

impl FailureIdentifier {
    pub fn step_level() -> Self {
        Self::default()
    }

    pub fn is_step_level(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for FailureIdentifier {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for FailureIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_step_level() {
            return f.write_str("<step>");
        }
        let names: Vec<&str> = self.names().collect();
        f.write_str(&names.join(","))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FailureKey(pub u64);

impl fmt::Display for FailureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The smallest failing unit: a step, or a target/test set within a step.
///
/// Owned by the failed build it was observed in and never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomicFailure {
    pub key: FailureKey,
    pub build_id: BuildId,
    pub kind: FailureKind,
    pub step_name: String,
    pub identifier: FailureIdentifier,
    pub first_failed_build_id: BuildId,
    pub last_passed_build_id: Option<BuildId>,
    /// Canonical failure this one is deduplicated into; itself by default.
    pub merged_failure_key: FailureKey,
    pub failure_group_build_id: Option<BuildId>,
    #[serde(default)]
    pub properties: Map<String, Value>,
    pub culprit_commit_key: Option<CulpritKey>,
}

impl AtomicFailure {
    pub fn is(&self, step_name: &str, identifier: &FailureIdentifier) -> bool {
        self.step_name == step_name && &self.identifier == identifier
    }
}

/// Cross-build deduplication record, keyed by the build that established it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureGroup {
    pub build_id: BuildId,
    pub kind: FailureKind,
    pub luci_project: String,
    pub repo: GitilesRepo,
    pub last_passed_commit: Commit,
    pub first_failed_commit: Commit,
    pub failure_keys: Vec<FailureKey>,
    /// Step name to the union of failed target/test names in that step.
    pub failures: BTreeMap<String, BTreeSet<String>>,
}
