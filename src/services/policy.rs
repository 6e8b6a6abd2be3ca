use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::analysis::{AnalysisContext, DetailedFailures, FirstFailures, GroupMatches};
use crate::error::{CulpritError, Result};
use crate::model::{AtomicFailure, Build, BuildId, FailureGroup, FailureKey, FailureKind, Step};

/// Project-specific knowledge about one kind of failure.
///
/// The engine never looks inside a build's failures itself: which steps
/// matter, what failed in them, how failures are grouped and how a rerun
/// build is configured all come from here.
pub trait FailurePolicy: Send + Sync {
    fn kind(&self) -> FailureKind;

    /// Whether a failed step of `build` is of this policy's kind.
    fn is_failure_step(&self, build: &Build, step: &Step) -> bool;

    /// Detail for `failed_steps` of `build`, one entry per step. A step
    /// without finer detail maps to a step-level entry.
    fn failures_in_build(&self, build: &Build, failed_steps: &[&Step]) -> DetailedFailures;

    /// Which first failures of `build` belong to one of `candidates`.
    fn failures_with_matching_groups(
        &self,
        context: &AnalysisContext,
        build: &Build,
        first_failures: &FirstFailures,
        candidates: &[FailureGroup],
    ) -> GroupMatches;

    /// Maps each of `failures` to the failure analyzed on its behalf. Keys
    /// that map to themselves are analyzed; the rest share their sample's
    /// culprit.
    fn failure_keys_to_analyze(&self, failures: &[AtomicFailure])
        -> BTreeMap<FailureKey, FailureKey>;

    /// `project/bucket/builder` that runs rerun builds for `build`.
    fn rerun_builder_id(&self, build: &Build) -> Result<String>;

    /// Input properties that make a rerun build check exactly `failures`.
    fn rerun_build_input_properties(&self, failures: &[AtomicFailure])
        -> Result<Map<String, Value>>;

    fn rerun_build_tags(&self, analyzed_build_id: BuildId) -> Vec<(String, String)>;
}

/// Failure policies keyed by the kind they handle, filled in at startup.
#[derive(Clone, Default)]
pub struct PolicyRegistry {
    policies: HashMap<FailureKind, Arc<dyn FailurePolicy>>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, policy: Arc<dyn FailurePolicy>) -> Self {
        self.policies.insert(policy.kind(), policy);
        self
    }

    /// # Errors
    ///
    /// Returns a configuration error if nothing handles `kind`.
    pub fn get(&self, kind: FailureKind) -> Result<Arc<dyn FailurePolicy>> {
        self.policies
            .get(&kind)
            .cloned()
            .ok_or_else(|| CulpritError::Config(format!("No failure policy registered for {kind}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::OutputPropertyPolicy;

    #[test]
    fn test_registry_resolves_by_kind() {
        let registry = PolicyRegistry::new().register(Arc::new(OutputPropertyPolicy::new(
            FailureKind::Compile,
        )));

        assert_eq!(
            registry.get(FailureKind::Compile).unwrap().kind(),
            FailureKind::Compile
        );
        assert!(matches!(
            registry.get(FailureKind::Test),
            Err(CulpritError::Config(_))
        ));
    }
}
