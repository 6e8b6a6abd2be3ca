use std::collections::BTreeMap;

use log::{debug, info};

use crate::model::{AtomicFailure, Build, BuildId, FailureGroup, FailureKey};
use crate::services::FailurePolicy;

use super::analyzer::FailureAnalyzer;
use super::types::{AnalysisContext, FirstFailures, GroupMatches};

impl FailureAnalyzer {
    /// Drops the first failures of `build` that an existing group already
    /// covers, linking their entities to the group. Returns what is left.
    pub fn get_first_failures_in_current_build_without_group(
        &self,
        policy: &dyn FailurePolicy,
        build: &Build,
        first_failures: &FirstFailures,
    ) -> FirstFailures {
        if first_failures.is_empty() {
            return first_failures.clone();
        }

        let context = AnalysisContext::from_build(build);
        let candidates = self.store.groups_with_first_failed_commit(
            policy.kind(),
            &context.luci_project,
            &context.gitiles_id,
        );
        if candidates.is_empty() {
            return first_failures.clone();
        }

        let matches =
            policy.failures_with_matching_groups(&context, build, first_failures, &candidates);
        if matches.is_empty() {
            debug!("No group matches the first failures of build {}", build.id);
            return first_failures.clone();
        }

        self.update_failures_with_group_info(policy, build, &matches, &candidates);

        let remaining = without_matches(first_failures, &matches);
        info!(
            "{} of {} steps of build {} still need an analysis after grouping",
            remaining.steps.len(),
            first_failures.steps.len(),
            build.id
        );
        remaining
    }

    /// Points every matched failure of `build` at its group and at the
    /// group's canonical failure for the same step.
    fn update_failures_with_group_info(
        &self,
        policy: &dyn FailurePolicy,
        build: &Build,
        matches: &GroupMatches,
        candidates: &[FailureGroup],
    ) {
        let mut merge_targets: BTreeMap<(BuildId, String), FailureKey> = BTreeMap::new();
        let mut updated: Vec<AtomicFailure> = Vec::new();

        for mut failure in self.store.failures_for_build(build.id, policy.kind()) {
            let Some(group_id) = matches
                .get(&failure.step_name)
                .and_then(|by_identifier| by_identifier.get(&failure.identifier))
                .copied()
            else {
                continue;
            };

            let target = *merge_targets
                .entry((group_id, failure.step_name.clone()))
                .or_insert_with(|| {
                    self.group_canonical_failure(candidates, group_id, &failure.step_name)
                        .unwrap_or(failure.key)
                });

            failure.failure_group_build_id = Some(group_id);
            failure.merged_failure_key = target;
            updated.push(failure);
        }

        self.store.put_failures(&updated);
        debug!(
            "Linked {} failures of build {} to existing groups",
            updated.len(),
            build.id
        );
    }

    /// The failure analyzed for the lowest-keyed failure of group `group_id`
    /// in `step_name`.
    fn group_canonical_failure(
        &self,
        candidates: &[FailureGroup],
        group_id: BuildId,
        step_name: &str,
    ) -> Option<FailureKey> {
        let group = candidates.iter().find(|g| g.build_id == group_id)?;
        self.store
            .failures(&group.failure_keys)
            .into_iter()
            .filter(|f| f.step_name == step_name)
            .min_by_key(|f| f.key)
            .map(|f| f.merged_failure_key)
    }
}

/// `first_failures` minus the matched ones. Steps left without failures are
/// removed and the last-passed bound is recomputed over the rest.
fn without_matches(first_failures: &FirstFailures, matches: &GroupMatches) -> FirstFailures {
    let mut remaining = first_failures.clone();
    for (step_name, matched) in matches {
        if let Some(step) = remaining.steps.get_mut(step_name) {
            step.identifiers.retain(|id| !matched.contains_key(id));
            if step.identifiers.is_empty() {
                remaining.steps.shift_remove(step_name);
            }
        }
    }
    remaining.recompute_last_passed();
    remaining
}
