use log::{debug, info};

use crate::error::Result;
use crate::model::{Build, BuildRef, BuildStatus, FailureIdentifier, Step};
use crate::services::FailurePolicy;

use super::analyzer::FailureAnalyzer;
use super::types::{DetailedFailures, FirstFailures, StepFailure, StepFirstFailures};

impl FailureAnalyzer {
    /// Walks the history of `build`'s builder backwards and bounds every
    /// failure in `detailed` with the build it first failed in and the last
    /// build it passed in.
    ///
    /// Failures still open when the lookback runs out keep no last-passed
    /// build.
    ///
    /// # Errors
    ///
    /// Returns an error if the history or an earlier build cannot be fetched.
    pub async fn update_failures_with_first_failure_info(
        &self,
        policy: &dyn FailurePolicy,
        build: &Build,
        detailed: &mut DetailedFailures,
    ) -> Result<()> {
        if detailed.is_empty() {
            return Ok(());
        }

        let limit = self.settings.max_builds_to_check;
        let history = self
            .orchestrator
            .search_builds_on_builder(&build.builder, build.id, limit)
            .await?;

        let mut checked = 0;
        for earlier in history
            .iter()
            .filter(|b| b.id != build.id && b.number < build.number)
            .take(limit)
        {
            checked += 1;

            if earlier.status == BuildStatus::Success {
                debug!("Build {} passed, bounding every open failure", earlier.id);
                let earlier_ref = BuildRef::from(earlier);
                for step in detailed.values_mut() {
                    bound_step(step, &earlier_ref);
                }
                break;
            }

            let earlier = self.orchestrator.get_build(earlier.id).await?;
            if !update_with_earlier_build(policy, detailed, &earlier) {
                break;
            }
        }

        let open = detailed
            .values()
            .filter(|step| step.last_passed.is_none())
            .count();
        info!(
            "Checked {checked} earlier builds of build {}, {open} steps still unbounded",
            build.id
        );
        Ok(())
    }

    /// First failures of `build`: those that started in it and have a known
    /// last-passed build.
    pub fn get_first_failures_in_current_build(
        build: &Build,
        detailed: &DetailedFailures,
    ) -> FirstFailures {
        let mut first_failures = FirstFailures::default();

        for (step_name, step) in detailed {
            let included = if step.is_step_level() {
                match &step.last_passed {
                    Some(last_passed) if step.first_failed.id == build.id => {
                        Some(StepFirstFailures {
                            identifiers: vec![FailureIdentifier::step_level()],
                            last_passed: last_passed.clone(),
                        })
                    }
                    _ => None,
                }
            } else {
                let mut identifiers = Vec::new();
                let mut last_passed = None;
                for failure in &step.failures {
                    match &failure.last_passed {
                        Some(bound) if failure.first_failed.id == build.id => {
                            identifiers.push(failure.identifier.clone());
                            last_passed = Some(BuildRef::earliest(last_passed, bound));
                        }
                        _ => {}
                    }
                }
                last_passed.map(|last_passed| StepFirstFailures {
                    identifiers,
                    last_passed,
                })
            };

            if let Some(step_first_failures) = included {
                first_failures
                    .steps
                    .insert(step_name.clone(), step_first_failures);
            }
        }

        first_failures.recompute_last_passed();
        debug!(
            "Build {} has first failures in {} steps",
            build.id,
            first_failures.steps.len()
        );
        first_failures
    }
}

/// Bounds every open failure of `step` with `last_passed`.
fn bound_step(step: &mut StepFailure, last_passed: &BuildRef) {
    if step.last_passed.is_some() {
        return;
    }
    for failure in &mut step.failures {
        if failure.last_passed.is_none() {
            failure.last_passed = Some(last_passed.clone());
        }
    }
    step.last_passed = Some(last_passed.clone());
}

/// Compares the open failures in `detailed` with a failed `earlier` build.
/// Returns whether any failure still needs to look further back.
fn update_with_earlier_build(
    policy: &dyn FailurePolicy,
    detailed: &mut DetailedFailures,
    earlier: &Build,
) -> bool {
    let earlier_ref = BuildRef::from(earlier);

    let earlier_failed_steps: Vec<&Step> = detailed
        .iter()
        .filter(|(_, step)| step.last_passed.is_none())
        .filter_map(|(name, _)| earlier.step(name))
        .filter(|step| step.status == BuildStatus::Failure)
        .collect();
    let earlier_failures = policy.failures_in_build(earlier, &earlier_failed_steps);

    let mut keep_going = false;
    for (step_name, step) in detailed.iter_mut() {
        if step.last_passed.is_some() {
            continue;
        }

        let status = earlier.step(step_name).map(|s| s.status);
        match status {
            Some(BuildStatus::Success) => bound_step(step, &earlier_ref),
            Some(BuildStatus::Failure) => {
                step.first_failed = earlier_ref.clone();
                let Some(earlier_step) = earlier_failures.get(step_name) else {
                    keep_going = true;
                    continue;
                };

                if step.is_step_level() || earlier_step.is_step_level() {
                    // Nothing to compare below the step: it failed before too.
                    keep_going = true;
                    continue;
                }

                for failure in &mut step.failures {
                    if failure.last_passed.is_some() {
                        continue;
                    }
                    let failed_before = earlier_step
                        .failures
                        .iter()
                        .any(|f| f.identifier == failure.identifier);
                    if failed_before {
                        failure.first_failed = earlier_ref.clone();
                        keep_going = true;
                    } else {
                        failure.last_passed = Some(earlier_ref.clone());
                    }
                }
                if step.failures.iter().all(|f| f.last_passed.is_some()) {
                    step.last_passed = Some(earlier_ref.clone());
                }
            }
            // The step did not run, or ended without a verdict.
            _ => keep_going = true,
        }
    }
    keep_going
}
