use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use log::{debug, info};
use serde::Serialize;
use serde_json::Map;

use crate::error::{CulpritError, Result};
use crate::model::{
    AnalysisId, AnalysisStatus, AtomicFailure, Build, BuildId, BuildRef, Commit, Culprit,
    FailureAnalysis, FailureGroup, FailureIdentifier, FailureKey, FailureKind, Step,
};
use crate::services::{BuildOrchestrator, FailurePolicy, PolicyRegistry, SourceControl};
use crate::store::FailureStore;

use super::types::{DetailedFailures, FirstFailures, RegressionRange, TickReport};

/// Knobs of the analysis pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisSettings {
    /// How many earlier builds to inspect when looking for a failure's start.
    pub max_builds_to_check: usize,
    /// Whether failures are deduplicated against groups of other builds.
    pub should_group_failures: bool,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            max_builds_to_check: 20,
            should_group_failures: true,
        }
    }
}

/// Result of analyzing one failed build.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AnalyzeOutcome {
    /// Nothing failed for the first time in this build with a known bound.
    NoFirstFailures { build_id: BuildId },
    /// Every first failure belongs to a group another build already analyzes.
    AllGrouped {
        build_id: BuildId,
        groups: BTreeSet<BuildId>,
    },
    /// The analysis of this build already finished.
    Finished {
        analysis_id: AnalysisId,
        status: AnalysisStatus,
    },
    /// An analysis is running; this is what its latest tick did.
    Analyzing(TickReport),
}

/// Finds culprits for failed builds.
///
/// The engine is split over several files: first-failure localization, failure
/// grouping, bisection and rerun handling each add their operations to this
/// type.
pub struct FailureAnalyzer {
    pub(super) store: Arc<FailureStore>,
    pub(super) orchestrator: Arc<dyn BuildOrchestrator>,
    pub(super) source_control: Arc<dyn SourceControl>,
    pub(super) policies: PolicyRegistry,
    pub(super) settings: AnalysisSettings,
}

impl FailureAnalyzer {
    pub fn new(
        store: Arc<FailureStore>,
        orchestrator: Arc<dyn BuildOrchestrator>,
        source_control: Arc<dyn SourceControl>,
        policies: PolicyRegistry,
        settings: AnalysisSettings,
    ) -> Self {
        Self {
            store,
            orchestrator,
            source_control,
            policies,
            settings,
        }
    }

    pub fn store(&self) -> &FailureStore {
        &self.store
    }

    /// Runs the whole pipeline for a failed build: reads its failures, finds
    /// where each started, drops those another analysis already covers, opens
    /// an analysis for the rest and runs its first bisection tick.
    ///
    /// Analyzing a build twice does not open a second analysis.
    ///
    /// # Errors
    ///
    /// Returns an error if the build or its history cannot be fetched, no
    /// policy handles `kind`, or the analysis cannot be created.
    pub async fn analyze_build(
        &self,
        build_id: BuildId,
        kind: FailureKind,
    ) -> Result<AnalyzeOutcome> {
        if let Some(existing) = self.store.analysis_for_build(build_id, kind) {
            info!(
                "Build {build_id} already has {kind} analysis {} ({:?})",
                existing.id, existing.status
            );
            if existing.status.is_terminal() {
                return Ok(AnalyzeOutcome::Finished {
                    analysis_id: existing.id,
                    status: existing.status,
                });
            }
            let report = self.rerun_based_analysis(existing.id).await?;
            return Ok(AnalyzeOutcome::Analyzing(report));
        }

        let policy = self.policies.get(kind)?;
        let build = self.orchestrator.get_build(build_id).await?;
        info!(
            "Analyzing {kind} failures of build {build_id} ({} #{})",
            build.builder, build.number
        );

        let failed_steps: Vec<&Step> = build
            .failed_steps()
            .filter(|step| policy.is_failure_step(&build, step))
            .collect();
        if failed_steps.is_empty() {
            info!("Build {build_id} has no failed {kind} steps");
            return Ok(AnalyzeOutcome::NoFirstFailures { build_id });
        }

        let mut detailed = policy.failures_in_build(&build, &failed_steps);
        self.update_failures_with_first_failure_info(policy.as_ref(), &build, &mut detailed)
            .await?;
        self.save_failures(kind, &build, &detailed);

        let first_failures = Self::get_first_failures_in_current_build(&build, &detailed);
        if first_failures.is_empty() {
            info!("No {kind} failure started in build {build_id}");
            return Ok(AnalyzeOutcome::NoFirstFailures { build_id });
        }

        let remaining = if self.settings.should_group_failures {
            self.get_first_failures_in_current_build_without_group(
                policy.as_ref(),
                &build,
                &first_failures,
            )
        } else {
            first_failures
        };
        if remaining.is_empty() {
            let groups = self
                .store
                .failures_for_build(build_id, kind)
                .into_iter()
                .filter_map(|f| f.failure_group_build_id)
                .collect();
            info!("Every first failure of build {build_id} is already being analyzed");
            return Ok(AnalyzeOutcome::AllGrouped { build_id, groups });
        }

        let analysis = self
            .save_failure_analysis(policy.as_ref(), &build, &remaining)
            .await?;
        let report = self.rerun_based_analysis(analysis.id).await?;
        Ok(AnalyzeOutcome::Analyzing(report))
    }

    /// Saves one entity per atomic failure of `build`, or one per step where
    /// nothing finer is known.
    ///
    /// A failure that started in an earlier build is merged into that
    /// build's failure. Saving the same build again updates its entities.
    pub fn save_failures(
        &self,
        kind: FailureKind,
        build: &Build,
        detailed: &DetailedFailures,
    ) -> Vec<AtomicFailure> {
        let mut entities = Vec::new();

        for (step_name, step) in detailed {
            let atomic: Vec<_> = if step.is_step_level() {
                vec![(
                    FailureIdentifier::step_level(),
                    &step.properties,
                    &step.first_failed,
                    step.last_passed.as_ref(),
                )]
            } else {
                step.failures
                    .iter()
                    .map(|f| {
                        (
                            f.identifier.clone(),
                            &f.properties,
                            &f.first_failed,
                            f.last_passed.as_ref(),
                        )
                    })
                    .collect()
            };

            for (identifier, properties, first_failed, last_passed) in atomic {
                let existing = self
                    .store
                    .find_failure(build.id, kind, step_name, &identifier);
                let key = existing
                    .as_ref()
                    .map_or_else(|| self.store.allocate_failure_key(), |f| f.key);

                let merged_failure_key = if first_failed.id == build.id {
                    key
                } else {
                    self.store
                        .find_failure(first_failed.id, kind, step_name, &identifier)
                        .map_or(key, |earlier| earlier.merged_failure_key)
                };

                let mut entity = existing.unwrap_or_else(|| AtomicFailure {
                    key,
                    build_id: build.id,
                    kind,
                    step_name: step_name.clone(),
                    identifier: identifier.clone(),
                    first_failed_build_id: first_failed.id,
                    last_passed_build_id: None,
                    merged_failure_key,
                    failure_group_build_id: None,
                    properties: Map::new(),
                    culprit_commit_key: None,
                });
                entity.first_failed_build_id = first_failed.id;
                entity.last_passed_build_id = last_passed.map(|b| b.id);
                if entity.failure_group_build_id.is_none() {
                    entity.merged_failure_key = merged_failure_key;
                }
                entity.properties = properties.clone();
                entities.push(entity);
            }
        }

        self.store.put_failures(&entities);
        debug!("Saved {} {kind} failures of build {}", entities.len(), build.id);
        entities
    }

    /// Opens the analysis for the ungrouped first failures of `build`. When
    /// grouping is on, the build also becomes a group other builds can join.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no last-passed bound, the policy has no
    /// rerun builder, a commit position cannot be resolved, or the bounds are
    /// malformed.
    pub async fn save_failure_analysis(
        &self,
        policy: &dyn FailurePolicy,
        build: &Build,
        first_failures: &FirstFailures,
    ) -> Result<FailureAnalysis> {
        let kind = policy.kind();
        let Some(last_passed) = &first_failures.last_passed else {
            return Err(CulpritError::Invariant(format!(
                "No last passed build for the first failures of build {}",
                build.id
            )));
        };

        let rerun_builder_id = policy.rerun_builder_id(build)?;
        let repo = build.gitiles_commit.repo();

        let last_passed_position = match last_passed.commit_position {
            Some(position) => position,
            None => {
                self.source_control
                    .commit_position(&repo, &last_passed.commit_id)
                    .await?
            }
        };
        let first_failed_position = match build.gitiles_commit.position {
            Some(position) => position,
            None => {
                self.source_control
                    .commit_position(&repo, &build.gitiles_commit.id)
                    .await?
            }
        };
        let last_passed_commit = Commit::new(&last_passed.commit_id, last_passed_position);
        let first_failed_commit = Commit::new(&build.gitiles_commit.id, first_failed_position);
        let range = RegressionRange::new(last_passed_commit, first_failed_commit)?;

        let mut failures: Vec<AtomicFailure> = self
            .store
            .failures_for_build(build.id, kind)
            .into_iter()
            .filter(|f| first_failures.contains(&f.step_name, &f.identifier))
            .collect();
        let group_keys = failures.iter().map(|f| f.key).collect::<Vec<_>>();

        let samples = policy.failure_keys_to_analyze(&failures);
        let mut failure_keys = Vec::new();
        for failure in &mut failures {
            match samples.get(&failure.key) {
                Some(sample) if *sample != failure.key => failure.merged_failure_key = *sample,
                _ => failure_keys.push(failure.key),
            }
        }

        if self.settings.should_group_failures {
            let mut grouped: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
            for failure in &mut failures {
                grouped
                    .entry(failure.step_name.clone())
                    .or_default()
                    .extend(failure.identifier.names().map(str::to_string));
                failure.failure_group_build_id = Some(build.id);
            }
            self.store.put_group(FailureGroup {
                build_id: build.id,
                kind,
                luci_project: build.builder.project.clone(),
                repo: repo.clone(),
                last_passed_commit: range.last_passed.clone(),
                first_failed_commit: range.first_failed.clone(),
                failure_keys: group_keys.clone(),
                failures: grouped,
            });
            debug!("Build {} now groups {} failures", build.id, group_keys.len());
        }
        self.store.put_failures(&failures);

        let analysis = self.store.get_or_create_analysis(build.id, kind, |id| FailureAnalysis {
            id,
            kind,
            luci_project: build.builder.project.clone(),
            build_id: build.id,
            builder: build.builder.clone(),
            repo,
            last_passed_commit: range.last_passed.clone(),
            first_failed_commit: range.first_failed.clone(),
            rerun_builder_id,
            failure_keys,
            status: AnalysisStatus::Running,
            create_time: Utc::now(),
            start_time: None,
            end_time: None,
            error: None,
        });

        info!(
            "Opened {kind} analysis {} for build {} over {range} with {} failures",
            analysis.id,
            build.id,
            analysis.failure_keys.len()
        );
        Ok(analysis)
    }

    /// Culprits explaining `failure_keys`, each failure resolved through the
    /// failure it was merged into.
    pub fn get_culprits_for_failures(&self, failure_keys: &[FailureKey]) -> Vec<Culprit> {
        let mut culprits: BTreeMap<_, Culprit> = BTreeMap::new();

        for failure in self.store.failures(failure_keys) {
            let canonical = if failure.merged_failure_key == failure.key {
                Some(failure)
            } else {
                self.store.failure(failure.merged_failure_key)
            };
            let Some(culprit_key) = canonical.and_then(|f| f.culprit_commit_key) else {
                continue;
            };
            if culprits.contains_key(&culprit_key) {
                continue;
            }
            if let Some(culprit) = self.store.culprit(&culprit_key) {
                culprits.insert(culprit_key, culprit);
            }
        }

        culprits.into_values().collect()
    }
}
