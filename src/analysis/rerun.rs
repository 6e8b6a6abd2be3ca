use std::collections::BTreeMap;

use chrono::Utc;
use log::{debug, info, warn};

use crate::error::{CulpritError, Result};
use crate::model::{
    AtomicFailure, BuildId, BuildStatus, BuilderId, Commit, FailureAnalysis, FailureKind,
    GitilesCommit, RerunBuild, Step,
};
use crate::services::FailurePolicy;

use super::analyzer::FailureAnalyzer;
use super::types::TickReport;

/// Rerun builds allowed per commit of one analysis.
pub const MAX_RERUN_ATTEMPTS: usize = 3;

impl FailureAnalyzer {
    /// Makes sure a rerun build checks `failures` at `commit` and returns
    /// its id.
    ///
    /// Runs inside the analysis transaction: a usable rerun already at
    /// `commit` is returned as is, so overlapping ticks of the same analysis
    /// trigger at most one build per commit.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit already used up its attempts, the
    /// policy cannot configure the rerun, or the build cannot be triggered.
    /// Nothing is saved in those cases.
    pub async fn trigger_rerun_build(
        &self,
        analysis: &FailureAnalysis,
        policy: &dyn FailurePolicy,
        commit: &Commit,
        failures: &[AtomicFailure],
    ) -> Result<BuildId> {
        let tx = self.store.begin_transaction(analysis.id).await;

        let existing = self.store.rerun_builds_at(&tx, commit.commit_position);
        if let Some(usable) = existing.iter().find(|r| r.status.is_usable_rerun()) {
            debug!(
                "Rerun build {} ({:?}) already checks {commit} for analysis {}",
                usable.build_id, usable.status, analysis.id
            );
            return Ok(usable.build_id);
        }
        if existing.len() >= MAX_RERUN_ATTEMPTS {
            return Err(CulpritError::RerunCapExceeded {
                commit_position: commit.commit_position,
                attempts: existing.len(),
            });
        }

        let properties = policy.rerun_build_input_properties(failures)?;
        let tags = policy.rerun_build_tags(analysis.build_id);
        let builder: BuilderId = analysis.rerun_builder_id.parse()?;
        let gitiles_commit = GitilesCommit::at(&analysis.repo, commit);

        let build = self
            .orchestrator
            .trigger_build(&builder, &gitiles_commit, properties, &tags)
            .await
            .map_err(|e| match e {
                CulpritError::Trigger(_) => e,
                other => CulpritError::Trigger(other.to_string()),
            })?;

        self.store.insert_rerun_build(
            &tx,
            RerunBuild {
                build_id: build.id,
                analysis_id: analysis.id,
                commit: commit.clone(),
                status: build.status,
                failures: BTreeMap::new(),
                create_time: Utc::now(),
                end_time: None,
            },
        )?;

        info!(
            "Triggered rerun build {} on {builder} at {commit} for analysis {} (attempt {})",
            build.id,
            analysis.id,
            existing.len() + 1
        );
        Ok(build.id)
    }

    /// Records the result of rerun build `build_id` and, once it has ended,
    /// runs the next bisection tick of its analysis.
    ///
    /// Returns `None` when no tick ran: the build is still running or the
    /// analysis already finished.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if the build carries no analyzed build tag,
    /// or the analysis or rerun entity it points to does not exist.
    pub async fn process_rerun_build_result(
        &self,
        build_id: BuildId,
        kind: FailureKind,
    ) -> Result<Option<TickReport>> {
        let build = self.orchestrator.get_build(build_id).await?;
        let analyzed_build_id: BuildId = build
            .tag("analyzed_build_id")
            .and_then(|value| value.parse().ok())
            .ok_or_else(|| {
                CulpritError::NotFound(format!("analyzed_build_id tag on build {build_id}"))
            })?;

        let analysis = self
            .store
            .analysis_for_build(analyzed_build_id, kind)
            .ok_or_else(|| {
                CulpritError::NotFound(format!(
                    "{kind} analysis of build {analyzed_build_id}"
                ))
            })?;
        let mut rerun = self
            .store
            .rerun_build(build_id)
            .filter(|r| r.analysis_id == analysis.id)
            .ok_or_else(|| {
                CulpritError::NotFound(format!(
                    "rerun build {build_id} of analysis {}",
                    analysis.id
                ))
            })?;

        rerun.status = build.status;
        if !build.status.is_completed() {
            self.store.update_rerun_build(&rerun)?;
            debug!("Rerun build {build_id} is still {:?}", build.status);
            return Ok(None);
        }

        rerun.end_time = Some(Utc::now());
        if build.status == BuildStatus::Failure {
            let policy = self.policies.get(kind)?;
            let failed_steps: Vec<&Step> = build
                .failed_steps()
                .filter(|step| policy.is_failure_step(&build, step))
                .collect();
            rerun.failures = policy
                .failures_in_build(&build, &failed_steps)
                .into_iter()
                .map(|(step_name, step)| (step_name, step.identifiers()))
                .collect();
        }
        self.store.update_rerun_build(&rerun)?;
        info!(
            "Rerun build {build_id} at {} ended {:?} with {} failed steps",
            rerun.commit,
            rerun.status,
            rerun.failures.len()
        );

        if analysis.status.is_terminal() {
            warn!(
                "Analysis {} already ended {:?}, not ticking",
                analysis.id, analysis.status
            );
            return Ok(None);
        }

        self.rerun_based_analysis(analysis.id).await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::testing::Harness;
    use crate::model::{AnalysisStatus, FailureIdentifier};

    fn commit(position: u64) -> Commit {
        Commit::new(format!("git_sha_{position}"), position)
    }

    mod trigger_rerun_build {
        use super::*;

        #[tokio::test]
        async fn concurrent_triggers_create_one_rerun() {
            let harness = Harness::new();
            let analysis_id = harness.open_analysis(900, 100, 110, &[&["a.o"]]);
            let analysis = harness.store.analysis(analysis_id).unwrap();
            let failures = harness.store.failures(&analysis.failure_keys);
            let policy = harness.policy(FailureKind::Compile);
            let at_105 = commit(105);

            let (first, second) = tokio::join!(
                harness
                    .analyzer
                    .trigger_rerun_build(&analysis, policy.as_ref(), &at_105, &failures),
                harness
                    .analyzer
                    .trigger_rerun_build(&analysis, policy.as_ref(), &at_105, &failures),
            );

            assert_eq!(first.unwrap(), second.unwrap());
            let triggered = harness.orchestrator.triggered();
            assert_eq!(triggered.len(), 1);
            assert_eq!(triggered[0].position, 105);
            assert!(triggered[0]
                .tags
                .contains(&("analyzed_build_id".to_string(), "900".to_string())));
            assert_eq!(harness.store.rerun_builds(analysis_id).len(), 1);
        }

        #[tokio::test]
        async fn fourth_attempt_is_refused() {
            let harness = Harness::new();
            let analysis_id = harness.open_analysis(900, 100, 110, &[&["a.o"]]);
            let analysis = harness.store.analysis(analysis_id).unwrap();
            let failures = harness.store.failures(&analysis.failure_keys);
            let policy = harness.policy(FailureKind::Compile);

            for _ in 0..MAX_RERUN_ATTEMPTS {
                let build_id = harness
                    .analyzer
                    .trigger_rerun_build(&analysis, policy.as_ref(), &commit(105), &failures)
                    .await
                    .unwrap();
                harness.orchestrator.finish_with(build_id, BuildStatus::InfraFailure);
                harness
                    .analyzer
                    .process_rerun_build_result(build_id, FailureKind::Compile)
                    .await
                    .unwrap();
            }
            assert_eq!(harness.orchestrator.triggered().len(), MAX_RERUN_ATTEMPTS);

            let result = harness
                .analyzer
                .trigger_rerun_build(&analysis, policy.as_ref(), &commit(105), &failures)
                .await;

            assert!(matches!(
                result,
                Err(CulpritError::RerunCapExceeded {
                    commit_position: 105,
                    attempts: 3
                })
            ));
            assert_eq!(harness.store.rerun_builds(analysis_id).len(), 3);
        }

        #[tokio::test]
        async fn trigger_failure_saves_nothing() {
            let harness = Harness::new();
            harness.orchestrator.refuse_triggers();
            let analysis_id = harness.open_analysis(900, 100, 110, &[&["a.o"]]);
            let analysis = harness.store.analysis(analysis_id).unwrap();
            let failures = harness.store.failures(&analysis.failure_keys);
            let policy = harness.policy(FailureKind::Compile);

            let result = harness
                .analyzer
                .trigger_rerun_build(&analysis, policy.as_ref(), &commit(105), &failures)
                .await;

            assert!(matches!(result, Err(CulpritError::Trigger(_))));
            assert!(harness.store.rerun_builds(analysis_id).is_empty());
        }
    }

    mod process_rerun_build_result {
        use super::*;

        #[tokio::test]
        async fn running_build_does_not_tick() {
            let harness = Harness::new();
            let analysis_id = harness.open_analysis(900, 100, 110, &[&["a.o"]]);
            harness.analyzer.rerun_based_analysis(analysis_id).await.unwrap();
            let rerun = harness.orchestrator.triggered()[0].build_id;
            harness.orchestrator.finish_with(rerun, BuildStatus::Started);

            let report = harness
                .analyzer
                .process_rerun_build_result(rerun, FailureKind::Compile)
                .await
                .unwrap();

            assert!(report.is_none());
            assert_eq!(
                harness.store.rerun_build(rerun).unwrap().status,
                BuildStatus::Started
            );
        }

        #[tokio::test]
        async fn failed_rerun_records_observed_failures() {
            let harness = Harness::new();
            let analysis_id = harness.open_analysis(900, 100, 110, &[&["a.o"]]);
            harness.analyzer.rerun_based_analysis(analysis_id).await.unwrap();
            let rerun = harness.orchestrator.triggered()[0].build_id;
            harness.orchestrator.complete(rerun, &[&["a.o"]]);

            let report = harness
                .analyzer
                .process_rerun_build_result(rerun, FailureKind::Compile)
                .await
                .unwrap()
                .unwrap();

            let saved = harness.store.rerun_build(rerun).unwrap();
            assert_eq!(saved.status, BuildStatus::Failure);
            let expected: FailureIdentifier = ["a.o"].into_iter().collect();
            assert_eq!(saved.failures["compile"], vec![expected]);
            assert!(saved.end_time.is_some());
            assert_eq!(report.status, AnalysisStatus::Running);
            assert_eq!(report.reruns, vec![102]);
        }

        #[tokio::test]
        async fn missing_tag_is_not_found() {
            let harness = Harness::new();
            let mut build = crate::analysis::testing::failed_compile(5000, 1, 105, &[]);
            build.tags.clear();
            harness.add_build(build);

            let result = harness
                .analyzer
                .process_rerun_build_result(5000, FailureKind::Compile)
                .await;
            assert!(matches!(result, Err(CulpritError::NotFound(_))));
        }

        #[tokio::test]
        async fn unknown_rerun_is_not_found() {
            let harness = Harness::new();
            harness.open_analysis(900, 100, 110, &[&["a.o"]]);
            let mut build = crate::analysis::testing::failed_compile(5000, 1, 105, &[]);
            build.tags = vec![("analyzed_build_id".to_string(), "900".to_string())];
            harness.add_build(build);

            let result = harness
                .analyzer
                .process_rerun_build_result(5000, FailureKind::Compile)
                .await;
            assert!(matches!(result, Err(CulpritError::NotFound(_))));
        }
    }
}
