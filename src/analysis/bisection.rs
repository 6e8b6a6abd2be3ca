use std::collections::BTreeMap;

use chrono::Utc;
use indexmap::IndexMap;
use log::{info, warn};

use crate::error::{CulpritError, Result};
use crate::model::{AnalysisId, AnalysisStatus, AtomicFailure, Commit, RerunBuild};

use super::analyzer::FailureAnalyzer;
use super::types::{RegressionRange, TickReport};

impl FailureAnalyzer {
    /// Runs one bisection tick of an analysis: narrows the regression range
    /// of every failure still lacking a culprit with the rerun results so
    /// far, records culprits where a range is down to one commit, and
    /// triggers a rerun build at the middle of every other range.
    ///
    /// # Errors
    ///
    /// Returns an error if the analysis does not exist, is already finished
    /// or has malformed bounds. Problems with a single range are recorded on
    /// the analysis instead.
    pub async fn rerun_based_analysis(&self, analysis_id: AnalysisId) -> Result<TickReport> {
        let mut analysis = self
            .store
            .analysis(analysis_id)
            .ok_or_else(|| CulpritError::NotFound(format!("analysis {analysis_id}")))?;
        if analysis.status.is_terminal() {
            return Err(CulpritError::Invariant(format!(
                "Analysis {analysis_id} is already {:?}",
                analysis.status
            )));
        }
        let policy = self.policies.get(analysis.kind)?;
        let range = RegressionRange::new(
            analysis.last_passed_commit.clone(),
            analysis.first_failed_commit.clone(),
        )?;

        if analysis.start_time.is_none() {
            analysis.start_time = Some(Utc::now());
        }

        let mut errors = Vec::new();
        let hashes = match self
            .source_control
            .commit_positions_to_hashes(
                &analysis.repo,
                &range.first_failed.gitiles_id,
                range.first_failed.commit_position,
                range.last_passed.commit_position,
            )
            .await
        {
            Ok(hashes) => hashes,
            Err(e) => {
                warn!("Failed to map commit positions of analysis {analysis_id}: {e}");
                errors.push(format!("Failed to map commit positions in {range}: {e}"));
                BTreeMap::new()
            }
        };

        let open: Vec<AtomicFailure> = self
            .store
            .failures(&analysis.failure_keys)
            .into_iter()
            .filter(|f| f.culprit_commit_key.is_none())
            .collect();
        let completed: Vec<RerunBuild> = self
            .store
            .rerun_builds(analysis_id)
            .into_iter()
            .filter(RerunBuild::is_completed)
            .collect();

        let groups = group_by_range(narrow_ranges(&range, open, &completed));
        info!(
            "Tick of analysis {analysis_id}: {} open ranges after {} completed reruns",
            groups.len(),
            completed.len()
        );

        let mut report = TickReport {
            analysis_id,
            status: analysis.status,
            culprits: Vec::new(),
            reruns: Vec::new(),
            open_ranges: Vec::new(),
            errors: Vec::new(),
        };
        let mut resolved = 0;
        let mut hard_errors = 0;

        for (range, failures) in &groups {
            let keys: Vec<_> = failures.iter().map(|f| f.key).collect();

            if range.is_culprit_found() {
                let culprit = self.store.record_culprit(
                    &analysis.repo,
                    &range.first_failed,
                    analysis_id,
                    &keys,
                );
                info!(
                    "Culprit of {} failures in analysis {analysis_id}: {}",
                    keys.len(),
                    culprit.commit
                );
                report.culprits.push(culprit);
                resolved += 1;
                continue;
            }

            report.open_ranges.push((keys, range.clone()));

            let position = range.bisect_position();
            let Some(gitiles_id) = hashes.get(&position) else {
                warn!("No commit hash at position {position} for range {range}");
                errors.push(format!(
                    "{range}: {}",
                    CulpritError::DataUnavailable(format!("no commit hash at position {position}"))
                ));
                hard_errors += 1;
                continue;
            };

            let commit = Commit::new(gitiles_id, position);
            info!("Bisecting {range} of analysis {analysis_id} at {commit}");
            match self
                .trigger_rerun_build(&analysis, policy.as_ref(), &commit, failures)
                .await
            {
                Ok(_) => report.reruns.push(position),
                Err(e) => {
                    warn!("Failed to get a rerun build at {commit}: {e}");
                    if e.is_hard() {
                        hard_errors += 1;
                    }
                    errors.push(format!("{range}: {e}"));
                }
            }
        }

        if resolved == groups.len() {
            analysis.status = AnalysisStatus::Completed;
            analysis.end_time = Some(Utc::now());
            info!("Analysis {analysis_id} found every culprit");
        } else if hard_errors == groups.len() {
            analysis.status = AnalysisStatus::Error;
            analysis.end_time = Some(Utc::now());
            warn!("Analysis {analysis_id} failed: no range made progress");
        }

        analysis.error = (!errors.is_empty()).then(|| errors.join("\n"));
        self.store.put_analysis(&analysis);

        report.status = analysis.status;
        report.errors = errors;
        Ok(report)
    }
}

/// Narrows `range` for every failure with the completed reruns, in commit
/// order.
fn narrow_ranges(
    range: &RegressionRange,
    failures: Vec<AtomicFailure>,
    completed: &[RerunBuild],
) -> Vec<(AtomicFailure, RegressionRange)> {
    failures
        .into_iter()
        .map(|failure| {
            let mut narrowed = range.clone();
            for rerun in completed {
                if !narrowed.can_narrow_at(rerun.commit.commit_position) {
                    continue;
                }
                if rerun.reproduces(&failure) {
                    narrowed.lower_first_failed(&rerun.commit);
                } else {
                    narrowed.raise_last_passed(&rerun.commit);
                }
            }
            (failure, narrowed)
        })
        .collect()
}

/// Failures sharing a narrowed range share a rerun build.
fn group_by_range(
    narrowed: Vec<(AtomicFailure, RegressionRange)>,
) -> IndexMap<RegressionRange, Vec<AtomicFailure>> {
    let mut groups: IndexMap<RegressionRange, Vec<AtomicFailure>> = IndexMap::new();
    for (failure, range) in narrowed {
        groups.entry(range).or_default().push(failure);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::testing::Harness;
    use crate::model::{BuildStatus, FailureKind};
    use serde_json::json;

    fn commit(position: u64) -> Commit {
        Commit::new(format!("git_sha_{position}"), position)
    }

    fn range(lp: u64, ff: u64) -> RegressionRange {
        RegressionRange::new(commit(lp), commit(ff)).unwrap()
    }

    mod narrow_ranges {
        use super::*;
        use crate::analysis::testing::{atomic_failure, completed_rerun};

        #[test]
        fn pass_raises_and_reproduction_lowers() {
            let failure = atomic_failure(1, &["a.o"]);
            let reruns = vec![
                completed_rerun(102, &[]),
                completed_rerun(105, &[&["a.o"]]),
            ];

            let narrowed = narrow_ranges(&range(100, 110), vec![failure], &reruns);
            assert_eq!(narrowed[0].1, range(102, 105));
        }

        #[test]
        fn reruns_outside_the_range_are_ignored() {
            let failure = atomic_failure(1, &["a.o"]);
            let reruns = vec![
                completed_rerun(95, &[&["a.o"]]),
                completed_rerun(110, &[]),
                completed_rerun(120, &[]),
            ];

            let narrowed = narrow_ranges(&range(100, 110), vec![failure], &reruns);
            assert_eq!(narrowed[0].1, range(100, 110));
        }

        #[test]
        fn diverging_failures_split() {
            let a = atomic_failure(1, &["a.o"]);
            let b = atomic_failure(2, &["b.o"]);
            let reruns = vec![completed_rerun(105, &[&["a.o"]])];

            let narrowed = narrow_ranges(&range(100, 110), vec![a, b], &reruns);
            assert_eq!(narrowed[0].1, range(100, 105));
            assert_eq!(narrowed[1].1, range(105, 110));

            let groups = group_by_range(narrowed);
            assert_eq!(groups.len(), 2);
        }

        #[test]
        fn width_never_grows() {
            let failure = atomic_failure(1, &["a.o"]);
            let results = [
                completed_rerun(105, &[&["a.o"]]),
                completed_rerun(102, &[]),
                completed_rerun(108, &[]),
                completed_rerun(103, &[]),
                completed_rerun(104, &[&["a.o"]]),
            ];

            let mut width = range(100, 110).width();
            for seen in 1..=results.len() {
                let narrowed =
                    narrow_ranges(&range(100, 110), vec![failure.clone()], &results[..seen]);
                assert!(narrowed[0].1.width() <= width);
                width = narrowed[0].1.width();
            }
            assert_eq!(width, 1);
        }
    }

    /// Completes the pending rerun at `position` on the fake orchestrator and
    /// feeds its result to the analyzer.
    async fn finish_rerun(harness: &Harness, position: u64, reproduced: &[&[&str]]) {
        let rerun = harness
            .orchestrator
            .triggered()
            .into_iter()
            .rev()
            .find(|t| t.position == position)
            .unwrap();
        harness.orchestrator.complete(rerun.build_id, reproduced);
        harness
            .analyzer
            .process_rerun_build_result(rerun.build_id, FailureKind::Compile)
            .await
            .unwrap();
    }

    fn bisected_positions(harness: &Harness) -> Vec<u64> {
        harness
            .orchestrator
            .triggered()
            .iter()
            .map(|t| t.position)
            .collect()
    }

    #[tokio::test]
    async fn test_bisects_to_culprit() {
        let harness = Harness::new();
        let analysis_id = harness.open_analysis(900, 100, 110, &[&["a.o"]]);

        let report = harness.analyzer.rerun_based_analysis(analysis_id).await.unwrap();
        assert_eq!(report.reruns, vec![105]);

        finish_rerun(&harness, 105, &[&["a.o"]]).await;
        assert_eq!(bisected_positions(&harness), vec![105, 102]);

        finish_rerun(&harness, 102, &[]).await;
        assert_eq!(bisected_positions(&harness), vec![105, 102, 103]);

        finish_rerun(&harness, 103, &[]).await;
        assert_eq!(bisected_positions(&harness), vec![105, 102, 103, 104]);

        finish_rerun(&harness, 104, &[&["a.o"]]).await;

        let analysis = harness.store.analysis(analysis_id).unwrap();
        assert_eq!(analysis.status, AnalysisStatus::Completed);
        assert!(analysis.end_time.is_some());
        assert!(analysis.error.is_none());

        let failure = harness.store.failure(analysis.failure_keys[0]).unwrap();
        let culprit = harness
            .store
            .culprit(failure.culprit_commit_key.as_ref().unwrap())
            .unwrap();
        assert_eq!(culprit.commit, commit(104));
        assert!(culprit.analysis_ids.contains(&analysis_id));
    }

    #[tokio::test]
    async fn test_converges_for_any_culprit() {
        for culprit_position in 101..=110 {
            let harness = Harness::new();
            let analysis_id = harness.open_analysis(900, 100, 110, &[&["a.o"]]);
            harness.analyzer.rerun_based_analysis(analysis_id).await.unwrap();

            for _ in 0..10 {
                let analysis = harness.store.analysis(analysis_id).unwrap();
                if analysis.status.is_terminal() {
                    break;
                }
                let position = *bisected_positions(&harness).last().unwrap();
                let reproduced: &[&[&str]] = if position >= culprit_position {
                    &[&["a.o"]]
                } else {
                    &[]
                };
                finish_rerun(&harness, position, reproduced).await;
            }

            let analysis = harness.store.analysis(analysis_id).unwrap();
            assert_eq!(analysis.status, AnalysisStatus::Completed);
            let culprit_key = harness
                .store
                .failure(analysis.failure_keys[0])
                .unwrap()
                .culprit_commit_key
                .unwrap();
            assert_eq!(
                harness.store.culprit(&culprit_key).unwrap().commit.commit_position,
                culprit_position
            );
            assert!(bisected_positions(&harness).len() <= 4);
        }
    }

    #[tokio::test]
    async fn test_diverging_failures_get_separate_reruns() {
        let harness = Harness::new();
        let analysis_id = harness.open_analysis(900, 100, 110, &[&["a.o"], &["b.o"]]);

        let report = harness.analyzer.rerun_based_analysis(analysis_id).await.unwrap();
        assert_eq!(report.reruns, vec![105]);

        finish_rerun(&harness, 105, &[&["a.o"]]).await;

        let mut positions = bisected_positions(&harness);
        positions.sort_unstable();
        assert_eq!(positions, vec![102, 105, 107]);

        let rerun_102 = harness
            .orchestrator
            .triggered()
            .into_iter()
            .find(|t| t.position == 102)
            .unwrap();
        let targets = &rerun_102.properties["$culprit_finder/bisect"]["compile"]["targets"];
        assert_eq!(targets, &json!(["a.o"]));
    }

    #[tokio::test]
    async fn test_inconclusive_reruns_do_not_narrow() {
        let harness = Harness::new();
        let analysis_id = harness.open_analysis(900, 100, 110, &[&["a.o"]]);
        harness.analyzer.rerun_based_analysis(analysis_id).await.unwrap();

        for status in [BuildStatus::InfraFailure, BuildStatus::Canceled] {
            let rerun = harness.orchestrator.triggered().last().unwrap().build_id;
            harness.orchestrator.finish_with(rerun, status);

            let report = harness
                .analyzer
                .process_rerun_build_result(rerun, FailureKind::Compile)
                .await
                .unwrap()
                .unwrap();

            assert_eq!(harness.store.rerun_build(rerun).unwrap().status, status);
            assert_eq!(report.status, AnalysisStatus::Running);
            assert_eq!(report.open_ranges[0].1, range(100, 110));
            assert_eq!(report.reruns, vec![105]);
        }
        assert_eq!(bisected_positions(&harness), vec![105, 105, 105]);
    }

    #[tokio::test]
    async fn test_terminal_analysis_is_rejected() {
        let harness = Harness::new();
        let analysis_id = harness.open_analysis(900, 103, 104, &[&["a.o"]]);

        let report = harness.analyzer.rerun_based_analysis(analysis_id).await.unwrap();
        assert_eq!(report.status, AnalysisStatus::Completed);
        assert_eq!(report.culprits.len(), 1);

        let again = harness.analyzer.rerun_based_analysis(analysis_id).await;
        assert!(matches!(again, Err(CulpritError::Invariant(_))));
    }

    #[tokio::test]
    async fn test_missing_hashes_move_analysis_to_error() {
        let harness = Harness::new();
        harness.source_control.fail_hash_lookups();
        let analysis_id = harness.open_analysis(900, 100, 110, &[&["a.o"]]);

        let report = harness.analyzer.rerun_based_analysis(analysis_id).await.unwrap();

        assert_eq!(report.status, AnalysisStatus::Error);
        assert!(harness.orchestrator.triggered().is_empty());
        let analysis = harness.store.analysis(analysis_id).unwrap();
        let error = analysis.error.unwrap();
        assert!(error.contains("Failed to map commit positions"));
        assert!(error.contains("no commit hash at position 105"));
        assert!(analysis.start_time.is_some());
    }

    #[tokio::test]
    async fn test_plugin_error_keeps_analysis_running() {
        let harness = Harness::new();
        let analysis_id = harness.open_analysis(900, 100, 110, &[]);

        let report = harness.analyzer.rerun_based_analysis(analysis_id).await.unwrap();

        assert_eq!(report.status, AnalysisStatus::Running);
        assert!(report.errors[0].contains("No compile targets"));
        assert!(harness.orchestrator.triggered().is_empty());
    }
}
