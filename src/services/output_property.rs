use std::collections::{BTreeMap, BTreeSet};

use log::{debug, warn};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::analysis::{
    AnalysisContext, AtomicFailureInfo, DetailedFailures, FirstFailures, GroupMatches, StepFailure,
};
use crate::error::{CulpritError, Result};
use crate::model::{
    AtomicFailure, Build, BuildId, BuildRef, BuilderId, FailureGroup, FailureIdentifier,
    FailureKey, FailureKind, Step,
};

use super::policy::FailurePolicy;

const COMPILE_FAILURES: &str = "compile_failures";
const TEST_FAILURES: &str = "test_failures";
const BISECT_BUILDER: &str = "BISECT_BUILDER";
const DEFAULT_COMPILE_STEP: &str = "compile";

/// Input property a rerun build reads to learn what it has to check.
pub const BISECT_PROPERTY: &str = "$culprit_finder/bisect";

#[derive(Debug, Deserialize)]
struct CompileFailures {
    failed_step: String,
    #[serde(default)]
    failures: Vec<CompileFailure>,
}

#[derive(Debug, Deserialize)]
struct CompileFailure {
    #[serde(default)]
    output_targets: Vec<String>,
    rule: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TestFailure {
    failed_step: String,
    test_spec: String,
    suite: Option<String>,
}

/// Reads failures from output properties the build itself reports.
///
/// Compile builds report `compile_failures`:
///
/// ```json
/// {"failed_step": "compile", "failures": [{"output_targets": ["obj/a.o"], "rule": "CXX"}]}
/// ```
///
/// Test builds report `test_failures`, keyed by failure type:
///
/// ```json
/// {"unittest": [{"failed_step": "base_unittests", "test_spec": "//base:base_unittests", "suite": "base"}]}
/// ```
///
/// Test failures are only known per step.
pub struct OutputPropertyPolicy {
    kind: FailureKind,
}

impl OutputPropertyPolicy {
    pub fn new(kind: FailureKind) -> Self {
        Self { kind }
    }

    fn compile_failures(build: &Build) -> Option<CompileFailures> {
        let value = build.output_property(COMPILE_FAILURES)?;
        match serde_json::from_value(value.clone()) {
            Ok(failures) => Some(failures),
            Err(e) => {
                warn!("Ignoring malformed {COMPILE_FAILURES} on build {}: {e}", build.id);
                None
            }
        }
    }

    /// `(failure type, entry)` pairs of the build's test failures.
    fn test_failures(build: &Build) -> Vec<(String, TestFailure)> {
        let Some(Value::Object(by_type)) = build.output_property(TEST_FAILURES) else {
            return Vec::new();
        };

        let mut failures = Vec::new();
        for (failure_type, entries) in by_type {
            let Some(entries) = entries.as_array() else {
                warn!("Ignoring {TEST_FAILURES}.{failure_type} on build {}: not a list", build.id);
                continue;
            };
            for entry in entries {
                match serde_json::from_value::<TestFailure>(entry.clone()) {
                    Ok(failure) => failures.push((failure_type.clone(), failure)),
                    Err(e) => warn!(
                        "Ignoring malformed {TEST_FAILURES}.{failure_type} entry on build {}: {e}",
                        build.id
                    ),
                }
            }
        }
        failures
    }

    fn compile_step_failures(&self, build: &Build, step: &Step) -> StepFailure {
        let build_ref = BuildRef::from(build);
        let mut step_failure = StepFailure::new(&build_ref);

        let Some(compile) = Self::compile_failures(build) else {
            return step_failure;
        };
        if compile.failed_step != step.name {
            return step_failure;
        }

        for failure in compile.failures {
            if failure.output_targets.is_empty() {
                warn!("Ignoring compile failure without targets on build {}", build.id);
                continue;
            }
            let mut properties = Map::new();
            if let Some(rule) = failure.rule {
                properties.insert("rule".to_string(), Value::String(rule));
            }
            let identifier: FailureIdentifier = failure.output_targets.into_iter().collect();
            if step_failure.failures.iter().any(|f| f.identifier == identifier) {
                continue;
            }
            step_failure
                .failures
                .push(AtomicFailureInfo::new(identifier, properties, &build_ref));
        }
        step_failure
    }

    fn test_step_failures(&self, build: &Build, step: &Step) -> StepFailure {
        let mut step_failure = StepFailure::new(&BuildRef::from(build));

        let tests: Vec<Value> = Self::test_failures(build)
            .into_iter()
            .filter(|(_, failure)| failure.failed_step == step.name)
            .map(|(failure_type, failure)| {
                json!({
                    "failure_type": failure_type,
                    "test_spec": failure.test_spec,
                    "suite": failure.suite,
                })
            })
            .collect();

        if !tests.is_empty() {
            step_failure
                .properties
                .insert("tests".to_string(), Value::Array(tests));
        }
        step_failure
    }

    /// Suite of the first test of a step-level test failure.
    fn suite(failure: &AtomicFailure) -> Option<&str> {
        failure
            .properties
            .get("tests")
            .and_then(Value::as_array)?
            .iter()
            .find_map(|test| test.get("suite").and_then(Value::as_str))
    }

    fn compile_rerun_properties(failures: &[AtomicFailure]) -> Result<Value> {
        let targets: BTreeSet<&str> = failures
            .iter()
            .flat_map(|f| f.identifier.names())
            .collect();
        if targets.is_empty() {
            return Err(CulpritError::Plugin(
                "No compile targets to check in rerun build".to_string(),
            ));
        }
        Ok(json!({ "compile": { "targets": targets } }))
    }

    fn test_rerun_properties(failures: &[AtomicFailure]) -> Result<Value> {
        let mut by_type: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for failure in failures {
            let tests = failure
                .properties
                .get("tests")
                .and_then(Value::as_array)
                .into_iter()
                .flatten();
            for test in tests {
                let (Some(failure_type), Some(test_spec)) = (
                    test.get("failure_type").and_then(Value::as_str),
                    test.get("test_spec").and_then(Value::as_str),
                ) else {
                    continue;
                };
                let entry = json!({ "test_spec": test_spec });
                let specs = by_type.entry(failure_type.to_string()).or_default();
                if !specs.contains(&entry) {
                    specs.push(entry);
                }
            }
        }

        if by_type.is_empty() {
            return Err(CulpritError::Plugin(
                "No test specs to check in rerun build".to_string(),
            ));
        }
        Ok(json!({ "test": by_type }))
    }
}

impl FailurePolicy for OutputPropertyPolicy {
    fn kind(&self) -> FailureKind {
        self.kind
    }

    fn is_failure_step(&self, build: &Build, step: &Step) -> bool {
        match self.kind {
            FailureKind::Compile => match Self::compile_failures(build) {
                Some(compile) => compile.failed_step == step.name,
                None => step.name == DEFAULT_COMPILE_STEP,
            },
            FailureKind::Test => Self::test_failures(build)
                .iter()
                .any(|(_, failure)| failure.failed_step == step.name),
        }
    }

    fn failures_in_build(&self, build: &Build, failed_steps: &[&Step]) -> DetailedFailures {
        failed_steps
            .iter()
            .map(|step| {
                let step_failure = match self.kind {
                    FailureKind::Compile => self.compile_step_failures(build, step),
                    FailureKind::Test => self.test_step_failures(build, step),
                };
                (step.name.clone(), step_failure)
            })
            .collect()
    }

    fn failures_with_matching_groups(
        &self,
        context: &AnalysisContext,
        build: &Build,
        first_failures: &FirstFailures,
        candidates: &[FailureGroup],
    ) -> GroupMatches {
        let mut matches = GroupMatches::new();
        for (step_name, step) in &first_failures.steps {
            let targets: BTreeSet<String> = step
                .identifiers
                .iter()
                .flat_map(|id| id.names().map(str::to_string))
                .collect();

            let group = candidates.iter().find(|group| {
                group.build_id != build.id
                    && group.kind == self.kind
                    && group.repo == context.repo
                    && group.first_failed_commit.gitiles_id == context.gitiles_id
                    && group.last_passed_commit.gitiles_id == step.last_passed.commit_id
                    && group.failures.get(step_name).is_some_and(|group_targets| {
                        self.kind == FailureKind::Test || *group_targets == targets
                    })
            });

            if let Some(group) = group {
                debug!(
                    "Step {step_name} of build {} matches group of build {}",
                    build.id, group.build_id
                );
                matches.entry(step_name.clone()).or_default().extend(
                    step.identifiers
                        .iter()
                        .map(|identifier| (identifier.clone(), group.build_id)),
                );
            }
        }
        matches
    }

    fn failure_keys_to_analyze(
        &self,
        failures: &[AtomicFailure],
    ) -> BTreeMap<FailureKey, FailureKey> {
        let mut ordered: Vec<&AtomicFailure> = failures.iter().collect();
        ordered.sort_by_key(|f| f.key);

        let mut samples: BTreeMap<&str, FailureKey> = BTreeMap::new();
        let mut to_analyze = BTreeMap::new();
        for failure in ordered {
            let sample = match (self.kind, Self::suite(failure)) {
                (FailureKind::Test, Some(suite)) => *samples.entry(suite).or_insert(failure.key),
                _ => failure.key,
            };
            if sample != failure.key {
                debug!(
                    "Failure {} in {} is analyzed through failure {sample}",
                    failure.key, failure.step_name
                );
            }
            to_analyze.insert(failure.key, sample);
        }
        to_analyze
    }

    fn rerun_builder_id(&self, build: &Build) -> Result<String> {
        let Some(name) = build.output_property(BISECT_BUILDER).and_then(Value::as_str) else {
            return Err(CulpritError::Plugin(format!(
                "Build {} has no {BISECT_BUILDER} output property",
                build.id
            )));
        };

        if name.contains('/') {
            let builder: BuilderId = name
                .parse()
                .map_err(|e| CulpritError::Plugin(format!("Invalid {BISECT_BUILDER}: {e}")))?;
            return Ok(builder.to_string());
        }

        Ok(format!(
            "{}/{}/{name}",
            build.builder.project, build.builder.bucket
        ))
    }

    fn rerun_build_input_properties(
        &self,
        failures: &[AtomicFailure],
    ) -> Result<Map<String, Value>> {
        let bisect = match self.kind {
            FailureKind::Compile => Self::compile_rerun_properties(failures)?,
            FailureKind::Test => Self::test_rerun_properties(failures)?,
        };

        let mut properties = Map::new();
        properties.insert(BISECT_PROPERTY.to_string(), bisect);
        Ok(properties)
    }

    fn rerun_build_tags(&self, analyzed_build_id: BuildId) -> Vec<(String, String)> {
        vec![
            ("analyzed_build_id".to_string(), analyzed_build_id.to_string()),
            ("failure_kind".to_string(), self.kind.to_string()),
        ]
    }
}
