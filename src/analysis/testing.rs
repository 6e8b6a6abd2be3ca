//! In-memory stand-ins for the build orchestrator and source control, and a
//! harness wiring them into an analyzer.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::error::{CulpritError, Result};
use crate::model::{
    AnalysisId, AnalysisStatus, AtomicFailure, Build, BuildId, BuildStatus, BuilderId, Commit,
    FailureAnalysis, FailureIdentifier, FailureKey, FailureKind, GitilesCommit, GitilesRepo,
    RerunBuild, Step,
};
use crate::services::{
    BuildOrchestrator, FailurePolicy, OutputPropertyPolicy, PolicyRegistry, SourceControl,
};
use crate::store::FailureStore;

use super::analyzer::{AnalysisSettings, FailureAnalyzer};

const HOST: &str = "chromium.googlesource.com";
const PROJECT: &str = "chromium/src";
const REF: &str = "refs/heads/main";

pub fn hash(position: u64) -> String {
    format!("git_sha_{position}")
}

fn repo() -> GitilesRepo {
    GitilesRepo {
        host: HOST.to_string(),
        project: PROJECT.to_string(),
        ref_: REF.to_string(),
    }
}

fn builder(name: &str) -> BuilderId {
    BuilderId {
        project: "chromium".to_string(),
        bucket: "ci".to_string(),
        builder: name.to_string(),
    }
}

fn compile_step(status: BuildStatus) -> Step {
    Step {
        name: "compile".to_string(),
        status,
    }
}

fn compile_failures(targets: &[&[&str]]) -> Value {
    let failures: Vec<Value> = targets
        .iter()
        .map(|names| json!({"output_targets": names, "rule": "CXX"}))
        .collect();
    json!({"failed_step": "compile", "failures": failures})
}

/// A build of `builder_name` at commit `position`. Failed builds have a
/// failed compile step reporting `targets`; without targets the step has no
/// detail.
pub fn compile_build_on(
    builder_name: &str,
    id: BuildId,
    number: u64,
    position: u64,
    status: BuildStatus,
) -> Build {
    let mut output_properties = Map::new();
    output_properties.insert("BISECT_BUILDER".to_string(), json!("linux-rel-bisect"));
    Build {
        id,
        number,
        builder: builder(builder_name),
        status,
        gitiles_commit: GitilesCommit::at(&repo(), &Commit::new(hash(position), position)),
        steps: vec![compile_step(status)],
        output_properties,
        tags: Vec::new(),
    }
}

pub fn failed_compile_on(
    builder_name: &str,
    id: BuildId,
    number: u64,
    position: u64,
    targets: &[&[&str]],
) -> Build {
    let mut build = compile_build_on(builder_name, id, number, position, BuildStatus::Failure);
    if !targets.is_empty() {
        build
            .output_properties
            .insert("compile_failures".to_string(), compile_failures(targets));
    }
    build
}

/// A build of `chromium/ci/linux-rel`.
pub fn compile_build(
    id: BuildId,
    number: u64,
    position: u64,
    status: BuildStatus,
    targets: &[&[&str]],
) -> Build {
    if status == BuildStatus::Failure {
        failed_compile_on("linux-rel", id, number, position, targets)
    } else {
        compile_build_on("linux-rel", id, number, position, status)
    }
}

pub fn failed_compile(id: BuildId, number: u64, position: u64, targets: &[&[&str]]) -> Build {
    failed_compile_on("linux-rel", id, number, position, targets)
}

/// A compile failure of build 900 on `names`.
pub fn atomic_failure(key: u64, names: &[&str]) -> AtomicFailure {
    AtomicFailure {
        key: FailureKey(key),
        build_id: 900,
        kind: FailureKind::Compile,
        step_name: "compile".to_string(),
        identifier: names.iter().copied().collect(),
        first_failed_build_id: 900,
        last_passed_build_id: Some(700),
        merged_failure_key: FailureKey(key),
        failure_group_build_id: None,
        properties: Map::new(),
        culprit_commit_key: None,
    }
}

/// A finished rerun at `position`: passed when nothing reproduced, failed
/// on `reproduced` otherwise.
pub fn completed_rerun(position: u64, reproduced: &[&[&str]]) -> RerunBuild {
    let mut failures = BTreeMap::new();
    if !reproduced.is_empty() {
        let identifiers: Vec<FailureIdentifier> = reproduced
            .iter()
            .map(|names| names.iter().copied().collect())
            .collect();
        failures.insert("compile".to_string(), identifiers);
    }
    RerunBuild {
        build_id: 5000 + position as BuildId,
        analysis_id: AnalysisId(1),
        commit: Commit::new(hash(position), position),
        status: if reproduced.is_empty() {
            BuildStatus::Success
        } else {
            BuildStatus::Failure
        },
        failures,
        create_time: Utc::now(),
        end_time: Some(Utc::now()),
    }
}

/// A rerun build the fake orchestrator was asked for.
#[derive(Debug, Clone)]
pub struct Triggered {
    pub build_id: BuildId,
    pub position: u64,
    pub properties: Map<String, Value>,
    pub tags: Vec<(String, String)>,
}

pub struct FakeOrchestrator {
    builds: Mutex<BTreeMap<BuildId, Build>>,
    triggered: Mutex<Vec<Triggered>>,
    next_id: AtomicI64,
    refuse: AtomicBool,
}

impl FakeOrchestrator {
    fn new() -> Self {
        Self {
            builds: Mutex::new(BTreeMap::new()),
            triggered: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(10_000),
            refuse: AtomicBool::new(false),
        }
    }

    pub fn add(&self, build: Build) {
        self.builds.lock().unwrap().insert(build.id, build);
    }

    pub fn build(&self, id: BuildId) -> Build {
        self.builds.lock().unwrap()[&id].clone()
    }

    pub fn triggered(&self) -> Vec<Triggered> {
        self.triggered.lock().unwrap().clone()
    }

    /// Makes every later trigger fail as if the orchestrator said no.
    pub fn refuse_triggers(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    /// Ends rerun `id`: passing when nothing reproduced, failing the compile
    /// step on `reproduced` otherwise.
    pub fn complete(&self, id: BuildId, reproduced: &[&[&str]]) {
        let mut builds = self.builds.lock().unwrap();
        let build = builds.get_mut(&id).unwrap();
        if reproduced.is_empty() {
            build.status = BuildStatus::Success;
            build.steps = vec![compile_step(BuildStatus::Success)];
        } else {
            build.status = BuildStatus::Failure;
            build.steps = vec![compile_step(BuildStatus::Failure)];
            build
                .output_properties
                .insert("compile_failures".to_string(), compile_failures(reproduced));
        }
    }

    /// Moves rerun `id` to `status` without any step results.
    pub fn finish_with(&self, id: BuildId, status: BuildStatus) {
        let mut builds = self.builds.lock().unwrap();
        let build = builds.get_mut(&id).unwrap();
        build.status = status;
        build.steps.clear();
    }
}

#[async_trait]
impl BuildOrchestrator for FakeOrchestrator {
    async fn search_builds_on_builder(
        &self,
        builder: &BuilderId,
        before: BuildId,
        page_size: usize,
    ) -> Result<Vec<Build>> {
        let builds = self.builds.lock().unwrap();
        let before_number = builds.get(&before).map_or(u64::MAX, |b| b.number);
        let mut found: Vec<Build> = builds
            .values()
            .filter(|b| &b.builder == builder && b.number < before_number)
            .map(|b| Build {
                steps: Vec::new(),
                output_properties: Map::new(),
                ..b.clone()
            })
            .collect();
        found.sort_by(|a, b| b.number.cmp(&a.number));
        found.truncate(page_size);
        Ok(found)
    }

    async fn get_build(&self, id: BuildId) -> Result<Build> {
        self.builds
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| CulpritError::NotFound(format!("build {id}")))
    }

    async fn trigger_build(
        &self,
        builder: &BuilderId,
        commit: &GitilesCommit,
        properties: Map<String, Value>,
        tags: &[(String, String)],
    ) -> Result<Build> {
        tokio::task::yield_now().await;
        if self.refuse.load(Ordering::SeqCst) {
            return Err(CulpritError::Api {
                status: 403,
                message: "PERMISSION_DENIED".to_string(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let build = Build {
            id,
            number: id as u64,
            builder: builder.clone(),
            status: BuildStatus::Scheduled,
            gitiles_commit: commit.clone(),
            steps: Vec::new(),
            output_properties: Map::new(),
            tags: tags.to_vec(),
        };
        self.add(build.clone());
        self.triggered.lock().unwrap().push(Triggered {
            build_id: id,
            position: commit.position.unwrap_or_default(),
            properties,
            tags: tags.to_vec(),
        });
        Ok(build)
    }
}

/// Source control where the commit at position `p` is `git_sha_{p}`.
#[derive(Default)]
pub struct FakeSourceControl {
    fail_hashes: AtomicBool,
}

impl FakeSourceControl {
    pub fn fail_hash_lookups(&self) {
        self.fail_hashes.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SourceControl for FakeSourceControl {
    async fn commit_position(&self, _repo: &GitilesRepo, revision: &str) -> Result<u64> {
        revision
            .strip_prefix("git_sha_")
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| CulpritError::DataUnavailable(format!("no position for {revision}")))
    }

    async fn commit_positions_to_hashes(
        &self,
        _repo: &GitilesRepo,
        _from_revision: &str,
        from_position: u64,
        to_position: u64,
    ) -> Result<BTreeMap<u64, String>> {
        if self.fail_hashes.load(Ordering::SeqCst) {
            return Err(CulpritError::DataUnavailable("gitiles is down".to_string()));
        }
        if to_position > from_position {
            return Err(CulpritError::Invariant(format!(
                "inverted range {to_position}..{from_position}"
            )));
        }
        Ok((to_position..=from_position).map(|p| (p, hash(p))).collect())
    }
}

pub struct Harness {
    pub analyzer: FailureAnalyzer,
    pub store: Arc<FailureStore>,
    pub orchestrator: Arc<FakeOrchestrator>,
    pub source_control: Arc<FakeSourceControl>,
    policies: PolicyRegistry,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(AnalysisSettings::default())
    }

    pub fn with_settings(settings: AnalysisSettings) -> Self {
        let store = Arc::new(FailureStore::in_memory());
        let orchestrator = Arc::new(FakeOrchestrator::new());
        let source_control = Arc::new(FakeSourceControl::default());
        let policies = PolicyRegistry::new()
            .register(Arc::new(OutputPropertyPolicy::new(FailureKind::Compile)))
            .register(Arc::new(OutputPropertyPolicy::new(FailureKind::Test)));
        let analyzer = FailureAnalyzer::new(
            store.clone(),
            orchestrator.clone(),
            source_control.clone(),
            policies.clone(),
            settings,
        );
        Self {
            analyzer,
            store,
            orchestrator,
            source_control,
            policies,
        }
    }

    pub fn add_build(&self, build: Build) {
        self.orchestrator.add(build);
    }

    pub fn policy(&self, kind: FailureKind) -> Arc<dyn FailurePolicy> {
        self.policies.get(kind).unwrap()
    }

    /// Stores a running compile analysis of build `build_id` over
    /// `(last_passed, first_failed]` with one failure per target set, or a
    /// single step-level failure when `targets` is empty.
    pub fn open_analysis(
        &self,
        build_id: BuildId,
        last_passed: u64,
        first_failed: u64,
        targets: &[&[&str]],
    ) -> AnalysisId {
        let build = failed_compile(build_id, 130, first_failed, targets);
        self.add_build(build.clone());

        let identifiers: Vec<FailureIdentifier> = if targets.is_empty() {
            vec![FailureIdentifier::step_level()]
        } else {
            targets
                .iter()
                .map(|names| names.iter().copied().collect())
                .collect()
        };
        let failures: Vec<AtomicFailure> = identifiers
            .into_iter()
            .map(|identifier| {
                let key = self.store.allocate_failure_key();
                AtomicFailure {
                    key,
                    build_id,
                    kind: FailureKind::Compile,
                    step_name: "compile".to_string(),
                    identifier,
                    first_failed_build_id: build_id,
                    last_passed_build_id: Some(700),
                    merged_failure_key: key,
                    failure_group_build_id: None,
                    properties: Map::new(),
                    culprit_commit_key: None,
                }
            })
            .collect();
        self.store.put_failures(&failures);

        let analysis = self
            .store
            .get_or_create_analysis(build_id, FailureKind::Compile, |id| FailureAnalysis {
                id,
                kind: FailureKind::Compile,
                luci_project: "chromium".to_string(),
                build_id,
                builder: build.builder.clone(),
                repo: repo(),
                last_passed_commit: Commit::new(hash(last_passed), last_passed),
                first_failed_commit: Commit::new(hash(first_failed), first_failed),
                rerun_builder_id: "chromium/ci/linux-rel-bisect".to_string(),
                failure_keys: failures.iter().map(|f| f.key).collect(),
                status: AnalysisStatus::Running,
                create_time: Utc::now(),
                start_time: None,
                end_time: None,
                error: None,
            });
        analysis.id
    }
}
