use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use fs2::FileExt;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::{CulpritError, Result};
use crate::model::{
    AnalysisId, AtomicFailure, BuildId, Commit, Culprit, CulpritKey, FailureAnalysis,
    FailureGroup, FailureIdentifier, FailureKey, FailureKind, GitilesRepo, RerunBuild,
};

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    next_failure_key: u64,
    next_analysis_id: u64,
    failures: BTreeMap<FailureKey, AtomicFailure>,
    groups: BTreeMap<BuildId, FailureGroup>,
    analyses: BTreeMap<AnalysisId, FailureAnalysis>,
    rerun_builds: BTreeMap<BuildId, RerunBuild>,
    culprits: BTreeMap<CulpritKey, Culprit>,
}

/// Proof that the caller holds the transaction lock of one analysis.
///
/// Dropping it commits: every write made while it is held is already visible
/// in the store, and the next transaction on the same analysis can start.
pub struct AnalysisTransaction {
    analysis_id: AnalysisId,
    _guard: OwnedMutexGuard<()>,
}

impl AnalysisTransaction {
    pub fn analysis_id(&self) -> AnalysisId {
        self.analysis_id
    }
}

/// Storage for failures, groups, analyses, rerun builds and culprits.
///
/// Entity tables live behind a blocking mutex that is never held across an
/// `.await`. Writers that need a read-check-write sequence spanning a remote
/// call take an [`AnalysisTransaction`] first.
///
/// The store can be snapshotted to a JSON file so that analyses survive
/// between CLI invocations:
/// - Linux: `~/.local/share/culprit-finder/store.json`
/// - macOS: `~/Library/Application Support/culprit-finder/store.json`
///
/// A store opened from a snapshot holds an exclusive lock on `<snapshot>.lock`
/// until it is dropped, so one process at a time loads, changes and flushes
/// the snapshot.
pub struct FailureStore {
    path: Option<PathBuf>,
    _lock: Option<File>,
    state: Mutex<StoreState>,
    analysis_locks: Mutex<HashMap<AnalysisId, Arc<AsyncMutex<()>>>>,
}

impl FailureStore {
    /// Creates a store that only lives in memory.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            _lock: None,
            state: Mutex::new(StoreState::default()),
            analysis_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Opens the store snapshot at `path`, starting empty if the file does not
    /// exist yet. Waits while another store holds the snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be created or locked, or if
    /// the snapshot exists but cannot be read or parsed.
    pub fn open(path: &Path) -> Result<Self> {
        let lock = Self::lock(path)?;

        let state = if path.exists() {
            let content = fs::read_to_string(path)?;
            let state: StoreState = serde_json::from_str(&content)?;
            debug!(
                "Loaded {} failures and {} analyses from: {}",
                state.failures.len(),
                state.analyses.len(),
                path.display()
            );
            state
        } else {
            StoreState::default()
        };

        info!("Failure store at: {}", path.display());

        Ok(Self {
            path: Some(path.to_path_buf()),
            _lock: Some(lock),
            state: Mutex::new(state),
            analysis_locks: Mutex::new(HashMap::new()),
        })
    }

    fn lock(path: &Path) -> Result<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut lock_path = path.as_os_str().to_owned();
        lock_path.push(".lock");
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;

        if lock.try_lock_exclusive().is_err() {
            info!("Waiting for another run to release: {}", path.display());
            lock.lock_exclusive()?;
        }
        Ok(lock)
    }

    /// Platform-specific default location of the store snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if no data directory exists on this platform.
    pub fn default_path() -> Result<PathBuf> {
        Ok(dirs::data_dir()
            .ok_or_else(|| CulpritError::Config("No data directory found".into()))?
            .join("culprit-finder")
            .join("store.json"))
    }

    /// Writes the snapshot to disk. No-op for in-memory stores.
    pub fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string(&*self.state())?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, path)?;

        debug!("Saved failure store to: {}", path.display());
        Ok(())
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts the transaction that serializes rerun triggering for one
    /// analysis. Waits while another transaction on the same analysis is open.
    pub async fn begin_transaction(&self, analysis_id: AnalysisId) -> AnalysisTransaction {
        let lock = {
            let mut locks = self
                .analysis_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(analysis_id).or_default())
        };

        AnalysisTransaction {
            analysis_id,
            _guard: lock.lock_owned().await,
        }
    }

    // Failures

    pub fn allocate_failure_key(&self) -> FailureKey {
        let mut state = self.state();
        state.next_failure_key += 1;
        FailureKey(state.next_failure_key)
    }

    /// Saves failures in one batch.
    pub fn put_failures(&self, failures: &[AtomicFailure]) {
        let mut state = self.state();
        for failure in failures {
            state.failures.insert(failure.key, failure.clone());
        }
    }

    pub fn failure(&self, key: FailureKey) -> Option<AtomicFailure> {
        self.state().failures.get(&key).cloned()
    }

    pub fn failures(&self, keys: &[FailureKey]) -> Vec<AtomicFailure> {
        let state = self.state();
        keys.iter()
            .filter_map(|key| state.failures.get(key).cloned())
            .collect()
    }

    /// Failures of one kind observed in a build, ordered by key.
    pub fn failures_for_build(
        &self,
        build_id: BuildId,
        kind: FailureKind,
    ) -> Vec<AtomicFailure> {
        self.state()
            .failures
            .values()
            .filter(|f| f.build_id == build_id && f.kind == kind)
            .cloned()
            .collect()
    }

    pub fn find_failure(
        &self,
        build_id: BuildId,
        kind: FailureKind,
        step_name: &str,
        identifier: &FailureIdentifier,
    ) -> Option<AtomicFailure> {
        self.state()
            .failures
            .values()
            .find(|f| f.build_id == build_id && f.kind == kind && f.is(step_name, identifier))
            .cloned()
    }

    // Groups

    pub fn put_group(&self, group: FailureGroup) {
        self.state().groups.insert(group.build_id, group);
    }

    pub fn group(&self, build_id: BuildId) -> Option<FailureGroup> {
        self.state().groups.get(&build_id).cloned()
    }

    /// Groups of a project whose first failure happened at `gitiles_id`.
    pub fn groups_with_first_failed_commit(
        &self,
        kind: FailureKind,
        luci_project: &str,
        gitiles_id: &str,
    ) -> Vec<FailureGroup> {
        self.state()
            .groups
            .values()
            .filter(|g| {
                g.kind == kind
                    && g.luci_project == luci_project
                    && g.first_failed_commit.gitiles_id == gitiles_id
            })
            .cloned()
            .collect()
    }

    // Analyses

    /// Returns the analysis for `(build_id, kind)`, creating it with `create`
    /// if there is none yet.
    pub fn get_or_create_analysis(
        &self,
        build_id: BuildId,
        kind: FailureKind,
        create: impl FnOnce(AnalysisId) -> FailureAnalysis,
    ) -> FailureAnalysis {
        let mut state = self.state();
        if let Some(existing) = state
            .analyses
            .values()
            .find(|a| a.build_id == build_id && a.kind == kind)
        {
            return existing.clone();
        }

        state.next_analysis_id += 1;
        let analysis = create(AnalysisId(state.next_analysis_id));
        state.analyses.insert(analysis.id, analysis.clone());
        analysis
    }

    pub fn analysis(&self, id: AnalysisId) -> Option<FailureAnalysis> {
        self.state().analyses.get(&id).cloned()
    }

    pub fn analysis_for_build(
        &self,
        build_id: BuildId,
        kind: FailureKind,
    ) -> Option<FailureAnalysis> {
        self.state()
            .analyses
            .values()
            .find(|a| a.build_id == build_id && a.kind == kind)
            .cloned()
    }

    pub fn put_analysis(&self, analysis: &FailureAnalysis) {
        self.state().analyses.insert(analysis.id, analysis.clone());
    }

    // Rerun builds

    /// Rerun builds of an analysis, ordered by commit position.
    pub fn rerun_builds(&self, analysis_id: AnalysisId) -> Vec<RerunBuild> {
        let mut reruns: Vec<RerunBuild> = self
            .state()
            .rerun_builds
            .values()
            .filter(|r| r.analysis_id == analysis_id)
            .cloned()
            .collect();
        reruns.sort_by_key(|r| (r.commit.commit_position, r.create_time));
        reruns
    }

    /// Rerun builds of an analysis at one commit. Requires the analysis
    /// transaction so the answer stays valid until the caller's write.
    pub fn rerun_builds_at(
        &self,
        tx: &AnalysisTransaction,
        commit_position: u64,
    ) -> Vec<RerunBuild> {
        self.state()
            .rerun_builds
            .values()
            .filter(|r| {
                r.analysis_id == tx.analysis_id() && r.commit.commit_position == commit_position
            })
            .cloned()
            .collect()
    }

    /// Inserts a newly triggered rerun build inside the analysis transaction.
    pub fn insert_rerun_build(&self, tx: &AnalysisTransaction, rerun: RerunBuild) -> Result<()> {
        if rerun.analysis_id != tx.analysis_id() {
            return Err(CulpritError::Invariant(format!(
                "Rerun build {} belongs to analysis {}, transaction is for analysis {}",
                rerun.build_id,
                rerun.analysis_id,
                tx.analysis_id()
            )));
        }
        self.state().rerun_builds.insert(rerun.build_id, rerun);
        Ok(())
    }

    pub fn rerun_build(&self, build_id: BuildId) -> Option<RerunBuild> {
        self.state().rerun_builds.get(&build_id).cloned()
    }

    /// Records the result of a rerun build that already exists.
    pub fn update_rerun_build(&self, rerun: &RerunBuild) -> Result<()> {
        let mut state = self.state();
        let Some(existing) = state.rerun_builds.get_mut(&rerun.build_id) else {
            return Err(CulpritError::NotFound(format!(
                "rerun build {}",
                rerun.build_id
            )));
        };
        *existing = rerun.clone();
        Ok(())
    }

    // Culprits

    /// Links failures to the culprit at `commit`, creating the culprit on
    /// first use. Culprit and failures are written under one lock.
    pub fn record_culprit(
        &self,
        repo: &GitilesRepo,
        commit: &Commit,
        analysis_id: AnalysisId,
        failure_keys: &[FailureKey],
    ) -> Culprit {
        let mut state = self.state();
        let key = CulpritKey(commit.gitiles_id.clone());

        for failure_key in failure_keys {
            if let Some(failure) = state.failures.get_mut(failure_key) {
                failure.culprit_commit_key = Some(key.clone());
            }
        }

        let culprit = state.culprits.entry(key.clone()).or_insert_with(|| Culprit {
            key,
            repo: repo.clone(),
            commit: commit.clone(),
            failure_keys: Default::default(),
            analysis_ids: Default::default(),
        });
        culprit.failure_keys.extend(failure_keys.iter().copied());
        culprit.analysis_ids.insert(analysis_id);
        culprit.clone()
    }

    pub fn culprit(&self, key: &CulpritKey) -> Option<Culprit> {
        self.state().culprits.get(key).cloned()
    }
}
