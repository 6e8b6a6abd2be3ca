use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CulpritError;

/// Buildbucket build id.
pub type BuildId = i64;

/// Build status as reported by the build orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    #[default]
    Scheduled,
    Started,
    Success,
    Failure,
    InfraFailure,
    Canceled,
    #[serde(other)]
    Unspecified,
}

impl BuildStatus {
    pub fn is_completed(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failure | Self::InfraFailure | Self::Canceled
        )
    }

    /// Only passed and failed builds tell us anything about a failure.
    pub fn is_conclusive(self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }

    /// A rerun build in one of these states has answered, or will answer,
    /// the question it was triggered for.
    pub fn is_usable_rerun(self) -> bool {
        matches!(
            self,
            Self::Scheduled | Self::Started | Self::Success | Self::Failure
        )
    }
}

/// Fully qualified builder, `project/bucket/builder`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BuilderId {
    pub project: String,
    pub bucket: String,
    pub builder: String,
}

impl fmt::Display for BuilderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.project, self.bucket, self.builder)
    }
}

impl FromStr for BuilderId {
    type Err = CulpritError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [project, bucket, builder]
                if !project.is_empty() && !bucket.is_empty() && !builder.is_empty() =>
            {
                Ok(Self {
                    project: (*project).to_string(),
                    bucket: (*bucket).to_string(),
                    builder: (*builder).to_string(),
                })
            }
            _ => Err(CulpritError::Config(format!(
                "Builder id must be in format 'project/bucket/builder', got '{s}'"
            ))),
        }
    }
}

/// A repository branch on a gitiles host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GitilesRepo {
    pub host: String,
    pub project: String,
    #[serde(rename = "ref")]
    pub ref_: String,
}

impl GitilesRepo {
    /// Web URL of the repository (e.g. <https://chromium.googlesource.com/chromium/src>)
    pub fn url(&self) -> String {
        format!("https://{}/{}", self.host, self.project)
    }
}

/// The commit a build ran at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct GitilesCommit {
    pub host: String,
    pub project: String,
    #[serde(rename = "ref")]
    pub ref_: String,
    pub id: String,
    #[serde(default)]
    pub position: Option<u64>,
}

impl GitilesCommit {
    pub fn repo(&self) -> GitilesRepo {
        GitilesRepo {
            host: self.host.clone(),
            project: self.project.clone(),
            ref_: self.ref_.clone(),
        }
    }

    pub fn at(repo: &GitilesRepo, commit: &Commit) -> Self {
        Self {
            host: repo.host.clone(),
            project: repo.project.clone(),
            ref_: repo.ref_.clone(),
            id: commit.gitiles_id.clone(),
            position: Some(commit.commit_position),
        }
    }
}

/// A commit identified by both its hash and its commit position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Commit {
    pub gitiles_id: String,
    pub commit_position: u64,
}

impl Commit {
    pub fn new(gitiles_id: impl Into<String>, commit_position: u64) -> Self {
        Self {
            gitiles_id: gitiles_id.into(),
            commit_position,
        }
    }
}

impl fmt::Display for Commit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.gitiles_id, self.commit_position)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub status: BuildStatus,
}

/// A build with the detail this engine needs.
///
/// Builds returned by history searches carry no steps and no output
/// properties; `get_build` fills them in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub number: u64,
    pub builder: BuilderId,
    pub status: BuildStatus,
    pub gitiles_commit: GitilesCommit,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub output_properties: Map<String, Value>,
    #[serde(default)]
    pub tags: Vec<(String, String)>,
}

impl Build {
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &Step> {
        self.steps
            .iter()
            .filter(|s| s.status == BuildStatus::Failure)
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn output_property(&self, name: &str) -> Option<&Value> {
        self.output_properties.get(name)
    }
}

/// The few fields of a build used to bound a failure in history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRef {
    pub id: BuildId,
    pub number: u64,
    pub commit_id: String,
    pub commit_position: Option<u64>,
}

impl BuildRef {
    /// Orders builds by commit position when both have one, by build number
    /// otherwise. Build ids are never compared.
    pub fn cmp_age(&self, other: &Self) -> Ordering {
        match (self.commit_position, other.commit_position) {
            (Some(a), Some(b)) if a != b => a.cmp(&b),
            _ => self.number.cmp(&other.number),
        }
    }

    /// Returns the earlier of two optional builds.
    pub fn earliest(current: Option<Self>, candidate: &Self) -> Self {
        match current {
            Some(current) if current.cmp_age(candidate) != Ordering::Greater => current,
            _ => candidate.clone(),
        }
    }
}

impl From<&Build> for BuildRef {
    fn from(build: &Build) -> Self {
        Self {
            id: build.id,
            number: build.number,
            commit_id: build.gitiles_commit.id.clone(),
            commit_position: build.gitiles_commit.position,
        }
    }
}
