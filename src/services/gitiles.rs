use std::collections::BTreeMap;

use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;

use crate::error::{CulpritError, Result};
use crate::model::GitilesRepo;

use super::http::RetryingClient;

/// Largest page gitiles serves for a log request.
const MAX_LOG_PAGE: u64 = 1000;

/// The source-control service that knows commit positions.
#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Commit position of `revision` in `repo`.
    async fn commit_position(&self, repo: &GitilesRepo, revision: &str) -> Result<u64>;

    /// Maps every commit position in `[to_position, from_position]` to its
    /// hash, walking history backwards from `from_revision`, which sits at
    /// `from_position`.
    async fn commit_positions_to_hashes(
        &self,
        repo: &GitilesRepo,
        from_revision: &str,
        from_position: u64,
        to_position: u64,
    ) -> Result<BTreeMap<u64, String>>;
}

pub struct GitilesClient {
    http: RetryingClient,
    footer: String,
    base_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CommitJson {
    commit: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct LogJson {
    #[serde(default)]
    log: Vec<CommitJson>,
    next: Option<String>,
}

impl GitilesClient {
    /// `footer` is the commit message footer carrying the commit position,
    /// usually `Cr-Commit-Position`.
    pub fn new(http: RetryingClient, footer: impl Into<String>) -> Self {
        Self {
            http,
            footer: footer.into(),
            base_url: None,
        }
    }

    /// Serves every repository from `base_url` instead of its own host.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into().trim_end_matches('/').to_string());
        self
    }

    fn repo_url(&self, repo: &GitilesRepo) -> String {
        match &self.base_url {
            Some(base) => format!("{base}/{}", repo.project),
            None => repo.url(),
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<T> {
        let text = self
            .http
            .send(|client| client.get(url))
            .await
            .map_err(|e| CulpritError::DataUnavailable(format!("{url}: {e}")))?;
        Ok(serde_json::from_str(&text)?)
    }

    fn parse_position(&self, message: &str) -> Option<u64> {
        commit_position_from_message(message, &self.footer)
    }
}

/// Extracts `12345` from a footer line like
/// `Cr-Commit-Position: refs/heads/main@{#12345}`. The last matching footer
/// wins.
fn commit_position_from_message(message: &str, footer: &str) -> Option<u64> {
    message.lines().rev().find_map(|line| {
        let value = line.trim().strip_prefix(footer)?.strip_prefix(':')?;
        let (_, tail) = value.trim().split_once("@{#")?;
        let digits = tail.strip_suffix('}')?;
        digits.parse().ok()
    })
}

#[async_trait]
impl SourceControl for GitilesClient {
    async fn commit_position(&self, repo: &GitilesRepo, revision: &str) -> Result<u64> {
        let url = format!("{}/+/{revision}?format=JSON", self.repo_url(repo));
        let commit: CommitJson = self.get_json(&url).await?;

        self.parse_position(&commit.message).ok_or_else(|| {
            CulpritError::DataUnavailable(format!(
                "No {} footer on {} in {}",
                self.footer,
                commit.commit,
                repo.url()
            ))
        })
    }

    async fn commit_positions_to_hashes(
        &self,
        repo: &GitilesRepo,
        from_revision: &str,
        from_position: u64,
        to_position: u64,
    ) -> Result<BTreeMap<u64, String>> {
        if to_position > from_position {
            return Err(CulpritError::Invariant(format!(
                "Cannot map positions {to_position}..={from_position} backwards"
            )));
        }

        let wanted = from_position - to_position + 1;
        let mut hashes = BTreeMap::new();
        let mut revision = from_revision.to_string();
        let mut seen: u64 = 0;

        while seen < wanted {
            let page = (wanted - seen).min(MAX_LOG_PAGE);
            let url = format!(
                "{}/+log/{revision}?format=JSON&n={page}",
                self.repo_url(repo)
            );
            let log: LogJson = self.get_json(&url).await?;
            if log.log.is_empty() {
                break;
            }

            for commit in &log.log {
                let position = self.parse_position(&commit.message).unwrap_or_else(|| {
                    warn!(
                        "No commit position on {}, assuming {}",
                        commit.commit,
                        from_position - seen
                    );
                    from_position - seen
                });
                seen += 1;

                if position < to_position {
                    seen = wanted;
                    break;
                }
                hashes.insert(position, commit.commit.clone());
                if position == to_position || seen >= wanted {
                    seen = wanted;
                    break;
                }
            }

            match log.next {
                Some(next) if seen < wanted => revision = next,
                _ => break,
            }
        }

        debug!(
            "Mapped {} commit positions in {} from {from_position} down to {to_position}",
            hashes.len(),
            repo.url()
        );
        Ok(hashes)
    }
}
