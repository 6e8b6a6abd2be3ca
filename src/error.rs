use thiserror::Error;

#[derive(Error, Debug)]
pub enum CulpritError {
    /// A commit position or gitiles hash could not be resolved.
    #[error("Data unavailable: {0}")]
    DataUnavailable(String),

    /// The failure policy could not produce what the engine asked for.
    #[error("Failure policy error: {0}")]
    Plugin(String),

    /// The build orchestrator refused or failed to create a build.
    #[error("Failed to trigger rerun build: {0}")]
    Trigger(String),

    #[error("Rerun cap reached at commit position {commit_position}: {attempts} attempts already exist")]
    RerunCapExceeded { commit_position: u64, attempts: usize },

    /// Programming-invariant violation. Never retried.
    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("API request failed with status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("API request failed with status {status} after {retries} retries")]
    ApiAfterRetries { status: u16, retries: u32 },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CulpritError {
    /// Whether this error counts as a hard failure for a bisection group.
    ///
    /// An analysis only moves to `ERROR` when every group of a tick ends in a
    /// hard error. Policy errors leave the analysis running.
    pub fn is_hard(&self) -> bool {
        !matches!(self, Self::Plugin(_))
    }
}

pub type Result<T> = std::result::Result<T, CulpritError>;
