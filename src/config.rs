use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::analysis::AnalysisSettings;

/// Configuration file structure for culprit-finder.
///
/// Holds collaborator endpoints, credentials and analysis knobs so they do
/// not have to be repeated on every invocation. Configuration files are
/// loaded from the current directory or a specified path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Build orchestration service
    #[serde(default)]
    pub buildbucket: BuildbucketConfig,

    /// Source control service
    #[serde(default)]
    pub gitiles: GitilesConfig,

    /// Analysis parameters
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Failure store location
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BuildbucketConfig {
    /// Buildbucket host, with or without scheme
    #[serde(default = "default_buildbucket_host")]
    pub host: String,

    /// OAuth access token
    pub token: Option<String>,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay_seconds")]
    pub retry_delay_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GitilesConfig {
    /// Commit message footer carrying the commit position
    #[serde(default = "default_commit_position_footer")]
    pub commit_position_footer: String,

    /// Overrides the `https://{host}` base of every repository
    pub base_url: Option<String>,

    /// OAuth access token
    pub token: Option<String>,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay_seconds")]
    pub retry_delay_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AnalysisConfig {
    /// Earlier builds inspected when looking for where a failure started
    #[serde(default = "default_max_builds_to_check")]
    pub max_builds_to_check: usize,

    /// Deduplicate failures across builders
    #[serde(default = "default_true")]
    pub should_group_failures: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StoreConfig {
    /// Store snapshot path, platform data directory when unset
    pub path: Option<PathBuf>,
}

impl Default for BuildbucketConfig {
    fn default() -> Self {
        Self {
            host: default_buildbucket_host(),
            token: None,
            max_retries: default_max_retries(),
            retry_delay_seconds: default_retry_delay_seconds(),
        }
    }
}

impl Default for GitilesConfig {
    fn default() -> Self {
        Self {
            commit_position_footer: default_commit_position_footer(),
            base_url: None,
            token: None,
            max_retries: default_max_retries(),
            retry_delay_seconds: default_retry_delay_seconds(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_builds_to_check: default_max_builds_to_check(),
            should_group_failures: true,
        }
    }
}

impl From<&AnalysisConfig> for AnalysisSettings {
    fn from(config: &AnalysisConfig) -> Self {
        Self {
            max_builds_to_check: config.max_builds_to_check,
            should_group_failures: config.should_group_failures,
        }
    }
}

fn default_buildbucket_host() -> String {
    "cr-buildbucket.appspot.com".to_string()
}

fn default_commit_position_footer() -> String {
    "Cr-Commit-Position".to_string()
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay_seconds() -> u64 {
    10
}

fn default_max_builds_to_check() -> usize {
    20
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a file.
    ///
    /// Searches for configuration files in this order:
    /// 1. Specified path
    /// 2. ./culprit-finder.toml
    /// 3. ./culprit-finder.json
    /// 4. ./culprit-finder.yaml
    /// 5. ./culprit-finder.yml
    ///
    /// Returns default configuration if no file is found.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_from_path(path);
        }

        let candidates = [
            "culprit-finder.toml",
            "culprit-finder.json",
            "culprit-finder.yaml",
            "culprit-finder.yml",
        ];

        for candidate in &candidates {
            let path = Path::new(candidate);
            if path.exists() {
                return Self::load_from_path(path);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file path.
    fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");

        match extension {
            "toml" => toml::from_str(&contents)
                .with_context(|| format!("Failed to parse TOML config: {}", path.display())),
            "json" => serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display())),
            "yaml" | "yml" => serde_yaml::from_str(&contents)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display())),
            _ => toml::from_str(&contents)
                .or_else(|_| serde_json::from_str(&contents))
                .or_else(|_| serde_yaml::from_str(&contents))
                .with_context(|| format!("Failed to parse config file: {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.buildbucket.host, "cr-buildbucket.appspot.com");
        assert_eq!(config.buildbucket.max_retries, 5);
        assert_eq!(config.gitiles.commit_position_footer, "Cr-Commit-Position");
        assert_eq!(config.analysis.max_builds_to_check, 20);
        assert!(config.analysis.should_group_failures);
        assert!(config.store.path.is_none());
    }

    #[test]
    fn test_load_toml_config() {
        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        let toml_content = r#"
[buildbucket]
host = "bb.example.com"
token = "bb-token"
max-retries = 2

[gitiles]
commit-position-footer = "X-Position"

[analysis]
max-builds-to-check = 5
should-group-failures = false

[store]
path = "/tmp/culprits.json"
"#;
        write!(temp_file, "{toml_content}").unwrap();

        let config = Config::load_from_path(temp_file.path()).unwrap();
        assert_eq!(config.buildbucket.host, "bb.example.com");
        assert_eq!(config.buildbucket.token.as_deref(), Some("bb-token"));
        assert_eq!(config.buildbucket.max_retries, 2);
        assert_eq!(config.buildbucket.retry_delay_seconds, 10);
        assert_eq!(config.gitiles.commit_position_footer, "X-Position");
        assert_eq!(config.store.path, Some(PathBuf::from("/tmp/culprits.json")));

        let settings = AnalysisSettings::from(&config.analysis);
        assert_eq!(settings.max_builds_to_check, 5);
        assert!(!settings.should_group_failures);
    }

    #[test]
    fn test_load_yaml_config() {
        let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        let yaml_content = r"
gitiles:
  base-url: http://localhost:8080
  token: gitiles-token
analysis:
  max-builds-to-check: 50
";
        write!(temp_file, "{yaml_content}").unwrap();

        let config = Config::load_from_path(temp_file.path()).unwrap();
        assert_eq!(config.gitiles.base_url.as_deref(), Some("http://localhost:8080"));
        assert_eq!(config.gitiles.token.as_deref(), Some("gitiles-token"));
        assert_eq!(config.analysis.max_builds_to_check, 50);
        assert!(config.analysis.should_group_failures);
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let result = Config::load(Some(Path::new("does-not-exist.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_unknown_extension_tries_every_format() {
        let mut temp_file = NamedTempFile::with_suffix(".conf").unwrap();
        write!(temp_file, r#"{{"buildbucket": {{"host": "json.example.com"}}}}"#).unwrap();

        let config = Config::load_from_path(temp_file.path()).unwrap();
        assert_eq!(config.buildbucket.host, "json.example.com");
    }
}
