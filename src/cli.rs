use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::analysis::{AnalysisSettings, FailureAnalyzer};
use crate::auth::Token;
use crate::config::Config;
use crate::model::{
    AnalysisId, AtomicFailure, BuildId, Culprit, FailureAnalysis, FailureKind, RerunBuild,
};
use crate::output::{self, PhaseProgress};
use crate::services::{
    BuildbucketClient, GitilesClient, OutputPropertyPolicy, PolicyRegistry, RetryingClient,
};
use crate::store::FailureStore;

#[derive(Parser)]
#[command(name = "culprit-finder")]
#[command(author, version, about = "Finds the commits that broke CI builds", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to ./culprit-finder.{toml,json,yaml,yml})
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Failure store snapshot
    #[arg(short, long, global = true)]
    store: Option<PathBuf>,

    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    #[arg(short, long, global = true, default_value_t = false)]
    pretty: bool,

    /// Print tables instead of JSON
    #[arg(long, global = true, default_value_t = false)]
    summary: bool,

    #[arg(long, global = true, env = "BUILDBUCKET_TOKEN", hide_env_values = true)]
    buildbucket_token: Option<String>,

    #[arg(long, global = true, env = "GITILES_TOKEN", hide_env_values = true)]
    gitiles_token: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Find where the failures of a build started and bisect them
    Analyze {
        #[arg(short, long)]
        build: BuildId,

        #[arg(short, long, value_enum, default_value_t = FailureKind::Compile)]
        kind: FailureKind,
    },
    /// Record the result of a rerun build and run the next bisection tick
    RerunResult {
        #[arg(short, long)]
        build: BuildId,

        #[arg(short, long, value_enum, default_value_t = FailureKind::Compile)]
        kind: FailureKind,
    },
    /// Run one bisection tick of an analysis
    Tick {
        #[arg(short, long)]
        analysis: u64,
    },
    /// Culprits explaining the failures of a build
    Culprits {
        #[arg(short, long)]
        build: BuildId,

        #[arg(short, long, value_enum, default_value_t = FailureKind::Compile)]
        kind: FailureKind,
    },
    /// Print an analysis with its failures, reruns and culprits
    Show {
        #[arg(short, long)]
        analysis: u64,
    },
}

/// Everything known about one analysis.
#[derive(Serialize)]
struct AnalysisView {
    analysis: FailureAnalysis,
    failures: Vec<AtomicFailure>,
    reruns: Vec<RerunBuild>,
    culprits: Vec<Culprit>,
}

impl Cli {
    fn open_store(&self, config: &Config) -> Result<Arc<FailureStore>> {
        let path = match self.store.as_ref().or(config.store.path.as_ref()) {
            Some(path) => path.clone(),
            None => FailureStore::default_path()?,
        };
        let store = FailureStore::open(&path)
            .with_context(|| format!("Failed to open failure store: {}", path.display()))?;
        Ok(Arc::new(store))
    }

    fn build_analyzer(&self, config: &Config, store: Arc<FailureStore>) -> Result<FailureAnalyzer> {
        let buildbucket_token = self
            .buildbucket_token
            .as_ref()
            .or(config.buildbucket.token.as_ref())
            .map(|t| Token::from(t.as_str()));
        let buildbucket_http = RetryingClient::new(
            buildbucket_token,
            config.buildbucket.max_retries,
            Duration::from_secs(config.buildbucket.retry_delay_seconds),
        )?;
        let orchestrator = BuildbucketClient::new(&config.buildbucket.host, buildbucket_http)?;

        let gitiles_token = self
            .gitiles_token
            .as_ref()
            .or(config.gitiles.token.as_ref())
            .map(|t| Token::from(t.as_str()));
        let gitiles_http = RetryingClient::new(
            gitiles_token,
            config.gitiles.max_retries,
            Duration::from_secs(config.gitiles.retry_delay_seconds),
        )?;
        let mut source_control =
            GitilesClient::new(gitiles_http, config.gitiles.commit_position_footer.as_str());
        if let Some(base_url) = &config.gitiles.base_url {
            source_control = source_control.with_base_url(base_url.as_str());
        }

        let policies = PolicyRegistry::new()
            .register(Arc::new(OutputPropertyPolicy::new(FailureKind::Compile)))
            .register(Arc::new(OutputPropertyPolicy::new(FailureKind::Test)));

        Ok(FailureAnalyzer::new(
            store,
            Arc::new(orchestrator),
            Arc::new(source_control),
            policies,
            AnalysisSettings::from(&config.analysis),
        ))
    }

    fn write_json<T: Serialize>(&self, value: &T) -> Result<()> {
        let json_output = if self.pretty {
            serde_json::to_string_pretty(value)?
        } else {
            serde_json::to_string(value)?
        };

        if let Some(output_path) = &self.output {
            std::fs::write(output_path, json_output)
                .with_context(|| format!("Failed to write output: {}", output_path.display()))?;
            info!("Output written to: {}", output_path.display());
        } else {
            println!("{json_output}");
        }

        Ok(())
    }

    async fn execute_analyze(
        &self,
        analyzer: &FailureAnalyzer,
        build: BuildId,
        kind: FailureKind,
    ) -> Result<()> {
        info!("Analyzing {kind} failures of build {build}");
        let progress = PhaseProgress::start(&format!("Analyzing build {build}"));
        let outcome = match analyzer.analyze_build(build, kind).await {
            Ok(outcome) => outcome,
            Err(e) => {
                progress.abandon();
                return Err(e).with_context(|| format!("Failed to analyze build {build}"));
            }
        };
        progress.finish(&format!("Analyzed build {build}"));

        if self.summary {
            output::print_outcome(&outcome);
            Ok(())
        } else {
            self.write_json(&outcome)
        }
    }

    async fn execute_rerun_result(
        &self,
        analyzer: &FailureAnalyzer,
        build: BuildId,
        kind: FailureKind,
    ) -> Result<()> {
        let report = analyzer
            .process_rerun_build_result(build, kind)
            .await
            .with_context(|| format!("Failed to process rerun build {build}"))?;

        match (&report, self.summary) {
            (Some(report), true) => output::print_tick(report),
            (None, true) => println!(
                "  {}",
                output::dim(format!("Rerun build {build} recorded, no tick ran"))
            ),
            (_, false) => self.write_json(&report)?,
        }
        Ok(())
    }

    async fn execute_tick(&self, analyzer: &FailureAnalyzer, analysis: AnalysisId) -> Result<()> {
        let report = analyzer
            .rerun_based_analysis(analysis)
            .await
            .with_context(|| format!("Failed to run a tick of analysis {analysis}"))?;

        if self.summary {
            output::print_tick(&report);
            Ok(())
        } else {
            self.write_json(&report)
        }
    }

    fn execute_culprits(
        &self,
        analyzer: &FailureAnalyzer,
        build: BuildId,
        kind: FailureKind,
    ) -> Result<()> {
        let keys: Vec<_> = analyzer
            .store()
            .failures_for_build(build, kind)
            .iter()
            .map(|f| f.key)
            .collect();
        let culprits = analyzer.get_culprits_for_failures(&keys);
        info!("{} culprits explain {} failures of build {build}", culprits.len(), keys.len());

        if self.summary {
            output::print_culprits(&culprits);
            Ok(())
        } else {
            self.write_json(&culprits)
        }
    }

    fn execute_show(&self, analyzer: &FailureAnalyzer, analysis_id: AnalysisId) -> Result<()> {
        let store = analyzer.store();
        let analysis = store
            .analysis(analysis_id)
            .with_context(|| format!("No analysis {analysis_id}"))?;
        let view = AnalysisView {
            failures: store.failures(&analysis.failure_keys),
            reruns: store.rerun_builds(analysis_id),
            culprits: analyzer.get_culprits_for_failures(&analysis.failure_keys),
            analysis,
        };

        if self.summary {
            output::print_analysis(&view.analysis, &view.failures, &view.reruns, &view.culprits);
            Ok(())
        } else {
            self.write_json(&view)
        }
    }

    pub async fn execute(&self) -> Result<()> {
        let config = Config::load(self.config.as_deref())?;
        let store = self.open_store(&config)?;
        let analyzer = self.build_analyzer(&config, store.clone())?;

        let result = match &self.command {
            Commands::Analyze { build, kind } => {
                self.execute_analyze(&analyzer, *build, *kind).await
            }
            Commands::RerunResult { build, kind } => {
                self.execute_rerun_result(&analyzer, *build, *kind).await
            }
            Commands::Tick { analysis } => {
                self.execute_tick(&analyzer, AnalysisId(*analysis)).await
            }
            Commands::Culprits { build, kind } => self.execute_culprits(&analyzer, *build, *kind),
            Commands::Show { analysis } => self.execute_show(&analyzer, AnalysisId(*analysis)),
        };

        store.flush().context("Failed to save failure store")?;
        result
    }
}
