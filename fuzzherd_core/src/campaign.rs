use crate::build::{BuildDriver, BuildError};
use crate::config::CampaignConfig;
use crate::matrix::{ConfigError, FuzzRunSpec, FuzzTargetMatrix, expand};
use crate::process::{ExitState, ProcessRunner};
use crate::runner::RunOutcome;
use crate::source::{SyncError, sync};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Errors that end a campaign before the matrix has been attempted.
#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("Invalid fuzz matrix: {0}")]
    Config(#[from] ConfigError),
    #[error("Source sync failed: {0}")]
    Sync(#[from] SyncError),
    #[error("Build failed: {0}")]
    Build(#[from] BuildError),
}

/// Per-invocation switches layered over the config file.
#[derive(Debug, Clone, Default)]
pub struct CampaignOptions {
    pub skip_sync: bool,
    pub skip_build: bool,
    /// Restrict the matrix to these grammars; all when empty.
    pub grammars: Vec<String>,
}

/// Everything a finished campaign has to say.
#[derive(Debug, Clone, Default)]
pub struct CampaignReport {
    /// Non-fatal problems in the order they happened.
    pub warnings: Vec<String>,
    /// One entry per expanded spec, in matrix order.
    pub outcomes: Vec<RunOutcome>,
}

impl CampaignReport {
    pub fn failures(&self) -> impl Iterator<Item = &RunOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn total_duration(&self) -> Duration {
        self.outcomes.iter().map(|o| o.duration).sum()
    }

    /// Renders the report as pretty JSON.
    ///
    /// The document has `success`, `warnings` and `runs`. Every run carries the
    /// kebab-case fields of its [`FuzzRunSpec`] plus `exit`, `duration-secs` and
    /// `error`. `exit` is `null` when the process never ran. Otherwise it is
    /// `{"kind": "success" | "abnormal"}` or `{"kind": "code" | "signal",
    /// "value": <n>}`.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&ReportDocument::from(self))
    }
}

impl fmt::Display for CampaignReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Campaign report ({} runs):", self.outcomes.len())?;
        for outcome in &self.outcomes {
            let verdict = match &outcome.result {
                Ok(()) => "ok".to_string(),
                Err(e) => format!("FAILED: {e}"),
            };
            writeln!(
                f,
                "  {:<12} {:<20} {:>8.1?}  {}",
                outcome.spec.grammar, outcome.spec.parser, outcome.duration, verdict
            )?;
        }
        for warning in &self.warnings {
            writeln!(f, "  warning: {warning}")?;
        }
        let failed = self.failures().count();
        write!(
            f,
            "{} passed, {} failed, total {:.1?}",
            self.outcomes.len() - failed,
            failed,
            self.total_duration()
        )
    }
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct ReportDocument<'a> {
    success: bool,
    warnings: &'a [String],
    runs: Vec<ReportEntry<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct ReportEntry<'a> {
    #[serde(flatten)]
    spec: &'a FuzzRunSpec,
    exit: Option<ExitState>,
    duration_secs: f64,
    error: Option<String>,
}

impl<'a> From<&'a CampaignReport> for ReportDocument<'a> {
    fn from(report: &'a CampaignReport) -> Self {
        Self {
            success: report.is_success(),
            warnings: &report.warnings,
            runs: report
                .outcomes
                .iter()
                .map(|o| ReportEntry {
                    spec: &o.spec,
                    exit: o.exit,
                    duration_secs: o.duration.as_secs_f64(),
                    error: o.result.as_ref().err().map(ToString::to_string),
                })
                .collect(),
        }
    }
}

/// Sync → build → expand → execute, strictly in that order.
pub struct Campaign<R: ProcessRunner> {
    config: CampaignConfig,
    options: CampaignOptions,
    runner: R,
}

impl<R: ProcessRunner> Campaign<R> {
    /// `config` must already have its paths resolved.
    pub fn new(config: CampaignConfig, options: CampaignOptions, runner: R) -> Self {
        Self {
            config,
            options,
            runner,
        }
    }

    /// Validates and expands the matrix without touching the host.
    ///
    /// Grammars with no parsers are returned separately so callers can warn.
    pub fn plan(&self) -> Result<(Vec<FuzzRunSpec>, Vec<String>), ConfigError> {
        let matrix = self.matrix()?;
        matrix.validate()?;
        let skipped = matrix
            .empty_grammars()
            .into_iter()
            .map(|g| format!("grammar '{g}' has no parsers; skipped"))
            .collect();
        Ok((expand(&matrix, self.config.run.limits()), skipped))
    }

    fn matrix(&self) -> Result<FuzzTargetMatrix, ConfigError> {
        if self.options.grammars.is_empty() {
            Ok(self.config.matrix.clone())
        } else {
            self.config.matrix.retain_grammars(&self.options.grammars)
        }
    }

    pub fn run(&mut self) -> Result<CampaignReport, CampaignError> {
        let mut report = CampaignReport::default();
        let (specs, skipped) = self.plan()?;
        for warning in skipped {
            warn!("{warning}");
            report.warnings.push(warning);
        }

        if self.options.skip_sync {
            info!("skipping source sync");
        } else {
            for repo in &self.config.sources {
                let action = sync(repo, &mut self.runner)?;
                report.warnings.extend(action.degraded().iter().cloned());
            }
        }

        let driver = BuildDriver::new(self.config.build_environment());
        if self.options.skip_build {
            info!("skipping fuzz target build");
        } else {
            driver.build(&mut self.runner)?;
        }
        driver.verify_targets(&self.matrix()?)?;

        let executor = self.config.executor();
        info!(runs = specs.len(), "running fuzz matrix");
        for spec in &specs {
            let outcome = executor.run(spec, &mut self.runner);
            report.outcomes.push(outcome);
        }
        Ok(report)
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }
}
