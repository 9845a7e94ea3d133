use crate::matrix::FuzzRunSpec;
use crate::process::{ExitState, ProcessRunner, ProcessSpec};
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

/// Mount point of the output directory inside a fuzz-run container.
pub const CONTAINER_WORK_DIR: &str = "/work";

/// Environment variable the fuzz binaries read to pick a parser.
pub const DEFAULT_PARSER_ENV: &str = "SPICY_FUZZ_PARSER";

/// A failed fuzz run, tagged with the pair it belongs to.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    #[error("{grammar}/{parser}: fuzz run {state}")]
    Exit {
        grammar: String,
        parser: String,
        state: ExitState,
        diagnostics: String,
    },
    #[error("{grammar}/{parser}: could not launch fuzz run: {message}")]
    Launch {
        grammar: String,
        parser: String,
        message: String,
    },
    #[error("{grammar}/{parser}: could not prepare {path:?}: {message}")]
    Prepare {
        grammar: String,
        parser: String,
        path: PathBuf,
        message: String,
    },
}

impl RunError {
    pub fn pair(&self) -> (&str, &str) {
        match self {
            RunError::Exit {
                grammar, parser, ..
            }
            | RunError::Launch {
                grammar, parser, ..
            }
            | RunError::Prepare {
                grammar, parser, ..
            } => (grammar.as_str(), parser.as_str()),
        }
    }
}

/// Outcome of one executed [`FuzzRunSpec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub spec: FuzzRunSpec,
    /// `None` when the process never ran.
    pub exit: Option<ExitState>,
    pub duration: Duration,
    pub result: Result<(), RunError>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Launches one containerized fuzz target per spec.
#[derive(Debug, Clone)]
pub struct FuzzRunExecutor {
    pub engine: String,
    pub image: String,
    /// Absolute host path mounted as [`CONTAINER_WORK_DIR`].
    pub output_dir: PathBuf,
    pub parser_env: String,
    pub asan_options: String,
}

impl FuzzRunExecutor {
    pub fn new(engine: &str, image: &str, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: engine.to_string(),
            image: image.to_string(),
            output_dir: output_dir.into(),
            parser_env: DEFAULT_PARSER_ENV.to_string(),
            asan_options: "detect_leaks=0".to_string(),
        }
    }

    /// The exact container invocation for `spec`.
    pub fn command(&self, spec: &FuzzRunSpec) -> ProcessSpec {
        ProcessSpec::new(self.engine.as_str())
            .args(["run", "--rm"])
            .arg("-v")
            .arg(format!(
                "{}:{CONTAINER_WORK_DIR}",
                self.output_dir.display()
            ))
            .arg("-e")
            .arg(format!("{}={}", self.parser_env, spec.parser))
            .arg("-e")
            .arg(format!("ASAN_OPTIONS={}", self.asan_options))
            .arg(self.image.as_str())
            .arg(format!("{CONTAINER_WORK_DIR}/{}", spec.binary()))
            .arg(format!("-timeout={}", spec.timeout_secs))
            .arg(format!("-max_total_time={}", spec.max_total_time_secs))
            .arg(format!("-jobs={}", spec.jobs))
            .arg("-create_missing_dirs=1")
            .arg(format!(
                "-artifact_prefix={CONTAINER_WORK_DIR}/{}/",
                spec.artifact_dir
            ))
            .arg(format!("{CONTAINER_WORK_DIR}/{}", spec.corpus_dir))
    }

    /// Runs `spec` to completion. Failures are reported in the outcome, never raised.
    pub fn run(&self, spec: &FuzzRunSpec, runner: &mut dyn ProcessRunner) -> RunOutcome {
        let start_time = Instant::now();
        let artifact_dir = spec.host_artifact_dir(&self.output_dir);
        if let Err(e) = fs::create_dir_all(&artifact_dir) {
            return self.failed(
                spec,
                None,
                start_time,
                RunError::Prepare {
                    grammar: spec.grammar.clone(),
                    parser: spec.parser.clone(),
                    path: artifact_dir,
                    message: e.to_string(),
                },
            );
        }

        info!(
            grammar = %spec.grammar,
            parser = %spec.parser,
            jobs = spec.jobs,
            max_total_time = spec.max_total_time_secs,
            "starting fuzz run"
        );
        let output = match runner.run(&self.command(spec)) {
            Ok(output) => output,
            Err(e) => {
                let error = RunError::Launch {
                    grammar: spec.grammar.clone(),
                    parser: spec.parser.clone(),
                    message: e.to_string(),
                };
                return self.failed(spec, None, start_time, error);
            }
        };

        if !output.state.is_success() {
            let error = RunError::Exit {
                grammar: spec.grammar.clone(),
                parser: spec.parser.clone(),
                state: output.state,
                diagnostics: output.diagnostics(),
            };
            return self.failed(spec, Some(output.state), start_time, error);
        }

        let duration = start_time.elapsed();
        info!(grammar = %spec.grammar, parser = %spec.parser, elapsed = ?duration, "fuzz run finished");
        RunOutcome {
            spec: spec.clone(),
            exit: Some(output.state),
            duration,
            result: Ok(()),
        }
    }

    fn failed(
        &self,
        spec: &FuzzRunSpec,
        exit: Option<ExitState>,
        start_time: Instant,
        error: RunError,
    ) -> RunOutcome {
        warn!("{error}");
        RunOutcome {
            spec: spec.clone(),
            exit,
            duration: start_time.elapsed(),
            result: Err(error),
        }
    }
}

/// Number of CPUs the host reports, at least one.
pub fn host_cpu_count() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}
