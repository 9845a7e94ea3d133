use fuzzherd_core::campaign::{Campaign, CampaignOptions};
use fuzzherd_core::config::CampaignConfig;
use fuzzherd_core::process::CommandRunner;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_FILE: &str = "fuzzherd.toml";

#[derive(Parser, Debug)]
#[clap(author, version, about = "Builds and runs a matrix of containerized fuzz targets", long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Option<Commands>,
    /// Campaign config; defaults to ./fuzzherd.toml, then built-in defaults
    #[clap(short, long = "config", value_parser)]
    config_file: Option<PathBuf>,
    /// Wall-clock budget of each fuzz run, in seconds
    #[clap(long)]
    max_total_time: Option<u64>,
    /// Per-input stall timeout, in seconds
    #[clap(long)]
    timeout: Option<u64>,
    /// Parallel fuzzing jobs per run (capped at the CPU count)
    #[clap(short, long)]
    jobs: Option<usize>,
    /// Only fuzz these grammars; repeatable
    #[clap(short, long = "grammar")]
    grammars: Vec<String>,
    #[clap(long)]
    skip_sync: bool,
    #[clap(long)]
    skip_build: bool,
    /// Also write the final report as JSON
    #[clap(long)]
    report: Option<PathBuf>,
    #[clap(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Commands {
    /// Sync, build and fuzz the whole matrix (default)
    Run,
    /// Print the expanded runs and their commands without executing anything
    Plan,
}

fn main() -> Result<ExitCode, anyhow::Error> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let (mut config, base_dir) = load_config(cli.config_file.as_deref())?;
    config.resolve_paths(&base_dir);

    if let Some(max_total_time) = cli.max_total_time {
        config.run.max_total_time_secs = max_total_time;
    }
    if let Some(timeout) = cli.timeout {
        config.run.timeout_secs = timeout;
    }
    if let Some(jobs) = cli.jobs {
        config.run.jobs = Some(jobs);
    }
    tracing::debug!("Effective configuration: {config:#?}");

    let options = CampaignOptions {
        skip_sync: cli.skip_sync,
        skip_build: cli.skip_build,
        grammars: cli.grammars,
    };
    let executor = config.executor();
    let mut campaign = Campaign::new(config, options, CommandRunner::new());

    if cli.command == Some(Commands::Plan) {
        let (specs, skipped) = campaign.plan()?;
        for warning in skipped {
            warn!("{warning}");
        }
        for (i, spec) in specs.iter().enumerate() {
            println!("[{}/{}] {} / {}", i + 1, specs.len(), spec.grammar, spec.parser);
            println!("    {}", executor.command(spec).command_line());
        }
        return Ok(ExitCode::SUCCESS);
    }

    let report = campaign.run()?;

    println!("{report}");
    if let Some(path) = &cli.report {
        let json = report.to_json()?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report to {path:?}"))?;
        info!(path = ?path, "report written");
    }

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Loads the campaign config and returns it with the directory its relative
/// paths are anchored to.
fn load_config(config_file: Option<&Path>) -> Result<(CampaignConfig, PathBuf), anyhow::Error> {
    let cwd = std::env::current_dir().context("Failed to determine the working directory")?;
    let path = match config_file {
        Some(path) => {
            info!("Loading configuration from specified path: {path:?}");
            path.to_path_buf()
        }
        None => {
            let default_path = cwd.join(DEFAULT_CONFIG_FILE);
            if !default_path.exists() {
                info!(
                    "No config file specified and default '{DEFAULT_CONFIG_FILE}' not found, using built-in defaults."
                );
                return Ok((CampaignConfig::default(), cwd));
            }
            info!("No config file specified via CLI, loading default: {default_path:?}");
            default_path
        }
    };

    let config = CampaignConfig::load_from_file(&path)?;
    let base_dir = path
        .canonicalize()
        .with_context(|| format!("Failed to resolve config path {path:?}"))?
        .parent()
        .map_or_else(|| cwd.clone(), Path::to_path_buf);
    Ok((config, base_dir))
}
