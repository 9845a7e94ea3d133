use crate::process::{ProcessError, ProcessRunner, ProcessSpec};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// A git checkout the campaign keeps current.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SourceRepository {
    pub uri: String,
    pub path: PathBuf,
    #[serde(default = "default_submodules")]
    pub submodules: bool,
}

fn default_submodules() -> bool {
    true
}

impl SourceRepository {
    pub fn new(uri: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            uri: uri.into(),
            path: path.into(),
            submodules: true,
        }
    }
}

/// Errors that stop a campaign before anything is built.
///
/// Failures after the checkout exists are never reported here; they end up in
/// the `degraded` list of the returned [`SyncAction`] instead.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Cloning {uri} into {path:?} failed ({state}):\n{diagnostics}")]
    Clone {
        uri: String,
        path: PathBuf,
        state: String,
        diagnostics: String,
    },
    #[error("Could not launch git for {path:?}: {source}")]
    Launch {
        path: PathBuf,
        #[source]
        source: ProcessError,
    },
    #[error("Source path {0:?} exists but is not a directory")]
    NotADirectory(PathBuf),
}

/// What [`sync`] did to a checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    /// Fresh recursive clone.
    Cloned { degraded: Vec<String> },
    /// Existing checkout fast-forwarded and reset.
    Updated { degraded: Vec<String> },
}

impl SyncAction {
    /// Non-fatal step failures, one message per failed step.
    pub fn degraded(&self) -> &[String] {
        match self {
            SyncAction::Cloned { degraded } | SyncAction::Updated { degraded } => degraded,
        }
    }
}

/// Brings `repo` to the tip of its default branch with no local modifications.
///
/// Only a failed initial clone is fatal. Pull, submodule update and the
/// final hard reset are attempted in order and their failures are recorded.
pub fn sync(
    repo: &SourceRepository,
    runner: &mut dyn ProcessRunner,
) -> Result<SyncAction, SyncError> {
    let dest = repo.path.as_path();
    if dest.exists() && !dest.is_dir() {
        return Err(SyncError::NotADirectory(dest.to_path_buf()));
    }

    let mut degraded = Vec::new();
    let cloned = if !dest.exists() {
        clone(repo, runner)?;
        true
    } else {
        info!(path = ?dest, "updating source checkout");
        let pull = ProcessSpec::new("git")
            .args(["pull", "--ff-only"])
            .current_dir(dest);
        tolerate(runner, &pull, dest, &mut degraded);
        if repo.submodules {
            let submodules = ProcessSpec::new("git")
                .args(["submodule", "update", "--recursive", "--init"])
                .current_dir(dest);
            tolerate(runner, &submodules, dest, &mut degraded);
        }
        false
    };

    let reset = ProcessSpec::new("git")
        .args(["reset", "HEAD", "--hard"])
        .current_dir(dest);
    tolerate(runner, &reset, dest, &mut degraded);

    Ok(if cloned {
        SyncAction::Cloned { degraded }
    } else {
        SyncAction::Updated { degraded }
    })
}

fn clone(repo: &SourceRepository, runner: &mut dyn ProcessRunner) -> Result<(), SyncError> {
    info!(uri = %repo.uri, path = ?repo.path, "cloning source checkout");
    let mut spec = ProcessSpec::new("git").arg("clone");
    if repo.submodules {
        spec = spec.arg("--recursive");
    }
    let spec = spec
        .arg(repo.uri.as_str())
        .arg(repo.path.to_string_lossy());

    let output = runner.run(&spec).map_err(|source| SyncError::Launch {
        path: repo.path.clone(),
        source,
    })?;
    if !output.state.is_success() {
        return Err(SyncError::Clone {
            uri: repo.uri.clone(),
            path: repo.path.clone(),
            state: output.state.to_string(),
            diagnostics: output.diagnostics(),
        });
    }
    Ok(())
}

fn tolerate(
    runner: &mut dyn ProcessRunner,
    spec: &ProcessSpec,
    dest: &Path,
    degraded: &mut Vec<String>,
) {
    let failure = match runner.run(spec) {
        Ok(output) if output.state.is_success() => return,
        Ok(output) => output.state.to_string(),
        Err(e) => e.to_string(),
    };
    let message = format!("'{}' in {:?}: {}", spec.command_line(), dest, failure);
    warn!("{message}");
    degraded.push(message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::{FakeRunner, spawn_error};
    use crate::process::{ExitState, ProcessOutput};
    use std::fs;

    fn repo_at(path: &Path) -> SourceRepository {
        SourceRepository::new("https://example.invalid/spicy", path)
    }

    #[test]
    fn missing_checkout_is_cloned_recursively_then_reset() {
        let base = tempfile::tempdir().unwrap();
        let dest = base.path().join("spicy");
        let repo = repo_at(&dest);
        let clone_target = dest.clone();
        let mut runner = FakeRunner::new(move |spec| {
            if spec.args.first().map(String::as_str) == Some("clone") {
                fs::create_dir_all(&clone_target).unwrap();
            }
            Ok(ProcessOutput::success())
        });

        let action = sync(&repo, &mut runner).unwrap();
        assert_eq!(action, SyncAction::Cloned { degraded: vec![] });

        let lines = runner.command_lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            format!(
                "git clone --recursive https://example.invalid/spicy {}",
                dest.display()
            )
        );
        assert_eq!(lines[1], "git reset HEAD --hard");
        assert_eq!(runner.calls[1].working_dir.as_deref(), Some(dest.as_path()));
    }

    #[test]
    fn existing_checkout_is_pulled_updated_and_reset() {
        let dest = tempfile::tempdir().unwrap();
        let repo = repo_at(dest.path());
        let mut runner = FakeRunner::succeeding();

        let action = sync(&repo, &mut runner).unwrap();
        assert_eq!(action, SyncAction::Updated { degraded: vec![] });
        assert_eq!(
            runner.command_lines(),
            vec![
                "git pull --ff-only",
                "git submodule update --recursive --init",
                "git reset HEAD --hard",
            ]
        );
        assert!(
            runner
                .calls
                .iter()
                .all(|c| c.working_dir.as_deref() == Some(dest.path()))
        );
    }

    #[test]
    fn submodule_update_skipped_without_submodules() {
        let dest = tempfile::tempdir().unwrap();
        let mut repo = repo_at(dest.path());
        repo.submodules = false;
        let mut runner = FakeRunner::succeeding();

        sync(&repo, &mut runner).unwrap();
        assert_eq!(
            runner.command_lines(),
            vec!["git pull --ff-only", "git reset HEAD --hard"]
        );
    }

    #[test]
    fn repeated_sync_is_idempotent() {
        let dest = tempfile::tempdir().unwrap();
        let repo = repo_at(dest.path());
        let mut runner = FakeRunner::succeeding();

        let first = sync(&repo, &mut runner).unwrap();
        let first_calls = runner.command_lines();
        runner.calls.clear();
        let second = sync(&repo, &mut runner).unwrap();

        assert_eq!(first, second);
        assert_eq!(first_calls, runner.command_lines());
        assert!(dest.path().is_dir());
    }

    #[test]
    fn failed_clone_is_fatal_and_carries_diagnostics() {
        let base = tempfile::tempdir().unwrap();
        let repo = repo_at(&base.path().join("spicy"));
        let mut runner = FakeRunner::new(|_| {
            Ok(ProcessOutput {
                state: ExitState::Code(128),
                stderr_tail: vec!["fatal: repository not found".to_string()],
                duration: Default::default(),
            })
        });

        match sync(&repo, &mut runner) {
            Err(SyncError::Clone {
                state, diagnostics, ..
            }) => {
                assert_eq!(state, "exited with code 128");
                assert_eq!(diagnostics, "fatal: repository not found");
            }
            other => panic!("Expected clone error, got {other:?}"),
        }
        assert_eq!(runner.calls.len(), 1, "nothing runs after a failed clone");
    }

    #[test]
    fn missing_git_binary_during_clone_is_fatal() {
        let base = tempfile::tempdir().unwrap();
        let repo = repo_at(&base.path().join("spicy"));
        let mut runner = FakeRunner::new(|_| Err(spawn_error("git")));
        assert!(matches!(
            sync(&repo, &mut runner),
            Err(SyncError::Launch { .. })
        ));
    }

    #[test]
    fn failed_reset_after_clone_is_tolerated() {
        let base = tempfile::tempdir().unwrap();
        let dest = base.path().join("spicy");
        let repo = repo_at(&dest);
        let clone_target = dest.clone();
        let mut runner = FakeRunner::new(move |spec| match spec.args[0].as_str() {
            "clone" => {
                fs::create_dir_all(&clone_target).unwrap();
                Ok(ProcessOutput::success())
            }
            _ => Ok(ProcessOutput::with_state(ExitState::Code(128))),
        });

        let action = sync(&repo, &mut runner).unwrap();
        assert!(matches!(action, SyncAction::Cloned { .. }));
        assert_eq!(action.degraded().len(), 1);
        assert!(action.degraded()[0].contains("git reset HEAD --hard"));
    }

    #[test]
    fn failed_pull_and_submodule_update_are_tolerated() {
        let dest = tempfile::tempdir().unwrap();
        let repo = repo_at(dest.path());
        let mut runner = FakeRunner::new(|spec| match spec.args[0].as_str() {
            "reset" => Ok(ProcessOutput::success()),
            _ => Ok(ProcessOutput::with_state(ExitState::Code(1))),
        });

        let action = sync(&repo, &mut runner).unwrap();
        assert_eq!(action.degraded().len(), 2);
        assert_eq!(runner.calls.len(), 3, "reset still runs after failures");
    }

    #[test]
    fn file_in_place_of_checkout_is_rejected() {
        let base = tempfile::tempdir().unwrap();
        let dest = base.path().join("spicy");
        fs::write(&dest, b"not a repo").unwrap();
        let mut runner = FakeRunner::succeeding();

        assert!(matches!(
            sync(&repo_at(&dest), &mut runner),
            Err(SyncError::NotADirectory(_))
        ));
        assert!(runner.calls.is_empty());
    }
}
