use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Rejections of a matrix, raised before any sync, build or run work.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Fuzz matrix expands to no runs")]
    EmptyMatrix,
    #[error("Grammar name must not be empty")]
    EmptyGrammar,
    #[error("Grammar '{0}' lists an empty parser name")]
    EmptyParser(String),
    #[error("Name '{0}' cannot be used in a corpus directory name")]
    UnsafeName(String),
    #[error("Grammar '{grammar}' lists parser '{parser}' more than once")]
    DuplicateParser { grammar: String, parser: String },
    #[error("'{first}' and '{second}' would share corpus directory '{dir}'")]
    CorpusCollision {
        first: String,
        second: String,
        dir: String,
    },
    #[error("Grammar filter '{0}' does not name a grammar in the matrix")]
    UnknownGrammar(String),
}

/// Ordered grammar → parsers mapping. Declaration order is execution order.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct FuzzTargetMatrix {
    entries: IndexMap<String, Vec<String>>,
}

impl FuzzTargetMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends parsers to `grammar`, creating it at the end if it is new.
    pub fn insert<I, S>(&mut self, grammar: impl Into<String>, parsers: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entries
            .entry(grammar.into())
            .or_default()
            .extend(parsers.into_iter().map(Into::into));
    }

    pub fn grammars(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn parsers(&self, grammar: &str) -> Option<&[String]> {
        self.entries.get(grammar).map(Vec::as_slice)
    }

    /// Grammars that contribute no runs.
    pub fn empty_grammars(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(_, parsers)| parsers.is_empty())
            .map(|(grammar, _)| grammar.as_str())
            .collect()
    }

    pub fn run_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Keeps only the named grammars, in matrix order.
    pub fn retain_grammars(&self, keep: &[String]) -> Result<Self, ConfigError> {
        if let Some(unknown) = keep.iter().find(|g| !self.entries.contains_key(*g)) {
            return Err(ConfigError::UnknownGrammar(unknown.clone()));
        }
        let entries = self
            .entries
            .iter()
            .filter(|(grammar, _)| keep.contains(grammar))
            .map(|(grammar, parsers)| (grammar.clone(), parsers.clone()))
            .collect();
        Ok(Self { entries })
    }

    /// Checks every invariant [`expand`] relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen_dirs: HashMap<String, String> = HashMap::new();
        for (grammar, parsers) in &self.entries {
            if grammar.is_empty() {
                return Err(ConfigError::EmptyGrammar);
            }
            check_name(grammar)?;
            for (i, parser) in parsers.iter().enumerate() {
                if parser.is_empty() {
                    return Err(ConfigError::EmptyParser(grammar.clone()));
                }
                check_name(parser)?;
                if parsers[..i].contains(parser) {
                    return Err(ConfigError::DuplicateParser {
                        grammar: grammar.clone(),
                        parser: parser.clone(),
                    });
                }
                let dir = corpus_dir_name(grammar, parser);
                let pair = format!("{grammar}/{parser}");
                if let Some(first) = seen_dirs.insert(dir.clone(), pair.clone()) {
                    return Err(ConfigError::CorpusCollision {
                        first,
                        second: pair,
                        dir,
                    });
                }
            }
        }
        if self.run_count() == 0 {
            return Err(ConfigError::EmptyMatrix);
        }
        Ok(())
    }
}

fn check_name(name: &str) -> Result<(), ConfigError> {
    if name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(ConfigError::UnsafeName(name.to_string()));
    }
    Ok(())
}

/// Name of the fuzz-target binary built for `grammar`.
pub fn binary_name(grammar: &str) -> String {
    format!("fuzz-{grammar}")
}

/// Name of the corpus directory owned by one (grammar, parser) pair.
pub fn corpus_dir_name(grammar: &str, parser: &str) -> String {
    format!("corpus-fuzz-{grammar}-{parser}")
}

/// Bounds applied to every run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLimits {
    /// Per-input stall timeout handed to the fuzz engine.
    pub timeout_secs: u64,
    /// Wall-clock budget of one run.
    pub max_total_time_secs: u64,
    pub jobs: usize,
}

/// One bounded fuzz run of one parser inside one grammar's binary.
///
/// Directory fields are relative to the campaign output directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct FuzzRunSpec {
    pub grammar: String,
    pub parser: String,
    pub corpus_dir: String,
    pub artifact_dir: String,
    pub timeout_secs: u64,
    pub max_total_time_secs: u64,
    pub jobs: usize,
}

impl FuzzRunSpec {
    pub fn new(grammar: &str, parser: &str, limits: RunLimits) -> Self {
        let corpus_dir = corpus_dir_name(grammar, parser);
        let artifact_dir = format!("{corpus_dir}/artifacts");
        Self {
            grammar: grammar.to_string(),
            parser: parser.to_string(),
            corpus_dir,
            artifact_dir,
            timeout_secs: limits.timeout_secs,
            max_total_time_secs: limits.max_total_time_secs,
            jobs: limits.jobs,
        }
    }

    pub fn binary(&self) -> String {
        binary_name(&self.grammar)
    }

    pub fn host_corpus_dir(&self, output_dir: &Path) -> PathBuf {
        output_dir.join(&self.corpus_dir)
    }

    pub fn host_artifact_dir(&self, output_dir: &Path) -> PathBuf {
        output_dir.join(&self.artifact_dir)
    }
}

/// Expands `matrix` into one spec per (grammar, parser), grammar order first.
///
/// Pure; callers validate the matrix first.
pub fn expand(matrix: &FuzzTargetMatrix, limits: RunLimits) -> Vec<FuzzRunSpec> {
    matrix
        .entries
        .iter()
        .flat_map(|(grammar, parsers)| {
            parsers
                .iter()
                .map(move |parser| FuzzRunSpec::new(grammar, parser, limits))
        })
        .collect()
}
