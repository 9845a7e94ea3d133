pub mod build;
pub mod campaign;
pub mod config;
pub mod matrix;
pub mod process;
pub mod runner;
pub mod source;

pub use build::{BuildDriver, BuildEnvironment, BuildError};
pub use campaign::{Campaign, CampaignError, CampaignOptions, CampaignReport};
pub use config::CampaignConfig;
pub use matrix::{ConfigError, FuzzRunSpec, FuzzTargetMatrix, RunLimits, expand};
pub use process::{CommandRunner, ExitState, ProcessError, ProcessRunner, ProcessSpec};
pub use runner::{FuzzRunExecutor, RunError, RunOutcome};
pub use source::{SourceRepository, SyncAction, SyncError, sync};
