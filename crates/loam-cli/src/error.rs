use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] loam_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Item ID cannot be empty")]
    EmptyItemId,
    #[error("Editor command failed: {0}")]
    EditorFailed(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(
        "No sync target configured. Run `loam config set-target <uri>`, pass --target, or set LOAM_TARGET."
    )]
    TargetNotConfigured,
    #[error("sync already in progress ({0})")]
    SyncInProgress(String),
    #[error("Refusing to format the target without --yes")]
    FormatNotConfirmed,
}

impl CliError {
    /// Process exit code for this error
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::SyncInProgress(_) => 2,
            _ => 1,
        }
    }
}
