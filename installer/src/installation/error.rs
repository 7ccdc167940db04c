use std::path::PathBuf;
use thiserror::Error;

/// Fatal pipeline errors. Any of these halts the run; the operator has to act before retrying.
#[derive(Debug, Error)]
pub enum InstallError {
    /// Working directory unusable, lock held, tool missing, or ownership gate failed.
    #[error("{0}")]
    Precondition(String),

    /// Leftovers from an earlier run that must be cleared by hand.
    #[error("{what} already exists: {path:?} (remove it before re-running)")]
    StaleState { what: &'static str, path: PathBuf },

    #[error("{tool} failed during {stage}: {detail}")]
    ExternalTool {
        stage: &'static str,
        tool: String,
        detail: String,
    },

    #[error("archive checksum mismatch for {path:?} (expected {expected}, got {actual})")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("cannot move {from:?} to {to:?}: {source}")]
    Relocate {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("stage {stage} called out of order (run is {state})")]
    OutOfOrder {
        stage: &'static str,
        state: &'static str,
    },
}

impl InstallError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        InstallError::Io {
            context: context.into(),
            source,
        }
    }

    /// Short classification used in reports and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            InstallError::Precondition(_) => "precondition",
            InstallError::StaleState { .. } => "stale_state",
            InstallError::ExternalTool { .. } => "external_tool",
            InstallError::ChecksumMismatch { .. } => "checksum_mismatch",
            InstallError::Relocate { .. } => "relocate",
            InstallError::Io { .. } => "io",
            InstallError::OutOfOrder { .. } => "out_of_order",
        }
    }
}
