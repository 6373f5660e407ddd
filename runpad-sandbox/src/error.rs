//! Error types for the execution pipeline
//!
//! Only platform-level failures are errors. A program that exits non-zero or
//! runs past its deadline still produces an [`ExecutionResult`](crate::ExecutionResult).

use crate::types::InstallReport;
use runpad_common::ErrorKind;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SandboxError>;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{context}: {source}")]
    Resource {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Dependency installation failed: {}", .0.status)]
    Install(Box<InstallReport>),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SandboxError {
    pub fn invalid(message: impl Into<String>) -> Self {
        SandboxError::InvalidInput(message.into())
    }

    pub fn resource(context: impl Into<String>, source: io::Error) -> Self {
        SandboxError::Resource {
            context: context.into(),
            source,
        }
    }

    /// Wire category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::InvalidInput(_) => ErrorKind::InvalidInput,
            SandboxError::Resource { .. } => ErrorKind::Resource,
            SandboxError::Spawn { .. } => ErrorKind::Spawn,
            SandboxError::Install(_) => ErrorKind::Install,
            SandboxError::Cancelled => ErrorKind::Cancelled,
            SandboxError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the caller, rather than the platform, is at fault
    pub fn is_client_error(&self) -> bool {
        matches!(self, SandboxError::InvalidInput(_))
    }
}
