//! Runtime trait and implementations

mod process;

use crate::types::{OutputSink, RunOutcome};
use crate::workspace::Workspace;
use crate::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use process::ProcessRuntime;

/// Per-run parameters decided by the coordinator
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Effective wall-clock limit
    pub timeout: Duration,

    /// Installed packages to put on the import path
    pub python_path: Option<PathBuf>,
}

/// Runtime abstraction for executing an entry file
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Run `entry` (relative to the workspace root) to completion
    ///
    /// A non-zero exit or an expired deadline is a normal outcome. Errors
    /// are reserved for spawn failures, cancellation and I/O problems.
    async fn run(
        &self,
        workspace: &Workspace,
        entry: &Path,
        options: &RunOptions,
        sink: Option<OutputSink>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome>;

    /// Get runtime name
    fn name(&self) -> &str;
}
