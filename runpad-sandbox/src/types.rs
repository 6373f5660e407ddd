//! Core types for sandbox execution

use crate::error::{Result, SandboxError};
use crate::execution::ExecutionId;
use runpad_common::StreamKind;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::DropGuard;

/// A source file submitted for execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    /// Path relative to the workspace root
    pub filename: String,

    /// File contents
    pub content: String,
}

impl SourceFile {
    pub fn new(filename: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            content: content.into(),
        }
    }
}

/// What to do when dependency installation does not succeed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallPolicy {
    /// Attach the install log as a warning and run anyway, so the program's
    /// own import errors reach the caller
    #[default]
    BestEffort,
    /// Abort the request before the entry file runs
    FailFast,
}

/// Request to execute a project
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Files to materialize, in submission order
    pub files: Vec<SourceFile>,

    /// File to launch (None = configured default)
    pub entry_file: Option<String>,

    /// Requested timeout, never longer than the configured one
    pub timeout: Option<Duration>,

    /// Overrides the configured install policy
    pub install_policy: Option<InstallPolicy>,
}

impl ExecutionRequest {
    /// Create a request for the given files
    pub fn new(files: Vec<SourceFile>) -> Self {
        Self {
            files,
            entry_file: None,
            timeout: None,
            install_policy: None,
        }
    }

    /// Add a file
    pub fn with_file(mut self, filename: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.push(SourceFile::new(filename, content));
        self
    }

    /// Set the entry file
    pub fn with_entry(mut self, entry: impl Into<String>) -> Self {
        self.entry_file = Some(entry.into());
        self
    }

    /// Set timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_install_policy(mut self, policy: InstallPolicy) -> Self {
        self.install_policy = Some(policy);
        self
    }
}

/// A chunk of process output, as it was read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputEvent {
    pub stream: StreamKind,
    pub data: Vec<u8>,
}

impl OutputEvent {
    pub fn new(stream: StreamKind, data: Vec<u8>) -> Self {
        Self { stream, data }
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }
}

/// Receives output incrementally while a request runs
pub type OutputSink = mpsc::UnboundedSender<OutputEvent>;

/// An allow-listed file produced by the program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    pub media_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallStatus {
    Succeeded,
    Failed { exit_code: Option<i32> },
    TimedOut,
    /// The package manager could not be started
    SpawnFailed,
    /// The manifest declared nothing to install
    Skipped,
}

impl InstallStatus {
    /// Whether execution can rely on the declared packages
    pub fn is_success(&self) -> bool {
        matches!(self, InstallStatus::Succeeded | InstallStatus::Skipped)
    }
}

impl fmt::Display for InstallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallStatus::Succeeded => write!(f, "succeeded"),
            InstallStatus::Failed {
                exit_code: Some(code),
            } => write!(f, "failed with exit code {}", code),
            InstallStatus::Failed { exit_code: None } => write!(f, "failed"),
            InstallStatus::TimedOut => write!(f, "timed out"),
            InstallStatus::SpawnFailed => write!(f, "package manager could not be started"),
            InstallStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Outcome of the dependency installation step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub status: InstallStatus,

    /// Combined installer output
    pub log: String,

    pub duration_ms: u64,
}

/// What a single supervised run produced
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    /// stdout and stderr merged in arrival order, stderr lines marked
    pub combined_output: String,
    pub stdout: String,
    pub stderr: String,

    /// Exit code; None exactly when the run timed out
    pub exit_code: Option<i32>,
    pub timed_out: bool,

    pub output_truncated: bool,
    pub duration_ms: u64,
}

/// Result of one execution request
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub execution_id: ExecutionId,

    pub combined_output: String,

    /// Exit code of the entry file; None exactly when `timed_out`
    pub exit_code: Option<i32>,
    pub timed_out: bool,

    /// Bytes of the primary image artifact
    pub artifact_image: Option<Vec<u8>>,

    /// Every artifact harvested, the primary image included
    pub artifacts: Vec<Artifact>,

    /// Present when a manifest was found
    pub install: Option<InstallReport>,

    /// Non-fatal problems (install failure under best-effort, skipped artifacts)
    pub warnings: Vec<String>,

    pub output_truncated: bool,

    /// Wall-clock duration of the whole request
    pub duration_ms: u64,
}

impl ExecutionResult {
    /// Check if the program exited with status 0
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }
}

/// Streaming execution: output events as they happen, then the result
///
/// Dropping the stream cancels the execution; the process tree is killed
/// and the workspace removed.
pub struct ExecutionStream {
    id: ExecutionId,
    events: mpsc::UnboundedReceiver<OutputEvent>,
    result: JoinHandle<Result<ExecutionResult>>,
    _cancel: DropGuard,
}

impl ExecutionStream {
    pub(crate) fn new(
        id: ExecutionId,
        events: mpsc::UnboundedReceiver<OutputEvent>,
        result: JoinHandle<Result<ExecutionResult>>,
        cancel: DropGuard,
    ) -> Self {
        Self {
            id,
            events,
            result,
            _cancel: cancel,
        }
    }

    pub fn id(&self) -> ExecutionId {
        self.id
    }

    /// Next output event; None once the execution has finished producing output
    pub async fn next_event(&mut self) -> Option<OutputEvent> {
        self.events.recv().await
    }

    /// Wait for the final result, discarding unread events
    pub async fn finish(self) -> Result<ExecutionResult> {
        let ExecutionStream {
            events,
            result,
            _cancel,
            ..
        } = self;
        drop(events);
        let outcome = result
            .await
            .map_err(|e| SandboxError::Internal(format!("execution task failed: {}", e)));
        drop(_cancel.disarm());
        outcome?
    }
}
