//! Request/response types exchanged with runpad clients.
//!
//! These are the JSON shapes of `POST /run` and `POST /run/stream`. The
//! sandbox converts them to and from its own execution types; nothing here
//! knows about processes or workspaces.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single generated source file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the project root
    pub filename: String,

    /// File contents
    pub content: String,
}

impl FileEntry {
    pub fn new(filename: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            content: content.into(),
        }
    }
}

/// Body of a run request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    /// Project files, in submission order
    pub files: Vec<FileEntry>,

    /// File to launch (server default when omitted)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,

    /// Requested wall-clock limit; clamped to the server maximum
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Abort before running when dependency installation fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_fast: Option<bool>,
}

impl RunRequest {
    pub fn new(files: Vec<FileEntry>) -> Self {
        Self {
            files,
            entry: None,
            timeout_secs: None,
            fail_fast: None,
        }
    }

    pub fn with_entry(mut self, entry: impl Into<String>) -> Self {
        self.entry = Some(entry.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// Which stream an output chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
    /// Output of the dependency installer
    Install,
}

/// Outcome of the dependency installation step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallState {
    Succeeded,
    Failed,
    TimedOut,
    SpawnFailed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallSummary {
    pub status: InstallState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub log: String,
    pub duration_ms: u64,
}

/// An output file produced by the program, base64 encoded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactPayload {
    pub name: String,
    pub media_type: String,
    pub data: String,
}

/// Body of a successful run response
///
/// "Successful" means the platform did its job; the program itself may
/// still have failed, which is visible through `exit_code` and `timed_out`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResponse {
    pub execution_id: Uuid,

    /// Merged stdout/stderr, stderr lines marked
    pub output: String,

    /// Primary image artifact (base64), if the program produced one
    pub image: Option<String>,

    pub exit_code: Option<i32>,
    pub timed_out: bool,

    #[serde(default)]
    pub output_truncated: bool,

    pub duration_ms: u64,

    #[serde(default)]
    pub artifacts: Vec<ArtifactPayload>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install: Option<InstallSummary>,

    #[serde(default)]
    pub warnings: Vec<String>,
}

impl RunResponse {
    /// The program ran to completion and exited with status 0
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }
}

/// Category of a platform-level failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The request itself was malformed (bad filenames, missing entry)
    InvalidInput,
    /// The workspace could not be provisioned or written
    Resource,
    /// The interpreter could not be started
    Spawn,
    /// Dependency installation failed under the fail-fast policy
    Install,
    /// The caller went away or cancelled the run
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// HTTP status code used by the service for this kind
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::InvalidInput => 400,
            ErrorKind::Install => 422,
            ErrorKind::Cancelled => 503,
            ErrorKind::Resource | ErrorKind::Spawn | ErrorKind::Internal => 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install: Option<InstallSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

impl ErrorResponse {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                kind,
                message: message.into(),
                install: None,
            },
        }
    }
}

/// Events emitted by `POST /run/stream`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    Output { stream: StreamKind, data: String },
    Result(RunResponse),
    Error(ErrorBody),
}

impl StreamEvent {
    /// SSE event name for this payload
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Output { .. } => "output",
            StreamEvent::Result(_) => "result",
            StreamEvent::Error(_) => "error",
        }
    }
}
