//! Conversions between pipeline types and the `runpad-common` wire protocol

use crate::error::SandboxError;
use crate::types::{
    Artifact, ExecutionRequest, ExecutionResult, InstallPolicy, InstallReport, InstallStatus,
    SourceFile,
};
use runpad_common::{
    encode_artifact, ArtifactPayload, ErrorBody, ErrorResponse, FileEntry, InstallState,
    InstallSummary, RunRequest, RunResponse,
};
use std::time::Duration;

impl From<FileEntry> for SourceFile {
    fn from(entry: FileEntry) -> Self {
        SourceFile::new(entry.filename, entry.content)
    }
}

impl From<RunRequest> for ExecutionRequest {
    fn from(request: RunRequest) -> Self {
        ExecutionRequest {
            files: request.files.into_iter().map(SourceFile::from).collect(),
            entry_file: request.entry,
            timeout: request
                .timeout_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            install_policy: request.fail_fast.map(|fail_fast| {
                if fail_fast {
                    InstallPolicy::FailFast
                } else {
                    InstallPolicy::BestEffort
                }
            }),
        }
    }
}

impl InstallReport {
    pub fn summary(&self) -> InstallSummary {
        let (status, exit_code) = match &self.status {
            InstallStatus::Succeeded => (InstallState::Succeeded, Some(0)),
            InstallStatus::Failed { exit_code } => (InstallState::Failed, *exit_code),
            InstallStatus::TimedOut => (InstallState::TimedOut, None),
            InstallStatus::SpawnFailed => (InstallState::SpawnFailed, None),
            InstallStatus::Skipped => (InstallState::Skipped, None),
        };
        InstallSummary {
            status,
            exit_code,
            log: self.log.clone(),
            duration_ms: self.duration_ms,
        }
    }
}

impl From<&Artifact> for ArtifactPayload {
    fn from(artifact: &Artifact) -> Self {
        ArtifactPayload {
            name: artifact.name.clone(),
            media_type: artifact.media_type.clone(),
            data: encode_artifact(&artifact.bytes),
        }
    }
}

impl ExecutionResult {
    /// Response body for `POST /run`; binary artifacts are base64 encoded
    pub fn to_response(&self) -> RunResponse {
        RunResponse {
            execution_id: self.execution_id.0,
            output: self.combined_output.clone(),
            image: self.artifact_image.as_deref().map(encode_artifact),
            exit_code: self.exit_code,
            timed_out: self.timed_out,
            output_truncated: self.output_truncated,
            duration_ms: self.duration_ms,
            artifacts: self.artifacts.iter().map(ArtifactPayload::from).collect(),
            install: self.install.as_ref().map(InstallReport::summary),
            warnings: self.warnings.clone(),
        }
    }
}

impl SandboxError {
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
            install: match self {
                SandboxError::Install(report) => Some(report.summary()),
                _ => None,
            },
        }
    }

    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            error: self.to_body(),
        }
    }
}
