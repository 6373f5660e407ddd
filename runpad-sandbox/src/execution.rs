//! Execution identity and the per-request stage machine

use crate::error::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Unique execution identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub uuid::Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Directory name of the workspace owned by this execution
    pub fn workspace_dir_name(&self) -> String {
        format!("run-{}", self.0)
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pipeline stage
///
/// `Created → FilesWritten → (Installing →) Running → Collecting → Completed`,
/// with `Failed` reachable from any non-terminal stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStage {
    Created,
    FilesWritten,
    Installing,
    Running,
    Collecting,
    Completed,
    Failed,
}

impl ExecutionStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStage::Completed | ExecutionStage::Failed)
    }

    /// Whether `self → next` is a legal transition
    pub fn can_advance_to(self, next: ExecutionStage) -> bool {
        use ExecutionStage::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Created, FilesWritten) => true,
            (FilesWritten, Installing) | (FilesWritten, Running) => true,
            (Installing, Running) => true,
            (Running, Collecting) => true,
            (Collecting, Completed) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStage::Created => "created",
            ExecutionStage::FilesWritten => "files_written",
            ExecutionStage::Installing => "installing",
            ExecutionStage::Running => "running",
            ExecutionStage::Collecting => "collecting",
            ExecutionStage::Completed => "completed",
            ExecutionStage::Failed => "failed",
        }
    }
}

/// Tracks where one execution is in the pipeline
#[derive(Debug, Clone)]
pub struct ExecutionState {
    pub id: ExecutionId,
    stage: ExecutionStage,
    started: Instant,
}

impl ExecutionState {
    pub fn new(id: ExecutionId) -> Self {
        Self {
            id,
            stage: ExecutionStage::Created,
            started: Instant::now(),
        }
    }

    pub fn stage(&self) -> ExecutionStage {
        self.stage
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Move to `next`, rejecting transitions the pipeline never makes
    pub fn advance(&mut self, next: ExecutionStage) -> Result<()> {
        if !self.stage.can_advance_to(next) {
            return Err(SandboxError::Internal(format!(
                "illegal stage transition {} -> {}",
                self.stage.as_str(),
                next.as_str()
            )));
        }
        tracing::debug!(
            execution_id = %self.id,
            from = self.stage.as_str(),
            to = next.as_str(),
            "Stage transition"
        );
        self.stage = next;
        Ok(())
    }

    /// Enter the absorbing failure stage (no-op once terminal)
    pub fn fail(&mut self) {
        if !self.stage.is_terminal() {
            tracing::debug!(
                execution_id = %self.id,
                from = self.stage.as_str(),
                "Execution failed"
            );
            self.stage = ExecutionStage::Failed;
        }
    }
}
