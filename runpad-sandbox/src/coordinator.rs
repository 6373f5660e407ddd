//! Execution coordinator - main entry point
//!
//! Drives one request through the pipeline: validate, provision a
//! workspace, write files, install dependencies, run the entry file,
//! harvest artifacts, tear down. The workspace is destroyed on every path
//! out of [`ExecutionCoordinator::execute`], and by the workspace drop guard
//! when the future itself is dropped.

use crate::artifacts::ArtifactCollector;
use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError};
use crate::execution::{ExecutionId, ExecutionStage, ExecutionState};
use crate::installer::{CommandInstaller, DependencyInstaller};
use crate::runtime::{ProcessRuntime, RunOptions, Runtime};
use crate::types::{
    ExecutionRequest, ExecutionResult, ExecutionStream, InstallPolicy, OutputSink,
};
use crate::workspace::{validate_filename, Workspace, WorkspaceManager};
use runpad_common::ErrorKind;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Runs execution requests end to end
///
/// Cloning is cheap; clones share configuration and components.
#[derive(Clone)]
pub struct ExecutionCoordinator {
    config: Arc<SandboxConfig>,
    workspaces: WorkspaceManager,
    installer: Arc<dyn DependencyInstaller>,
    runtime: Arc<dyn Runtime>,
    artifacts: ArtifactCollector,
    active: Arc<AtomicUsize>,
}

impl ExecutionCoordinator {
    /// Create a coordinator that runs the configured interpreter and package manager
    pub fn new(config: SandboxConfig) -> Self {
        let runtime = ProcessRuntime::new(&config);
        let installer = CommandInstaller::new(
            config.installer.clone(),
            config.environment.clone(),
            config.output.clone(),
        );
        Self::with_components(config, runtime, installer)
    }

    /// Create a coordinator with custom runtime and installer implementations
    pub fn with_components(
        config: SandboxConfig,
        runtime: impl Runtime + 'static,
        installer: impl DependencyInstaller + 'static,
    ) -> Self {
        Self {
            workspaces: WorkspaceManager::new(config.workspace_root.clone(), config.input.clone()),
            artifacts: ArtifactCollector::new(config.artifacts.clone()),
            installer: Arc::new(installer),
            runtime: Arc::new(runtime),
            config: Arc::new(config),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Get the runtime name
    pub fn runtime_name(&self) -> &str {
        self.runtime.name()
    }

    /// Number of requests currently in the pipeline
    pub fn active_executions(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Execute a request and wait for the result
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        self.execute_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Execute a request that the caller can cancel
    pub async fn execute_with_cancel(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult> {
        self.run_pipeline(ExecutionId::new(), request, None, cancel)
            .await
    }

    /// Execute in the background, streaming output as it is produced
    ///
    /// Dropping the returned stream cancels the execution.
    pub fn execute_streaming(&self, request: ExecutionRequest) -> ExecutionStream {
        let id = ExecutionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let coordinator = self.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            coordinator
                .run_pipeline(id, request, Some(tx), token)
                .await
        });

        ExecutionStream::new(id, rx, handle, cancel.drop_guard())
    }

    async fn run_pipeline(
        &self,
        id: ExecutionId,
        request: ExecutionRequest,
        sink: Option<OutputSink>,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult> {
        let _active = ActiveGuard::enter(&self.active);
        let mut state = ExecutionState::new(id);
        info!(
            execution_id = %id,
            files = request.files.len(),
            runtime = self.runtime.name(),
            "Executing project"
        );

        let result = match self.prepare(&request) {
            Ok((entry, inputs)) => match self.workspaces.create(id).await {
                Ok(mut workspace) => {
                    let result = self
                        .run_stages(&mut state, &workspace, &request, entry, inputs, sink, &cancel)
                        .await;
                    self.workspaces.destroy(&mut workspace).await;
                    result
                }
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        let elapsed = state.elapsed_ms();
        metrics::histogram!("runpad_execution_duration_seconds").record(elapsed as f64 / 1000.0);
        match &result {
            Ok(result) => {
                let outcome = if result.timed_out {
                    "timed_out"
                } else if result.success() {
                    "success"
                } else {
                    "program_failed"
                };
                metrics::counter!("runpad_executions_total", "outcome" => outcome).increment(1);
                info!(
                    execution_id = %id,
                    exit_code = ?result.exit_code,
                    timed_out = result.timed_out,
                    artifacts = result.artifacts.len(),
                    duration_ms = result.duration_ms,
                    "Execution completed"
                );
            }
            Err(e) => {
                metrics::counter!("runpad_executions_total", "outcome" => error_label(e.kind()))
                    .increment(1);
                if e.is_client_error() {
                    info!(execution_id = %id, error = %e, "Execution rejected");
                } else {
                    warn!(execution_id = %id, stage = state.stage().as_str(), error = %e, "Execution failed");
                }
                state.fail();
            }
        }
        result
    }

    /// Validate the request before touching the filesystem
    ///
    /// Returns the normalized entry path and the normalized input names.
    fn prepare(&self, request: &ExecutionRequest) -> Result<(PathBuf, HashSet<String>)> {
        let normalized = self.workspaces.validate_files(&request.files)?;

        let entry_name = request
            .entry_file
            .as_deref()
            .filter(|entry| !entry.trim().is_empty())
            .unwrap_or(&self.config.default_entry);
        let entry = validate_filename(entry_name)?;
        if !normalized.contains(&entry) {
            return Err(SandboxError::invalid(format!(
                "entry file {:?} is not among the submitted files",
                entry_name
            )));
        }

        let inputs = normalized
            .iter()
            .map(|path| path.to_string_lossy().into_owned())
            .collect();
        Ok((entry, inputs))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_stages(
        &self,
        state: &mut ExecutionState,
        workspace: &Workspace,
        request: &ExecutionRequest,
        entry: PathBuf,
        inputs: HashSet<String>,
        sink: Option<OutputSink>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        self.workspaces.write_files(workspace, &request.files).await?;
        state.advance(ExecutionStage::FilesWritten)?;

        let mut warnings = Vec::new();
        let mut install = None;
        let mut python_path = None;

        let manifest = if self.config.installer.enabled {
            self.installer.detect_manifest(workspace).await?
        } else {
            None
        };
        if let Some(manifest) = manifest {
            if cancel.is_cancelled() {
                return Err(SandboxError::Cancelled);
            }
            state.advance(ExecutionStage::Installing)?;
            warnings.extend(manifest.warnings());

            let report = self
                .installer
                .install(workspace, &manifest, sink.clone(), cancel)
                .await?;
            if !report.status.is_success() {
                let policy = request
                    .install_policy
                    .unwrap_or(self.config.installer.policy);
                match policy {
                    InstallPolicy::FailFast => return Err(SandboxError::Install(Box::new(report))),
                    InstallPolicy::BestEffort => warnings.push(format!(
                        "dependency installation {}; running anyway",
                        report.status
                    )),
                }
            }
            python_path = self.installer.site_dir(workspace);
            install = Some(report);
        }

        if cancel.is_cancelled() {
            return Err(SandboxError::Cancelled);
        }
        state.advance(ExecutionStage::Running)?;
        let options = RunOptions {
            timeout: self.config.limits.clamp_timeout(request.timeout),
            python_path,
        };
        let outcome = self
            .runtime
            .run(workspace, &entry, &options, sink, cancel)
            .await?;

        state.advance(ExecutionStage::Collecting)?;
        let collected = self.artifacts.collect(workspace, &inputs).await;
        warnings.extend(collected.warnings);

        state.advance(ExecutionStage::Completed)?;

        // A run either exited or was stopped at its deadline, never both.
        let exit_code = if outcome.timed_out {
            None
        } else {
            Some(outcome.exit_code.unwrap_or(-1))
        };

        Ok(ExecutionResult {
            execution_id: state.id,
            combined_output: outcome.combined_output,
            exit_code,
            timed_out: outcome.timed_out,
            artifact_image: collected.primary,
            artifacts: collected.artifacts,
            install,
            warnings,
            output_truncated: outcome.output_truncated,
            duration_ms: state.elapsed_ms(),
        })
    }
}

fn error_label(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::InvalidInput => "invalid_input",
        ErrorKind::Resource => "resource",
        ErrorKind::Spawn => "spawn",
        ErrorKind::Install => "install",
        ErrorKind::Cancelled => "cancelled",
        ErrorKind::Internal => "internal",
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}
