//! Dependency installation
//!
//! A project declares third-party packages in a requirements manifest at
//! the workspace root. The [`CommandInstaller`] hands that manifest to the
//! configured package manager, supervised like any other process: own
//! process group, cleared environment, installer limits and a hard deadline.

use crate::config::{InstallerConfig, OutputConfig};
use crate::environment::EnvironmentConfig;
use crate::error::{Result, SandboxError};
use crate::supervisor::{CommandSpec, OutputPump, SupervisedChild, WaitOutcome};
use crate::types::{InstallReport, InstallStatus, OutputSink};
use crate::workspace::Workspace;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A parsed requirements manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Path relative to the workspace root
    pub path: PathBuf,

    /// Package specifiers, one per non-comment line
    pub requirements: Vec<String>,

    /// Lines that are package manager options rather than specifiers
    pub options: Vec<String>,
}

impl Manifest {
    /// Parse manifest text
    ///
    /// Blank lines and `#` comments (whole-line or trailing) are ignored.
    pub fn parse(path: impl Into<PathBuf>, text: &str) -> Self {
        let mut requirements = Vec::new();
        let mut options = Vec::new();

        for line in text.lines() {
            let line = match line.find(" #").or_else(|| line.find("\t#")) {
                Some(index) => &line[..index],
                None => line,
            };
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.starts_with('-') {
                options.push(line.to_string());
            } else {
                requirements.push(line.to_string());
            }
        }

        Self {
            path: path.into(),
            requirements,
            options,
        }
    }

    /// Nothing to install
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty() && self.options.is_empty()
    }

    /// Messages about lines that are handed to the package manager verbatim
    pub fn warnings(&self) -> Vec<String> {
        self.options
            .iter()
            .map(|option| {
                format!(
                    "{} contains package manager option `{}`",
                    self.path.display(),
                    option
                )
            })
            .collect()
    }
}

/// Installs the dependencies a workspace declares
#[async_trait]
pub trait DependencyInstaller: Send + Sync {
    /// Locate and parse the manifest; None when the project declares none
    async fn detect_manifest(&self, workspace: &Workspace) -> Result<Option<Manifest>>;

    /// Install everything `manifest` declares into the workspace
    ///
    /// Install failures are reported, not returned: only cancellation and
    /// platform problems are errors.
    async fn install(
        &self,
        workspace: &Workspace,
        manifest: &Manifest,
        sink: Option<OutputSink>,
        cancel: &CancellationToken,
    ) -> Result<InstallReport>;

    /// Directory the run must import packages from, if any
    fn site_dir(&self, workspace: &Workspace) -> Option<PathBuf>;

    /// Installer name
    fn name(&self) -> &str;
}

/// Runs the configured package manager as a supervised process
#[derive(Debug, Clone)]
pub struct CommandInstaller {
    config: InstallerConfig,
    environment: EnvironmentConfig,
    output: OutputConfig,
}

impl CommandInstaller {
    pub fn new(config: InstallerConfig, environment: EnvironmentConfig, output: OutputConfig) -> Self {
        Self {
            config,
            environment,
            output,
        }
    }

    fn command_args(&self, workspace: &Workspace, manifest: &Manifest) -> Vec<String> {
        let mut args = self.config.args.clone();
        if let Some(target) = self.site_dir(workspace) {
            args.push("--target".to_string());
            args.push(target.to_string_lossy().into_owned());
        }
        args.push("-r".to_string());
        args.push(manifest.path.to_string_lossy().into_owned());
        args
    }
}

#[async_trait]
impl DependencyInstaller for CommandInstaller {
    async fn detect_manifest(&self, workspace: &Workspace) -> Result<Option<Manifest>> {
        let path = workspace.join(&self.config.manifest);
        let metadata = match tokio::fs::symlink_metadata(&path).await {
            Ok(metadata) => metadata,
            Err(_) => return Ok(None),
        };
        if !metadata.is_file() {
            debug!(path = %path.display(), "Manifest is not a regular file, ignoring");
            return Ok(None);
        }

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| SandboxError::resource("Failed to read requirements manifest", e))?;
        let manifest = Manifest::parse(&self.config.manifest, &String::from_utf8_lossy(&bytes));
        debug!(
            execution_id = %workspace.id(),
            requirements = manifest.requirements.len(),
            "Manifest detected"
        );
        Ok(Some(manifest))
    }

    async fn install(
        &self,
        workspace: &Workspace,
        manifest: &Manifest,
        sink: Option<OutputSink>,
        cancel: &CancellationToken,
    ) -> Result<InstallReport> {
        let started = Instant::now();
        if manifest.is_empty() {
            return Ok(InstallReport {
                status: InstallStatus::Skipped,
                log: String::new(),
                duration_ms: 0,
            });
        }

        let spec = CommandSpec {
            program: self.config.program.clone(),
            args: self.command_args(workspace, manifest),
            cwd: workspace.path().to_path_buf(),
            env: self.environment.build(workspace.path(), None),
            limits: self.config.limits.clone(),
        };
        info!(
            execution_id = %workspace.id(),
            program = %spec.program,
            packages = manifest.requirements.len(),
            "Installing dependencies"
        );

        let pump = OutputPump::installer(self.output.max_output_bytes).with_sink(sink);
        let child = match SupervisedChild::spawn(spec, pump) {
            Ok(child) => child,
            Err(SandboxError::Spawn { program, source }) => {
                warn!(execution_id = %workspace.id(), %program, error = %source, "Package manager could not be started");
                return Ok(InstallReport {
                    status: InstallStatus::SpawnFailed,
                    log: format!("failed to start `{}`: {}", program, source),
                    duration_ms: started.elapsed().as_millis() as u64,
                });
            }
            Err(e) => return Err(e),
        };

        let limits = &self.config.limits;
        let done = child
            .supervise(
                limits.timeout,
                limits.grace_period,
                self.output.drain_timeout,
                cancel,
            )
            .await?;

        let status = match done.outcome {
            WaitOutcome::Cancelled => return Err(SandboxError::Cancelled),
            WaitOutcome::TimedOut => {
                metrics::counter!("runpad_timeouts_total", "stage" => "install").increment(1);
                InstallStatus::TimedOut
            }
            WaitOutcome::Exited(_) if done.exit_code == Some(0) => InstallStatus::Succeeded,
            WaitOutcome::Exited(_) => InstallStatus::Failed {
                exit_code: done.exit_code,
            },
        };

        if status.is_success() {
            info!(execution_id = %workspace.id(), duration_ms = done.duration_ms, "Dependencies installed");
        } else {
            warn!(execution_id = %workspace.id(), %status, "Dependency installation did not succeed");
        }

        Ok(InstallReport {
            status,
            log: done.output.combined,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn site_dir(&self, workspace: &Workspace) -> Option<PathBuf> {
        self.config
            .target_dir
            .as_deref()
            .filter(|dir| !dir.is_empty())
            .map(|dir| workspace.join(Path::new(dir)))
    }

    fn name(&self) -> &str {
        &self.config.program
    }
}
