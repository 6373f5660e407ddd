//! Runpad sandbox - ephemeral execution of generated projects
//!
//! A request carries a set of source files and an entry file. The
//! [`ExecutionCoordinator`] materializes the files into a fresh workspace,
//! installs declared dependencies, runs the entry file under a supervised
//! process group, harvests allow-listed artifacts and tears the workspace
//! down again, whatever happened along the way.

mod artifacts;
mod config;
mod coordinator;
mod environment;
mod error;
mod execution;
mod installer;
mod limits;
mod runtime;
mod supervisor;
mod types;
mod wire;
mod workspace;

pub use artifacts::{media_type_of, ArtifactCollector, CollectedArtifacts};
pub use config::{
    ArtifactConfig, InputLimits, InstallerConfig, InterpreterConfig, OutputConfig, SandboxConfig,
};
pub use coordinator::ExecutionCoordinator;
pub use environment::EnvironmentConfig;
pub use error::{Result, SandboxError};
pub use execution::{ExecutionId, ExecutionStage, ExecutionState};
pub use installer::{CommandInstaller, DependencyInstaller, Manifest};
pub use limits::ResourceLimits;
pub use runtime::{ProcessRuntime, RunOptions, Runtime};
pub use supervisor::{
    exit_code_of, CapturedOutput, CommandSpec, OutputPump, Supervised, SupervisedChild, WaitOutcome,
};
pub use types::{
    Artifact, ExecutionRequest, ExecutionResult, ExecutionStream, InstallPolicy, InstallReport,
    InstallStatus, OutputEvent, OutputSink, RunOutcome, SourceFile,
};
pub use workspace::{validate_filename, Workspace, WorkspaceManager};

pub use runpad_common::StreamKind;
