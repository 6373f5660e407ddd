//! Pipeline configuration
//!
//! Every external program the pipeline starts, and every bound it enforces,
//! comes from here. All sections deserialize with defaults so a config file
//! only needs to name what it changes.

use crate::environment::EnvironmentConfig;
use crate::limits::ResourceLimits;
use crate::types::InstallPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Directory under which per-request workspaces are created
    pub workspace_root: PathBuf,

    /// Entry file used when a request does not name one
    pub default_entry: String,

    pub interpreter: InterpreterConfig,
    pub installer: InstallerConfig,

    /// Limits for the program run
    pub limits: ResourceLimits,

    pub environment: EnvironmentConfig,
    pub output: OutputConfig,
    pub artifacts: ArtifactConfig,
    pub input: InputLimits,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            workspace_root: std::env::temp_dir().join("runpad"),
            default_entry: "main.py".to_string(),
            interpreter: InterpreterConfig::default(),
            installer: InstallerConfig::default(),
            limits: ResourceLimits::default(),
            environment: EnvironmentConfig::default(),
            output: OutputConfig::default(),
            artifacts: ArtifactConfig::default(),
            input: InputLimits::default(),
        }
    }
}

impl SandboxConfig {
    /// Defaults with a different workspace root
    pub fn with_workspace_root(root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: root.into(),
            ..Self::default()
        }
    }
}

/// The program that runs the entry file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterConfig {
    /// Executable name (looked up on `PATH`) or absolute path
    pub program: String,

    /// Arguments placed before the entry file
    pub args: Vec<String>,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    /// Skip dependency installation entirely when false
    pub enabled: bool,

    /// Package manager executable
    pub program: String,

    /// Arguments placed before the target/manifest arguments
    pub args: Vec<String>,

    /// Manifest filename looked up in the workspace root
    pub manifest: String,

    /// Install into this workspace-relative directory instead of the
    /// interpreter's environment; added to `PYTHONPATH` for the run
    pub target_dir: Option<String>,

    pub policy: InstallPolicy,

    #[serde(default = "ResourceLimits::installer")]
    pub limits: ResourceLimits,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            program: "python3".to_string(),
            args: vec![
                "-m".to_string(),
                "pip".to_string(),
                "install".to_string(),
                "--disable-pip-version-check".to_string(),
                "--no-input".to_string(),
            ],
            manifest: "requirements.txt".to_string(),
            target_dir: Some(".packages".to_string()),
            policy: InstallPolicy::BestEffort,
            limits: ResourceLimits::installer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Marker placed at the start of every stderr line in combined output
    pub stderr_prefix: String,

    /// Cap on captured output per stream and for the combined stream
    pub max_output_bytes: usize,

    /// How long to wait for output pipes to close after the process exits
    #[serde(with = "humantime_serde")]
    pub drain_timeout: std::time::Duration,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            stderr_prefix: "❌ ".to_string(),
            max_output_bytes: 1024 * 1024,
            drain_timeout: std::time::Duration::from_secs(1),
        }
    }
}

/// Allow-list for files harvested after the run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    /// Image returned as the primary artifact
    pub primary: Option<String>,

    /// Additional fixed filenames at the workspace root
    pub names: Vec<String>,

    /// Extensions (without dot) matched at the workspace root
    pub extensions: Vec<String>,

    pub max_artifacts: usize,
    pub max_artifact_bytes: u64,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            primary: Some("plot.png".to_string()),
            names: Vec::new(),
            extensions: ["png", "jpg", "jpeg", "gif", "svg"]
                .into_iter()
                .map(String::from)
                .collect(),
            max_artifacts: 8,
            max_artifact_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Bounds on what a request may submit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputLimits {
    pub max_files: usize,
    pub max_total_bytes: usize,
    pub max_filename_len: usize,
}

impl Default for InputLimits {
    fn default() -> Self {
        Self {
            max_files: 64,
            max_total_bytes: 4 * 1024 * 1024,
            max_filename_len: 255,
        }
    }
}
