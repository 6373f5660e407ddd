//! Application configuration
//!
//! Loaded from `--config`, else `<config dir>/runpad/config.toml`, else
//! built-in defaults. `RUNPAD_*` environment variables override file values.

use anyhow::{bail, Context, Result};
use runpad_sandbox::{InstallPolicy, SandboxConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// HTTP service configuration
    pub server: ServerConfig,
    /// Log output configuration
    pub logging: LoggingConfig,
    /// Execution pipeline configuration
    pub sandbox: SandboxConfig,
}

/// HTTP service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the service listens on
    pub bind: String,
    /// Requests executed at the same time; others wait for a slot
    pub max_concurrent_runs: usize,
    /// Leftover workspaces older than this are removed at start-up
    #[serde(with = "humantime_serde")]
    pub stale_workspace_age: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:5000".to_string(),
            max_concurrent_runs: 4,
            stale_workspace_age: Duration::from_secs(3600),
        }
    }
}

/// Log output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when neither `RUST_LOG` nor `-v` is given
    pub level: String,
    /// Also write logs to this file
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl AppConfig {
    /// Load configuration, then apply environment overrides
    ///
    /// An explicit `path` must exist; the default location is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Read and parse a TOML config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Save configuration to `path`, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory {}", parent.display())
            })?;
        }
        std::fs::write(path, self.to_toml()?)
            .with_context(|| format!("Failed to write config {}", path.display()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Get the default configuration file path
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("runpad").join("config.toml"))
    }

    /// Apply `RUNPAD_*` overrides read through `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(bind) = lookup("RUNPAD_BIND") {
            self.server.bind = bind;
        }
        if let Some(value) = lookup("RUNPAD_MAX_CONCURRENT_RUNS") {
            self.server.max_concurrent_runs = value
                .parse()
                .with_context(|| format!("Invalid RUNPAD_MAX_CONCURRENT_RUNS: {}", value))?;
        }
        if let Some(root) = lookup("RUNPAD_WORKSPACE_ROOT") {
            self.sandbox.workspace_root = PathBuf::from(root);
        }
        if let Some(program) = lookup("RUNPAD_INTERPRETER") {
            self.sandbox.interpreter.program = program;
        }
        if let Some(program) = lookup("RUNPAD_PACKAGE_MANAGER") {
            self.sandbox.installer.program = program;
        }
        if let Some(value) = lookup("RUNPAD_TIMEOUT") {
            self.sandbox.limits.timeout = humantime_serde::re::humantime::parse_duration(&value)
                .with_context(|| format!("Invalid RUNPAD_TIMEOUT: {}", value))?;
        }
        if let Some(value) = lookup("RUNPAD_INSTALL_POLICY") {
            self.sandbox.installer.policy = parse_install_policy(&value)?;
        }
        if let Some(file) = lookup("RUNPAD_LOG_FILE") {
            self.logging.file = Some(PathBuf::from(file));
        }
        Ok(())
    }
}

fn parse_install_policy(value: &str) -> Result<InstallPolicy> {
    match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "best_effort" => Ok(InstallPolicy::BestEffort),
        "fail_fast" => Ok(InstallPolicy::FailFast),
        other => bail!(
            "Invalid install policy: {} (expected best_effort or fail_fast)",
            other
        ),
    }
}
