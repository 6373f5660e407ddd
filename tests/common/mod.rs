//! Common test utilities shared across integration and E2E tests

pub mod test_server;

pub use test_server::*;

use runpad_sandbox::SandboxConfig;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

/// Setup logging for tests
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("runpad_sandbox=debug,runpad_cli=debug")
        .with_test_writer()
        .try_init();
}

/// Pipeline configuration that runs entry files with `/bin/sh`
///
/// Keeps the suites independent of a Python installation while still
/// exercising real process supervision.
pub fn shell_config(root: &Path) -> SandboxConfig {
    let mut config = SandboxConfig::with_workspace_root(root);
    config.interpreter.program = "/bin/sh".to_string();
    config.limits.grace_period = Duration::from_millis(500);
    config
}

/// Number of entries left under a workspace root
pub fn leftover_workspaces(root: &Path) -> usize {
    match std::fs::read_dir(root) {
        Ok(entries) => entries.count(),
        Err(_) => 0,
    }
}

/// Whether a `python3` interpreter is on PATH
pub fn python3_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}
