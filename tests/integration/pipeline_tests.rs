//! Integration tests for the execution pipeline
//!
//! These drive [`ExecutionCoordinator`] end to end with real processes:
//! workspace provisioning, supervised runs, output capture, artifact
//! harvesting and teardown.

#![cfg(unix)]

use assert_matches::assert_matches;
use async_trait::async_trait;
use runpad_sandbox::{
    CommandInstaller, ExecutionCoordinator, ExecutionRequest, InstallPolicy, InstallStatus,
    OutputSink, RunOptions, RunOutcome, Runtime, SandboxConfig, SandboxError, StreamKind,
    Workspace,
};
use runpad_tests::{leftover_workspaces, python3_available, setup_test_logging, shell_config};
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

/// Bytes written by the artifact test: a PNG signature plus high bytes
const IMAGE_BYTES: &[u8] = &[0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n', 0xff, 0x01, 0x7f];

fn shell_coordinator(root: &Path) -> ExecutionCoordinator {
    ExecutionCoordinator::new(shell_config(root))
}

fn shell_request(script: &str) -> ExecutionRequest {
    ExecutionRequest::new(Vec::new())
        .with_file("main.sh", script)
        .with_entry("main.sh")
}

#[tokio::test]
async fn hello_world_runs_and_cleans_up() {
    setup_test_logging();
    let root = tempdir().unwrap();
    let coordinator = shell_coordinator(root.path());

    let result = coordinator
        .execute(shell_request("echo hello world\n"))
        .await
        .unwrap();

    assert_eq!(result.combined_output, "hello world\n");
    assert_eq!(result.exit_code, Some(0));
    assert!(!result.timed_out);
    assert!(result.artifact_image.is_none());
    assert!(result.success());
    assert_eq!(leftover_workspaces(root.path()), 0);
}

#[tokio::test]
async fn stderr_lines_are_prefixed_in_order() {
    let root = tempdir().unwrap();
    let coordinator = shell_coordinator(root.path());

    // Pauses keep the two pipes from racing each other.
    let script = "echo one\nsleep 0.1\necho two >&2\nsleep 0.1\necho three\nsleep 0.1\nprintf 'a\\nb\\n' >&2\nexit 3\n";
    let result = coordinator.execute(shell_request(script)).await.unwrap();

    assert_eq!(result.exit_code, Some(3));
    assert_eq!(
        result.combined_output,
        "one\n❌ two\nthree\n❌ a\n❌ b\n"
    );
    assert!(!result.success());
}

#[tokio::test]
async fn multi_file_project_uses_relative_layout() {
    let root = tempdir().unwrap();
    let coordinator = shell_coordinator(root.path());

    let request = ExecutionRequest::new(Vec::new())
        .with_file("lib/greeting.txt", "from a subdirectory")
        .with_file("main.sh", "cat lib/greeting.txt\necho\npwd | grep -c run-\n")
        .with_entry("main.sh");

    let result = coordinator.execute(request).await.unwrap();
    assert_eq!(result.combined_output, "from a subdirectory\n1\n");
    assert_eq!(leftover_workspaces(root.path()), 0);
}

#[tokio::test]
async fn timeout_kills_the_process_tree() {
    setup_test_logging();
    let root = tempdir().unwrap();
    let coordinator = shell_coordinator(root.path());

    // The background sleep shares the process group and must die too.
    let script = "echo started\nsleep 30 &\nsleep 30\necho unreachable\n";
    let started = Instant::now();
    let result = coordinator
        .execute(shell_request(script).with_timeout(Duration::from_secs(1)))
        .await
        .unwrap();

    assert!(result.timed_out);
    assert_eq!(result.exit_code, None);
    assert!(result.combined_output.contains("started"));
    assert!(!result.combined_output.contains("unreachable"));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(leftover_workspaces(root.path()), 0);
}

#[tokio::test]
async fn traversal_is_rejected_before_anything_is_written() {
    let root = tempdir().unwrap();
    let outside = root.path().join("escaped.txt");
    let coordinator = shell_coordinator(&root.path().join("workspaces"));

    for name in ["../escaped.txt", "/tmp/absolute.sh", "a/../../escaped.txt", ""] {
        let request = ExecutionRequest::new(Vec::new())
            .with_file("main.sh", "echo hi\n")
            .with_file(name, "owned");
        let err = coordinator.execute(request).await.unwrap_err();
        assert_matches!(err, SandboxError::InvalidInput(_), "accepted {:?}", name);
    }

    assert!(!outside.exists());
    assert_eq!(leftover_workspaces(&root.path().join("workspaces")), 0);
}

#[tokio::test]
async fn missing_entry_is_invalid_input() {
    let root = tempdir().unwrap();
    let coordinator = shell_coordinator(root.path());

    let request = ExecutionRequest::new(Vec::new()).with_file("helper.sh", "echo hi\n");
    let err = coordinator.execute(request).await.unwrap_err();
    assert_matches!(err, SandboxError::InvalidInput(_));
    assert!(err.is_client_error());
}

#[tokio::test]
async fn primary_image_is_returned_byte_for_byte() {
    let root = tempdir().unwrap();
    let coordinator = shell_coordinator(root.path());

    let script = "printf '\\211PNG\\r\\n\\032\\n\\377\\001\\177' > plot.png\necho drawn\n";
    let result = coordinator.execute(shell_request(script)).await.unwrap();

    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.artifact_image.as_deref(), Some(IMAGE_BYTES));
    assert_eq!(result.artifacts.len(), 1);
    assert_eq!(result.artifacts[0].name, "plot.png");
    assert_eq!(result.artifacts[0].media_type, "image/png");

    let response = result.to_response();
    let decoded = runpad_common::decode_artifact(response.image.as_deref().unwrap()).unwrap();
    assert_eq!(decoded, IMAGE_BYTES);
}

#[tokio::test]
async fn image_from_a_failed_run_is_still_collected() {
    let root = tempdir().unwrap();
    let coordinator = shell_coordinator(root.path());

    let script = "printf 'x' > plot.png\necho broke >&2\nexit 1\n";
    let result = coordinator.execute(shell_request(script)).await.unwrap();

    assert_eq!(result.exit_code, Some(1));
    assert_eq!(result.artifact_image.as_deref(), Some(&b"x"[..]));
    assert_eq!(result.combined_output, "❌ broke\n");
}

#[tokio::test]
async fn concurrent_runs_are_isolated() {
    let root = tempdir().unwrap();
    let coordinator = shell_coordinator(root.path());

    let first = shell_request("echo first > marker\nsleep 0.2\ncat marker\n");
    let second = shell_request("echo second > marker\nsleep 0.2\ncat marker\n");
    let (a, b) = tokio::join!(coordinator.execute(first), coordinator.execute(second));

    assert_eq!(a.unwrap().combined_output, "first\n");
    assert_eq!(b.unwrap().combined_output, "second\n");
    assert!(!root.path().join("marker").exists());
    assert_eq!(leftover_workspaces(root.path()), 0);
}

#[tokio::test]
async fn environment_is_scrubbed() {
    let root = tempdir().unwrap();
    let coordinator = shell_coordinator(root.path());

    let script = "echo \"home=$HOME\"\necho \"cargo=${CARGO_PKG_NAME:-unset}\"\necho \"mpl=$MPLBACKEND\"\n";
    let result = coordinator.execute(shell_request(script)).await.unwrap();

    assert!(result.combined_output.contains("cargo=unset"));
    assert!(result.combined_output.contains("mpl=Agg"));
    assert!(result.combined_output.contains("home=") && result.combined_output.contains("run-"));
}

#[tokio::test]
async fn streaming_delivers_output_before_the_result() {
    let root = tempdir().unwrap();
    let coordinator = shell_coordinator(root.path());

    let mut execution = coordinator.execute_streaming(shell_request("echo out\nsleep 0.1\necho err >&2\n"));
    let mut stdout = String::new();
    let mut stderr = String::new();
    while let Some(event) = execution.next_event().await {
        match event.stream {
            StreamKind::Stdout => stdout.push_str(&event.text()),
            StreamKind::Stderr => stderr.push_str(&event.text()),
            StreamKind::Install => {}
        }
    }
    let result = execution.finish().await.unwrap();

    assert_eq!(stdout, "out\n");
    assert_eq!(stderr, "err\n");
    assert_eq!(result.combined_output, "out\n❌ err\n");
}

#[tokio::test]
async fn dropping_a_stream_cancels_and_cleans_up() {
    let root = tempdir().unwrap();
    let coordinator = shell_coordinator(root.path());

    let mut execution = coordinator.execute_streaming(shell_request("echo ready\nsleep 30\n"));
    let first = execution.next_event().await.unwrap();
    assert_eq!(first.text(), "ready\n");
    drop(execution);

    let deadline = Instant::now() + Duration::from_secs(10);
    while (leftover_workspaces(root.path()) > 0 || coordinator.active_executions() > 0)
        && Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(leftover_workspaces(root.path()), 0);
    assert_eq!(coordinator.active_executions(), 0);
}

#[tokio::test]
async fn cancellation_token_aborts_the_run() {
    let root = tempdir().unwrap();
    let coordinator = shell_coordinator(root.path());

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = coordinator
        .execute_with_cancel(shell_request("sleep 30\n"), token)
        .await
        .unwrap_err();
    assert_matches!(err, SandboxError::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(leftover_workspaces(root.path()), 0);
}

#[tokio::test]
async fn missing_interpreter_is_a_spawn_error() {
    let root = tempdir().unwrap();
    let mut config = shell_config(root.path());
    config.interpreter.program = "/nonexistent/interpreter".to_string();
    let coordinator = ExecutionCoordinator::new(config);

    let err = coordinator
        .execute(shell_request("echo hi\n"))
        .await
        .unwrap_err();
    assert_matches!(err, SandboxError::Spawn { .. });
    assert_eq!(leftover_workspaces(root.path()), 0);
}

#[tokio::test]
async fn unusable_workspace_root_is_a_resource_error() {
    let dir = tempdir().unwrap();
    let blocker = dir.path().join("not-a-directory");
    std::fs::write(&blocker, "occupied").unwrap();
    let coordinator = shell_coordinator(&blocker);

    let err = coordinator
        .execute(shell_request("echo hi\n"))
        .await
        .unwrap_err();
    assert_matches!(err, SandboxError::Resource { .. });
    assert_eq!(err.kind().http_status(), 500);
    assert!(blocker.is_file());
    assert_eq!(leftover_workspaces(dir.path()), 1);
    assert_eq!(coordinator.active_executions(), 0);
}

#[tokio::test]
async fn failed_file_write_removes_the_partial_workspace() {
    let root = tempdir().unwrap();
    let mut config = shell_config(root.path());
    config.input.max_filename_len = 1024;
    let coordinator = ExecutionCoordinator::new(config);

    // Passes validation but exceeds the filesystem's name length.
    let oversized = format!("data/{}.txt", "n".repeat(400));
    let request = shell_request("echo never\n")
        .with_file("lib/helper.sh", "true\n")
        .with_file(oversized, "payload");
    let err = coordinator.execute(request).await.unwrap_err();

    assert_matches!(err, SandboxError::Resource { .. });
    assert_eq!(leftover_workspaces(root.path()), 0);
}

/// Runtime that fails after checking it was handed a live workspace
struct BrokenRuntime;

#[async_trait]
impl Runtime for BrokenRuntime {
    async fn run(
        &self,
        workspace: &Workspace,
        entry: &Path,
        _options: &RunOptions,
        _sink: Option<OutputSink>,
        _cancel: &CancellationToken,
    ) -> runpad_sandbox::Result<RunOutcome> {
        assert!(workspace.join(entry).is_file());
        Err(SandboxError::Internal("runtime exploded".to_string()))
    }

    fn name(&self) -> &str {
        "broken"
    }
}

#[tokio::test]
async fn workspace_is_removed_when_the_runtime_fails() {
    let root = tempdir().unwrap();
    let config = shell_config(root.path());
    let installer = CommandInstaller::new(
        config.installer.clone(),
        config.environment.clone(),
        config.output.clone(),
    );
    let coordinator = ExecutionCoordinator::with_components(config, BrokenRuntime, installer);

    let err = coordinator
        .execute(shell_request("echo hi\n"))
        .await
        .unwrap_err();
    assert_matches!(err, SandboxError::Internal(_));
    assert_eq!(leftover_workspaces(root.path()), 0);
    assert_eq!(coordinator.runtime_name(), "broken");
}

/// Installer configuration that runs a shell script in place of pip
fn scripted_installer(config: &mut SandboxConfig, script: &str) {
    config.installer.program = "/bin/sh".to_string();
    config.installer.args = vec!["-c".to_string(), script.to_string(), "pip".to_string()];
}

#[tokio::test]
async fn install_failure_is_best_effort_by_default() {
    let root = tempdir().unwrap();
    let mut config = shell_config(root.path());
    scripted_installer(&mut config, "echo resolving; echo 'no such package' >&2; exit 1");
    let coordinator = ExecutionCoordinator::new(config);

    let request = shell_request("echo still ran\n").with_file("requirements.txt", "nonexistent-pkg\n");
    let result = coordinator.execute(request).await.unwrap();

    let install = result.install.as_ref().unwrap();
    assert_matches!(install.status, InstallStatus::Failed { exit_code: Some(1) });
    assert!(install.log.contains("no such package"));
    assert_eq!(result.combined_output, "still ran\n");
    assert!(!result.warnings.is_empty());
}

#[tokio::test]
async fn install_failure_aborts_under_fail_fast() {
    let root = tempdir().unwrap();
    let mut config = shell_config(root.path());
    scripted_installer(&mut config, "exit 2");
    let coordinator = ExecutionCoordinator::new(config);

    let request = shell_request("echo must not run\n")
        .with_file("requirements.txt", "nonexistent-pkg\n")
        .with_install_policy(InstallPolicy::FailFast);
    let err = coordinator.execute(request).await.unwrap_err();

    assert_matches!(err, SandboxError::Install(_));
    assert_eq!(err.kind().http_status(), 422);
    assert_eq!(leftover_workspaces(root.path()), 0);
}

#[tokio::test]
async fn installed_packages_are_importable() {
    let root = tempdir().unwrap();
    let mut config = shell_config(root.path());
    // "$@" ends with: --target <dir> -r <manifest>
    scripted_installer(
        &mut config,
        "while [ $# -gt 0 ]; do if [ \"$1\" = --target ]; then mkdir -p \"$2\" && echo ok > \"$2/marker\"; fi; shift; done",
    );
    let coordinator = ExecutionCoordinator::new(config);

    let request = shell_request("cat \"${PYTHONPATH%%:*}/marker\"\n")
        .with_file("requirements.txt", "somepkg==1.0\n");
    let result = coordinator.execute(request).await.unwrap();

    assert_eq!(result.install.as_ref().unwrap().status, InstallStatus::Succeeded);
    assert_eq!(result.combined_output, "ok\n");
}

#[tokio::test]
async fn python_hello_world() {
    if !python3_available() {
        eprintln!("python3 not found, skipping");
        return;
    }
    let root = tempdir().unwrap();
    let coordinator = ExecutionCoordinator::new(SandboxConfig::with_workspace_root(root.path()));

    let request = ExecutionRequest::new(Vec::new())
        .with_file("main.py", "import sys\nprint('hello')\nprint('oops', file=sys.stderr)\n");
    let result = coordinator.execute(request).await.unwrap();

    assert_eq!(result.exit_code, Some(0));
    assert!(result.combined_output.contains("hello\n"));
    assert!(result.combined_output.contains("❌ oops\n"));
    assert_eq!(leftover_workspaces(root.path()), 0);
}

#[tokio::test]
async fn python_exception_exits_non_zero() {
    if !python3_available() {
        eprintln!("python3 not found, skipping");
        return;
    }
    let root = tempdir().unwrap();
    let coordinator = ExecutionCoordinator::new(SandboxConfig::with_workspace_root(root.path()));

    let request = ExecutionRequest::new(Vec::new())
        .with_file("main.py", "from helper import value\nprint(value)\nraise RuntimeError('boom')\n")
        .with_file("helper.py", "value = 41 + 1\n");
    let result = coordinator.execute(request).await.unwrap();

    assert_eq!(result.exit_code, Some(1));
    assert!(result.combined_output.starts_with("42\n"));
    assert!(result.combined_output.contains("❌ RuntimeError: boom"));
}
