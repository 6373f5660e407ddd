//! End-to-end tests for the HTTP service
//!
//! A real service is started on an ephemeral port and driven with reqwest,
//! the way a client of `POST /run` and `POST /run/stream` would.

#![cfg(unix)]

use anyhow::Result;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use runpad_common::{
    decode_artifact, ErrorKind, ErrorResponse, FileEntry, RunRequest, RunResponse, StreamEvent,
    StreamKind,
};
use runpad_tests::{leftover_workspaces, setup_test_logging, shell_config, TestServer};
use serde_json::json;
use std::time::Duration;
use tempfile::tempdir;

fn shell_run(script: &str) -> RunRequest {
    RunRequest::new(vec![FileEntry::new("main.sh", script)]).with_entry("main.sh")
}

#[tokio::test]
async fn health_reports_runtime() -> Result<()> {
    setup_test_logging();
    let root = tempdir()?;
    let server = TestServer::start(shell_config(root.path()), 2).await?;

    let body: serde_json::Value = reqwest::get(server.url("/health")).await?.json().await?;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["active_runs"], 0);
    assert!(body["runtime"].is_string());

    server.stop().await
}

#[tokio::test]
async fn run_returns_output_and_image() -> Result<()> {
    let root = tempdir()?;
    let server = TestServer::start(shell_config(root.path()), 2).await?;
    let client = reqwest::Client::new();

    let script = "echo plotting\nsleep 0.1\necho careful >&2\nprintf 'PNGDATA' > plot.png\n";
    let response = client
        .post(server.url("/run"))
        .json(&shell_run(script))
        .send()
        .await?;
    assert_eq!(response.status(), 200);

    let body: RunResponse = response.json().await?;
    assert_eq!(body.output, "plotting\n❌ careful\n");
    assert_eq!(body.exit_code, Some(0));
    assert!(!body.timed_out);
    assert!(body.success());
    let image = decode_artifact(body.image.as_deref().unwrap_or_default())?;
    assert_eq!(image, b"PNGDATA");
    assert_eq!(leftover_workspaces(root.path()), 0);

    server.stop().await
}

#[tokio::test]
async fn run_without_image_has_null_image() -> Result<()> {
    let root = tempdir()?;
    let server = TestServer::start(shell_config(root.path()), 2).await?;

    let body: serde_json::Value = reqwest::Client::new()
        .post(server.url("/run"))
        .json(&shell_run("echo plain\nexit 2\n"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(body["output"], "plain\n");
    assert_eq!(body["exit_code"], 2);
    assert!(body["image"].is_null());

    server.stop().await
}

#[tokio::test]
async fn timeout_is_reported_not_failed() -> Result<()> {
    let root = tempdir()?;
    let server = TestServer::start(shell_config(root.path()), 2).await?;

    let request = shell_run("echo waiting\nsleep 30\n").with_timeout(1);
    let response = reqwest::Client::new()
        .post(server.url("/run"))
        .json(&request)
        .timeout(Duration::from_secs(15))
        .send()
        .await?;
    assert_eq!(response.status(), 200);

    let body: RunResponse = response.json().await?;
    assert!(body.timed_out);
    assert_eq!(body.exit_code, None);
    assert!(body.output.contains("waiting"));

    server.stop().await
}

#[tokio::test]
async fn traversal_is_a_bad_request() -> Result<()> {
    let root = tempdir()?;
    let server = TestServer::start(shell_config(root.path()), 2).await?;

    let request = RunRequest::new(vec![
        FileEntry::new("main.sh", "echo hi\n"),
        FileEntry::new("../../etc/evil", "x"),
    ])
    .with_entry("main.sh");
    let response = reqwest::Client::new()
        .post(server.url("/run"))
        .json(&request)
        .send()
        .await?;
    assert_eq!(response.status(), 400);

    let body: ErrorResponse = response.json().await?;
    assert_eq!(body.error.kind, ErrorKind::InvalidInput);
    assert_eq!(leftover_workspaces(root.path()), 0);

    server.stop().await
}

#[tokio::test]
async fn malformed_json_is_a_bad_request() -> Result<()> {
    let root = tempdir()?;
    let server = TestServer::start(shell_config(root.path()), 2).await?;
    let client = reqwest::Client::new();

    let response = client
        .post(server.url("/run"))
        .header("content-type", "application/json")
        .body("{\"files\": [")
        .send()
        .await?;
    assert_eq!(response.status(), 400);

    let response = client
        .post(server.url("/run"))
        .json(&json!({"entry": "main.py"}))
        .send()
        .await?;
    assert_eq!(response.status(), 400);
    let body: ErrorResponse = response.json().await?;
    assert_eq!(body.error.kind, ErrorKind::InvalidInput);

    server.stop().await
}

#[tokio::test]
async fn fail_fast_install_failure_is_unprocessable() -> Result<()> {
    let root = tempdir()?;
    let mut config = shell_config(root.path());
    config.installer.program = "/bin/sh".to_string();
    config.installer.args = vec!["-c".into(), "echo 'resolver failed' >&2; exit 1".into(), "pip".into()];
    let server = TestServer::start(config, 2).await?;

    let mut request = RunRequest::new(vec![
        FileEntry::new("main.sh", "echo never\n"),
        FileEntry::new("requirements.txt", "missing-package\n"),
    ])
    .with_entry("main.sh");
    request.fail_fast = Some(true);

    let response = reqwest::Client::new()
        .post(server.url("/run"))
        .json(&request)
        .send()
        .await?;
    assert_eq!(response.status(), 422);

    let body: ErrorResponse = response.json().await?;
    assert_eq!(body.error.kind, ErrorKind::Install);
    let install = body.error.install.expect("install summary");
    assert!(install.log.contains("resolver failed"));
    assert_eq!(leftover_workspaces(root.path()), 0);

    server.stop().await
}

#[tokio::test]
async fn missing_interpreter_is_a_server_error() -> Result<()> {
    let root = tempdir()?;
    let mut config = shell_config(root.path());
    config.interpreter.program = "/nonexistent/python".to_string();
    let server = TestServer::start(config, 2).await?;

    let response = reqwest::Client::new()
        .post(server.url("/run"))
        .json(&shell_run("echo hi\n"))
        .send()
        .await?;
    assert_eq!(response.status(), 500);
    let body: ErrorResponse = response.json().await?;
    assert_eq!(body.error.kind, ErrorKind::Spawn);

    server.stop().await
}

#[tokio::test]
async fn stream_emits_output_then_result() -> Result<()> {
    let root = tempdir()?;
    let server = TestServer::start(shell_config(root.path()), 2).await?;

    let response = reqwest::Client::new()
        .post(server.url("/run/stream"))
        .json(&shell_run("echo first\nsleep 0.1\necho second >&2\n"))
        .send()
        .await?;
    assert_eq!(response.status(), 200);

    let mut events = response.bytes_stream().eventsource();
    let mut outputs = Vec::new();
    let mut result = None;
    while let Some(event) = events.next().await {
        let event = event.map_err(|e| anyhow::anyhow!("bad SSE frame: {}", e))?;
        let payload: StreamEvent = serde_json::from_str(&event.data)?;
        assert_eq!(event.event, payload.name());
        match payload {
            StreamEvent::Output { stream, data } => outputs.push((stream, data)),
            StreamEvent::Result(body) => {
                result = Some(body);
                break;
            }
            StreamEvent::Error(body) => panic!("unexpected error event: {}", body.message),
        }
    }

    assert!(outputs.contains(&(StreamKind::Stdout, "first\n".to_string())));
    assert!(outputs.contains(&(StreamKind::Stderr, "second\n".to_string())));
    let result = result.expect("result event");
    assert_eq!(result.output, "first\n❌ second\n");
    assert_eq!(result.exit_code, Some(0));

    server.stop().await
}

#[tokio::test]
async fn stream_reports_invalid_input_as_error_event() -> Result<()> {
    let root = tempdir()?;
    let server = TestServer::start(shell_config(root.path()), 2).await?;

    let request = RunRequest::new(vec![FileEntry::new("helper.sh", "echo hi\n")]);
    let response = reqwest::Client::new()
        .post(server.url("/run/stream"))
        .json(&request)
        .send()
        .await?;
    assert_eq!(response.status(), 200);

    let mut events = response.bytes_stream().eventsource();
    let event = events
        .next()
        .await
        .expect("one event")
        .map_err(|e| anyhow::anyhow!("bad SSE frame: {}", e))?;
    assert_eq!(event.event, "error");
    let payload: StreamEvent = serde_json::from_str(&event.data)?;
    match payload {
        StreamEvent::Error(body) => assert_eq!(body.kind, ErrorKind::InvalidInput),
        other => panic!("expected error event, got {:?}", other),
    }

    server.stop().await
}

#[tokio::test]
async fn concurrent_requests_do_not_interfere() -> Result<()> {
    let root = tempdir()?;
    let server = TestServer::start(shell_config(root.path()), 4).await?;
    let client = reqwest::Client::new();

    let send = |marker: &'static str| {
        let client = client.clone();
        let url = server.url("/run");
        let request = shell_run(&format!(
            "echo {marker} > state\nsleep 0.2\ncat state\n",
            marker = marker
        ));
        async move {
            let body: RunResponse = client.post(url).json(&request).send().await?.json().await?;
            anyhow::Ok(body)
        }
    };

    let (a, b) = tokio::join!(send("alpha"), send("beta"));
    assert_eq!(a?.output, "alpha\n");
    assert_eq!(b?.output, "beta\n");
    assert_eq!(leftover_workspaces(root.path()), 0);

    server.stop().await
}
