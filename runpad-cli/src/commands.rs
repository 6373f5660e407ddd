//! CLI command implementations
//!
//! `run` executes a project directory on this machine through the same
//! pipeline the service uses; `config` inspects and initialises the
//! configuration file.

use crate::config::AppConfig;
use anyhow::{bail, Context, Result};
use runpad_sandbox::{
    ExecutionCoordinator, ExecutionRequest, ExecutionResult, InstallPolicy, SourceFile, StreamKind,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Exit status reported when the program ran past its deadline
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Directories never uploaded from a local project
const SKIPPED_DIRS: &[&str] = &[".git", ".packages", "__pycache__", ".venv", "venv", "node_modules"];

/// Options for a local run
#[derive(Debug, Clone)]
pub struct LocalRun {
    pub dir: PathBuf,
    pub entry: Option<String>,
    pub timeout: Option<Duration>,
    pub image_out: Option<PathBuf>,
    pub json: bool,
    pub fail_fast: bool,
}

/// Collect the project files under `dir` as workspace-relative sources
///
/// Hidden files, non-UTF-8 files and well-known tool directories are skipped.
pub async fn collect_project(dir: &Path) -> Result<Vec<SourceFile>> {
    let metadata = tokio::fs::metadata(dir)
        .await
        .with_context(|| format!("Cannot read project directory {}", dir.display()))?;
    if !metadata.is_dir() {
        bail!("{} is not a directory", dir.display());
    }

    let mut files = Vec::new();
    let mut pending = vec![PathBuf::new()];
    while let Some(relative) = pending.pop() {
        let mut entries = tokio::fs::read_dir(dir.join(&relative))
            .await
            .with_context(|| format!("Failed to list {}", dir.join(&relative).display()))?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let file_type = entry.file_type().await?;
            let path = relative.join(&name);
            if file_type.is_dir() {
                if !SKIPPED_DIRS.contains(&name.as_str()) {
                    pending.push(path);
                }
            } else if file_type.is_file() {
                let bytes = tokio::fs::read(entry.path())
                    .await
                    .with_context(|| format!("Failed to read {}", entry.path().display()))?;
                match String::from_utf8(bytes) {
                    Ok(content) => files.push(SourceFile::new(to_wire_name(&path), content)),
                    Err(_) => debug!(file = %path.display(), "Skipping non-UTF-8 file"),
                }
            }
        }
    }

    files.sort_by(|a, b| a.filename.cmp(&b.filename));
    Ok(files)
}

fn to_wire_name(path: &Path) -> String {
    path.components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Execute a local project, streaming its output to this terminal
///
/// Returns the process exit status the CLI should exit with.
pub async fn run_project(config: &AppConfig, options: LocalRun) -> Result<i32> {
    let files = collect_project(&options.dir).await?;
    info!(
        dir = %options.dir.display(),
        files = files.len(),
        "Running local project"
    );

    let mut request = ExecutionRequest::new(files);
    if let Some(entry) = &options.entry {
        request = request.with_entry(entry.clone());
    }
    if let Some(timeout) = options.timeout {
        request = request.with_timeout(timeout);
    }
    if options.fail_fast {
        request = request.with_install_policy(InstallPolicy::FailFast);
    }

    let coordinator = ExecutionCoordinator::new(config.sandbox.clone());
    let mut execution = coordinator.execute_streaming(request);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;
    loop {
        tokio::select! {
            event = execution.next_event() => match event {
                Some(event) if !options.json => print_event(event.stream, &event.text()),
                Some(_) => {}
                None => break,
            },
            _ = &mut ctrl_c => {
                interrupted = true;
                break;
            }
        }
    }
    if interrupted {
        drop(execution);
        bail!("Interrupted");
    }

    let result = execution.finish().await?;

    if let Some(path) = &options.image_out {
        write_image(&result, path).await?;
    }

    if options.json {
        let body = serde_json::to_string_pretty(&result.to_response())?;
        println!("{}", body);
    } else {
        print_summary(&result);
    }

    Ok(match result.exit_code {
        Some(code) => code,
        None => TIMEOUT_EXIT_CODE,
    })
}

fn print_event(stream: StreamKind, text: &str) {
    match stream {
        StreamKind::Stdout => {
            print!("{}", text);
            let _ = std::io::stdout().flush();
        }
        StreamKind::Stderr => eprint!("{}", text),
        StreamKind::Install => {
            for line in text.lines() {
                eprintln!("[install] {}", line);
            }
        }
    }
}

fn print_summary(result: &ExecutionResult) {
    for warning in &result.warnings {
        eprintln!("warning: {}", warning);
    }
    if result.output_truncated {
        eprintln!("warning: output was truncated");
    }
    if !result.artifacts.is_empty() {
        let names: Vec<&str> = result.artifacts.iter().map(|a| a.name.as_str()).collect();
        eprintln!("artifacts: {}", names.join(", "));
    }
    match result.exit_code {
        Some(code) => eprintln!("exit code {} in {}ms", code, result.duration_ms),
        None => eprintln!("timed out after {}ms", result.duration_ms),
    }
}

async fn write_image(result: &ExecutionResult, path: &Path) -> Result<()> {
    match &result.artifact_image {
        Some(bytes) => {
            tokio::fs::write(path, bytes)
                .await
                .with_context(|| format!("Failed to write image to {}", path.display()))?;
            info!(path = %path.display(), bytes = bytes.len(), "Image written");
        }
        None => warn!("The program did not produce an image"),
    }
    Ok(())
}

/// Resolve the config file the `config` subcommands operate on
pub fn config_file(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => AppConfig::default_path().context("Cannot determine the configuration directory"),
    }
}

/// Print the effective configuration as TOML
pub fn show_config(config: &AppConfig) -> Result<()> {
    print!("{}", config.to_toml()?);
    Ok(())
}

/// Write a default configuration file
pub fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    AppConfig::default().save(path)?;
    println!("Wrote {}", path.display());
    Ok(())
}
