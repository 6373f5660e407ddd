//! Process-based runtime

use super::{RunOptions, Runtime};
use crate::config::{InterpreterConfig, OutputConfig, SandboxConfig};
use crate::environment::EnvironmentConfig;
use crate::error::SandboxError;
use crate::limits::ResourceLimits;
use crate::supervisor::{CommandSpec, OutputPump, SupervisedChild, WaitOutcome};
use crate::types::{OutputSink, RunOutcome};
use crate::workspace::Workspace;
use crate::Result;
use async_trait::async_trait;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Process-based runtime - runs the entry file with the configured interpreter
#[derive(Debug, Clone)]
pub struct ProcessRuntime {
    interpreter: InterpreterConfig,
    limits: ResourceLimits,
    environment: EnvironmentConfig,
    output: OutputConfig,
}

impl ProcessRuntime {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            limits: config.limits.clone(),
            environment: config.environment.clone(),
            output: config.output.clone(),
        }
    }

    /// Same runtime with a different interpreter
    pub fn with_interpreter(mut self, program: impl Into<String>, args: Vec<String>) -> Self {
        self.interpreter = InterpreterConfig {
            program: program.into(),
            args,
        };
        self
    }
}

impl Default for ProcessRuntime {
    fn default() -> Self {
        Self::new(&SandboxConfig::default())
    }
}

#[async_trait]
impl Runtime for ProcessRuntime {
    async fn run(
        &self,
        workspace: &Workspace,
        entry: &Path,
        options: &RunOptions,
        sink: Option<OutputSink>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        let mut args = self.interpreter.args.clone();
        args.push(entry.to_string_lossy().into_owned());

        let spec = CommandSpec {
            program: self.interpreter.program.clone(),
            args,
            cwd: workspace.path().to_path_buf(),
            env: self
                .environment
                .build(workspace.path(), options.python_path.as_deref()),
            limits: self.limits.clone(),
        };
        debug!(
            execution_id = %workspace.id(),
            program = %spec.program,
            entry = %entry.display(),
            timeout_ms = options.timeout.as_millis() as u64,
            "Starting entry file"
        );

        let pump = OutputPump::program(&self.output.stderr_prefix, self.output.max_output_bytes)
            .with_sink(sink);
        let child = SupervisedChild::spawn(spec, pump)?;
        let pid = child.pid();

        let done = child
            .supervise(
                options.timeout,
                self.limits.grace_period,
                self.output.drain_timeout,
                cancel,
            )
            .await?;

        let timed_out = match done.outcome {
            WaitOutcome::Cancelled => return Err(SandboxError::Cancelled),
            WaitOutcome::TimedOut => {
                metrics::counter!("runpad_timeouts_total", "stage" => "run").increment(1);
                true
            }
            WaitOutcome::Exited(_) => false,
        };

        info!(
            execution_id = %workspace.id(),
            pid = ?pid,
            exit_code = ?done.exit_code,
            timed_out,
            duration_ms = done.duration_ms,
            "Entry file finished"
        );

        Ok(RunOutcome {
            combined_output: done.output.combined,
            stdout: done.output.stdout,
            stderr: done.output.stderr,
            exit_code: done.exit_code,
            timed_out,
            output_truncated: done.output.truncated,
            duration_ms: done.duration_ms,
        })
    }

    fn name(&self) -> &str {
        "process"
    }
}
