//! Structured supervision of one child process tree
//!
//! A [`SupervisedChild`] is spawned as the leader of its own process group
//! with a cleared environment, piped stdout/stderr and rlimits installed
//! before exec. Two reader tasks feed a single aggregator which owns the
//! captured output. Whatever path ends the supervision (exit, deadline,
//! cancellation, drop) the whole group is killed.

use crate::error::{Result, SandboxError};
use crate::limits::ResourceLimits;
use crate::types::{OutputEvent, OutputSink};
use runpad_common::StreamKind;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Longest chunk a reader forwards at once; longer lines are split
const READ_CHUNK: u64 = 8192;

/// Everything needed to start a supervised process
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub limits: ResourceLimits,
}

/// How captured output is labelled, marked, bounded and forwarded
#[derive(Debug, Clone)]
pub struct OutputPump {
    stdout_kind: StreamKind,
    stderr_kind: StreamKind,
    stderr_prefix: Option<String>,
    max_bytes: usize,
    sink: Option<OutputSink>,
}

impl OutputPump {
    /// Output of the user's program: stderr lines carry `stderr_prefix`
    pub fn program(stderr_prefix: impl Into<String>, max_bytes: usize) -> Self {
        let prefix = stderr_prefix.into();
        Self {
            stdout_kind: StreamKind::Stdout,
            stderr_kind: StreamKind::Stderr,
            stderr_prefix: (!prefix.is_empty()).then_some(prefix),
            max_bytes,
            sink: None,
        }
    }

    /// Output of the package manager, both streams unmarked
    pub fn installer(max_bytes: usize) -> Self {
        Self {
            stdout_kind: StreamKind::Install,
            stderr_kind: StreamKind::Install,
            stderr_prefix: None,
            max_bytes,
            sink: None,
        }
    }

    /// Forward every accepted chunk to `sink` as it arrives
    pub fn with_sink(mut self, sink: Option<OutputSink>) -> Self {
        self.sink = sink;
        self
    }
}

/// Output retained after a supervised process finished
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    /// Both streams in arrival order, stderr lines marked
    pub combined: String,
    pub stdout: String,
    pub stderr: String,
    /// Output was dropped after the byte cap was reached
    pub truncated: bool,
}

/// How waiting on a child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

/// A supervised run that has fully finished
#[derive(Debug)]
pub struct Supervised {
    pub outcome: WaitOutcome,
    /// Exit code when the process exited on its own
    pub exit_code: Option<i32>,
    pub output: CapturedOutput,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pipe {
    Stdout,
    Stderr,
}

/// A child process leading its own process group
pub struct SupervisedChild {
    child: Child,
    program: String,
    pgid: Option<i32>,
    started: Instant,
    readers: Vec<JoinHandle<()>>,
    aggregator: Option<JoinHandle<CapturedOutput>>,
    stop_aggregator: CancellationToken,
    group_killed: bool,
}

impl SupervisedChild {
    /// Spawn `spec` and start capturing its output
    pub fn spawn(spec: CommandSpec, pump: OutputPump) -> Result<Self> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .env_clear()
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            command.process_group(0);
            let rlimits = spec.limits.rlimits();
            // SAFETY: the closure only issues getrlimit/setrlimit syscalls,
            // which are async-signal-safe, and allocates nothing.
            unsafe {
                command.pre_exec(move || {
                    use nix::sys::resource::{getrlimit, setrlimit};
                    for (resource, value) in &rlimits {
                        let (_, hard) = getrlimit(*resource)?;
                        let value = (*value).min(hard);
                        setrlimit(*resource, value, value)?;
                    }
                    Ok(())
                });
            }
        }

        let mut child = command.spawn().map_err(|source| SandboxError::Spawn {
            program: spec.program.clone(),
            source,
        })?;
        let pgid = child.id().map(|pid| pid as i32);
        debug!(program = %spec.program, pid = ?pgid, "Spawned supervised process");

        let (tx, rx) = mpsc::unbounded_channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(read_pipe(stdout, Pipe::Stdout, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(read_pipe(stderr, Pipe::Stderr, tx.clone())));
        }
        drop(tx);

        let stop_aggregator = CancellationToken::new();
        let aggregator = tokio::spawn(aggregate(rx, pump, stop_aggregator.clone()));

        Ok(Self {
            child,
            program: spec.program,
            pgid,
            started: Instant::now(),
            readers,
            aggregator: Some(aggregator),
            stop_aggregator,
            group_killed: false,
        })
    }

    pub fn pid(&self) -> Option<i32> {
        self.pgid
    }

    /// Wait for exit, the deadline or cancellation, whichever comes first
    pub async fn wait(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome> {
        tokio::select! {
            status = self.child.wait() => {
                let status = status.map_err(|e| {
                    SandboxError::resource(format!("Failed to wait for `{}`", self.program), e)
                })?;
                Ok(WaitOutcome::Exited(status))
            }
            _ = tokio::time::sleep(timeout) => Ok(WaitOutcome::TimedOut),
            _ = cancel.cancelled() => Ok(WaitOutcome::Cancelled),
        }
    }

    /// SIGTERM the group, give it `grace` to exit, then SIGKILL it
    pub async fn terminate_tree(&mut self, grace: Duration) -> Option<ExitStatus> {
        #[cfg(unix)]
        self.signal_group(nix::sys::signal::Signal::SIGTERM);
        #[cfg(not(unix))]
        let _ = self.child.start_kill();

        let status = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            _ => {
                debug!(pid = ?self.pgid, "Grace period elapsed, killing process group");
                self.kill_group();
                let _ = self.child.start_kill();
                self.child.wait().await.ok()
            }
        };
        self.kill_group();
        status
    }

    /// SIGKILL every process left in the group
    pub fn kill_group(&mut self) {
        #[cfg(unix)]
        self.signal_group(nix::sys::signal::Signal::SIGKILL);
        self.group_killed = true;
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: nix::sys::signal::Signal) {
        use nix::errno::Errno;
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        let Some(pgid) = self.pgid else {
            return;
        };
        match killpg(Pid::from_raw(pgid), signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(pgid, signal = ?signal, error = %e, "Failed to signal process group"),
        }
    }

    /// Stop capturing and return the output
    ///
    /// Descendants that escaped the group can keep the pipes open, so the
    /// readers get at most `drain` to reach end of file.
    pub async fn finish(mut self, drain: Duration) -> Result<CapturedOutput> {
        let Some(mut aggregator) = self.aggregator.take() else {
            return Err(SandboxError::Internal("output already collected".into()));
        };
        let joined = match tokio::time::timeout(drain, &mut aggregator).await {
            Ok(joined) => joined,
            Err(_) => {
                debug!(pid = ?self.pgid, "Output pipes still open after drain timeout");
                self.stop_aggregator.cancel();
                aggregator.await
            }
        };
        for reader in &self.readers {
            reader.abort();
        }
        joined.map_err(|e| SandboxError::Internal(format!("output aggregator failed: {}", e)))
    }

    /// Wait under `timeout`, terminate the tree when it runs over or the
    /// caller cancels, then collect the output
    pub async fn supervise(
        mut self,
        timeout: Duration,
        grace: Duration,
        drain: Duration,
        cancel: &CancellationToken,
    ) -> Result<Supervised> {
        let outcome = self.wait(timeout, cancel).await?;
        let exit_code = match outcome {
            WaitOutcome::Exited(status) => {
                self.kill_group();
                Some(exit_code_of(status))
            }
            WaitOutcome::TimedOut => {
                info!(
                    program = %self.program,
                    pid = ?self.pgid,
                    timeout_ms = timeout.as_millis() as u64,
                    "Process exceeded its deadline, terminating"
                );
                self.terminate_tree(grace).await;
                None
            }
            WaitOutcome::Cancelled => {
                debug!(program = %self.program, pid = ?self.pgid, "Cancelled, terminating");
                self.terminate_tree(grace).await;
                None
            }
        };
        let started = self.started;
        let output = self.finish(drain).await?;
        Ok(Supervised {
            outcome,
            exit_code,
            output,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

impl Drop for SupervisedChild {
    fn drop(&mut self) {
        if !self.group_killed {
            self.kill_group();
        }
        for reader in &self.readers {
            reader.abort();
        }
        if let Some(aggregator) = &self.aggregator {
            aggregator.abort();
        }
    }
}

/// Exit code of a finished process; signal deaths map to `128 + signal`
pub fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

async fn read_pipe<R>(pipe: R, kind: Pipe, tx: mpsc::UnboundedSender<(Pipe, Vec<u8>)>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    loop {
        let mut chunk = Vec::new();
        match (&mut reader)
            .take(READ_CHUNK)
            .read_until(b'\n', &mut chunk)
            .await
        {
            Ok(0) => break,
            Ok(_) => {
                if tx.send((kind, chunk)).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(pipe = ?kind, error = %e, "Pipe read failed");
                break;
            }
        }
    }
}

async fn aggregate(
    mut rx: mpsc::UnboundedReceiver<(Pipe, Vec<u8>)>,
    pump: OutputPump,
    stop: CancellationToken,
) -> CapturedOutput {
    let mut aggregator = Aggregator::new(pump);
    loop {
        tokio::select! {
            chunk = rx.recv() => match chunk {
                Some((pipe, data)) => aggregator.push(pipe, &data),
                None => break,
            },
            _ = stop.cancelled() => {
                while let Ok((pipe, data)) = rx.try_recv() {
                    aggregator.push(pipe, &data);
                }
                break;
            }
        }
    }
    aggregator.finish()
}

struct Aggregator {
    pump: OutputPump,
    captured: CapturedOutput,
    stderr_at_line_start: bool,
    /// Bytes of a UTF-8 sequence cut at a chunk edge, per pipe
    stdout_partial: Vec<u8>,
    stderr_partial: Vec<u8>,
}

impl Aggregator {
    fn new(pump: OutputPump) -> Self {
        Self {
            pump,
            captured: CapturedOutput::default(),
            stderr_at_line_start: true,
            stdout_partial: Vec::new(),
            stderr_partial: Vec::new(),
        }
    }

    /// Accept raw bytes from `pipe`
    ///
    /// A multi-byte character split across reads is held back until the
    /// rest of it arrives.
    fn push(&mut self, pipe: Pipe, data: &[u8]) {
        let partial = match pipe {
            Pipe::Stdout => &mut self.stdout_partial,
            Pipe::Stderr => &mut self.stderr_partial,
        };
        let mut bytes = std::mem::take(partial);
        bytes.extend_from_slice(data);
        let split = bytes.len() - incomplete_utf8_suffix(&bytes);
        *partial = bytes.split_off(split);
        if !bytes.is_empty() {
            self.push_text(pipe, &String::from_utf8_lossy(&bytes));
        }
    }

    /// Decode whatever is still held back and return the capture
    fn finish(mut self) -> CapturedOutput {
        for pipe in [Pipe::Stdout, Pipe::Stderr] {
            let partial = match pipe {
                Pipe::Stdout => std::mem::take(&mut self.stdout_partial),
                Pipe::Stderr => std::mem::take(&mut self.stderr_partial),
            };
            if !partial.is_empty() {
                self.push_text(pipe, &String::from_utf8_lossy(&partial));
            }
        }
        self.captured
    }

    fn push_text(&mut self, pipe: Pipe, text: &str) {
        if self.captured.truncated || text.is_empty() {
            return;
        }
        // An unfinished marked stderr line must not absorb stdout text.
        if pipe == Pipe::Stdout && !self.stderr_at_line_start && self.pump.stderr_prefix.is_some() {
            if self.captured.combined.len() >= self.pump.max_bytes {
                self.captured.truncated = true;
                return;
            }
            self.captured.combined.push('\n');
            self.stderr_at_line_start = true;
        }
        let mut accepted = String::with_capacity(text.len());

        for piece in text.split_inclusive('\n') {
            let prefix = match (pipe, &self.pump.stderr_prefix) {
                (Pipe::Stderr, Some(prefix)) if self.stderr_at_line_start => prefix.as_str(),
                _ => "",
            };
            let remaining = self.pump.max_bytes.saturating_sub(self.captured.combined.len());
            let piece = if prefix.len() + piece.len() > remaining {
                self.captured.truncated = true;
                let room = remaining.saturating_sub(prefix.len());
                &piece[..floor_char_boundary(piece, room)]
            } else {
                piece
            };
            if piece.is_empty() {
                break;
            }

            self.captured.combined.push_str(prefix);
            self.captured.combined.push_str(piece);
            accepted.push_str(piece);
            if pipe == Pipe::Stderr {
                self.stderr_at_line_start = piece.ends_with('\n');
            }
            if self.captured.truncated {
                break;
            }
        }

        if accepted.is_empty() {
            return;
        }
        let kind = match pipe {
            Pipe::Stdout => {
                self.captured.stdout.push_str(&accepted);
                self.pump.stdout_kind
            }
            Pipe::Stderr => {
                self.captured.stderr.push_str(&accepted);
                self.pump.stderr_kind
            }
        };
        if let Some(sink) = &self.pump.sink {
            if sink.send(OutputEvent::new(kind, accepted.into_bytes())).is_err() {
                self.pump.sink = None;
            }
        }
    }
}

/// Length of an unfinished UTF-8 sequence at the end of `bytes`
fn incomplete_utf8_suffix(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let width = match byte {
            0xc0..=0xdf => 2,
            0xe0..=0xef => 3,
            0xf0..=0xf7 => 4,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    let mut index = index.min(s.len());
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}
