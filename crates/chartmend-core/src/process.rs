//! Subprocess execution with hard timeouts and cooperative cancellation.
//!
//! Both the chart renderer and the LLM runner go through [`run_process`].
//! Children are spawned with `kill_on_drop`, so a timeout or cancellation
//! that drops the wait future also kills the process.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// What to run.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
    /// Written to the child's stdin, which is then closed.
    pub stdin: Option<String>,
    pub env: Vec<(String, String)>,
    pub env_remove: Vec<String>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            stdin: None,
            env: Vec::new(),
            env_remove: Vec::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn env_remove(mut self, key: impl Into<String>) -> Self {
        self.env_remove.push(key.into());
        self
    }

    /// Shell-ish rendering for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.to_string_lossy().into_owned())
            .chain(self.args.iter().map(|a| a.to_string_lossy().into_owned()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured output of a process that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// -1 when terminated by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug)]
pub enum ProcessOutcome {
    Completed(ProcessOutput),
    /// The program could not be started (typically not installed).
    SpawnFailed(std::io::Error),
    /// Waiting on the child failed after it started.
    WaitFailed(std::io::Error),
    TimedOut { after: Duration },
    Cancelled,
}

/// Run a command to completion, honouring its timeout and `cancel`.
pub async fn run_process(spec: &CommandSpec, cancel: &CancellationToken) -> ProcessOutcome {
    let start = Instant::now();
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }
    for key in &spec.env_remove {
        cmd.env_remove(key);
    }
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    debug!(command = %spec.display(), "spawning subprocess");
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return ProcessOutcome::SpawnFailed(e),
    };

    let mut stdin_pipe = child.stdin.take();
    let input = spec.stdin.clone();
    let feed = async move {
        if let (Some(pipe), Some(data)) = (stdin_pipe.as_mut(), input.as_deref()) {
            // A child that exits without reading stdin closes the pipe early.
            if let Err(e) = pipe.write_all(data.as_bytes()).await {
                debug!(error = %e, "stdin write interrupted");
            }
        }
        drop(stdin_pipe);
    };
    let run = async move {
        let (_, output) = tokio::join!(feed, child.wait_with_output());
        output
    };

    tokio::select! {
        _ = cancel.cancelled() => ProcessOutcome::Cancelled,
        res = tokio::time::timeout(spec.timeout, run) => match res {
            Err(_) => ProcessOutcome::TimedOut { after: spec.timeout },
            Ok(Err(e)) => ProcessOutcome::WaitFailed(e),
            Ok(Ok(output)) => ProcessOutcome::Completed(ProcessOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                duration_ms: start.elapsed().as_millis() as u64,
            }),
        },
    }
}
