//! Process Runner
//!
//! Runs external binaries, either to completion or as long-running
//! processes whose output is delivered as a stream of events.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

/// Buffered output lines per subprocess before new lines are dropped
const EVENT_BUFFER: usize = 1024;

/// Captured result of a process that ran to completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code, `None` when the process was killed or timed out
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// A process that never reported an exit code
    pub fn killed() -> Self {
        Self::default()
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Short description of why the process failed
    pub fn failure_message(&self) -> String {
        match self.code {
            Some(code) => format!("Command failed with exit code {}", code),
            None => "Command was killed before reporting an exit code".to_string(),
        }
    }

    /// Message, stdout and stderr joined, for error classification
    pub fn text_surface(&self) -> String {
        format!("{}{}{}", self.failure_message(), self.stdout, self.stderr)
    }
}

/// How a subprocess ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

/// Subprocess event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Stdout(String),
    Stderr(String),
    Exited(ExitInfo),
}

/// Handle to a long-running process.
///
/// The event stream can be taken once. Lines are dropped when nobody
/// consumes it and the buffer is full.
pub struct SubProcess {
    pid: Option<u32>,
    events: Option<mpsc::Receiver<ProcessEvent>>,
    exit: watch::Receiver<Option<ExitInfo>>,
    kill: Option<oneshot::Sender<()>>,
}

impl SubProcess {
    /// Spawn `program` and start forwarding its output
    pub fn spawn(program: &Path, args: &[String], env: &HashMap<String, String>) -> io::Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let pid = child.id();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = tx.try_send(ProcessEvent::Stdout(line));
                }
            });
        }

        if let Some(stderr) = child.stderr.take() {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = tx.try_send(ProcessEvent::Stderr(line));
                }
            });
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                Ok(()) = &mut kill_rx => {
                    if let Err(e) = child.start_kill() {
                        warn!("Cannot kill process {:?}: {}", pid, e);
                    }
                    child.wait().await
                }
            };

            let info = match status {
                Ok(status) => ExitInfo::from(status),
                Err(e) => {
                    warn!("Cannot collect exit status of process {:?}: {}", pid, e);
                    ExitInfo::default()
                }
            };
            debug!("Process {:?} ended with {}", pid, info);
            let _ = exit_tx.send(Some(info));
            let _ = tx.try_send(ProcessEvent::Exited(info));
        });

        Ok(Self {
            pid,
            events: Some(rx),
            exit: exit_rx,
            kill: Some(kill_tx),
        })
    }

    /// Assemble a handle from its channels, for runners without an OS process
    pub fn from_parts(
        pid: Option<u32>,
        events: mpsc::Receiver<ProcessEvent>,
        exit: watch::Receiver<Option<ExitInfo>>,
        kill: oneshot::Sender<()>,
    ) -> Self {
        Self {
            pid,
            events: Some(events),
            exit,
            kill: Some(kill),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Take the output stream. Returns `None` once taken.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<ProcessEvent>> {
        self.events.take()
    }

    pub fn is_running(&self) -> bool {
        self.exit.borrow().is_none()
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }

    /// Wait for the process to exit
    pub async fn wait(&mut self) -> Option<ExitInfo> {
        loop {
            if let Some(info) = *self.exit.borrow() {
                return Some(info);
            }
            if self.exit.changed().await.is_err() {
                return *self.exit.borrow();
            }
        }
    }

    /// Kill the process and wait for it to exit
    pub async fn kill(&mut self) -> Option<ExitInfo> {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        self.wait().await
    }
}

impl fmt::Debug for SubProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubProcess")
            .field("pid", &self.pid)
            .field("exit", &*self.exit.borrow())
            .finish()
    }
}

/// Runs external binaries
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run to completion. A process still running after `timeout` is
    /// killed and reported without an exit code.
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        timeout: Option<Duration>,
    ) -> io::Result<ProcessOutput>;

    /// Start a long-running process
    fn spawn(
        &self,
        program: &Path,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> io::Result<SubProcess>;
}

/// [`ProcessRunner`] backed by `tokio::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioRunner;

#[async_trait]
impl ProcessRunner for TokioRunner {
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        timeout: Option<Duration>,
    ) -> io::Result<ProcessOutput> {
        let mut command = Command::new(program);
        command.args(args).stdin(Stdio::null()).kill_on_drop(true);

        let output = match timeout {
            Some(limit) => match tokio::time::timeout(limit, command.output()).await {
                Ok(output) => output?,
                Err(_) => {
                    debug!("{:?} timed out after {}ms", program, limit.as_millis());
                    return Ok(ProcessOutput::killed());
                }
            },
            None => command.output().await?,
        };

        Ok(ProcessOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    fn spawn(
        &self,
        program: &Path,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> io::Result<SubProcess> {
        SubProcess::spawn(program, args, env)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sh(script: &str) -> (PathBuf, Vec<String>) {
        (PathBuf::from("/bin/sh"), vec!["-c".to_string(), script.to_string()])
    }

    #[test]
    fn test_output_messages() {
        assert!(ProcessOutput::ok("x").success());
        assert_eq!(
            ProcessOutput::failed(2, "boom").text_surface(),
            "Command failed with exit code 2boom"
        );
        assert!(ProcessOutput::killed().failure_message().contains("killed"));
    }

    #[tokio::test]
    async fn test_run_captures_output() {
        let (program, args) = sh("echo out; echo err >&2; exit 3");
        let output = TokioRunner.run(&program, &args, None).await.unwrap();
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_run_timeout_has_no_exit_code() {
        let (program, args) = sh("sleep 5");
        let output = TokioRunner
            .run(&program, &args, Some(Duration::from_millis(100)))
            .await
            .unwrap();
        assert_eq!(output.code, None);
    }

    #[tokio::test]
    async fn test_subprocess_streams_lines_then_exit() {
        let (program, args) = sh("echo one; echo two >&2");
        let mut process = TokioRunner.spawn(&program, &args, &HashMap::new()).unwrap();
        let mut events = process.take_events().unwrap();
        assert!(process.take_events().is_none());

        let mut lines = Vec::new();
        while let Some(event) = events.recv().await {
            match event {
                ProcessEvent::Stdout(line) | ProcessEvent::Stderr(line) => lines.push(line),
                ProcessEvent::Exited(_) => {}
            }
        }
        lines.sort();
        assert_eq!(lines, vec!["one", "two"]);
        assert_eq!(process.wait().await.and_then(|i| i.code), Some(0));
        assert!(!process.is_running());
    }

    #[tokio::test]
    async fn test_subprocess_kill() {
        let (program, args) = sh("sleep 30");
        let mut process = TokioRunner.spawn(&program, &args, &HashMap::new()).unwrap();
        assert!(process.is_running());

        let info = process.kill().await.unwrap();
        assert_eq!(info.code, None);
        assert!(!process.is_running());
    }
}
