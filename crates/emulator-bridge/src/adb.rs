//! ADB (Android Debug Bridge) Client
//!
//! Runs bridge commands for the selected device. Every invocation gets the
//! session's default arguments prepended; transient failures are retried
//! once after the device is rediscovered.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use droid_sys_core::{BridgeConfig, BridgeError, Executable, Result, SessionState, TransientKind};
use droid_sys_toolchain::BinaryLocator;

use crate::console::{EmulatorConsole, TcpConsole};
use crate::process::{ProcessOutput, ProcessRunner, SubProcess, TokioRunner};

/// Pause before rediscovering a device that hit a transient error
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

static LINKER_WARNING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^WARNING: linker.+$").expect("valid linker warning regex"));

static VERSION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Android Debug Bridge version ((\d+)\.(\d+)(?:\.(\d+))?)").expect("valid version regex")
});

/// Options of a single bridge command
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Overrides the configured command timeout
    pub timeout: Option<Duration>,
    /// Overrides the configuration name reported on timeout
    pub timeout_cap_name: Option<String>,
}

impl ExecOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Default::default()
        }
    }
}

/// Options of a device shell command
#[derive(Debug, Clone, Default)]
pub struct ShellOptions {
    pub timeout: Option<Duration>,
    pub timeout_cap_name: Option<String>,
    /// Run with the daemon rooted
    pub privileged: bool,
    /// Leave the daemon rooted after a successful privileged command
    pub keep_privileged: bool,
}

impl ShellOptions {
    pub fn privileged() -> Self {
        Self {
            privileged: true,
            ..Default::default()
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Default::default()
        }
    }

    fn exec_options(&self) -> ExecOptions {
        ExecOptions {
            timeout: self.timeout,
            timeout_cap_name: self.timeout_cap_name.clone(),
        }
    }
}

/// A device shell command, as one string or as separate words
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand(Vec<String>);

impl ShellCommand {
    pub fn args(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

impl From<&str> for ShellCommand {
    fn from(cmd: &str) -> Self {
        Self(vec![cmd.to_string()])
    }
}

impl From<String> for ShellCommand {
    fn from(cmd: String) -> Self {
        Self(vec![cmd])
    }
}

impl From<Vec<String>> for ShellCommand {
    fn from(args: Vec<String>) -> Self {
        Self(args)
    }
}

impl From<&[&str]> for ShellCommand {
    fn from(args: &[&str]) -> Self {
        Self(args.iter().map(|a| a.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for ShellCommand {
    fn from(args: [&str; N]) -> Self {
        Self(args.iter().map(|a| a.to_string()).collect())
    }
}

/// Parsed `adb version` output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BridgeVersion {
    pub version_string: String,
    pub version_float: f64,
    pub major: u32,
    pub minor: u32,
    pub patch: Option<u32>,
}

impl BridgeVersion {
    pub fn parse(output: &str) -> Option<Self> {
        let caps = VERSION_RE.captures(output)?;
        let major: u32 = caps.get(2)?.as_str().parse().ok()?;
        let minor: u32 = caps.get(3)?.as_str().parse().ok()?;

        Some(Self {
            version_string: caps.get(1)?.as_str().to_string(),
            version_float: format!("{}.{}", major, minor).parse().ok()?,
            major,
            minor,
            patch: caps.get(4).and_then(|m| m.as_str().parse().ok()),
        })
    }
}

/// Strip benign linker warnings and surrounding whitespace
pub fn clean_stdout(stdout: &str) -> String {
    LINKER_WARNING.replace_all(stdout, "").trim().to_string()
}

/// Command line as shown in logs and errors
pub(crate) fn describe(program: &Path, args: &[String]) -> String {
    let mut line = program.display().to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Error for a command that did not exit cleanly
pub(crate) fn exec_failure(command: String, output: ProcessOutput, timeout: Duration, cap_name: &str) -> BridgeError {
    let message = output.failure_message();
    match output.code {
        Some(code) => BridgeError::ExecFailed {
            command,
            code,
            message,
            stdout: output.stdout,
            stderr: output.stderr,
        },
        None => BridgeError::ExecTimeout {
            command,
            message,
            timeout_ms: timeout.as_millis() as u64,
            timeout_cap_name: cap_name.to_string(),
        },
    }
}

/// Builder for [`AdbClient`]
pub struct AdbClientBuilder {
    config: BridgeConfig,
    adb_path: Option<PathBuf>,
    locator: Option<BinaryLocator>,
    runner: Option<Arc<dyn ProcessRunner>>,
    console: Option<Arc<dyn EmulatorConsole>>,
}

impl AdbClientBuilder {
    /// Use this bridge binary instead of resolving it
    pub fn adb_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.adb_path = Some(path.into());
        self
    }

    pub fn locator(mut self, locator: BinaryLocator) -> Self {
        self.locator = Some(locator);
        self
    }

    pub fn runner(mut self, runner: Arc<dyn ProcessRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn console(mut self, console: Arc<dyn EmulatorConsole>) -> Self {
        self.console = Some(console);
        self
    }

    pub async fn build(self) -> Result<AdbClient> {
        let locator = self
            .locator
            .unwrap_or_else(|| BinaryLocator::from_config(&self.config));
        let path = match self.adb_path {
            Some(path) => path,
            None => locator.resolve("adb").await?,
        };
        let executable = Executable::new(path).with_default_args(self.config.default_args());
        debug!("Using bridge executable {:?}", executable);

        Ok(AdbClient {
            executable: RwLock::new(executable),
            session: Mutex::new(SessionState::new()),
            locator,
            runner: self.runner.unwrap_or_else(|| Arc::new(TokioRunner)),
            console: self.console.unwrap_or_else(|| Arc::new(TcpConsole::new())),
            version: OnceCell::new(),
            config: self.config,
        })
    }
}

/// ADB Client
pub struct AdbClient {
    pub(crate) config: BridgeConfig,
    pub(crate) executable: RwLock<Executable>,
    pub(crate) session: Mutex<SessionState>,
    pub(crate) locator: BinaryLocator,
    pub(crate) runner: Arc<dyn ProcessRunner>,
    pub(crate) console: Arc<dyn EmulatorConsole>,
    version: OnceCell<BridgeVersion>,
}

impl AdbClient {
    pub fn builder(config: BridgeConfig) -> AdbClientBuilder {
        AdbClientBuilder {
            config,
            adb_path: None,
            locator: None,
            runner: None,
            console: None,
        }
    }

    /// Create a client that resolves the bridge binary from the SDK
    pub async fn new(config: BridgeConfig) -> Result<Self> {
        Self::builder(config).build().await
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn locator(&self) -> &BinaryLocator {
        &self.locator
    }

    /// Snapshot of the bridge binary and its default arguments
    pub fn executable(&self) -> Executable {
        self.executable.read().clone()
    }

    fn invocation<S: AsRef<str>>(&self, args: &[S]) -> (PathBuf, Vec<String>) {
        let exe = self.executable.read();
        (exe.path.clone(), exe.command_args(args))
    }

    /// Run a bridge command once, without retries or output checks
    pub(crate) async fn exec_raw<S: AsRef<str>>(&self, args: &[S], timeout: Duration) -> Result<ProcessOutput> {
        let (program, full_args) = self.invocation(args);
        debug!("Running '{}'", describe(&program, &full_args));
        self.runner
            .run(&program, &full_args, Some(timeout))
            .await
            .map_err(|source| BridgeError::Spawn {
                command: describe(&program, &full_args),
                source,
            })
    }

    /// Run a bridge command and return its cleaned stdout.
    ///
    /// A transient failure triggers device rediscovery and exactly one
    /// more attempt.
    pub async fn execute<S: AsRef<str>>(&self, args: &[S], opts: &ExecOptions) -> Result<String> {
        let timeout = opts.timeout.unwrap_or_else(|| self.config.exec_timeout());
        let cap_name = opts
            .timeout_cap_name
            .clone()
            .unwrap_or_else(|| self.config.timeout_cap_name.clone());
        let mut retried = false;

        loop {
            let (program, full_args) = self.invocation(args);
            let command = describe(&program, &full_args);
            debug!("Running '{}'", command);

            let output = self
                .runner
                .run(&program, &full_args, Some(timeout))
                .await
                .map_err(|source| BridgeError::Spawn {
                    command: command.clone(),
                    source,
                })?;

            if output.success() {
                return Ok(clean_stdout(&output.stdout));
            }

            if !retried {
                if let Some(kind) = TransientKind::classify(&output.text_surface()) {
                    retried = true;
                    info!(
                        "Error sending command ({}), reconnecting device and retrying: {}",
                        kind, command
                    );
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    self.list_devices_with_retry(self.config.discovery_timeout()).await?;
                    continue;
                }
            }

            self.dump_failure(&command, &output).await;
            return Err(exec_failure(command, output, timeout, &cap_name));
        }
    }

    /// Run a command in the device shell
    pub async fn shell<C: Into<ShellCommand>>(&self, cmd: C, opts: &ShellOptions) -> Result<String> {
        let cmd = cmd.into();
        let mut args = vec!["shell".to_string()];
        args.extend(cmd.args().iter().cloned());

        let mut should_restore = false;
        if opts.privileged {
            info!("'adb shell {}' requires root access", cmd);
            let elevated = self.root().await;
            if !elevated.is_successful {
                warn!("Cannot elevate privileges for 'adb shell {}', running it anyway", cmd);
            }
            // Restore only a change this call made
            should_restore = elevated.is_successful && !elevated.was_already_rooted;
        }

        let result = self.execute(&args, &opts.exec_options()).await;

        if should_restore && (!opts.keep_privileged || result.is_err()) {
            let restored = self.unroot().await;
            debug!("Restored privileges after 'adb shell {}': {:?}", cmd, restored);
        }
        result
    }

    /// Start a long-running bridge command
    pub fn create_subprocess<S: AsRef<str>>(&self, args: &[S], env: &HashMap<String, String>) -> Result<SubProcess> {
        let (program, full_args) = self.invocation(args);
        let command = describe(&program, &full_args);
        debug!("Creating subprocess with command: {}", command);
        self.runner
            .spawn(&program, &full_args, env)
            .map_err(|source| BridgeError::Spawn { command, source })
    }

    /// Append a failed command to the debug dump file
    async fn dump_failure(&self, command: &str, output: &ProcessOutput) {
        let Some(ref path) = self.config.debug_dump else {
            return;
        };
        let entry = format!(
            "$ {}\nexit code: {:?}\n--- stdout ---\n{}\n--- stderr ---\n{}\n\n",
            command, output.code, output.stdout, output.stderr
        );

        let written = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            file.write_all(entry.as_bytes()).await?;
            file.flush().await
        }
        .await;

        if let Err(e) = written {
            warn!("Cannot write debug dump to {:?}: {}", path, e);
        }
    }

    /// Stop the bridge server
    pub async fn kill_server(&self) -> Result<()> {
        debug!("Killing adb server");
        let timeout = self.config.exec_timeout();
        let output = self.exec_raw(&["kill-server"], timeout).await?;
        if !output.success() {
            let (program, args) = self.invocation(&["kill-server"]);
            return Err(exec_failure(describe(&program, &args), output, timeout, &self.config.timeout_cap_name));
        }
        Ok(())
    }

    pub async fn start_server(&self) -> Result<()> {
        debug!("Starting adb server");
        let timeout = self.config.exec_timeout();
        let output = self.exec_raw(&["start-server"], timeout).await?;
        if !output.success() {
            let (program, args) = self.invocation(&["start-server"]);
            return Err(exec_failure(describe(&program, &args), output, timeout, &self.config.timeout_cap_name));
        }
        Ok(())
    }

    /// Restart the bridge server. Never fails; capability caches are reset either way.
    pub async fn restart_adb(&self) {
        debug!("Restarting adb");
        if let Err(e) = self.kill_server().await {
            error!("Error killing ADB server, going to see if it's online anyway: {}", e);
        }
        self.session.lock().invalidate();
    }

    /// Reconnect offline devices
    pub async fn reconnect(&self) -> Result<()> {
        debug!("Reconnecting offline devices");
        self.execute(&["reconnect", "offline"], &ExecOptions::default()).await?;
        Ok(())
    }

    /// Bridge binary version, queried once
    pub async fn get_adb_version(&self) -> Result<BridgeVersion> {
        self.version
            .get_or_try_init(|| async {
                let output = self.execute(&["version"], &ExecOptions::default()).await?;
                BridgeVersion::parse(&output)
                    .ok_or_else(|| BridgeError::Parse(format!("Cannot parse adb version from '{}'", output)))
            })
            .await
            .cloned()
    }
}
