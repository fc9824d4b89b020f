//! Scripted process runner and emulator console for tests

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};

use droid_sys_core::{BridgeConfig, BridgeError, Result};
use droid_sys_toolchain::BinaryLocator;

use crate::adb::AdbClient;
use crate::console::EmulatorConsole;
use crate::process::{ExitInfo, ProcessEvent, ProcessOutput, ProcessRunner, SubProcess};

pub const DEVICES_ONE: &str = "List of devices attached\nemulator-5554\tdevice\n\n";

/// Flags that carry a value in the bridge's default arguments
const PREFIX_FLAGS: [&str; 3] = ["-s", "-H", "-P"];

/// One recorded process invocation
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub timeout: Option<Duration>,
}

impl Invocation {
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// Arguments after the default `-s`/`-H`/`-P` pairs
    pub fn command(&self) -> &[String] {
        let mut idx = 0;
        while idx + 1 < self.args.len() && PREFIX_FLAGS.contains(&self.args[idx].as_str()) {
            idx += 2;
        }
        &self.args[idx..]
    }

    pub fn line(&self) -> String {
        self.command().join(" ")
    }

    pub fn is(&self, line: &str) -> bool {
        self.line() == line
    }
}

type Handler = Box<dyn Fn(&Invocation) -> ProcessOutput + Send + Sync>;

/// Runner that answers through a closure and records every call
pub struct FakeRunner {
    handler: Handler,
    calls: Mutex<Vec<Invocation>>,
}

impl FakeRunner {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&Invocation) -> ProcessOutput + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().clone()
    }

    pub fn count<P: Fn(&Invocation) -> bool>(&self, predicate: P) -> usize {
        self.calls.lock().iter().filter(|c| predicate(c)).count()
    }
}

#[async_trait]
impl ProcessRunner for FakeRunner {
    async fn run(&self, program: &Path, args: &[String], timeout: Option<Duration>) -> io::Result<ProcessOutput> {
        let call = Invocation {
            program: program.to_path_buf(),
            args: args.to_vec(),
            timeout,
        };
        let output = (self.handler)(&call);
        self.calls.lock().push(call);
        Ok(output)
    }

    fn spawn(&self, program: &Path, args: &[String], _env: &HashMap<String, String>) -> io::Result<SubProcess> {
        self.calls.lock().push(Invocation {
            program: program.to_path_buf(),
            args: args.to_vec(),
            timeout: None,
        });

        let (events_tx, events_rx) = mpsc::channel(16);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let _ = events_tx.send(ProcessEvent::Stdout("emulator: started".into())).await;
            if kill_rx.await.is_ok() {
                let info = ExitInfo {
                    code: None,
                    signal: Some(9),
                };
                let _ = exit_tx.send(Some(info));
                let _ = events_tx.send(ProcessEvent::Exited(info)).await;
            }
        });

        Ok(SubProcess::from_parts(None, events_rx, exit_rx, kill_tx))
    }
}

type KillHook = Box<dyn Fn(u16) + Send + Sync>;

/// Console that maps ports to AVD names
pub struct FakeConsole {
    avds: Mutex<HashMap<u16, String>>,
    commands: Mutex<Vec<(u16, String)>>,
    on_kill: Option<KillHook>,
}

impl FakeConsole {
    pub fn new() -> Arc<Self> {
        Self::with_avds(&[])
    }

    pub fn with_avds(avds: &[(u16, &str)]) -> Arc<Self> {
        Arc::new(Self {
            avds: Mutex::new(avds.iter().map(|(p, n)| (*p, n.to_string())).collect()),
            commands: Mutex::new(Vec::new()),
            on_kill: None,
        })
    }

    /// Run `hook` with the port whenever a `kill` command arrives
    pub fn with_kill_hook<F>(avds: &[(u16, &str)], hook: F) -> Arc<Self>
    where
        F: Fn(u16) + Send + Sync + 'static,
    {
        Arc::new(Self {
            avds: Mutex::new(avds.iter().map(|(p, n)| (*p, n.to_string())).collect()),
            commands: Mutex::new(Vec::new()),
            on_kill: Some(Box::new(hook)),
        })
    }

    pub fn commands(&self) -> Vec<(u16, String)> {
        self.commands.lock().clone()
    }
}

#[async_trait]
impl EmulatorConsole for FakeConsole {
    async fn execute(&self, port: u16, command: &str) -> Result<String> {
        self.commands.lock().push((port, command.to_string()));
        match command {
            "avd name" => self
                .avds
                .lock()
                .get(&port)
                .cloned()
                .ok_or_else(|| BridgeError::Console(format!("Nothing listens on port {}", port))),
            "kill" => {
                self.avds.lock().remove(&port);
                if let Some(ref hook) = self.on_kill {
                    hook(port);
                }
                Ok("OK: killing emulator, bye bye".into())
            }
            other => Err(BridgeError::Console(format!("KO: unknown command '{}'", other))),
        }
    }
}

/// Client wired to fakes; other binaries resolve under `/usr/bin`
pub async fn client_with(
    config: BridgeConfig,
    runner: Arc<FakeRunner>,
    console: Arc<FakeConsole>,
) -> AdbClient {
    let locator = BinaryLocator::new(None, None)
        .with_path_lookup(Arc::new(|name: &str| Some(PathBuf::from("/usr/bin").join(name))));
    AdbClient::builder(config)
        .adb_path("/sdk/platform-tools/adb")
        .locator(locator)
        .runner(runner)
        .console(console)
        .build()
        .await
        .unwrap()
}
