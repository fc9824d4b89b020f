//! Emulator Launcher
//!
//! Launches AVDs, finds them among the connected devices through their
//! console, waits for boot completion and kills them.

use std::collections::HashMap;
use std::time::Duration;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use droid_sys_core::{BridgeError, Result};

use crate::adb::{describe, AdbClient, ShellOptions};
use crate::avd::{locale_args, normalize_avd_name};
use crate::device::Emulator;
use crate::process::{ExitInfo, ProcessEvent, SubProcess};
use crate::wait::wait_for;

const RUNNING_AVD_POLL_INTERVAL: Duration = Duration::from_millis(1000);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(3000);
const KILL_POLL_INTERVAL: Duration = Duration::from_millis(2000);

pub const DEFAULT_LAUNCH_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(60);

/// `pm get-install-location` answer, e.g. `0[auto]`
static INSTALL_LOCATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d+\[\w+\]").expect("valid install location regex"));

/// Emulator launch options
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// System language (`persist.sys.language`)
    pub language: Option<String>,
    /// System country (`persist.sys.country`)
    pub country: Option<String>,
    /// GPU mode (auto, host, swiftshader_indirect, etc.)
    pub gpu: Option<String>,
    pub no_window: bool,
    pub no_audio: bool,
    pub no_boot_anim: bool,
    pub wipe_data: bool,
    /// Skip loading the quick-boot snapshot
    pub cold_boot: bool,
    /// Additional emulator arguments
    pub args: Vec<String>,
    /// Extra environment of the emulator process
    pub env: HashMap<String, String>,
    /// How long to look for the AVD among connected devices, per attempt
    pub launch_timeout: Duration,
    /// How long to wait for boot completion
    pub ready_timeout: Duration,
    /// Attempts at finding the launched AVD
    pub retry_times: u32,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            language: None,
            country: None,
            gpu: None,
            no_window: false,
            no_audio: false,
            no_boot_anim: false,
            wipe_data: false,
            cold_boot: false,
            args: Vec::new(),
            env: HashMap::new(),
            launch_timeout: DEFAULT_LAUNCH_TIMEOUT,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            retry_times: 1,
        }
    }
}

impl LaunchOptions {
    /// Options for headless/CI environments
    pub fn headless() -> Self {
        Self {
            gpu: Some("swiftshader_indirect".to_string()),
            no_window: true,
            no_audio: true,
            no_boot_anim: true,
            ..Default::default()
        }
    }

    /// Emulator arguments following `-avd <name>`
    pub fn to_args(&self) -> Vec<String> {
        let mut args = locale_args(self.language.as_deref(), self.country.as_deref());

        if let Some(ref gpu) = self.gpu {
            args.push("-gpu".to_string());
            args.push(gpu.clone());
        }
        if self.no_window {
            args.push("-no-window".to_string());
        }
        if self.no_audio {
            args.push("-no-audio".to_string());
        }
        if self.no_boot_anim {
            args.push("-no-boot-anim".to_string());
        }
        if self.wipe_data {
            args.push("-wipe-data".to_string());
        }
        if self.cold_boot {
            args.push("-no-snapshot-load".to_string());
        }

        args.extend(self.args.iter().cloned());
        args
    }
}

/// Lifecycle of a launched emulator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulatorState {
    /// Process spawned, not yet visible to the bridge
    Launching,
    /// Connected, waiting for boot completion
    BootingRom,
    Ready,
    Killed,
}

/// Running emulator instance
#[derive(Debug)]
pub struct EmulatorInstance {
    pub avd_name: String,
    emulator: Option<Emulator>,
    state: EmulatorState,
    process: SubProcess,
}

impl EmulatorInstance {
    /// Get the serial for ADB, once the emulator is connected
    pub fn serial(&self) -> Option<&str> {
        self.emulator.as_ref().map(Emulator::udid)
    }

    pub fn port(&self) -> Option<u16> {
        self.emulator.as_ref().map(|e| e.port)
    }

    pub fn emulator(&self) -> Option<&Emulator> {
        self.emulator.as_ref()
    }

    pub fn state(&self) -> EmulatorState {
        self.state
    }

    pub fn process(&mut self) -> &mut SubProcess {
        &mut self.process
    }

    /// Check if the emulator process is still running
    pub fn is_running(&self) -> bool {
        self.state != EmulatorState::Killed && self.process.is_running()
    }

    /// Kill through the console, falling back to killing the process
    pub async fn kill(&mut self, adb: &AdbClient, timeout: Duration) -> Result<()> {
        let killed = adb.kill_emulator(Some(&self.avd_name), timeout).await;
        if !matches!(killed, Ok(true)) {
            warn!("Killing the '{}' emulator process directly", self.avd_name);
            self.process.kill().await;
        }
        self.state = EmulatorState::Killed;
        info!("Killed emulator: {}", self.avd_name);
        killed.map(|_| ())
    }

    /// Wait for emulator to exit
    pub async fn wait(&mut self) -> Option<ExitInfo> {
        let info = self.process.wait().await;
        self.state = EmulatorState::Killed;
        info
    }
}

/// Log emulator output until the process ends
async fn log_emulator_output(avd_name: String, mut events: mpsc::Receiver<ProcessEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ProcessEvent::Stdout(line) | ProcessEvent::Stderr(line) => {
                if !line.trim().is_empty() {
                    info!("[AVD OUTPUT] {}", line);
                }
            }
            ProcessEvent::Exited(exit) => {
                warn!("Emulator avd {} exited with {}", avd_name, exit);
            }
        }
    }
}

impl AdbClient {
    /// Launch `avd_name` and wait until it has booted
    pub async fn launch_avd(&self, avd_name: &str, opts: &LaunchOptions) -> Result<EmulatorInstance> {
        let name = normalize_avd_name(avd_name);
        self.check_avd_exist(name).await?;

        let emulator_binary = self.locator.resolve("emulator").await?;
        let mut args = vec!["-avd".to_string(), name.to_string()];
        args.extend(opts.to_args());

        let command = describe(&emulator_binary, &args);
        info!("Launching Emulator with command: {}", command);
        let mut process = self
            .runner
            .spawn(&emulator_binary, &args, &opts.env)
            .map_err(|source| BridgeError::Spawn { command, source })?;

        if let Some(events) = process.take_events() {
            tokio::spawn(log_emulator_output(name.to_string(), events));
        }
        let mut instance = EmulatorInstance {
            avd_name: name.to_string(),
            emulator: None,
            state: EmulatorState::Launching,
            process,
        };

        let attempts = opts.retry_times.max(1);
        let mut found = None;
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.get_running_avd_with_retry(name, opts.launch_timeout).await {
                Ok(emulator) => {
                    found = Some(emulator);
                    break;
                }
                Err(e) => {
                    warn!("Attempt {}/{} at finding '{}' failed: {}", attempt, attempts, name, e);
                    last_error = Some(e);
                }
            }
        }
        let emulator = match (found, last_error) {
            (Some(emulator), _) => emulator,
            (None, Some(e)) => return Err(e),
            (None, None) => {
                return Err(BridgeError::Timeout(format!("Emulator '{}' was not found", name)))
            }
        };

        instance.emulator = Some(emulator);
        instance.state = EmulatorState::BootingRom;
        self.wait_for_emulator_ready(opts.ready_timeout).await?;
        instance.state = EmulatorState::Ready;
        Ok(instance)
    }

    /// Find a connected emulator running `avd_name` and select it
    pub async fn get_running_avd(&self, avd_name: &str) -> Result<Option<Emulator>> {
        let name = normalize_avd_name(avd_name);
        debug!("Trying to find '{}' emulator", name);

        for emulator in self.get_connected_emulators().await? {
            self.set_emulator_port(Some(emulator.port));
            let running = match self.console.execute(emulator.port, "avd name").await {
                Ok(running) => running,
                Err(e) => {
                    debug!("Cannot ask {} for its AVD name: {}", emulator.udid(), e);
                    continue;
                }
            };
            if running.trim().eq_ignore_ascii_case(name) {
                debug!("Found emulator '{}' on port {}", name, emulator.port);
                self.set_device_id(emulator.udid());
                return Ok(Some(emulator));
            }
        }

        debug!("Emulator '{}' not running", name);
        Ok(None)
    }

    /// Poll for `avd_name` until it shows up or `timeout` passes
    pub async fn get_running_avd_with_retry(&self, avd_name: &str, timeout: Duration) -> Result<Emulator> {
        let found = wait_for(timeout, RUNNING_AVD_POLL_INTERVAL, || async move {
            match self.get_running_avd(avd_name).await {
                Ok(emulator) => emulator,
                Err(e) => {
                    debug!("Error while looking for '{}': {}", avd_name, e);
                    None
                }
            }
        })
        .await;

        found.ok_or_else(|| {
            BridgeError::Timeout(format!(
                "Emulator '{}' was not found within {}ms",
                normalize_avd_name(avd_name),
                timeout.as_millis()
            ))
        })
    }

    /// Both boot signals: boot animation stopped and package manager up
    async fn is_boot_complete(&self) -> Result<bool> {
        let bootanim = self
            .shell(["getprop", "init.svc.bootanim"], &ShellOptions::default())
            .await?;
        if !bootanim.contains("stopped") {
            return Ok(false);
        }
        let location = self
            .shell(["pm", "get-install-location"], &ShellOptions::default())
            .await?;
        Ok(INSTALL_LOCATION_RE.is_match(&location))
    }

    /// Block until the selected emulator has booted
    pub async fn wait_for_emulator_ready(&self, timeout: Duration) -> Result<()> {
        debug!("Waiting up to {}ms for the emulator to be ready", timeout.as_millis());
        let ready = wait_for(timeout, READY_POLL_INTERVAL, || async move {
            match self.is_boot_complete().await {
                Ok(true) => Some(()),
                Ok(false) => None,
                Err(e) => {
                    debug!("Waiting for emulator startup. Intermediate error: {}", e);
                    None
                }
            }
        })
        .await;

        ready.ok_or_else(|| {
            BridgeError::Timeout(format!("Emulator is not ready within {}ms", timeout.as_millis()))
        })
    }

    /// Run a command on the selected emulator's console
    pub async fn exec_emu_console_command(&self, command: &str) -> Result<String> {
        let port = self.emulator_port().ok_or(BridgeError::DeviceNotSelected)?;
        self.console.execute(port, command).await
    }

    /// Kill an emulator by AVD name, or the selected device.
    ///
    /// Returns `false` when no such emulator is running.
    pub async fn kill_emulator(&self, avd_name: Option<&str>, timeout: Duration) -> Result<bool> {
        let target = match avd_name {
            Some(name) => {
                debug!("Killing avd '{}'", normalize_avd_name(name));
                self.get_running_avd(name).await?
            }
            None => {
                let udid = self.current_device_id();
                debug!("Killing avd with id '{:?}'", udid);
                match udid {
                    Some(udid) => self
                        .get_connected_emulators()
                        .await?
                        .into_iter()
                        .find(|e| e.device.udid == udid),
                    None => None,
                }
            }
        };

        let Some(emulator) = target else {
            info!("No avd with name '{}' running. Skipping kill step", avd_name.unwrap_or_default());
            return Ok(false);
        };
        let label = avd_name
            .map(|name| normalize_avd_name(name).to_string())
            .unwrap_or_else(|| emulator.udid().to_string());

        self.console.execute(emulator.port, "kill").await?;
        debug!("Waiting up to {}ms until the emulator '{}' is killed", timeout.as_millis(), label);

        let gone = wait_for(timeout, KILL_POLL_INTERVAL, || async move {
            let still_running = match avd_name {
                Some(name) => self.get_running_avd(name).await.map(|e| e.is_some()),
                None => self.is_emulator_connected().await,
            };
            match still_running {
                Ok(false) => Some(()),
                _ => None,
            }
        })
        .await;

        gone.ok_or_else(|| {
            BridgeError::Timeout(format!(
                "The emulator '{}' is still running after being killed {}ms ago",
                label,
                timeout.as_millis()
            ))
        })?;
        info!("Successfully killed the '{}' emulator", label);
        Ok(true)
    }
}
