//! Device Discovery
//!
//! Parses `adb devices` output and tracks which device the client targets.

use std::time::Duration;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use droid_sys_core::{BridgeError, Result};

use crate::adb::{describe, exec_failure, AdbClient};

/// Header line printed before the device rows
pub const DEVICE_LIST_HEADER: &str = "List of devices";

/// Pause between two discovery attempts
const DISCOVERY_RETRY_INTERVAL: Duration = Duration::from_millis(200);

static EMULATOR_PORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"emulator-(\d+)$").expect("valid emulator serial regex"));

/// Device state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    /// Device is online and ready
    Online,
    Offline,
    /// Device is not authorized (need to accept on device)
    Unauthorized,
    Authorizing,
    Connecting,
    Bootloader,
    Recovery,
    Sideload,
    NoPermissions,
    Unknown,
}

impl DeviceState {
    pub fn parse(state: &str) -> Self {
        match state {
            "device" => DeviceState::Online,
            "offline" => DeviceState::Offline,
            "unauthorized" => DeviceState::Unauthorized,
            "authorizing" => DeviceState::Authorizing,
            "connecting" => DeviceState::Connecting,
            "bootloader" => DeviceState::Bootloader,
            "recovery" => DeviceState::Recovery,
            "sideload" => DeviceState::Sideload,
            // e.g. `no permissions (user in plugdev group); see [...]`
            s if s == "no" || s.starts_with("no permissions") => DeviceState::NoPermissions,
            _ => DeviceState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Online => "device",
            DeviceState::Offline => "offline",
            DeviceState::Unauthorized => "unauthorized",
            DeviceState::Authorizing => "authorizing",
            DeviceState::Connecting => "connecting",
            DeviceState::Bootloader => "bootloader",
            DeviceState::Recovery => "recovery",
            DeviceState::Sideload => "sideload",
            DeviceState::NoPermissions => "no permissions",
            DeviceState::Unknown => "unknown",
        }
    }

    pub fn is_usable(&self) -> bool {
        matches!(self, DeviceState::Online)
    }
}

/// A row of the device listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub udid: String,
    pub state: DeviceState,
}

impl Device {
    /// Parse a `<udid>\t<state>` row
    pub fn from_line(line: &str) -> Option<Self> {
        let (udid, state) = match line.split_once('\t') {
            Some((udid, state)) => (udid.trim(), state.trim()),
            None => {
                let mut parts = line.split_whitespace();
                (parts.next()?, parts.next().unwrap_or_default())
            }
        };
        if udid.is_empty() {
            return None;
        }
        Some(Self {
            udid: udid.to_string(),
            state: DeviceState::parse(state),
        })
    }

    pub fn is_usable(&self) -> bool {
        self.state.is_usable()
    }

    pub fn is_emulator(&self) -> bool {
        get_port_from_emulator_string(&self.udid).is_some()
    }
}

/// A connected emulator and its console port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Emulator {
    #[serde(flatten)]
    pub device: Device,
    pub port: u16,
}

impl Emulator {
    pub fn from_device(device: Device) -> Option<Self> {
        let port = get_port_from_emulator_string(&device.udid)?;
        Some(Self { device, port })
    }

    pub fn udid(&self) -> &str {
        &self.device.udid
    }
}

/// Console port embedded in an emulator serial (`emulator-5554` -> 5554)
pub fn get_port_from_emulator_string(udid: &str) -> Option<u16> {
    EMULATOR_PORT_RE
        .captures(udid)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Parse `adb devices` output.
///
/// Banner lines are skipped, and so are offline devices unless
/// `allow_offline` is set.
pub fn parse_device_list(output: &str, allow_offline: bool) -> Result<Vec<Device>> {
    let start = output.find(DEVICE_LIST_HEADER).ok_or_else(|| {
        BridgeError::Parse(format!("Unexpected output while trying to get devices: {}", output))
    })?;

    let mut excluded = vec![DEVICE_LIST_HEADER, "adb server", "* daemon"];
    if !allow_offline {
        excluded.push("offline");
    }

    Ok(output[start..]
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !excluded.iter().any(|marker| line.contains(marker)))
        .filter_map(Device::from_line)
        .collect())
}

impl AdbClient {
    /// Target all following commands at `udid`
    pub fn set_device_id(&self, udid: &str) {
        debug!("Setting device id to {}", udid);
        self.executable.write().set_device_selector(udid);

        let mut session = self.session.lock();
        session.select_device(udid);
        session.set_emulator_port(get_port_from_emulator_string(udid));
    }

    /// Target `device`, recording its emulator port if it has one
    pub fn set_device(&self, device: &Device) {
        self.set_device_id(&device.udid);
    }

    pub fn current_device_id(&self) -> Option<String> {
        self.session.lock().device_id().map(str::to_string)
    }

    pub fn set_emulator_port(&self, port: Option<u16>) {
        self.session.lock().set_emulator_port(port);
    }

    pub fn emulator_port(&self) -> Option<u16> {
        self.session.lock().emulator_port()
    }

    /// Devices currently known to the bridge server
    pub async fn list_devices(&self) -> Result<Vec<Device>> {
        debug!("Getting connected devices");
        let timeout = self.config.exec_timeout();
        let output = self.exec_raw(&["devices"], timeout).await?;
        if !output.success() {
            let exe = self.executable();
            let command = describe(&exe.path, &exe.command_args(&["devices"]));
            return Err(exec_failure(command, output, timeout, &self.config.timeout_cap_name));
        }

        let devices = parse_device_list(&output.stdout, self.config.allow_offline_devices)?;
        debug!("Connected devices: {:?}", devices);
        Ok(devices)
    }

    /// List devices, restarting the server between attempts, until at
    /// least one shows up or `timeout` passes
    pub async fn list_devices_with_retry(&self, timeout: Duration) -> Result<Vec<Device>> {
        let start = Instant::now();
        debug!("Trying to find connected Android devices");

        loop {
            if start.elapsed() > timeout {
                return Err(BridgeError::NoDevices(timeout.as_millis() as u64));
            }

            match self.list_devices().await {
                Ok(devices) if !devices.is_empty() => return Ok(devices),
                Ok(_) => debug!("Could not find online devices"),
                Err(e) => debug!("Device listing failed: {}", e),
            }

            info!("Restarting adb to look for devices again");
            self.restart_adb().await;
            tokio::time::sleep(DISCOVERY_RETRY_INTERVAL).await;
        }
    }

    /// Connected devices that are emulators
    pub async fn get_connected_emulators(&self) -> Result<Vec<Emulator>> {
        debug!("Getting connected emulators");
        let emulators: Vec<Emulator> = self
            .list_devices()
            .await?
            .into_iter()
            .filter_map(Emulator::from_device)
            .collect();
        debug!("{} emulator(s) connected", emulators.len());
        Ok(emulators)
    }

    /// Whether the selected device is a connected emulator
    pub async fn is_emulator_connected(&self) -> Result<bool> {
        let Some(udid) = self.current_device_id() else {
            return Ok(false);
        };
        Ok(self
            .get_connected_emulators()
            .await?
            .iter()
            .any(|e| e.device.udid == udid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessOutput;
    use crate::testing::{client_with, FakeConsole, FakeRunner};
    use droid_sys_core::BridgeConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const SAMPLE: &str = "* daemon not running; starting now at tcp:5037\n\
        * daemon started successfully\n\
        List of devices attached\n\
        emulator-5554\tdevice\n\
        0123456789ABCDEF\tunauthorized\n\
        emulator-5556\toffline\n\n";

    #[test]
    fn test_parse_device_list_skips_banner_and_offline() {
        let devices = parse_device_list(SAMPLE, false).unwrap();
        assert_eq!(
            devices,
            vec![
                Device {
                    udid: "emulator-5554".into(),
                    state: DeviceState::Online
                },
                Device {
                    udid: "0123456789ABCDEF".into(),
                    state: DeviceState::Unauthorized
                },
            ]
        );
    }

    #[test]
    fn test_parse_device_list_can_keep_offline() {
        let devices = parse_device_list(SAMPLE, true).unwrap();
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[2].state, DeviceState::Offline);
    }

    #[test]
    fn test_parse_device_list_requires_header() {
        assert!(parse_device_list("error: cannot connect to daemon", false).is_err());
        assert!(parse_device_list("List of devices attached\n\n", false).unwrap().is_empty());
    }

    #[test]
    fn test_emulator_port() {
        assert_eq!(get_port_from_emulator_string("emulator-5554"), Some(5554));
        assert_eq!(get_port_from_emulator_string("0123456789ABCDEF"), None);
        assert_eq!(get_port_from_emulator_string("emulator-5554x"), None);
        assert!(Device::from_line("emulator-5580\tdevice").unwrap().is_emulator());
    }

    #[tokio::test]
    async fn test_set_device_replaces_selector() {
        let runner = FakeRunner::new(|_| ProcessOutput::ok(""));
        let client = client_with(BridgeConfig::default(), runner, FakeConsole::new()).await;

        client.set_device(&Device::from_line("emulator-5554\tdevice").unwrap());
        assert_eq!(client.emulator_port(), Some(5554));

        client.set_device(&Device::from_line("R58M123\tdevice").unwrap());
        assert_eq!(client.executable().default_args, vec!["-s", "R58M123"]);
        assert_eq!(client.current_device_id().as_deref(), Some("R58M123"));
        assert_eq!(client.emulator_port(), None);
    }

    #[test]
    fn test_no_permissions_row_keeps_its_state() {
        let device = Device::from_line("R58M123\tno permissions (user in plugdev group); see [http://developer.android.com/tools/device.html]").unwrap();
        assert_eq!(device.udid, "R58M123");
        assert_eq!(device.state, DeviceState::NoPermissions);
        assert!(!device.is_usable());
        assert_eq!(DeviceState::parse("no"), DeviceState::NoPermissions);
        assert_eq!(DeviceState::parse("host"), DeviceState::Unknown);
    }

    #[tokio::test]
    async fn test_set_device_id_drops_previous_emulator_port() {
        let runner = FakeRunner::new(|_| ProcessOutput::ok(""));
        let client = client_with(BridgeConfig::default(), runner, FakeConsole::new()).await;

        client.set_device_id("emulator-5554");
        assert_eq!(client.emulator_port(), Some(5554));

        client.set_device_id("R58M123");
        assert_eq!(client.current_device_id().as_deref(), Some("R58M123"));
        assert_eq!(client.emulator_port(), None);
        assert!(matches!(
            client.exec_emu_console_command("avd name").await,
            Err(BridgeError::DeviceNotSelected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_devices_with_retry_restarts_server() {
        let listings = Arc::new(AtomicUsize::new(0));
        let counter = listings.clone();
        let runner = FakeRunner::new(move |call| {
            if call.is("devices") && counter.fetch_add(1, Ordering::SeqCst) >= 2 {
                ProcessOutput::ok("List of devices attached\nR58M123\tdevice\n")
            } else if call.is("devices") {
                ProcessOutput::ok("List of devices attached\n\n")
            } else {
                ProcessOutput::ok("")
            }
        });
        let client = client_with(BridgeConfig::default(), runner.clone(), FakeConsole::new()).await;

        let devices = client.list_devices_with_retry(Duration::from_secs(5)).await.unwrap();
        assert_eq!(devices[0].udid, "R58M123");
        assert_eq!(runner.count(|c| c.is("kill-server")), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_devices_with_retry_times_out() {
        let runner = FakeRunner::new(|_| ProcessOutput::ok("List of devices attached\n\n"));
        let client = client_with(BridgeConfig::default(), runner, FakeConsole::new()).await;

        let started = Instant::now();
        let err = client.list_devices_with_retry(Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, BridgeError::NoDevices(2000)));
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_connected_emulators() {
        let runner = FakeRunner::new(|_| {
            ProcessOutput::ok("List of devices attached\nemulator-5554\tdevice\nR58M123\tdevice\n")
        });
        let client = client_with(BridgeConfig::default(), runner, FakeConsole::new()).await;

        let emulators = client.get_connected_emulators().await.unwrap();
        assert_eq!(emulators.len(), 1);
        assert_eq!(emulators[0].port, 5554);

        assert!(!client.is_emulator_connected().await.unwrap());
        client.set_device_id("emulator-5554");
        assert!(client.is_emulator_connected().await.unwrap());
    }
}
