//! Bridge passthrough commands
//!
//! Port forwarding, file transfer, bug reports and screen recording.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use droid_sys_core::{BridgeError, Result};

use crate::adb::{AdbClient, ExecOptions, ShellOptions};
use crate::process::SubProcess;
use crate::wait::wait_for;

const BUGREPORT_TIMEOUT: Duration = Duration::from_secs(120);
const PULL_TIMEOUT: Duration = Duration::from_secs(60);
const WAIT_FOR_DEVICE_INTERVAL: Duration = Duration::from_secs(1);
const MISSING_FILE: &str = "No such file";

/// `screenrecord` options
#[derive(Debug, Clone, Default)]
pub struct ScreenrecordOptions {
    /// `WIDTHxHEIGHT`
    pub video_size: Option<String>,
    /// Bits per second
    pub bit_rate: Option<u32>,
    /// Seconds, the device caps it at 180
    pub time_limit: Option<u32>,
    /// Overlay build information
    pub bug_report: bool,
}

impl ScreenrecordOptions {
    fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(ref size) = self.video_size {
            args.push("--size".to_string());
            args.push(size.clone());
        }
        if let Some(rate) = self.bit_rate {
            args.push("--bit-rate".to_string());
            args.push(rate.to_string());
        }
        if let Some(limit) = self.time_limit {
            args.push("--time-limit".to_string());
            args.push(limit.to_string());
        }
        if self.bug_report {
            args.push("--bugreport".to_string());
        }
        args
    }
}

impl AdbClient {
    /// Forward a host port to a device port
    pub async fn forward_port(&self, system_port: u16, device_port: u16) -> Result<()> {
        debug!("Forwarding system: {} to device: {}", system_port, device_port);
        self.execute(
            &["forward".to_string(), format!("tcp:{}", system_port), format!("tcp:{}", device_port)],
            &ExecOptions::default(),
        )
        .await?;
        Ok(())
    }

    pub async fn remove_port_forward(&self, system_port: u16) -> Result<()> {
        debug!("Removing forwarded port socket connection: {}", system_port);
        self.execute(
            &["forward".to_string(), "--remove".to_string(), format!("tcp:{}", system_port)],
            &ExecOptions::default(),
        )
        .await?;
        Ok(())
    }

    /// Reverse a port (device connects to host)
    pub async fn reverse_port(&self, device_port: u16, system_port: u16) -> Result<()> {
        debug!("Forwarding device: {} to system: {}", device_port, system_port);
        self.execute(
            &["reverse".to_string(), format!("tcp:{}", device_port), format!("tcp:{}", system_port)],
            &ExecOptions::default(),
        )
        .await?;
        Ok(())
    }

    pub async fn remove_port_reverse(&self, device_port: u16) -> Result<()> {
        debug!("Removing reversed port socket connection: {}", device_port);
        self.execute(
            &["reverse".to_string(), "--remove".to_string(), format!("tcp:{}", device_port)],
            &ExecOptions::default(),
        )
        .await?;
        Ok(())
    }

    /// Forward a host port to an abstract device socket
    pub async fn forward_abstract_port(&self, system_port: u16, device_socket: &str) -> Result<()> {
        debug!("Forwarding system: {} to abstract device: {}", system_port, device_socket);
        self.execute(
            &[
                "forward".to_string(),
                format!("tcp:{}", system_port),
                format!("localabstract:{}", device_socket),
            ],
            &ExecOptions::default(),
        )
        .await?;
        Ok(())
    }

    /// Whether the device shell answers
    pub async fn ping(&self) -> Result<bool> {
        let output = self.shell(["echo", "ping"], &ShellOptions::default()).await?;
        Ok(output.starts_with("ping"))
    }

    async fn device_answers(&self, timeout: Duration) -> Result<bool> {
        self.execute(&["wait-for-device"], &ExecOptions::with_timeout(timeout)).await?;
        self.ping().await
    }

    /// Block until the selected device accepts shell commands
    pub async fn wait_for_device(&self, timeout: Duration) -> Result<()> {
        let ready = wait_for(timeout, WAIT_FOR_DEVICE_INTERVAL, || async move {
            match self.device_answers(timeout).await {
                Ok(true) => Some(()),
                Ok(false) => None,
                Err(e) => {
                    info!("Device is not answering yet, restarting adb: {}", e);
                    self.restart_adb().await;
                    None
                }
            }
        })
        .await;

        ready.ok_or_else(|| {
            BridgeError::Timeout(format!("Device is not ready after {}ms", timeout.as_millis()))
        })
    }

    /// Capture a bug report
    pub async fn bugreport(&self, timeout: Option<Duration>) -> Result<String> {
        let timeout = timeout.unwrap_or(BUGREPORT_TIMEOUT);
        self.execute(&["bugreport"], &ExecOptions::with_timeout(timeout)).await
    }

    /// Push a file to device
    pub async fn push(&self, local: &Path, remote: &str) -> Result<()> {
        let local = local.to_string_lossy();
        self.execute(&["push", &*local, remote], &ExecOptions::default())
            .await?;
        Ok(())
    }

    /// Pull a file from device
    pub async fn pull(&self, remote: &str, local: &Path) -> Result<()> {
        let local = local.to_string_lossy();
        self.execute(&["pull", remote, &*local], &ExecOptions::with_timeout(PULL_TIMEOUT))
            .await?;
        Ok(())
    }

    /// Entries listed for `path`, empty when it does not exist
    pub async fn ls(&self, path: &str) -> Result<Vec<String>> {
        match self.shell(["ls", path], &ShellOptions::default()).await {
            Ok(output) => Ok(output
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.contains(MISSING_FILE))
                .map(str::to_string)
                .collect()),
            Err(e) if e.text_surface().contains(MISSING_FILE) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    pub async fn file_exists(&self, path: &str) -> Result<bool> {
        Ok(!self.ls(path).await?.is_empty())
    }

    /// Start recording the screen to `destination` on the device
    pub fn screenrecord(&self, destination: &str, opts: &ScreenrecordOptions) -> Result<SubProcess> {
        let mut args = vec!["shell".to_string(), "screenrecord".to_string()];
        args.extend(opts.to_args());
        args.push(destination.to_string());
        self.create_subprocess(&args, &HashMap::new())
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

    #[tokio::test]
    async fn test_port_commands() {
        let runner = FakeRunner::new(|_| ProcessOutput::ok(""));
        let client = client_with(BridgeConfig::default(), runner.clone(), FakeConsole::new()).await;
        client.set_device_id("emulator-5554");

        client.forward_port(8200, 6790).await.unwrap();
        client.remove_port_forward(8200).await.unwrap();
        client.reverse_port(8081, 8081).await.unwrap();
        client.remove_port_reverse(8081).await.unwrap();
        client.forward_abstract_port(9222, "chrome_devtools_remote").await.unwrap();

        let lines: Vec<String> = runner.calls().iter().map(|c| c.line()).collect();
        assert_eq!(
            lines,
            vec![
                "forward tcp:8200 tcp:6790",
                "forward --remove tcp:8200",
                "reverse tcp:8081 tcp:8081",
                "reverse --remove tcp:8081",
                "forward tcp:9222 localabstract:chrome_devtools_remote",
            ]
        );
    }

    #[tokio::test]
    async fn test_ls_and_file_exists() {
        let runner = FakeRunner::new(|call| match call.line().as_str() {
            "shell ls /sdcard" => ProcessOutput::ok("Download\nMusic\n"),
            "shell ls /old" => ProcessOutput::ok("ls: /old: No such file or directory\n"),
            _ => ProcessOutput::failed(1, "ls: /missing: No such file or directory"),
        });
        let client = client_with(BridgeConfig::default(), runner, FakeConsole::new()).await;

        assert_eq!(client.ls("/sdcard").await.unwrap(), vec!["Download", "Music"]);
        assert!(client.ls("/old").await.unwrap().is_empty());
        assert!(client.file_exists("/sdcard").await.unwrap());
        assert!(!client.file_exists("/missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_pull_uses_longer_timeout() {
        let runner = FakeRunner::new(|_| ProcessOutput::ok("1 file pulled"));
        let client = client_with(BridgeConfig::default(), runner.clone(), FakeConsole::new()).await;

        client.pull("/sdcard/video.mp4", Path::new("/tmp/video.mp4")).await.unwrap();
        let call = runner.calls().pop().unwrap();
        assert_eq!(call.line(), "pull /sdcard/video.mp4 /tmp/video.mp4");
        assert_eq!(call.timeout, Some(PULL_TIMEOUT));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_device_restarts_until_ping() {
        let pings = Arc::new(AtomicUsize::new(0));
        let counter = pings.clone();
        let runner = FakeRunner::new(move |call| {
            if call.is("shell echo ping") {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    return ProcessOutput::failed(1, "error: closed");
                }
                return ProcessOutput::ok("ping\n");
            }
            ProcessOutput::ok("")
        });
        let client = client_with(BridgeConfig::default(), runner.clone(), FakeConsole::new()).await;

        client.wait_for_device(Duration::from_secs(30)).await.unwrap();
        assert_eq!(pings.load(Ordering::SeqCst), 2);
        assert_eq!(runner.count(|c| c.is("kill-server")), 1);
    }

    #[tokio::test]
    async fn test_screenrecord_subprocess() {
        let runner = FakeRunner::new(|_| ProcessOutput::ok(""));
        let client = client_with(BridgeConfig::default(), runner.clone(), FakeConsole::new()).await;
        client.set_device_id("R58M123");

        let opts = ScreenrecordOptions {
            time_limit: Some(10),
            bit_rate: Some(4_000_000),
            ..Default::default()
        };
        let mut recording = client.screenrecord("/sdcard/rec.mp4", &opts).unwrap();
        assert!(recording.is_running());

        let call = runner.calls().pop().unwrap();
        assert_eq!(&call.args[..2], &["-s", "R58M123"]);
        assert_eq!(
            call.line(),
            "shell screenrecord --bit-rate 4000000 --time-limit 10 /sdcard/rec.mp4"
        );

        recording.kill().await;
        assert!(!recording.is_running());
    }
}
