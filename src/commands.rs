//! CLI commands for droid-sys
//!
//! Thin command-line front end over the bridge client, for scripting and
//! manual checks.

use std::path::PathBuf;
use std::time::Duration;
use anyhow::{anyhow, bail, Result};
use tracing::info;

use droid_sys_bridge::{AdbClient, CertificateData, LaunchOptions, ShellOptions};
use droid_sys_core::BridgeConfig;

/// Usage text printed for unknown commands
pub const USAGE: &str = "\
usage: droid-sys [-s <udid>] <command> [args]

commands:
  devices                 list connected devices
  avds                    list installed AVDs
  version                 print the bridge version
  launch <avd> [--headless]
                          launch an AVD and wait for boot
  kill [avd]              kill an emulator
  root | unroot           change the device daemon privileges
  shell <cmd>...          run a device shell command
  install-cert <file>     install a CA certificate
  cert-installed <file>   check whether a CA certificate is installed";

/// Parsed command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub device: Option<String>,
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Devices,
    Avds,
    Version,
    Launch { avd: String, headless: bool },
    Kill { avd: Option<String> },
    Root,
    Unroot,
    Shell { args: Vec<String> },
    InstallCert { path: PathBuf },
    CertInstalled { path: PathBuf },
}

impl Invocation {
    pub fn parse(args: &[String]) -> Result<Self> {
        let (device, rest) = match args {
            [flag, udid, rest @ ..] if flag == "-s" => (Some(udid.clone()), rest),
            _ => (None, args),
        };

        let (name, params) = rest
            .split_first()
            .ok_or_else(|| anyhow!("missing command\n{}", USAGE))?;

        let command = match (name.as_str(), params) {
            ("devices", []) => Command::Devices,
            ("avds", []) => Command::Avds,
            ("version", []) => Command::Version,
            ("launch", [avd]) => Command::Launch {
                avd: avd.clone(),
                headless: false,
            },
            ("launch", [avd, flag]) if flag == "--headless" => Command::Launch {
                avd: avd.clone(),
                headless: true,
            },
            ("kill", []) => Command::Kill { avd: None },
            ("kill", [avd]) => Command::Kill {
                avd: Some(avd.clone()),
            },
            ("root", []) => Command::Root,
            ("unroot", []) => Command::Unroot,
            ("shell", args) if !args.is_empty() => Command::Shell {
                args: args.to_vec(),
            },
            ("install-cert", [path]) => Command::InstallCert {
                path: PathBuf::from(path),
            },
            ("cert-installed", [path]) => Command::CertInstalled {
                path: PathBuf::from(path),
            },
            _ => bail!("unknown command '{}'\n{}", rest.join(" "), USAGE),
        };

        Ok(Self { device, command })
    }

    /// Run the command and print its result as JSON
    pub async fn execute(self, config: BridgeConfig) -> Result<()> {
        let exec_timeout = config.exec_timeout();
        let client = AdbClient::new(config).await?;
        if let Some(ref udid) = self.device {
            client.set_device_id(udid);
        }

        let output = match self.command {
            Command::Devices => serde_json::to_string_pretty(&client.list_devices().await?)?,
            Command::Avds => serde_json::to_string_pretty(&client.list_avds().await?)?,
            Command::Version => serde_json::to_string_pretty(&client.get_adb_version().await?)?,
            Command::Launch { avd, headless } => {
                let opts = if headless {
                    LaunchOptions::headless()
                } else {
                    LaunchOptions::default()
                };
                let instance = client.launch_avd(&avd, &opts).await?;
                info!("Emulator '{}' is ready", instance.avd_name);
                serde_json::to_string_pretty(&instance.emulator())?
            }
            Command::Kill { avd } => {
                let killed = client
                    .kill_emulator(avd.as_deref(), Duration::from_secs(60))
                    .await?;
                serde_json::to_string(&killed)?
            }
            Command::Root => serde_json::to_string_pretty(&client.root().await)?,
            Command::Unroot => serde_json::to_string_pretty(&client.unroot().await)?,
            Command::Shell { args } => {
                let opts = ShellOptions::with_timeout(exec_timeout);
                serde_json::to_string(&client.shell(args, &opts).await?)?
            }
            Command::InstallCert { path } => {
                let cert = CertificateData::Bytes(tokio::fs::read(&path).await?);
                client.install_certificate(&cert).await?;
                serde_json::to_string(&true)?
            }
            Command::CertInstalled { path } => {
                let cert = CertificateData::Bytes(tokio::fs::read(&path).await?);
                serde_json::to_string(&client.is_certificate_installed(&cert).await?)?
            }
        };

        println!("{}", output);
        Ok(())
    }
}
