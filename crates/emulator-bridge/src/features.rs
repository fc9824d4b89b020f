//! Device features and shell capability checks

use tracing::{debug, info};

use droid_sys_core::{BridgeError, Result};

use crate::adb::{AdbClient, ExecOptions, ShellOptions};

const API_LEVEL_PROP: &str = "ro.build.version.sdk";

impl AdbClient {
    /// Features advertised by the device's daemon, cached per device
    pub async fn list_features(&self) -> Result<Vec<String>> {
        let udid = self.current_device_id();
        if let Some(ref udid) = udid {
            if let Some(features) = self.session.lock().cached_features(udid) {
                return Ok(features.clone());
            }
        }

        let output = match self.execute(&["features"], &ExecOptions::default()).await {
            Ok(output) => output,
            Err(e) if e.text_surface().contains("unknown command") => {
                info!("The bridge binary does not support the 'features' command");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let features: Vec<String> = output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        debug!("Device features: {:?}", features);

        if let Some(ref udid) = udid {
            self.session.lock().cache_features(udid, features.clone());
        }
        Ok(features)
    }

    /// Whether the device shell has a usable `pgrep`
    pub async fn is_pgrep_available(&self) -> Result<bool> {
        if let Some(available) = self.session.lock().capabilities().pgrep_available {
            return Ok(available);
        }
        let output = self
            .shell("pgrep --help; echo $?", &ShellOptions::default())
            .await?;
        let available = last_exit_code(&output).map(|code| code <= 1).unwrap_or(false);
        self.session.lock().capabilities_mut().pgrep_available = Some(available);
        Ok(available)
    }

    /// Whether the device shell has `pidof`
    pub async fn is_pidof_available(&self) -> Result<bool> {
        if let Some(available) = self.session.lock().capabilities().pidof_available {
            return Ok(available);
        }
        let output = self
            .shell("which pidof > /dev/null 2>&1; echo $?", &ShellOptions::default())
            .await?;
        let available = last_exit_code(&output) == Some(0);
        self.session.lock().capabilities_mut().pidof_available = Some(available);
        Ok(available)
    }

    /// API level of the selected device, cached per device
    pub async fn get_api_level(&self) -> Result<u32> {
        let udid = self.current_device_id();
        if let Some(ref udid) = udid {
            if let Some(level) = self.session.lock().cached_api_level(udid) {
                return Ok(level);
            }
        }

        let output = self
            .shell(["getprop", API_LEVEL_PROP], &ShellOptions::default())
            .await?;
        let level: u32 = output.trim().parse().map_err(|_| {
            BridgeError::Parse(format!("The actual output '{}' cannot be converted to an API level", output))
        })?;
        debug!("Device API level: {}", level);

        if let Some(ref udid) = udid {
            self.session.lock().cache_api_level(udid, level);
        }
        Ok(level)
    }
}

/// Exit code echoed on the last output line
fn last_exit_code(output: &str) -> Option<i32> {
    output.lines().last()?.trim().parse().ok()
}
