//! Bridge Configuration
//!
//! Settings shared by the executor, the binary locator and the emulator
//! controller:
//! - Android SDK location and pinned build-tools version
//! - bridge server host/port selection
//! - per-operation timeouts

use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;

/// Default timeout for a single bridge command
pub const DEFAULT_EXEC_TIMEOUT_MS: u64 = 20_000;

/// Default timeout for waiting until a device shows up
pub const DEFAULT_DISCOVERY_TIMEOUT_MS: u64 = 20_000;

/// Configuration name reported when a command hangs
pub const DEFAULT_TIMEOUT_CAP_NAME: &str = "adbExecTimeout";

/// Env var that enables the failure dump
pub const DEBUG_DUMP_ENV: &str = "DROID_SYS_DEBUG_DUMP";

/// Bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Path to Android SDK root
    pub sdk_root: Option<PathBuf>,
    /// Only use build-tools of this exact version
    pub build_tools_version: Option<String>,
    /// Bridge server port (`-P`)
    pub adb_port: Option<u16>,
    /// Remote bridge server host (`-H`)
    pub remote_adb_host: Option<String>,
    /// Timeout for a single bridge command, in milliseconds
    pub exec_timeout_ms: u64,
    /// Name reported in hung-command errors
    pub timeout_cap_name: String,
    /// How long discovery keeps retrying, in milliseconds
    pub device_discovery_timeout_ms: u64,
    /// Keep offline devices in discovery results
    pub allow_offline_devices: bool,
    /// Append raw failure output to this file
    pub debug_dump: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            sdk_root: None,
            build_tools_version: None,
            adb_port: None,
            remote_adb_host: None,
            exec_timeout_ms: DEFAULT_EXEC_TIMEOUT_MS,
            timeout_cap_name: DEFAULT_TIMEOUT_CAP_NAME.to_string(),
            device_discovery_timeout_ms: DEFAULT_DISCOVERY_TIMEOUT_MS,
            allow_offline_devices: false,
            debug_dump: None,
        }
    }
}

impl BridgeConfig {
    /// Build a configuration from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let sdk_root = ["ANDROID_HOME", "ANDROID_SDK_ROOT"]
            .iter()
            .filter_map(|key| lookup(key))
            .find(|value| !value.trim().is_empty())
            .map(PathBuf::from);

        let debug_dump = lookup(DEBUG_DUMP_ENV)
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);

        debug!("SDK root from environment: {:?}", sdk_root);

        Self {
            sdk_root,
            debug_dump,
            ..Default::default()
        }
    }

    /// Load configuration from a TOML file
    pub async fn load(path: &Path) -> Result<Self> {
        info!("Loading configuration from {:?}", path);
        let content = tokio::fs::read_to_string(path).await?;
        let config: BridgeConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration as TOML
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Default configuration file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("droid-sys")
            .join("config.toml")
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_millis(self.exec_timeout_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.device_discovery_timeout_ms)
    }

    /// Arguments prepended to every bridge invocation before a device is selected
    pub fn default_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(ref host) = self.remote_adb_host {
            args.push("-H".to_string());
            args.push(host.clone());
        }
        if let Some(port) = self.adb_port {
            args.push("-P".to_string());
            args.push(port.to_string());
        }
        args
    }
}
