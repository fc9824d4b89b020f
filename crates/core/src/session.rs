//! Session State
//!
//! The bridge executable with its fixed arguments, and the per-device
//! caches that must be dropped when the target device changes.

use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

/// Device selector flag understood by the bridge binary
const DEVICE_SELECTOR: &str = "-s";

/// The bridge binary and the arguments prepended to every invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executable {
    pub path: PathBuf,
    pub default_args: Vec<String>,
}

impl Executable {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            default_args: Vec::new(),
        }
    }

    pub fn with_default_args(mut self, args: Vec<String>) -> Self {
        self.default_args = args;
        self
    }

    /// Point every following invocation at `udid`.
    ///
    /// An existing selector pair is replaced in place.
    pub fn set_device_selector(&mut self, udid: &str) {
        match self.default_args.iter().position(|a| a == DEVICE_SELECTOR) {
            Some(idx) if idx + 1 < self.default_args.len() => {
                self.default_args[idx + 1] = udid.to_string();
            }
            Some(idx) => {
                self.default_args.truncate(idx);
                self.default_args.push(DEVICE_SELECTOR.to_string());
                self.default_args.push(udid.to_string());
            }
            None => {
                self.default_args.push(DEVICE_SELECTOR.to_string());
                self.default_args.push(udid.to_string());
            }
        }
    }

    /// Currently selected device, if any
    pub fn device_selector(&self) -> Option<&str> {
        self.default_args
            .iter()
            .position(|a| a == DEVICE_SELECTOR)
            .and_then(|idx| self.default_args.get(idx + 1))
            .map(String::as_str)
    }

    /// Full argument list for an invocation: default args first, untouched
    pub fn command_args<S: AsRef<str>>(&self, args: &[S]) -> Vec<String> {
        let mut full = self.default_args.clone();
        full.extend(args.iter().map(|a| a.as_ref().to_string()));
        full
    }
}

/// Cached answers of "does the device shell support X" checks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellCapabilities {
    pub pgrep_available: Option<bool>,
    pub pidof_available: Option<bool>,
}

/// Mutable state of one managed device
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    device_id: Option<String>,
    emulator_port: Option<u16>,
    capabilities: ShellCapabilities,
    features: HashMap<String, Vec<String>>,
    api_levels: HashMap<String, u32>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn emulator_port(&self) -> Option<u16> {
        self.emulator_port
    }

    pub fn set_emulator_port(&mut self, port: Option<u16>) {
        self.emulator_port = port;
    }

    /// Switch the session to another device.
    ///
    /// Capability answers belong to the previous device and are dropped.
    /// Per-device caches stay keyed by udid.
    pub fn select_device(&mut self, udid: &str) {
        if self.device_id.as_deref() == Some(udid) {
            return;
        }
        debug!("Session switching to device {}", udid);
        self.device_id = Some(udid.to_string());
        self.capabilities = ShellCapabilities::default();
    }

    /// Drop every cached capability, e.g. after a bridge server restart
    pub fn invalidate(&mut self) {
        self.capabilities = ShellCapabilities::default();
        self.features.clear();
        self.api_levels.clear();
    }

    pub fn capabilities(&self) -> &ShellCapabilities {
        &self.capabilities
    }

    pub fn capabilities_mut(&mut self) -> &mut ShellCapabilities {
        &mut self.capabilities
    }

    pub fn cached_features(&self, udid: &str) -> Option<&Vec<String>> {
        self.features.get(udid)
    }

    pub fn cache_features(&mut self, udid: &str, features: Vec<String>) {
        self.features.insert(udid.to_string(), features);
    }

    pub fn cached_api_level(&self, udid: &str) -> Option<u32> {
        self.api_levels.get(udid).copied()
    }

    pub fn cache_api_level(&mut self, udid: &str, level: u32) {
        self.api_levels.insert(udid.to_string(), level);
    }
}
