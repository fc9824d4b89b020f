//! droid-sys - Android system call layer
//!
//! Runs the Android Debug Bridge and the emulator on behalf of test
//! automation tooling.
//!
//! ## Architecture
//!
//! droid-sys is organized into specialized crates:
//!
//! - `droid-sys-core`: errors, configuration and per-device session state
//! - `droid-sys-toolchain`: SDK binary lookup and tools version detection
//! - `droid-sys-bridge`: bridge execution, devices, emulators and certificates

#![warn(clippy::all)]

pub mod commands;

// Re-export main components for library usage
pub use droid_sys_core as core;
pub use droid_sys_toolchain as toolchain;
pub use droid_sys_bridge as bridge;

/// Prelude module for convenient imports
pub mod prelude {
    pub use droid_sys_core::{BridgeConfig, BridgeError, Result};
    pub use droid_sys_toolchain::BinaryLocator;
    pub use droid_sys_bridge::{
        AdbClient, CertificateData, Device, DeviceState, Emulator, EmulatorInstance, ExecOptions,
        LaunchOptions, ShellOptions,
    };
}
