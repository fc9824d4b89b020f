//! Android Emulator Bridge
//!
//! System calls against Android devices and emulators: bridge command
//! execution, device discovery, root management, emulator lifecycle and
//! CA certificate installation.

pub mod adb;
pub mod avd;
pub mod certificate;
pub mod commands;
pub mod console;
pub mod device;
pub mod emulator;
pub mod features;
pub mod process;
pub mod root;
pub mod wait;

#[cfg(test)]
mod testing;

pub use adb::{AdbClient, AdbClientBuilder, BridgeVersion, ExecOptions, ShellCommand, ShellOptions};
pub use certificate::CertificateData;
pub use commands::ScreenrecordOptions;
pub use console::{EmulatorConsole, TcpConsole};
pub use device::{get_port_from_emulator_string, Device, DeviceState, Emulator};
pub use emulator::{EmulatorInstance, EmulatorState, LaunchOptions};
pub use process::{ExitInfo, ProcessEvent, ProcessOutput, ProcessRunner, SubProcess, TokioRunner};
pub use root::PrivilegeResult;
