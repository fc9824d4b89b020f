//! Android Toolchain Lookup
//!
//! Resolves absolute paths of:
//! - the bridge binary (platform tools)
//! - the emulator binary
//! - SDK management tools and build tools
//! - anything else reachable through `PATH`

pub mod locator;
pub mod sdk_version;

pub use locator::{binary_name_for_os, BinaryLocator, LocatorError, PathLookup};
pub use sdk_version::{build_tools_dirs, parse_version, SdkToolsVersion};

/// SDK subdirectories searched for binaries, in priority order
pub const SDK_BINARY_DIRS: &[&str] = &[
    "platform-tools",
    "emulator",
    "cmdline-tools/latest/bin",
    "tools",
    "tools/bin",
    ".",
];

/// Tools shipped as batch scripts on Windows
pub const BATCH_TOOLS: &[&str] = &["android", "apksigner", "apkanalyzer"];
