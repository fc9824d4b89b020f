//! droid-sys Core - shared types
//!
//! Errors, configuration and the per-device session state used by the
//! toolchain and bridge crates.

pub mod config;
pub mod error;
pub mod session;

pub use config::BridgeConfig;
pub use error::{BridgeError, Result, TransientKind};
pub use session::{ShellCapabilities, Executable, SessionState};

/// droid-sys version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
