//! Privilege Manager
//!
//! Switches the device daemon between rooted and unrooted. Changes are
//! best-effort: failures come back as a [`PrivilegeResult`], never as an
//! error.

use serde::Serialize;
use tracing::{debug, info, warn};

use droid_sys_core::Result;

use crate::adb::{AdbClient, ExecOptions};

const ROOT_USER: &str = "root";
const ROOT_REFUSED: &str = "adbd cannot run as root";
const ALREADY_ROOTED: &str = "already running as root";
const OFFLINE_MARKERS: [&str; 2] = ["closed", "device offline"];

/// Outcome of a privilege change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PrivilegeResult {
    pub is_successful: bool,
    /// Whether the daemon was rooted before the call
    pub was_already_rooted: bool,
}

impl PrivilegeResult {
    fn failed(was_already_rooted: bool) -> Self {
        Self {
            is_successful: false,
            was_already_rooted,
        }
    }
}

impl AdbClient {
    /// Whether the device shell runs as root
    pub async fn is_root(&self) -> Result<bool> {
        let user = self.execute(&["shell", "whoami"], &ExecOptions::default()).await?;
        Ok(user.trim() == ROOT_USER)
    }

    /// Move the daemon to the requested privilege level
    pub async fn change_user_privileges(&self, to_root: bool) -> PrivilegeResult {
        let command = if to_root { "root" } else { "unroot" };

        let is_root = match self.is_root().await {
            Ok(is_root) => is_root,
            Err(e) => {
                warn!("Cannot tell whether adbd runs as root, skipping '{}': {}", command, e);
                return PrivilegeResult::failed(false);
            }
        };

        if is_root == to_root {
            debug!("adbd already runs {}", if is_root { "as root" } else { "unrooted" });
            return PrivilegeResult {
                is_successful: true,
                was_already_rooted: is_root,
            };
        }

        info!("{} adbd", if to_root { "Rooting" } else { "Unrooting" });
        let output = match self.exec_raw(&[command], self.config.exec_timeout()).await {
            Ok(output) => output,
            Err(e) => {
                warn!("Unable to {} adb daemon: {}. Continuing", command, e);
                return PrivilegeResult::failed(is_root);
            }
        };

        if output.stdout.contains(ROOT_REFUSED) {
            warn!("{}", output.stdout.trim());
            return PrivilegeResult::failed(is_root);
        }

        if !output.success() {
            let stderr = output.stderr.to_lowercase();
            if OFFLINE_MARKERS.iter().any(|marker| stderr.contains(marker)) {
                warn!(
                    "Attempt to '{}' caused the device to go offline. Restarting adb",
                    command
                );
                self.restart_adb().await;
            }
            warn!(
                "Unable to {} adb daemon. Original error: '{}'. Stderr: '{}'. Continuing",
                command,
                output.failure_message(),
                output.stderr.trim()
            );
            return PrivilegeResult::failed(is_root);
        }

        PrivilegeResult {
            is_successful: true,
            was_already_rooted: is_root || output.stdout.contains(ALREADY_ROOTED),
        }
    }

    pub async fn root(&self) -> PrivilegeResult {
        self.change_user_privileges(true).await
    }

    pub async fn unroot(&self) -> PrivilegeResult {
        self.change_user_privileges(false).await
    }
}
