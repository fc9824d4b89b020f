//! Emulator Console
//!
//! Plain-text line protocol spoken by a running emulator on its console
//! port. The emulator greets with a banner ending in `OK`; each command
//! answers with output lines ending in `OK` or a `KO: ...` error line.

use std::path::{Path, PathBuf};
use std::time::Duration;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::OnceCell;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use droid_sys_core::{BridgeError, Result};

/// File holding the console auth token, relative to the home directory
pub const AUTH_TOKEN_FILE: &str = ".emulator_console_auth_token";

const CONSOLE_HOST: &str = "127.0.0.1";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Sends commands to an emulator console
#[async_trait]
pub trait EmulatorConsole: Send + Sync {
    /// Run `command` on the console at `port`, returning its output
    async fn execute(&self, port: u16, command: &str) -> Result<String>;
}

/// Home directory from the platform's environment variable
fn home_dir() -> Option<PathBuf> {
    #[cfg(windows)]
    let var = "USERPROFILE";
    #[cfg(not(windows))]
    let var = "HOME";

    std::env::var_os(var)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Default location of the console auth token file
pub fn auth_token_path() -> Option<PathBuf> {
    home_dir().map(|home| home.join(AUTH_TOKEN_FILE))
}

/// Empty the console auth token so commands need no authentication.
///
/// Returns whether the token was reset. Failures are only logged.
pub async fn reset_auth_token(path: Option<&Path>) -> bool {
    let Some(path) = path else {
        warn!("No home directory found, cannot reset the emulator console auth token");
        return false;
    };
    match tokio::fs::write(path, "").await {
        Ok(()) => {
            info!("Emptied the emulator console auth token at {:?}", path);
            true
        }
        Err(e) => {
            warn!("Cannot reset the emulator console auth token at {:?}: {}", path, e);
            false
        }
    }
}

/// [`EmulatorConsole`] over TCP on the loopback interface
pub struct TcpConsole {
    host: String,
    auth_token_path: Option<PathBuf>,
    auth_reset: OnceCell<bool>,
}

impl TcpConsole {
    pub fn new() -> Self {
        Self {
            host: CONSOLE_HOST.to_string(),
            auth_token_path: auth_token_path(),
            auth_reset: OnceCell::new(),
        }
    }

    /// Use another auth token file
    pub fn with_auth_token_path(mut self, path: Option<PathBuf>) -> Self {
        self.auth_token_path = path;
        self
    }

    async fn ensure_auth_reset(&self) -> bool {
        *self
            .auth_reset
            .get_or_init(|| reset_auth_token(self.auth_token_path.as_deref()))
            .await
    }

    async fn converse(&self, port: u16, command: &str) -> Result<String> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect((self.host.as_str(), port)))
            .await
            .map_err(|_| BridgeError::Console(format!("Timed out connecting to console port {}", port)))?
            .map_err(|e| BridgeError::Console(format!("Cannot connect to console port {}: {}", port, e)))?;

        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        // Greeting
        loop {
            match lines.next_line().await? {
                Some(line) if line.trim() == "OK" => break,
                Some(_) => continue,
                None => {
                    return Err(BridgeError::Console(format!(
                        "Console on port {} closed before greeting",
                        port
                    )))
                }
            }
        }

        write.write_all(format!("{}\r\n", command).as_bytes()).await?;
        write.flush().await?;

        let mut output = Vec::new();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line == "OK" {
                break;
            }
            if line.starts_with("KO") {
                return Err(BridgeError::Console(format!(
                    "Command '{}' failed on port {}: {}",
                    command, port, line
                )));
            }
            if line.starts_with("OK:") {
                output.push(line.to_string());
                break;
            }
            output.push(line.to_string());
        }

        let _ = write.shutdown().await;
        Ok(output.join("\n").trim().to_string())
    }
}

impl Default for TcpConsole {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmulatorConsole for TcpConsole {
    async fn execute(&self, port: u16, command: &str) -> Result<String> {
        self.ensure_auth_reset().await;
        debug!("Sending '{}' to the emulator console on port {}", command, port);

        timeout(COMMAND_TIMEOUT, self.converse(port, command))
            .await
            .map_err(|_| {
                BridgeError::Console(format!(
                    "No answer to '{}' from console port {} within {}ms",
                    command,
                    port,
                    COMMAND_TIMEOUT.as_millis()
                ))
            })?
    }
}
