//! Error types for droid-sys
//!
//! Centralized error handling using thiserror.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for the bridge layer
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Could not find '{binary}' in {searched:?}.{}", pinned_hint(.build_tools_version))]
    BinaryNotFound {
        binary: String,
        searched: Vec<String>,
        build_tools_version: Option<String>,
    },

    #[error("Cannot start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Error executing `{command}`. Original error: '{message}'; Command output: {}", command_output(.stderr, .stdout))]
    ExecFailed {
        command: String,
        code: i32,
        message: String,
        stdout: String,
        stderr: String,
    },

    #[error("Error executing `{command}`. Original error: '{message}'. Try to increase the {timeout_ms}ms execution timeout represented by '{timeout_cap_name}'")]
    ExecTimeout {
        command: String,
        message: String,
        timeout_ms: u64,
        timeout_cap_name: String,
    },

    #[error("Could not find a connected Android device in {0}ms")]
    NoDevices(u64),

    #[error("No device has been selected")]
    DeviceNotSelected,

    #[error("Avd '{name}' is not available. Please select your avd name from one of these: '{}'", .available.join(", "))]
    AvdNotFound { name: String, available: Vec<String> },

    #[error("SDK version error: {0}")]
    SdkVersion(String),

    #[error("Emulator console error: {0}")]
    Console(String),

    #[error("Cannot inject the custom certificate. Is the certificate properly encoded? Do you have root permissions on the device? Original error: {0}")]
    Certificate(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

fn pinned_hint(version: &Option<String>) -> String {
    match version {
        Some(v) => format!(" Do you have Android Build Tools v {} installed?", v),
        None => String::new(),
    }
}

fn command_output(stderr: &str, stdout: &str) -> String {
    if !stderr.trim().is_empty() {
        stderr.trim().to_string()
    } else if !stdout.trim().is_empty() {
        stdout.trim().to_string()
    } else {
        "<empty>".to_string()
    }
}

impl BridgeError {
    /// Stderr captured from a failed command, if any
    pub fn stderr(&self) -> Option<&str> {
        match self {
            BridgeError::ExecFailed { stderr, .. } => Some(stderr),
            _ => None,
        }
    }

    /// Full text surface used for error classification
    pub fn text_surface(&self) -> String {
        match self {
            BridgeError::ExecFailed {
                message,
                stdout,
                stderr,
                ..
            } => format!("{}{}{}", message, stdout, stderr),
            other => other.to_string(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            BridgeError::ExecTimeout { .. } | BridgeError::Timeout(_) | BridgeError::NoDevices(_)
        )
    }

    /// Transient failure kind, if the error text matches one
    pub fn transient_kind(&self) -> Option<TransientKind> {
        TransientKind::classify(&self.text_surface())
    }

    /// Whether reconnecting and retrying could fix this error
    pub fn is_transient(&self) -> bool {
        self.transient_kind().is_some()
    }
}

/// Failures that usually go away after the device reconnects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    ProtocolFault,
    DeviceNotFound,
    DeviceConnecting,
}

static TRANSIENT_ERRORS: Lazy<Vec<(Regex, TransientKind)>> = Lazy::new(|| {
    [
        (r"(?i)protocol fault \(no status\)", TransientKind::ProtocolFault),
        (r"(?i)error: device ('.+' )?not found", TransientKind::DeviceNotFound),
        (r"(?i)error: device still connecting", TransientKind::DeviceConnecting),
    ]
    .into_iter()
    .map(|(pattern, kind)| (Regex::new(pattern).expect("valid transient error pattern"), kind))
    .collect()
});

impl TransientKind {
    /// Match an error text against the transient error table
    pub fn classify(text: &str) -> Option<Self> {
        TRANSIENT_ERRORS
            .iter()
            .find(|(re, _)| re.is_match(text))
            .map(|(_, kind)| *kind)
    }
}

impl std::fmt::Display for TransientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransientKind::ProtocolFault => "protocol fault",
            TransientKind::DeviceNotFound => "device not found",
            TransientKind::DeviceConnecting => "device still connecting",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_failed_prefers_stderr() {
        let err = BridgeError::ExecFailed {
            command: "adb devices".into(),
            code: 1,
            message: "exited with code 1".into(),
            stdout: "out".into(),
            stderr: "error: closed".into(),
        };
        let text = err.to_string();
        assert!(text.contains("exited with code 1"));
        assert!(text.contains("Command output: error: closed"));
        assert_eq!(err.stderr(), Some("error: closed"));
    }

    #[test]
    fn test_exec_failed_empty_output() {
        let err = BridgeError::ExecFailed {
            command: "adb root".into(),
            code: 1,
            message: "boom".into(),
            stdout: String::new(),
            stderr: "  ".into(),
        };
        assert!(err.to_string().ends_with("Command output: <empty>"));
    }

    #[test]
    fn test_timeout_mentions_cap_name() {
        let err = BridgeError::ExecTimeout {
            command: "adb shell sleep 100".into(),
            message: "timed out".into(),
            timeout_ms: 20000,
            timeout_cap_name: "adbExecTimeout".into(),
        };
        let text = err.to_string();
        assert!(text.contains("20000ms"));
        assert!(text.contains("'adbExecTimeout'"));
        assert!(err.is_timeout());
    }

    #[test]
    fn test_binary_not_found_lists_locations() {
        let err = BridgeError::BinaryNotFound {
            binary: "aapt".into(),
            searched: vec!["/sdk/platform-tools/aapt".into(), "$PATH".into()],
            build_tools_version: Some("30.0.3".into()),
        };
        let text = err.to_string();
        assert!(text.contains("/sdk/platform-tools/aapt"));
        assert!(text.contains("v 30.0.3"));
    }

    #[test]
    fn test_avd_not_found_lists_available() {
        let err = BridgeError::AvdNotFound {
            name: "Pixel".into(),
            available: vec!["Nexus_5X".into(), "Pixel_6".into()],
        };
        assert!(err.to_string().contains("Nexus_5X, Pixel_6"));
    }

    #[test]
    fn test_transient_classification() {
        assert_eq!(
            TransientKind::classify("adb: error: protocol fault (no status)"),
            Some(TransientKind::ProtocolFault)
        );
        assert_eq!(
            TransientKind::classify("error: device 'emulator-5554' not found"),
            Some(TransientKind::DeviceNotFound)
        );
        assert_eq!(
            TransientKind::classify("error: device not found"),
            Some(TransientKind::DeviceNotFound)
        );
        assert_eq!(
            TransientKind::classify("error: device still connecting"),
            Some(TransientKind::DeviceConnecting)
        );
        assert_eq!(TransientKind::classify("error: device unauthorized"), None);
    }

    #[test]
    fn test_exec_error_is_transient() {
        let err = BridgeError::ExecFailed {
            command: "adb shell ls".into(),
            code: 1,
            message: "exited with code 1".into(),
            stdout: String::new(),
            stderr: "error: protocol fault (no status)".into(),
        };
        assert!(err.is_transient());
        assert!(!BridgeError::DeviceNotSelected.is_transient());
    }
}
