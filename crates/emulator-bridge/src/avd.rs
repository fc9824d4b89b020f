//! AVD (Android Virtual Device) listing
//!
//! Installed AVD names come from `emulator -list-avds`. Old emulators
//! lack that option; the SDK manager tool (`android` before tools 25,
//! `avdmanager` since) lists them instead.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use droid_sys_core::{BridgeError, Result};
use droid_sys_toolchain::SdkToolsVersion;

use crate::adb::{describe, exec_failure, AdbClient};

/// First SDK tools major version shipping `avdmanager`
const AVDMANAGER_SINCE_MAJOR: u32 = 25;

static UNKNOWN_OPTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"unknown option:\s*-list-avds").expect("valid option regex"));

/// Emulator log lines such as `INFO    | Storing crashdata`
static LOG_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z]+\s*\|").expect("valid log line regex"));

/// AVD name without the `@` shorthand prefix
pub fn normalize_avd_name(name: &str) -> &str {
    name.trim().trim_start_matches('@')
}

/// AVD names, one per line, without emulator log noise
pub fn parse_avd_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !LOG_LINE.is_match(line))
        .map(str::to_string)
        .collect()
}

/// Emulator arguments setting the system language, country and locale
pub fn locale_args(language: Option<&str>, country: Option<&str>) -> Vec<String> {
    let language = language.map(str::trim).filter(|l| !l.is_empty());
    let country = country.map(str::trim).filter(|c| !c.is_empty());
    let mut args = Vec::new();
    if let Some(language) = language {
        args.push("-prop".to_string());
        args.push(format!("persist.sys.language={}", language.to_lowercase()));
    }
    if let Some(country) = country {
        args.push("-prop".to_string());
        args.push(format!("persist.sys.country={}", country.to_uppercase()));
    }
    if let (Some(language), Some(country)) = (language, country) {
        args.push("-prop".to_string());
        args.push(format!(
            "persist.sys.locale={}-{}",
            language.to_lowercase(),
            country.to_uppercase()
        ));
    }
    args
}

impl AdbClient {
    /// Names of the installed AVDs
    pub async fn list_avds(&self) -> Result<Vec<String>> {
        let timeout = self.config.exec_timeout();
        let emulator = self.locator.resolve("emulator").await?;
        let args = vec!["-list-avds".to_string()];
        let output = self
            .runner
            .run(&emulator, &args, Some(timeout))
            .await
            .map_err(|source| BridgeError::Spawn {
                command: describe(&emulator, &args),
                source,
            })?;

        if output.success() {
            return Ok(parse_avd_list(&output.stdout));
        }
        if !UNKNOWN_OPTION.is_match(&output.stderr) {
            return Err(exec_failure(describe(&emulator, &args), output, timeout, &self.config.timeout_cap_name));
        }

        debug!("The emulator does not support -list-avds, asking the SDK manager");
        let sdk_root = self.locator.sdk_root().ok_or_else(|| {
            BridgeError::SdkVersion("Cannot detect SDK tools version without an SDK root".into())
        })?;
        let version = SdkToolsVersion::detect(sdk_root).await.ok_or_else(|| {
            BridgeError::SdkVersion(format!("Cannot parse SDK tools version under {:?}", sdk_root))
        })?;
        let manager = if version.major < AVDMANAGER_SINCE_MAJOR {
            "android"
        } else {
            "avdmanager"
        };
        debug!("SDK tools {} use '{}' to list AVDs", version.version, manager);

        let manager_path = self.locator.resolve(manager).await?;
        let args: Vec<String> = ["list", "avd", "-c"].iter().map(|a| a.to_string()).collect();
        let output = self
            .runner
            .run(&manager_path, &args, Some(timeout))
            .await
            .map_err(|source| BridgeError::Spawn {
                command: describe(&manager_path, &args),
                source,
            })?;
        if !output.success() {
            return Err(exec_failure(describe(&manager_path, &args), output, timeout, &self.config.timeout_cap_name));
        }
        Ok(parse_avd_list(&output.stdout))
    }

    /// Fail with the available names unless `avd_name` is installed
    pub async fn check_avd_exist(&self, avd_name: &str) -> Result<()> {
        let name = normalize_avd_name(avd_name);
        let available = self.list_avds().await?;
        if available.iter().any(|avd| avd == name) {
            return Ok(());
        }
        if available.is_empty() {
            warn!("No AVDs are installed");
        }
        Err(BridgeError::AvdNotFound {
            name: name.to_string(),
            available,
        })
    }
}
