//! Binary Locator
//!
//! Finds SDK binaries under the SDK root, falling back to `PATH`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use which::which;

use droid_sys_core::{BridgeConfig, BridgeError};

use crate::sdk_version::build_tools_dirs;
use crate::{BATCH_TOOLS, SDK_BINARY_DIRS};

/// Marker recorded in the searched-locations list for the `PATH` lookup
const PATH_MARKER: &str = "$PATH";

/// Function used to look a binary up in `PATH`
pub type PathLookup = Arc<dyn Fn(&str) -> Option<PathBuf> + Send + Sync>;

/// Binary lookup errors
#[derive(Debug, thiserror::Error)]
pub enum LocatorError {
    #[error("Could not find '{binary}' in {searched:?}")]
    NotFound {
        binary: String,
        searched: Vec<String>,
        build_tools_version: Option<String>,
    },
}

impl From<LocatorError> for BridgeError {
    fn from(err: LocatorError) -> Self {
        match err {
            LocatorError::NotFound {
                binary,
                searched,
                build_tools_version,
            } => BridgeError::BinaryNotFound {
                binary,
                searched,
                build_tools_version,
            },
        }
    }
}

/// OS-specific file name of an SDK binary
pub fn binary_name_for_os(name: &str) -> String {
    binary_name_for(name, cfg!(windows))
}

fn binary_name_for(name: &str, windows: bool) -> String {
    if !windows {
        return name.to_string();
    }
    if BATCH_TOOLS.contains(&name) {
        return format!("{}.bat", name);
    }
    if Path::new(name).extension().is_none() {
        return format!("{}.exe", name);
    }
    name.to_string()
}

/// Resolves and caches absolute binary paths
pub struct BinaryLocator {
    sdk_root: Option<PathBuf>,
    build_tools_version: Option<String>,
    cache: Mutex<HashMap<String, PathBuf>>,
    path_lookup: PathLookup,
}

impl BinaryLocator {
    /// Create a locator for the given SDK root
    pub fn new(sdk_root: Option<PathBuf>, build_tools_version: Option<String>) -> Self {
        Self {
            sdk_root,
            build_tools_version,
            cache: Mutex::new(HashMap::new()),
            path_lookup: Arc::new(|name: &str| which(name).ok()),
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.sdk_root.clone(), config.build_tools_version.clone())
    }

    /// Replace the `PATH` lookup
    pub fn with_path_lookup(mut self, lookup: PathLookup) -> Self {
        self.path_lookup = lookup;
        self
    }

    pub fn sdk_root(&self) -> Option<&Path> {
        self.sdk_root.as_deref()
    }

    pub fn build_tools_version(&self) -> Option<&str> {
        self.build_tools_version.as_deref()
    }

    /// Previously resolved path, if any
    pub fn cached(&self, name: &str) -> Option<PathBuf> {
        self.cache.lock().get(name).cloned()
    }

    /// Candidate locations under the SDK root, in search order
    pub async fn sdk_candidates(&self, name: &str) -> Vec<PathBuf> {
        let Some(ref sdk_root) = self.sdk_root else {
            return Vec::new();
        };
        let full_name = binary_name_for_os(name);

        let mut candidates: Vec<PathBuf> = SDK_BINARY_DIRS
            .iter()
            .map(|dir| sdk_root.join(dir).join(&full_name))
            .collect();

        let mut tools = build_tools_dirs(sdk_root).await;
        if let Some(ref pinned) = self.build_tools_version {
            tools.retain(|dir| dir.file_name().map(|n| n == pinned.as_str()).unwrap_or(false));
            if tools.is_empty() {
                info!("Found no build tools whose version matches '{}'", pinned);
            } else {
                info!("Using build tools at {:?}", tools);
            }
        }
        candidates.extend(tools.into_iter().map(|dir| dir.join(&full_name)));
        candidates
    }

    /// Resolve `name` to an absolute path.
    ///
    /// The SDK root wins over `PATH`. Only successful lookups are cached.
    pub async fn resolve(&self, name: &str) -> Result<PathBuf, LocatorError> {
        if let Some(path) = self.cached(name) {
            return Ok(path);
        }

        let full_name = binary_name_for_os(name);
        let candidates = self.sdk_candidates(name).await;

        for candidate in &candidates {
            if tokio::fs::metadata(candidate).await.is_ok() {
                info!("Using '{}' from '{}'", full_name, candidate.display());
                return Ok(self.remember(name, candidate.clone()));
            }
        }

        if self.sdk_root.is_none() {
            warn!(
                "The Android SDK root is not set (ANDROID_HOME). Looking for '{}' in PATH",
                full_name
            );
        } else {
            debug!("'{}' not found under the SDK root, trying PATH", full_name);
        }

        if let Some(path) = (self.path_lookup)(&full_name) {
            info!("Using '{}' from '{}'", full_name, path.display());
            return Ok(self.remember(name, path));
        }

        let mut searched: Vec<String> = candidates.iter().map(|p| p.display().to_string()).collect();
        searched.push(PATH_MARKER.to_string());

        Err(LocatorError::NotFound {
            binary: full_name,
            searched,
            build_tools_version: self.build_tools_version.clone(),
        })
    }

    fn remember(&self, name: &str, path: PathBuf) -> PathBuf {
        self.cache.lock().insert(name.to_string(), path.clone());
        path
    }
}
