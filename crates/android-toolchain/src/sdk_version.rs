//! SDK Tools Version
//!
//! Reads the installed SDK tools revision and orders build-tools directories.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

static REVISION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Pkg\.Revision=((\d+)(?:\.(\d+))?(?:\.(\d+))?)").expect("valid revision regex")
});

/// Installed SDK tools revision (`tools/source.properties`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdkToolsVersion {
    pub version: String,
    pub major: u32,
    pub minor: u32,
    pub build: u32,
}

impl SdkToolsVersion {
    /// Parse the content of a `source.properties` file
    pub fn parse(properties: &str) -> Option<Self> {
        let caps = REVISION_RE.captures(properties)?;
        let part = |idx: usize| {
            caps.get(idx)
                .and_then(|m| m.as_str().parse::<u32>().ok())
                .unwrap_or(0)
        };

        Some(Self {
            version: caps.get(1)?.as_str().to_string(),
            major: caps.get(2)?.as_str().parse().ok()?,
            minor: part(3),
            build: part(4),
        })
    }

    /// Read the tools revision of the SDK at `sdk_root`
    pub async fn detect(sdk_root: &Path) -> Option<Self> {
        let props = sdk_root.join("tools").join("source.properties");
        let content = match tokio::fs::read_to_string(&props).await {
            Ok(content) => content,
            Err(e) => {
                warn!("Cannot read {:?}: {}", props, e);
                return None;
            }
        };

        let version = Self::parse(&content);
        if version.is_none() {
            warn!("Cannot parse SDK tools revision from {:?}", props);
        }
        version
    }
}

/// Numeric components of a version string (`"30.0.3"` -> `[30, 0, 3]`).
///
/// Suffixes such as `-rc1` are ignored.
pub fn parse_version(s: &str) -> Option<Vec<u32>> {
    let numeric = s.split(&['-', ' '][..]).next()?;
    let parts: Option<Vec<u32>> = numeric.split('.').map(|p| p.parse().ok()).collect();
    parts.filter(|p| !p.is_empty())
}

fn compare_versions_desc(a: &Path, b: &Path) -> Ordering {
    let version = |p: &Path| {
        p.file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_version)
    };
    match (version(a), version(b)) {
        (Some(va), Some(vb)) => vb.cmp(&va),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

/// Installed build-tools directories, newest first
pub async fn build_tools_dirs(sdk_root: &Path) -> Vec<PathBuf> {
    let root = sdk_root.join("build-tools");
    let mut dirs = Vec::new();

    let mut entries = match tokio::fs::read_dir(&root).await {
        Ok(entries) => entries,
        Err(_) => return dirs,
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.path().is_dir() {
            dirs.push(entry.path());
        }
    }

    dirs.sort_by(|a, b| compare_versions_desc(a, b));
    debug!("Found build tools: {:?}", dirs);
    dirs
}
