//! Optional TOML config file (spec.md §3/§6). Every field mirrors a CLI
//! flag one-for-one; CLI flags always win when both are given, which is
//! enforced by [`crate::runtime::resolve`] rather than here — this module
//! only knows how to read and parse the file.

use std::path::Path;

use eyre::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ConfigFile {
    #[serde(default)]
    pub(crate) daemon: DaemonSection,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct DaemonSection {
    pub(crate) foreground: Option<bool>,
    pub(crate) run_as: Option<String>,
    pub(crate) verbosity: Option<i8>,
    pub(crate) mss: Option<u32>,
    pub(crate) buffer: Option<usize>,
    #[serde(default)]
    pub(crate) command: Vec<String>,
    #[serde(default)]
    pub(crate) data: Vec<String>,
}

pub(crate) fn load(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}
