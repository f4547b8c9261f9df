//! Load source settings from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::source::{NiceSrc, PropertyError};

/// Source configuration. File: ~/.config/nicesrc/config.toml or /etc/nicesrc/config.toml.
/// Env overrides: NICESRC_STREAM, NICESRC_COMPONENT, NICESRC_DO_TIMESTAMP.
///
/// The agent is a live object and is never part of the file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// Stream to read from (0 = unset).
    #[serde(default)]
    pub stream: u32,
    /// Component to read from (0 = unset).
    #[serde(default)]
    pub component: u32,
    /// Stamp buffers with running time (default true).
    #[serde(default = "default_do_timestamp")]
    pub do_timestamp: bool,
}

fn default_do_timestamp() -> bool {
    true
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            stream: 0,
            component: 0,
            do_timestamp: default_do_timestamp(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl SourceConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&s)
    }

    /// Apply environment overrides; unparsable values are ignored.
    pub fn apply_env_overrides<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = var("NICESRC_STREAM").and_then(|s| s.parse().ok()) {
            self.stream = v;
        }
        if let Some(v) = var("NICESRC_COMPONENT").and_then(|s| s.parse().ok()) {
            self.component = v;
        }
        if let Some(v) = var("NICESRC_DO_TIMESTAMP").and_then(|s| parse_bool(&s)) {
            self.do_timestamp = v;
        }
    }

    /// Push the settings through the property surface; fails while the source is active.
    pub fn apply_to(&self, src: &NiceSrc) -> Result<(), PropertyError> {
        src.set_stream_id(self.stream)?;
        src.set_component_id(self.component)?;
        src.set_do_timestamp(self.do_timestamp)
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Load config: default, then the first config file found, then env vars.
/// A file that fails to parse falls back to defaults.
pub fn load() -> SourceConfig {
    let paths = config_paths(std::env::var_os("HOME").map(PathBuf::from));
    load_from(&paths, |k| std::env::var(k).ok())
}

/// `load` over an explicit search list and variable lookup.
pub fn load_from<F>(paths: &[PathBuf], var: F) -> SourceConfig
where
    F: Fn(&str) -> Option<String>,
{
    let mut c = load_file(paths).unwrap_or_default();
    c.apply_env_overrides(var);
    c
}

fn config_paths(home: Option<PathBuf>) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/nicesrc/config.toml"));
    }
    out.push(PathBuf::from("/etc/nicesrc/config.toml"));
    out
}

fn load_file(paths: &[PathBuf]) -> Option<SourceConfig> {
    let path = paths.iter().find(|p| p.exists())?;
    match SourceConfig::from_file(path) {
        Ok(c) => Some(c),
        Err(err) => {
            tracing::warn!(%err, path = %path.display(), "ignoring config file");
            None
        }
    }
}
