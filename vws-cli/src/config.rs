//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use vws_core::Level;

/// Client configuration. File: $XDG_CONFIG_HOME/vws/config.toml (default
/// ~/.config/vws/config.toml) or /etc/vws/config.toml.
/// Env overrides: VWS_TIMEOUT, VWS_TRACE_LEVEL, VWS_FLUSH.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Socket timeout in seconds (default 10).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Trace threshold for the vws environment (default info).
    #[serde(default = "default_trace_level")]
    pub trace_level: Level,
    /// Write everything before returning (default true).
    #[serde(default = "default_flush")]
    pub flush: bool,
}

fn default_timeout_secs() -> u64 {
    10
}
fn default_trace_level() -> Level {
    Level::Info
}
fn default_flush() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            trace_level: default_trace_level(),
            flush: default_flush(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_overrides(&mut c, |key| std::env::var(key).ok());
    c
}

/// Apply `VWS_*` overrides from `lookup`. Unparseable values are ignored.
pub fn apply_overrides(c: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(s) = lookup("VWS_TIMEOUT") {
        if let Ok(t) = s.trim().parse::<u64>() {
            c.timeout_secs = t;
        }
    }
    if let Some(s) = lookup("VWS_TRACE_LEVEL") {
        if let Ok(l) = s.parse::<Level>() {
            c.trace_level = l;
        }
    }
    if let Some(s) = lookup("VWS_FLUSH") {
        match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => c.flush = true,
            "0" | "false" | "no" | "off" => c.flush = false,
            _ => {}
        }
    }
}

const CONFIG_FILE: &str = "config.toml";
const SYSTEM_DIR: &str = "/etc/vws";

/// Candidate files, most specific first: `$XDG_CONFIG_HOME/vws` (falling
/// back to `$HOME/.config/vws`), then the system directory.
fn search_path(var: impl Fn(&str) -> Option<PathBuf>) -> Vec<PathBuf> {
    let user = var("XDG_CONFIG_HOME")
        .filter(|dir| dir.is_absolute())
        .or_else(|| var("HOME").map(|home| home.join(".config")))
        .map(|base| base.join("vws"));
    user.into_iter()
        .chain([PathBuf::from(SYSTEM_DIR)])
        .map(|dir| dir.join(CONFIG_FILE))
        .collect()
}

fn load_file() -> Option<Config> {
    let candidates = search_path(|name| std::env::var_os(name).map(PathBuf::from));
    let path = candidates.into_iter().find(|p| p.is_file())?;
    match load_from(&path) {
        Ok(c) => Some(c),
        Err(e) => {
            log::warn!("ignoring {}: {:#}", path.display(), e);
            None
        }
    }
}

/// Parse one config file.
pub fn load_from(path: &Path) -> anyhow::Result<Config> {
    use anyhow::Context;
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let c = toml::from_str::<Config>(&s)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(c)
}
