//! Configuration file handling.
//!
//! Defaults live in a small TOML file:
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/lanferry/config.toml` |
//! | macOS | `~/Library/Application Support/Lanferry/config.toml` |
//! | Windows | `%APPDATA%\Lanferry\config.toml` |
//!
//! Protocol numbers (ports, block size) are fixed by the core and not
//! configurable.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// User defaults for the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name this device goes by in CLI output
    pub device_name: String,
    /// Default folder received files land in
    pub receive_root: Option<PathBuf>,
    /// Default session password
    pub password: Option<String>,
    /// Whether `receive` broadcasts this device's presence
    pub announce: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_name: hostname::get().map_or_else(
                |_| "Lanferry Device".to_string(),
                |h| h.to_string_lossy().to_string(),
            ),
            receive_root: None,
            password: None,
            announce: true,
        }
    }
}

impl Config {
    /// Location of the configuration file.
    pub fn path() -> PathBuf {
        directories::ProjectDirs::from("io", "lanferry", "Lanferry").map_or_else(
            || PathBuf::from(".lanferry").join("config.toml"),
            |dirs| dirs.config_dir().join("config.toml"),
        )
    }

    /// Load the configuration, falling back to defaults when the file
    /// is absent.
    pub fn load() -> Result<Self> {
        let path = Self::path();
        match std::fs::read_to_string(&path) {
            Ok(raw) => {
                toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    /// Write the configuration to its default location.
    pub fn save(&self) -> Result<()> {
        let path = Self::path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let raw = toml::to_string_pretty(self).context("serializing config")?;
        std::fs::write(&path, raw).with_context(|| format!("writing {}", path.display()))
    }
}
