// src/settings.rs
//
// Gateway settings persisted as TOML under the user config directory.
// Everything has a default so a missing or partial file never blocks
// startup; unknown fields are ignored.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::tlog;

fn default_baud() -> u32 {
    115_200
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_rate_window_ms() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// Port used when the CLI is invoked without `--port`.
    #[serde(default)]
    pub default_port: Option<String>,
    #[serde(default = "default_baud")]
    pub default_baud: u32,
    /// Read-loop idle backoff in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Packet-rate reporting window in milliseconds.
    #[serde(default = "default_rate_window_ms")]
    pub rate_window_ms: u64,
    /// When set, tlog! output is teed to a file in this directory.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        GatewaySettings {
            default_port: None,
            default_baud: default_baud(),
            poll_interval_ms: default_poll_interval_ms(),
            rate_window_ms: default_rate_window_ms(),
            log_dir: None,
        }
    }
}

/// `<config_dir>/tiltlink/settings.toml`, or `None` when the platform has no
/// config directory.
pub fn settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tiltlink").join("settings.toml"))
}

/// Load settings, falling back to defaults when the file is missing or
/// unreadable. A malformed file is reported but never fatal.
pub fn load() -> GatewaySettings {
    let Some(path) = settings_path() else {
        return GatewaySettings::default();
    };
    let Ok(text) = std::fs::read_to_string(&path) else {
        return GatewaySettings::default();
    };
    match toml::from_str(&text) {
        Ok(settings) => settings,
        Err(e) => {
            tlog!("[settings] Ignoring malformed {}: {}", path.display(), e);
            GatewaySettings::default()
        }
    }
}

/// Write settings back to disk, creating the config directory if needed.
pub fn save(settings: &GatewaySettings) -> Result<(), String> {
    let path = settings_path().ok_or("no config directory on this platform")?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
    }
    let text = toml::to_string_pretty(settings).map_err(|e| format!("Failed to serialize settings: {}", e))?;
    std::fs::write(&path, text).map_err(|e| format!("Failed to write {}: {}", path.display(), e))
}

// ============================================================================
// Tests
// ============================================================================
