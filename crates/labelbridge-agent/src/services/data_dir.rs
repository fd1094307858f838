// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Data directory and configuration file resolution.

use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.json";

/// Environment variable that points at an explicit configuration file.
pub const CONFIG_ENV: &str = "LABELBRIDGE_CONFIG";

/// Return the agent data directory, creating it if needed.
pub fn data_dir() -> PathBuf {
    let dir = base_dir(
        std::env::var("XDG_DATA_HOME").ok(),
        std::env::var("HOME").ok(),
    )
    .join("labelbridge");
    std::fs::create_dir_all(&dir).ok();
    dir
}

/// Configuration file: `$LABELBRIDGE_CONFIG` when set, otherwise
/// `config.json` in the data directory.
pub fn config_path() -> PathBuf {
    match std::env::var(CONFIG_ENV) {
        Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
        _ => default_config_path(&data_dir()),
    }
}

pub fn default_config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE)
}

fn base_dir(xdg_data_home: Option<String>, home: Option<String>) -> PathBuf {
    if let Some(xdg) = xdg_data_home.filter(|p| !p.is_empty()) {
        return PathBuf::from(xdg);
    }
    if let Some(home) = home.filter(|p| !p.is_empty()) {
        return PathBuf::from(home).join(".local").join("share");
    }
    std::env::temp_dir()
}
