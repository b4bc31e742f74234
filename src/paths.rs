//! XDG directory helpers for config/data locations.

use std::path::PathBuf;

/// Base directory for persistent data (store database, node reports, logs).
///
/// Uses `BROKER_DATA_DIR` if set, otherwise `$XDG_DATA_HOME/broker-rs` or
/// `~/.local/share/broker-rs`.
pub(crate) fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("BROKER_DATA_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    std::env::var("XDG_DATA_HOME")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local")
                .join("share")
        })
        .join("broker-rs")
}

/// Default metadata store database.
pub fn store_path() -> PathBuf {
    data_dir().join("broker.sqlite")
}

/// Default directory of per-node agent reports.
pub fn agent_reports_dir() -> PathBuf {
    data_dir().join("nodes")
}

/// Default directory for rolling log files.
pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Base directory for configuration files.
///
/// Uses `BROKER_CONFIG_DIR` if set, otherwise `$XDG_CONFIG_HOME/broker-rs` or
/// `~/.config/broker-rs`.
pub(crate) fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("BROKER_CONFIG_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".config")
        })
        .join("broker-rs")
}
