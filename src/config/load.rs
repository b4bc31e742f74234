use std::fs;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

use super::merge::{apply_env_overrides, merge_layers};
use super::{Config, ConfigLayer};

pub fn config_path() -> PathBuf {
    crate::paths::config_dir().join("config.toml")
}

pub fn load_user_config() -> Result<Option<ConfigLayer>> {
    load_layer(&config_path())
}

/// Parse one layer; a missing file is not an error.
pub fn load_layer(path: &Path) -> Result<Option<ConfigLayer>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)
        .map_err(|e| config_error(format!("failed to read {}: {e}", path.display())))?;
    toml::from_str(&contents)
        .map(Some)
        .map_err(|e| config_error(format!("failed to parse {}: {e}", path.display())))
}

/// User file, then `explicit` if given, then `BROKER_*` env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config> {
    let user = load_user_config()?;
    let explicit = match explicit {
        Some(path) if !path.exists() => {
            return Err(config_error(format!(
                "config file {} does not exist",
                path.display()
            )));
        }
        Some(path) => load_layer(path)?,
        None => None,
    };
    let mut config = merge_layers(user, explicit);
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Like [`load`], but falls back to defaults on a broken user file and
/// writes a default user file on first run.
pub fn load_or_init(explicit: Option<&Path>) -> Result<Config> {
    let path = config_path();
    let had_user_config = path.exists();

    let config = match load(explicit) {
        Ok(cfg) => cfg,
        Err(e) if explicit.is_some() => return Err(e),
        Err(e) => {
            tracing::warn!("config load failed, using defaults: {e}");
            let mut cfg = Config::default();
            apply_env_overrides(&mut cfg);
            cfg
        }
    };

    if !had_user_config && let Err(e) = write_config(&path, &Config::default()) {
        tracing::warn!("failed to write default config: {e}");
    }

    Ok(config)
}

pub fn write_config(path: &Path, cfg: &Config) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .map_err(|e| config_error(format!("failed to create {}: {e}", dir.display())))?;
    }
    let contents = toml::to_string_pretty(cfg)
        .map_err(|e| config_error(format!("failed to render config: {e}")))?;
    atomic_write(path, contents.as_bytes())
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| config_error("config path missing parent directory".to_string()))?;
    let temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| {
        config_error(format!(
            "failed to create temp file in {}: {e}",
            dir.display()
        ))
    })?;
    fs::write(temp.path(), data)
        .map_err(|e| config_error(format!("failed to write config temp file: {e}")))?;
    temp.persist(path).map_err(|e| {
        config_error(format!(
            "failed to persist config to {}: {e}",
            path.display()
        ))
    })?;
    Ok(())
}

fn config_error(reason: String) -> Error {
    Error::Config { reason }
}
