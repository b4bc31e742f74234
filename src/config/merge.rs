use std::path::PathBuf;

use super::{Config, ConfigLayer, LogFormat};

/// Later layers win: defaults, then the user file, then an explicit file.
pub fn merge_layers(user: Option<ConfigLayer>, explicit: Option<ConfigLayer>) -> Config {
    let mut config = Config::default();
    if let Some(layer) = user {
        layer.apply_to(&mut config);
    }
    if let Some(layer) = explicit {
        layer.apply_to(&mut config);
    }
    config
}

pub fn apply_env_overrides(config: &mut Config) {
    apply_env_overrides_from(config, |key| std::env::var(key).ok());
}

/// Apply `BROKER_*` overrides read through `lookup`. Blank values are
/// ignored; unparsable ones are logged and ignored.
pub fn apply_env_overrides_from(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    let value = |key: &str| {
        lookup(key)
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
    };

    if let Some(path) = value("BROKER_STORE_PATH") {
        config.store.path = Some(PathBuf::from(path));
    }

    if let Some(dir) = value("BROKER_AGENT_DIR") {
        config.agent.reports_dir = Some(PathBuf::from(dir));
    }

    if let Some(raw) = value("BROKER_LOG_FORMAT") {
        match raw.parse::<LogFormat>() {
            Ok(format) => config.logging.stdout_format = format,
            Err(err) => tracing::warn!("invalid BROKER_LOG_FORMAT, ignoring: {err}"),
        }
    }

    if let Some(raw) = value("BROKER_LOCK_TTL_SECS") {
        match raw.parse::<u64>() {
            Ok(ttl) => config.reconcile.lock_ttl_secs = ttl,
            Err(err) => tracing::warn!("invalid BROKER_LOCK_TTL_SECS, ignoring: {err}"),
        }
    }

    if let Some(raw) = value("BROKER_MAX_TRANSITION_ATTEMPTS") {
        match raw.parse::<u32>() {
            Ok(attempts) if attempts > 0 => config.ledger.max_transition_attempts = attempts,
            Ok(_) => tracing::warn!("BROKER_MAX_TRANSITION_ATTEMPTS must be positive, ignoring"),
            Err(err) => tracing::warn!("invalid BROKER_MAX_TRANSITION_ATTEMPTS, ignoring: {err}"),
        }
    }
}
