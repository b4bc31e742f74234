//! Config loading and persistence.

mod load;
mod merge;
mod schema;

pub use load::{config_path, load, load_layer, load_or_init, load_user_config, write_config};
pub use merge::{apply_env_overrides, apply_env_overrides_from, merge_layers};
pub use schema::{
    AgentConfig, Config, ConfigLayer, FileLoggingConfig, FileLoggingConfigOverride,
    LedgerConfig, LedgerConfigOverride, LogFormat, LogRotation, LoggingConfig,
    LoggingConfigOverride, ReconcileConfig, ReconcileConfigOverride, StoreConfig,
};
