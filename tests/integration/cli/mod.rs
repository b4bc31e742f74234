mod reconcile;

use std::path::Path;

use assert_cmd::Command;
use tempfile::TempDir;

/// `broker` with config and data dirs pinned under `home`, so a run never
/// reads or writes the real user directories.
pub fn broker(home: &TempDir, store: &Path, agent_dir: &Path) -> Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("broker");
    cmd.env("BROKER_CONFIG_DIR", home.path().join("config"));
    cmd.env("BROKER_DATA_DIR", home.path().join("data"));
    cmd.env_remove("BROKER_LOG");
    cmd.arg("--store").arg(store);
    cmd.arg("--agent-dir").arg(agent_dir);
    cmd
}
