//! Node agent boundary.
//!
//! The reconciler only ever asks node agents two things: which keys each
//! hosted gear currently authorizes, and to replace one gear's keys. Nodes
//! that do not answer simply contribute nothing to a pass.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{AppId, Application, GearId, KeySet, NodeId, key_set};
use crate::error::Transience;
use crate::store::{AppProjection, DocumentStore, StoreError};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AgentError {
    #[error("node agent io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("node report {path:?} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("node {node} did not respond")]
    NodeUnreachable { node: NodeId },
    #[error("gear {gear} is not hosted on node {node}")]
    GearNotHosted { node: NodeId, gear: GearId },
}

impl AgentError {
    pub fn transience(&self) -> Transience {
        match self {
            AgentError::Io { .. } | AgentError::NodeUnreachable { .. } => Transience::Retryable,
            AgentError::Malformed { .. } | AgentError::GearNotHosted { .. } => {
                Transience::Permanent
            }
        }
    }
}

/// Result of one bulk query across the fleet.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AgentInventory {
    pub responding: BTreeSet<NodeId>,
    /// Authorized keys per gear, per responding node.
    pub gear_keys: BTreeMap<NodeId, BTreeMap<GearId, KeySet>>,
}

impl AgentInventory {
    pub fn responded(&self, node: &NodeId) -> bool {
        self.responding.contains(node)
    }

    pub fn keys_for(&self, node: &NodeId, gear: &GearId) -> Option<&KeySet> {
        self.gear_keys.get(node)?.get(gear)
    }
}

pub trait NodeAgentProxy: Send + Sync {
    fn gear_key_inventory(&self) -> Result<AgentInventory, AgentError>;

    fn replace_gear_keys(
        &self,
        node: &NodeId,
        gear: &GearId,
        keys: &KeySet,
    ) -> Result<(), AgentError>;
}

/// One JSON report per node, as written by the node agents.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
    pub node: NodeId,
    #[serde(default)]
    pub gears: BTreeMap<GearId, KeySet>,
}

/// Node agent backed by a directory of `<node>.json` reports. A node without
/// a readable report counts as not responding.
#[derive(Clone, Debug)]
pub struct FileNodeAgent {
    dir: PathBuf,
}

impl FileNodeAgent {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn report_path(&self, node: &NodeId) -> PathBuf {
        self.dir.join(format!("{}.json", node.as_str()))
    }

    pub fn write_report(&self, report: &NodeReport) -> Result<(), AgentError> {
        fs::create_dir_all(&self.dir).map_err(|source| AgentError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.report_path(&report.node);
        let mut json = serde_json::to_vec_pretty(report).map_err(|source| AgentError::Malformed {
            path: path.clone(),
            source,
        })?;
        json.push(b'\n');
        let io_err = |source| AgentError::Io {
            path: path.clone(),
            source,
        };
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(io_err)?;
        tmp.write_all(&json).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&path).map_err(|err| io_err(err.error))?;
        Ok(())
    }

    fn read_report(&self, path: &Path) -> Result<NodeReport, AgentError> {
        let bytes = fs::read(path).map_err(|source| AgentError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| AgentError::Malformed {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl NodeAgentProxy for FileNodeAgent {
    fn gear_key_inventory(&self) -> Result<AgentInventory, AgentError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(dir = %self.dir.display(), "node report directory missing; no nodes responded");
                return Ok(AgentInventory::default());
            }
            Err(source) => {
                return Err(AgentError::Io {
                    path: self.dir.clone(),
                    source,
                });
            }
        };

        let mut inventory = AgentInventory::default();
        for entry in entries {
            let entry = entry.map_err(|source| AgentError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match self.read_report(&path) {
                Ok(report) => {
                    inventory.responding.insert(report.node.clone());
                    inventory.gear_keys.insert(report.node, report.gears);
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping unreadable node report");
                }
            }
        }
        tracing::debug!(nodes = inventory.responding.len(), "collected node key inventory");
        Ok(inventory)
    }

    fn replace_gear_keys(
        &self,
        node: &NodeId,
        gear: &GearId,
        keys: &KeySet,
    ) -> Result<(), AgentError> {
        let path = self.report_path(node);
        let mut report = match self.read_report(&path) {
            Ok(report) => report,
            Err(AgentError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                return Err(AgentError::NodeUnreachable { node: node.clone() });
            }
            Err(err) => return Err(err),
        };
        let Some(slot) = report.gears.get_mut(gear) else {
            return Err(AgentError::GearNotHosted {
                node: node.clone(),
                gear: *gear,
            });
        };
        *slot = keys.clone();
        self.write_report(&report)
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ResyncError {
    #[error("application {app} no longer exists")]
    ApplicationMissing { app: AppId },
    #[error("key resync failed on {} of {gears} gears", summarize_gear_errors(.errors))]
    Gears {
        gears: usize,
        errors: Vec<AgentError>,
    },
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn summarize_gear_errors(errors: &[AgentError]) -> String {
    match errors.first() {
        Some(first) => format!("{} ({first})", errors.len()),
        None => "0".to_string(),
    }
}

/// Gear counts from one application resync.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResyncSummary {
    pub pushed: usize,
    /// Gears on nodes that did not answer; picked up by a later pass.
    pub skipped_silent: usize,
}

/// Per-application "push the recorded keys to every gear" action.
pub trait KeyResync: Send + Sync {
    fn resync_keys(&self, app: &AppId) -> Result<ResyncSummary, ResyncError>;
}

/// Expected keys for every gear of an application: owner keys, the domain's
/// system keys and the application's own keys.
pub fn expected_keys(
    store: &dyn DocumentStore,
    app: &Application,
) -> Result<KeySet, StoreError> {
    let owner = store.find_owner(&app.owner_id)?;
    let domain = store.find_domain(&app.domain_id)?;
    let owner_keys = owner.iter().flat_map(|owner| owner.ssh_keys.iter());
    let domain_keys = domain.iter().flat_map(|domain| domain.system_ssh_keys.iter());
    Ok(key_set(owner_keys.chain(domain_keys).chain(app.ssh_keys.iter())))
}

pub struct AgentKeyResync {
    store: Arc<dyn DocumentStore>,
    agent: Arc<dyn NodeAgentProxy>,
}

impl AgentKeyResync {
    pub fn new(store: Arc<dyn DocumentStore>, agent: Arc<dyn NodeAgentProxy>) -> Self {
        Self { store, agent }
    }
}

impl KeyResync for AgentKeyResync {
    fn resync_keys(&self, app_id: &AppId) -> Result<ResyncSummary, ResyncError> {
        let Some(app) = self
            .store
            .find_application(app_id, AppProjection::Inventory)?
        else {
            return Err(ResyncError::ApplicationMissing { app: *app_id });
        };
        let keys = expected_keys(self.store.as_ref(), &app)?;
        let mut summary = ResyncSummary::default();
        let mut errors = Vec::new();
        for gear in app.gears() {
            match self
                .agent
                .replace_gear_keys(&gear.server_identity, &gear.id, &keys)
            {
                Ok(()) => summary.pushed += 1,
                Err(AgentError::NodeUnreachable { node }) => {
                    tracing::debug!(app_id = %app_id, gear_id = %gear.id, node = %node, "node silent; gear keys left for a later pass");
                    summary.skipped_silent += 1;
                }
                Err(err) => {
                    tracing::warn!(app_id = %app_id, gear_id = %gear.id, error = %err, "gear key resync failed");
                    errors.push(err);
                }
            }
        }
        if !errors.is_empty() {
            return Err(ResyncError::Gears {
                gears: app.gear_count(),
                errors,
            });
        }
        tracing::debug!(
            app_id = %app_id,
            pushed = summary.pushed,
            skipped_silent = summary.skipped_silent,
            keys = keys.len(),
            "resynced application keys"
        );
        Ok(summary)
    }
}
