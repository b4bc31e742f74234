//! Metadata store boundary.
//!
//! The store is document-shaped: one document per owner, domain,
//! application, district and lock. Applications embed their pending
//! operation groups, and the store offers no per-element versioning, so every
//! write into an embedded sequence is a single-document conditional update
//! addressed by position and guarded by the identities found at that
//! position (`OpSlot`, `GroupSlot`).
//!
//! The matching rules live here as pure functions so every backend applies
//! exactly the same predicate.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{
    AppId, Application, District, DistrictId, Domain, DomainId, Gear, GroupId, NodeId, OpId,
    OpState, OperationGroup, OperationRecord, Owner, OwnerId, WallClock,
};
use crate::error::{Effect, Transience};

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Fields returned by application reads and scans.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppProjection {
    Full,
    /// Gear inventory and keys; pending operations dropped.
    Inventory,
    /// Pending operations; gear inventory and keys dropped.
    Operations,
}

impl AppProjection {
    pub(crate) fn apply(self, mut app: Application) -> Application {
        match self {
            AppProjection::Full => {}
            AppProjection::Inventory => app.pending_op_groups.clear(),
            AppProjection::Operations => {
                app.group_instances.clear();
                app.ssh_keys.clear();
            }
        }
        app
    }
}

/// Positional address of one record plus everything the write must still
/// find there for it to apply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpSlot {
    pub app_id: AppId,
    pub group_index: usize,
    pub group_id: GroupId,
    pub record_index: usize,
    pub op_id: OpId,
    pub expected_state: OpState,
    pub expected_retry_count: u32,
}

impl OpSlot {
    pub fn for_record(
        app_id: AppId,
        group_index: usize,
        group_id: GroupId,
        record_index: usize,
        record: &OperationRecord,
    ) -> Self {
        Self {
            app_id,
            group_index,
            group_id,
            record_index,
            op_id: record.id,
            expected_state: record.state,
            expected_retry_count: record.retry_count,
        }
    }
}

/// Positional address of one group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupSlot {
    pub app_id: AppId,
    pub group_index: usize,
    pub group_id: GroupId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OpUpdate {
    State(OpState),
    Retry {
        rollback_op: Option<OpId>,
        saved_values: BTreeMap<String, String>,
    },
}

/// Persisted advisory lock.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub key: String,
    pub locked: bool,
    pub timeout: WallClock,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("{collection} document {id} is corrupt: {source}")]
    DocumentCorrupt {
        collection: &'static str,
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode {collection} document: {source}")]
    Encode {
        collection: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("io error at {path:?}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("path is a symlink: {path:?}")]
    Symlink { path: std::path::PathBuf },
    #[error("store schema version mismatch: expected {expected}, got {got}")]
    SchemaVersionMismatch { expected: u32, got: u32 },
}

impl StoreError {
    pub fn transience(&self) -> Transience {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                Transience::Retryable
            }
            StoreError::Sqlite(_) | StoreError::Io { .. } => Transience::Unknown,
            StoreError::DocumentCorrupt { .. }
            | StoreError::Encode { .. }
            | StoreError::Symlink { .. }
            | StoreError::SchemaVersionMismatch { .. } => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            StoreError::Encode { .. }
            | StoreError::Symlink { .. }
            | StoreError::SchemaVersionMismatch { .. } => Effect::None,
            _ => Effect::Unknown,
        }
    }
}

/// Storage primitives used by the ledger, the lock and the reconciler.
///
/// `put_*` are whole-document upserts for provisioning code and fixtures.
/// Everything the ledger and reconciler write goes through the conditional
/// primitives, each of which reports whether a matching document was found
/// and updated.
pub trait DocumentStore: Send + Sync {
    fn put_owner(&self, owner: &Owner) -> Result<(), StoreError>;
    fn find_owner(&self, id: &OwnerId) -> Result<Option<Owner>, StoreError>;
    fn scan_owners(
        &self,
        visit: &mut dyn FnMut(Owner) -> Result<(), StoreError>,
    ) -> Result<(), StoreError>;
    /// Unconditional `$set` of the quota counter. False if the owner is gone.
    fn set_consumed_gears(&self, id: &OwnerId, value: u32) -> Result<bool, StoreError>;

    fn put_domain(&self, domain: &Domain) -> Result<(), StoreError>;
    fn find_domain(&self, id: &DomainId) -> Result<Option<Domain>, StoreError>;
    fn scan_domains(
        &self,
        visit: &mut dyn FnMut(Domain) -> Result<(), StoreError>,
    ) -> Result<(), StoreError>;

    fn put_application(&self, app: &Application) -> Result<(), StoreError>;
    fn delete_application(&self, id: &AppId) -> Result<bool, StoreError>;
    fn find_application(
        &self,
        id: &AppId,
        projection: AppProjection,
    ) -> Result<Option<Application>, StoreError>;
    fn scan_applications(
        &self,
        projection: AppProjection,
        visit: &mut dyn FnMut(Application) -> Result<(), StoreError>,
    ) -> Result<(), StoreError>;
    fn applications_in_domain(
        &self,
        domain: &DomainId,
        projection: AppProjection,
    ) -> Result<Vec<Application>, StoreError>;

    fn update_op_record(&self, slot: &OpSlot, update: &OpUpdate) -> Result<bool, StoreError>;
    fn push_op_record(&self, slot: &GroupSlot, record: &OperationRecord)
    -> Result<bool, StoreError>;
    fn push_op_group(&self, app: &AppId, group: &OperationGroup) -> Result<bool, StoreError>;
    /// Remove the group found at `slot`, only if every record in it is
    /// completed.
    fn pull_finished_op_group(&self, slot: &GroupSlot) -> Result<bool, StoreError>;

    fn put_district(&self, district: &District) -> Result<(), StoreError>;
    fn find_district(&self, id: &DistrictId) -> Result<Option<District>, StoreError>;
    fn scan_districts(
        &self,
        visit: &mut dyn FnMut(District) -> Result<(), StoreError>,
    ) -> Result<(), StoreError>;
    /// `$pull` from the available pool. False if absent or district gone.
    fn remove_available_uid(&self, id: &DistrictId, uid: u32) -> Result<bool, StoreError>;
    /// `$addToSet` into the available pool. False if present or district gone.
    fn add_available_uid(&self, id: &DistrictId, uid: u32) -> Result<bool, StoreError>;

    /// Find-and-modify: take the lock if unlocked or expired at `now`,
    /// creating the record on first use.
    fn try_lock(&self, key: &str, now: WallClock, expires: WallClock) -> Result<bool, StoreError>;
    fn unlock(&self, key: &str) -> Result<(), StoreError>;
    fn find_lock(&self, key: &str) -> Result<Option<LockRecord>, StoreError>;

    /// Gear currently holding `uid` on one of `nodes`, with its application.
    fn find_gear_by_uid(
        &self,
        uid: u32,
        nodes: &[NodeId],
    ) -> Result<Option<(AppId, Gear)>, StoreError> {
        let mut found = None;
        self.scan_applications(AppProjection::Inventory, &mut |app| {
            if found.is_none()
                && let Some(gear) = app.gear_using_uid(uid, nodes)
            {
                found = Some((app.id, gear.clone()));
            }
            Ok(())
        })?;
        Ok(found)
    }
}

pub(crate) fn apply_op_update(app: &mut Application, slot: &OpSlot, update: &OpUpdate) -> bool {
    if app.id != slot.app_id {
        return false;
    }
    let Some(group) = app.pending_op_groups.get_mut(slot.group_index) else {
        return false;
    };
    if group.id != slot.group_id {
        return false;
    }
    let Some(record) = group.ops.get_mut(slot.record_index) else {
        return false;
    };
    if record.id != slot.op_id
        || record.state != slot.expected_state
        || record.retry_count != slot.expected_retry_count
    {
        return false;
    }
    match update {
        OpUpdate::State(state) => record.state = *state,
        OpUpdate::Retry {
            rollback_op,
            saved_values,
        } => {
            record.retry_count = record.retry_count.saturating_add(1);
            record.retry_rollback_op = *rollback_op;
            record.saved_values = saved_values.clone();
        }
    }
    true
}

pub(crate) fn apply_push_record(
    app: &mut Application,
    slot: &GroupSlot,
    record: &OperationRecord,
) -> bool {
    if app.id != slot.app_id {
        return false;
    }
    match app.pending_op_groups.get_mut(slot.group_index) {
        Some(group) if group.id == slot.group_id => {
            group.ops.push(record.clone());
            true
        }
        _ => false,
    }
}

pub(crate) fn apply_pull_finished_group(app: &mut Application, slot: &GroupSlot) -> bool {
    if app.id != slot.app_id {
        return false;
    }
    match app.pending_op_groups.get(slot.group_index) {
        Some(group) if group.id == slot.group_id && group.is_finished() => {
            app.pending_op_groups.remove(slot.group_index);
            true
        }
        _ => false,
    }
}

pub(crate) fn lock_is_free(record: Option<&LockRecord>, now: WallClock) -> bool {
    match record {
        None => true,
        Some(record) => !record.locked || record.timeout <= now,
    }
}
