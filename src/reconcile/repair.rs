//! Repairs. Each one re-reads current state and re-checks its own
//! precondition right before mutating, so a stale snapshot or a second
//! pass never causes a write that is no longer needed.

use thiserror::Error;

use crate::core::{AppId, DistrictId, GearId, OwnerId};
use crate::error::Transience;
use crate::lock::{DistributedLock, LockError, LockKey};
use crate::store::{AppProjection, DocumentStore, StoreError};

use super::agent::{KeyResync, ResyncError};
use super::report::FailureKind;
use super::snapshot::recompute_consumed_gears;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RepairError {
    #[error("{what} no longer exists")]
    NotFound { what: String },
    #[error("lock {key} is held by another repair")]
    LockUnavailable { key: LockKey },
    #[error("key resync failed: {0}")]
    Resync(#[source] ResyncError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("still inconsistent after repair: {detail}")]
    PersistentInconsistency { detail: String },
}

impl From<LockError> for RepairError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Store(err) => RepairError::Store(err),
        }
    }
}

impl RepairError {
    pub fn transience(&self) -> Transience {
        match self {
            RepairError::LockUnavailable { .. } => Transience::Retryable,
            RepairError::Store(e) => e.transience(),
            RepairError::NotFound { .. }
            | RepairError::Resync(_)
            | RepairError::PersistentInconsistency { .. } => Transience::Unknown,
        }
    }

    /// Reported failure class; `None` for benign outcomes.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            RepairError::NotFound { .. } => None,
            RepairError::LockUnavailable { .. } => Some(FailureKind::LockUnavailable),
            RepairError::Resync(_) => Some(FailureKind::Resync),
            RepairError::Store(_) => Some(FailureKind::Store),
            RepairError::PersistentInconsistency { .. } => {
                Some(FailureKind::PersistentInconsistency)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Repaired {
    Fixed(String),
    SelfResolved(String),
}

pub(crate) struct Repairer<'a> {
    pub store: &'a dyn DocumentStore,
    pub lock: &'a DistributedLock,
    pub resync: &'a dyn KeyResync,
    pub lock_ttl_secs: u64,
}

impl Repairer<'_> {
    /// Recompute the owner's gear count under the owner lock and overwrite
    /// the cached counter, then confirm it stuck.
    pub fn quota(&self, owner_id: &OwnerId) -> Result<Repaired, RepairError> {
        let key = LockKey::owner(owner_id);
        let Some(lease) = self.lock.lease(key.clone(), self.lock_ttl_secs)? else {
            return Err(RepairError::LockUnavailable { key });
        };

        let owner = self
            .store
            .find_owner(owner_id)?
            .ok_or_else(|| not_found("owner", owner_id))?;
        let actual = recompute_consumed_gears(self.store, owner_id)?;
        if owner.consumed_gears == actual {
            return Ok(Repaired::SelfResolved(format!(
                "consumed_gears already {actual}"
            )));
        }
        if !self.store.set_consumed_gears(owner_id, actual)? {
            return Err(not_found("owner", owner_id));
        }

        let recorded = self
            .store
            .find_owner(owner_id)?
            .map(|owner| owner.consumed_gears)
            .ok_or_else(|| not_found("owner", owner_id))?;
        let recomputed = recompute_consumed_gears(self.store, owner_id)?;
        if let Err(err) = lease.release() {
            tracing::warn!(lock = %key, error = %err, "failed to release lock lease");
        }
        if recorded != recomputed {
            return Err(RepairError::PersistentInconsistency {
                detail: format!(
                    "owner {owner_id} consumed_gears {recorded} but {recomputed} gears found"
                ),
            });
        }
        Ok(Repaired::Fixed(format!(
            "consumed_gears {} -> {actual}",
            owner.consumed_gears
        )))
    }

    pub fn ssh_keys(&self, app_id: &AppId) -> Result<Repaired, RepairError> {
        match self.resync.resync_keys(app_id) {
            Ok(summary) if summary.skipped_silent > 0 => Ok(Repaired::Fixed(format!(
                "keys resynced to {} gears, {} on silent nodes skipped",
                summary.pushed, summary.skipped_silent
            ))),
            Ok(summary) => Ok(Repaired::Fixed(format!(
                "keys resynced to {} gears",
                summary.pushed
            ))),
            Err(ResyncError::ApplicationMissing { .. }) => Err(not_found("application", app_id)),
            Err(err) => Err(RepairError::Resync(err)),
        }
    }

    /// A live gear's UID is still listed available: pull it from the pool.
    pub fn uid_unreserved(
        &self,
        district_id: &DistrictId,
        uid: u32,
        app_id: &AppId,
        gear_id: &GearId,
    ) -> Result<Repaired, RepairError> {
        if let Some(reason) = self.unreserved_gone(district_id, uid, app_id, gear_id)? {
            return Ok(Repaired::SelfResolved(reason));
        }
        let key = LockKey::application(app_id);
        let Some(_lease) = self.lock.lease(key.clone(), self.lock_ttl_secs)? else {
            return Err(RepairError::LockUnavailable { key });
        };
        if let Some(reason) = self.unreserved_gone(district_id, uid, app_id, gear_id)? {
            return Ok(Repaired::SelfResolved(reason));
        }
        if !self.store.remove_available_uid(district_id, uid)? {
            return Ok(Repaired::SelfResolved(
                "uid left the pool concurrently".to_string(),
            ));
        }
        Ok(Repaired::Fixed(format!(
            "removed uid {uid} from available pool"
        )))
    }

    /// A UID is neither live nor available: return it to the pool.
    pub fn uid_unused(&self, district_id: &DistrictId, uid: u32) -> Result<Repaired, RepairError> {
        if let Some(reason) = self.unused_gone(district_id, uid)? {
            return Ok(Repaired::SelfResolved(reason));
        }
        let key = LockKey::district(district_id);
        let Some(_lease) = self.lock.lease(key.clone(), self.lock_ttl_secs)? else {
            return Err(RepairError::LockUnavailable { key });
        };
        if let Some(reason) = self.unused_gone(district_id, uid)? {
            return Ok(Repaired::SelfResolved(reason));
        }
        if !self.store.add_available_uid(district_id, uid)? {
            return Ok(Repaired::SelfResolved(
                "uid joined the pool concurrently".to_string(),
            ));
        }
        Ok(Repaired::Fixed(format!(
            "returned uid {uid} to available pool"
        )))
    }

    /// Why the unreserved condition no longer holds, if it doesn't.
    fn unreserved_gone(
        &self,
        district_id: &DistrictId,
        uid: u32,
        app_id: &AppId,
        gear_id: &GearId,
    ) -> Result<Option<String>, RepairError> {
        let district = self
            .store
            .find_district(district_id)?
            .ok_or_else(|| not_found("district", district_id))?;
        if !district.is_available(uid) {
            return Ok(Some("uid no longer listed available".to_string()));
        }
        let app = self
            .store
            .find_application(app_id, AppProjection::Inventory)?
            .ok_or_else(|| not_found("application", app_id))?;
        let still_live = app.gear(gear_id).is_some_and(|gear| {
            gear.uid == uid && district.has_member(&gear.server_identity)
        });
        if !still_live {
            return Ok(Some("gear no longer uses uid".to_string()));
        }
        Ok(None)
    }

    fn unused_gone(&self, district_id: &DistrictId, uid: u32) -> Result<Option<String>, RepairError> {
        let district = self
            .store
            .find_district(district_id)?
            .ok_or_else(|| not_found("district", district_id))?;
        if district.is_available(uid) {
            return Ok(Some("uid already available".to_string()));
        }
        if let Some((app_id, gear)) = self.store.find_gear_by_uid(uid, &district.server_identities)? {
            return Ok(Some(format!("uid now used by gear {} of {app_id}", gear.id)));
        }
        Ok(None)
    }
}

fn not_found(kind: &str, id: &impl std::fmt::Display) -> RepairError {
    RepairError::NotFound {
        what: format!("{kind} {id}"),
    }
}
