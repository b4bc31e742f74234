use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::core::{
    AppId, Application, District, DistrictId, Domain, DomainId, OperationGroup, OperationRecord,
    Owner, OwnerId, WallClock,
};

use super::{
    AppProjection, DocumentStore, GroupSlot, LockRecord, OpSlot, OpUpdate, StoreError,
    apply_op_update, apply_pull_finished_group, apply_push_record, lock_is_free,
};

#[derive(Clone, Default)]
struct MemoryStoreState {
    owners: BTreeMap<OwnerId, Owner>,
    domains: BTreeMap<DomainId, Domain>,
    applications: BTreeMap<AppId, Application>,
    districts: BTreeMap<DistrictId, District>,
    locks: BTreeMap<String, LockRecord>,
}

/// In-process store. Each call holds the state lock for its whole duration,
/// which gives the same single-document atomicity as the sqlite backend.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryStoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&MemoryStoreState) -> T) -> T {
        let state = self.state.read().expect("memory store lock poisoned");
        f(&state)
    }

    fn write<T>(&self, f: impl FnOnce(&mut MemoryStoreState) -> T) -> T {
        let mut state = self.state.write().expect("memory store lock poisoned");
        f(&mut state)
    }
}

// Visitors run without the state lock held so they may write back.
fn visit_all<T>(
    items: Vec<T>,
    visit: &mut dyn FnMut(T) -> Result<(), StoreError>,
) -> Result<(), StoreError> {
    for item in items {
        visit(item)?;
    }
    Ok(())
}

impl DocumentStore for MemoryStore {
    fn put_owner(&self, owner: &Owner) -> Result<(), StoreError> {
        self.write(|state| state.owners.insert(owner.id, owner.clone()));
        Ok(())
    }

    fn find_owner(&self, id: &OwnerId) -> Result<Option<Owner>, StoreError> {
        Ok(self.read(|state| state.owners.get(id).cloned()))
    }

    fn scan_owners(
        &self,
        visit: &mut dyn FnMut(Owner) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let owners = self.read(|state| state.owners.values().cloned().collect());
        visit_all(owners, visit)
    }

    fn set_consumed_gears(&self, id: &OwnerId, value: u32) -> Result<bool, StoreError> {
        Ok(self.write(|state| match state.owners.get_mut(id) {
            Some(owner) => {
                owner.consumed_gears = value;
                true
            }
            None => false,
        }))
    }

    fn put_domain(&self, domain: &Domain) -> Result<(), StoreError> {
        self.write(|state| state.domains.insert(domain.id, domain.clone()));
        Ok(())
    }

    fn find_domain(&self, id: &DomainId) -> Result<Option<Domain>, StoreError> {
        Ok(self.read(|state| state.domains.get(id).cloned()))
    }

    fn scan_domains(
        &self,
        visit: &mut dyn FnMut(Domain) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let domains = self.read(|state| state.domains.values().cloned().collect());
        visit_all(domains, visit)
    }

    fn put_application(&self, app: &Application) -> Result<(), StoreError> {
        self.write(|state| state.applications.insert(app.id, app.clone()));
        Ok(())
    }

    fn delete_application(&self, id: &AppId) -> Result<bool, StoreError> {
        Ok(self.write(|state| state.applications.remove(id).is_some()))
    }

    fn find_application(
        &self,
        id: &AppId,
        projection: AppProjection,
    ) -> Result<Option<Application>, StoreError> {
        Ok(self.read(|state| {
            state
                .applications
                .get(id)
                .cloned()
                .map(|app| projection.apply(app))
        }))
    }

    fn scan_applications(
        &self,
        projection: AppProjection,
        visit: &mut dyn FnMut(Application) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let apps = self.read(|state| {
            state
                .applications
                .values()
                .cloned()
                .map(|app| projection.apply(app))
                .collect()
        });
        visit_all(apps, visit)
    }

    fn applications_in_domain(
        &self,
        domain: &DomainId,
        projection: AppProjection,
    ) -> Result<Vec<Application>, StoreError> {
        Ok(self.read(|state| {
            state
                .applications
                .values()
                .filter(|app| &app.domain_id == domain)
                .cloned()
                .map(|app| projection.apply(app))
                .collect()
        }))
    }

    fn update_op_record(&self, slot: &OpSlot, update: &OpUpdate) -> Result<bool, StoreError> {
        Ok(self.write(|state| match state.applications.get_mut(&slot.app_id) {
            Some(app) => apply_op_update(app, slot, update),
            None => false,
        }))
    }

    fn push_op_record(
        &self,
        slot: &GroupSlot,
        record: &OperationRecord,
    ) -> Result<bool, StoreError> {
        Ok(self.write(|state| match state.applications.get_mut(&slot.app_id) {
            Some(app) => apply_push_record(app, slot, record),
            None => false,
        }))
    }

    fn push_op_group(&self, app: &AppId, group: &OperationGroup) -> Result<bool, StoreError> {
        Ok(self.write(|state| match state.applications.get_mut(app) {
            Some(app) => {
                app.pending_op_groups.push(group.clone());
                true
            }
            None => false,
        }))
    }

    fn pull_finished_op_group(&self, slot: &GroupSlot) -> Result<bool, StoreError> {
        Ok(self.write(|state| match state.applications.get_mut(&slot.app_id) {
            Some(app) => apply_pull_finished_group(app, slot),
            None => false,
        }))
    }

    fn put_district(&self, district: &District) -> Result<(), StoreError> {
        self.write(|state| state.districts.insert(district.id, district.clone()));
        Ok(())
    }

    fn find_district(&self, id: &DistrictId) -> Result<Option<District>, StoreError> {
        Ok(self.read(|state| state.districts.get(id).cloned()))
    }

    fn scan_districts(
        &self,
        visit: &mut dyn FnMut(District) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let districts = self.read(|state| state.districts.values().cloned().collect());
        visit_all(districts, visit)
    }

    fn remove_available_uid(&self, id: &DistrictId, uid: u32) -> Result<bool, StoreError> {
        Ok(self.write(|state| {
            state
                .districts
                .get_mut(id)
                .is_some_and(|district| district.available_uids.remove(&uid))
        }))
    }

    fn add_available_uid(&self, id: &DistrictId, uid: u32) -> Result<bool, StoreError> {
        Ok(self.write(|state| {
            state
                .districts
                .get_mut(id)
                .is_some_and(|district| district.available_uids.insert(uid))
        }))
    }

    fn try_lock(&self, key: &str, now: WallClock, expires: WallClock) -> Result<bool, StoreError> {
        Ok(self.write(|state| {
            if !lock_is_free(state.locks.get(key), now) {
                return false;
            }
            state.locks.insert(
                key.to_string(),
                LockRecord {
                    key: key.to_string(),
                    locked: true,
                    timeout: expires,
                },
            );
            true
        }))
    }

    fn unlock(&self, key: &str) -> Result<(), StoreError> {
        self.write(|state| {
            if let Some(record) = state.locks.get_mut(key) {
                record.locked = false;
            }
        });
        Ok(())
    }

    fn find_lock(&self, key: &str) -> Result<Option<LockRecord>, StoreError> {
        Ok(self.read(|state| state.locks.get(key).cloned()))
    }
}
