//! Fleet snapshot: one streaming pass over the metadata store plus one bulk
//! node agent query, folded into the three independent views the diffs
//! compare.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::{
    AppId, Application, District, DistrictId, Domain, DomainId, GearId, KeySet, NodeId, Owner,
    OwnerId, key_set,
};
use crate::store::{AppProjection, DocumentStore, StoreError};

use super::agent::AgentInventory;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotStats {
    pub owners: usize,
    pub domains: usize,
    pub applications: usize,
    pub gears: usize,
    pub districts: usize,
    pub nodes_responding: usize,
    /// Gears whose node did not answer this pass.
    pub gears_on_silent_nodes: usize,
    /// Gears on a responding node that did not list them.
    pub gears_unreported: usize,
    /// Gears on nodes that belong to no district.
    pub gears_without_district: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnerQuota {
    pub owner_id: OwnerId,
    pub login: String,
    pub recorded: u32,
    pub actual: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GearKeys {
    pub app_id: AppId,
    pub gear_id: GearId,
    pub node: NodeId,
    pub recorded: KeySet,
    pub live: KeySet,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LiveGear {
    pub app_id: AppId,
    pub gear_id: GearId,
    pub node: NodeId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DistrictUids {
    pub district_id: DistrictId,
    pub name: String,
    pub first_uid: u32,
    pub capacity: u32,
    pub available: BTreeSet<u32>,
    /// Every live gear holding each UID, in scan order.
    pub live: BTreeMap<u32, Vec<LiveGear>>,
}

impl DistrictUids {
    pub fn contains_uid(&self, uid: u32) -> bool {
        uid >= self.first_uid && uid - self.first_uid < self.capacity
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FleetSnapshot {
    pub stats: SnapshotStats,
    pub quotas: Vec<OwnerQuota>,
    pub gear_keys: Vec<GearKeys>,
    pub districts: Vec<DistrictUids>,
}

/// Stream the store once and build all three views.
pub fn capture(
    store: &dyn DocumentStore,
    inventory: &AgentInventory,
) -> Result<FleetSnapshot, StoreError> {
    let mut owners: BTreeMap<OwnerId, Owner> = BTreeMap::new();
    store.scan_owners(&mut |owner| {
        owners.insert(owner.id, owner);
        Ok(())
    })?;
    let mut domains: BTreeMap<DomainId, Domain> = BTreeMap::new();
    store.scan_domains(&mut |domain| {
        domains.insert(domain.id, domain);
        Ok(())
    })?;
    let mut districts: Vec<District> = Vec::new();
    store.scan_districts(&mut |district| {
        districts.push(district);
        Ok(())
    })?;
    let node_district: BTreeMap<&NodeId, usize> = districts
        .iter()
        .enumerate()
        .flat_map(|(index, district)| district.server_identities.iter().map(move |n| (n, index)))
        .collect();

    let mut snapshot = FleetSnapshot {
        stats: SnapshotStats {
            owners: owners.len(),
            domains: domains.len(),
            districts: districts.len(),
            nodes_responding: inventory.responding.len(),
            ..SnapshotStats::default()
        },
        ..FleetSnapshot::default()
    };
    let mut actual_gears: BTreeMap<OwnerId, u32> = BTreeMap::new();
    let mut live_uids: Vec<BTreeMap<u32, Vec<LiveGear>>> = vec![BTreeMap::new(); districts.len()];

    store.scan_applications(AppProjection::Inventory, &mut |app: Application| {
        snapshot.stats.applications += 1;
        // Quota follows the domain walk; an application whose domain is
        // gone counts toward nobody.
        let domain = domains.get(&app.domain_id);
        if let Some(domain) = domain {
            *actual_gears.entry(domain.owner_id).or_default() += app.gear_count() as u32;
        }

        let owner_keys = owners
            .get(&app.owner_id)
            .into_iter()
            .flat_map(|owner| owner.ssh_keys.iter());
        let domain_keys = domain
            .into_iter()
            .flat_map(|domain| domain.system_ssh_keys.iter());
        let recorded = key_set(owner_keys.chain(domain_keys).chain(app.ssh_keys.iter()));

        for gear in app.gears() {
            snapshot.stats.gears += 1;
            let node = &gear.server_identity;

            match node_district.get(node) {
                Some(&index) => {
                    live_uids[index].entry(gear.uid).or_default().push(LiveGear {
                        app_id: app.id,
                        gear_id: gear.id,
                        node: node.clone(),
                    });
                }
                None => snapshot.stats.gears_without_district += 1,
            }

            if !inventory.responded(node) {
                snapshot.stats.gears_on_silent_nodes += 1;
                continue;
            }
            let Some(live) = inventory.keys_for(node, &gear.id) else {
                snapshot.stats.gears_unreported += 1;
                continue;
            };
            snapshot.gear_keys.push(GearKeys {
                app_id: app.id,
                gear_id: gear.id,
                node: node.clone(),
                recorded: recorded.clone(),
                live: live.clone(),
            });
        }
        Ok(())
    })?;

    snapshot.quotas = owners
        .values()
        .map(|owner| OwnerQuota {
            owner_id: owner.id,
            login: owner.login.clone(),
            recorded: owner.consumed_gears,
            actual: actual_gears.get(&owner.id).copied().unwrap_or(0),
        })
        .collect();
    snapshot.districts = districts
        .into_iter()
        .zip(live_uids)
        .map(|(district, live)| DistrictUids {
            district_id: district.id,
            name: district.name,
            first_uid: district.first_uid,
            capacity: district.capacity,
            available: district.available_uids,
            live,
        })
        .collect();

    tracing::debug!(
        owners = snapshot.stats.owners,
        applications = snapshot.stats.applications,
        gears = snapshot.stats.gears,
        districts = snapshot.stats.districts,
        "captured fleet snapshot"
    );
    Ok(snapshot)
}

/// True gear count for an owner, from primary reads: the owner's domains,
/// their applications, their gears.
pub fn recompute_consumed_gears(
    store: &dyn DocumentStore,
    owner: &OwnerId,
) -> Result<u32, StoreError> {
    let mut owned_domains = Vec::new();
    store.scan_domains(&mut |domain| {
        if &domain.owner_id == owner {
            owned_domains.push(domain.id);
        }
        Ok(())
    })?;
    let mut total = 0u32;
    for domain in owned_domains {
        for app in store.applications_in_domain(&domain, AppProjection::Inventory)? {
            total = total.saturating_add(app.gear_count() as u32);
        }
    }
    Ok(total)
}
