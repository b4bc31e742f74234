//! Pure comparisons over a fleet snapshot.

use serde::{Deserialize, Serialize};

use crate::core::{AppId, DistrictId, GearId, KeyHash, NodeId, OwnerId};

use super::snapshot::{DistrictUids, GearKeys, OwnerQuota};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaError {
    pub owner_id: OwnerId,
    pub login: String,
    pub recorded: u32,
    pub actual: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyDrift {
    /// Authorized on the node, absent from the metadata store.
    Unrecorded,
    /// Recorded in the metadata store, not authorized on the node.
    MissingOnNode,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyError {
    pub app_id: AppId,
    pub gear_id: GearId,
    pub node: NodeId,
    pub drift: KeyDrift,
    pub key_hash: KeyHash,
    pub key_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UidErrorKind {
    /// In live use and still listed available.
    Unreserved {
        app_id: AppId,
        gear_id: GearId,
        node: NodeId,
    },
    /// In range, neither live nor available.
    Unused,
    /// Listed available but outside the district's range.
    OutOfRange,
    /// Held by more than one live gear. Reported only; picking the gear
    /// that keeps the UID needs an operator.
    SharedUid { gear_ids: Vec<GearId> },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UidError {
    pub district_id: DistrictId,
    pub district_name: String,
    pub uid: u32,
    #[serde(flatten)]
    pub kind: UidErrorKind,
}

pub fn diff_quotas(quotas: &[OwnerQuota]) -> Vec<QuotaError> {
    quotas
        .iter()
        .filter(|quota| quota.recorded != quota.actual)
        .map(|quota| QuotaError {
            owner_id: quota.owner_id,
            login: quota.login.clone(),
            recorded: quota.recorded,
            actual: quota.actual,
        })
        .collect()
}

pub fn diff_keys(gears: &[GearKeys]) -> Vec<KeyError> {
    let mut errors = Vec::new();
    for gear in gears {
        let finding = |drift: KeyDrift, hash: &KeyHash, name: &String| KeyError {
            app_id: gear.app_id,
            gear_id: gear.gear_id,
            node: gear.node.clone(),
            drift,
            key_hash: hash.clone(),
            key_name: name.clone(),
        };
        errors.extend(
            gear.live
                .iter()
                .filter(|(hash, _)| !gear.recorded.contains_key(*hash))
                .map(|(hash, name)| finding(KeyDrift::Unrecorded, hash, name)),
        );
        errors.extend(
            gear.recorded
                .iter()
                .filter(|(hash, _)| !gear.live.contains_key(*hash))
                .map(|(hash, name)| finding(KeyDrift::MissingOnNode, hash, name)),
        );
    }
    errors
}

pub fn diff_uids(districts: &[DistrictUids]) -> Vec<UidError> {
    let mut errors = Vec::new();
    for district in districts {
        let error = |uid: u32, kind: UidErrorKind| UidError {
            district_id: district.district_id,
            district_name: district.name.clone(),
            uid,
            kind,
        };
        for &uid in &district.available {
            if !district.contains_uid(uid) {
                errors.push(error(uid, UidErrorKind::OutOfRange));
            } else if let Some(gear) = district.live.get(&uid).and_then(|gears| gears.first()) {
                errors.push(error(
                    uid,
                    UidErrorKind::Unreserved {
                        app_id: gear.app_id,
                        gear_id: gear.gear_id,
                        node: gear.node.clone(),
                    },
                ));
            }
        }
        for (&uid, gears) in &district.live {
            if gears.len() > 1 {
                errors.push(error(
                    uid,
                    UidErrorKind::SharedUid {
                        gear_ids: gears.iter().map(|gear| gear.gear_id).collect(),
                    },
                ));
            }
        }
        let end = district.first_uid.saturating_add(district.capacity);
        for uid in district.first_uid..end {
            if !district.available.contains(&uid) && !district.live.contains_key(&uid) {
                errors.push(error(uid, UidErrorKind::Unused));
            }
        }
    }
    errors
}
