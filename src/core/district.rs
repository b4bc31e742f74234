//! Districts: node groups sharing one UID namespace.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::identity::{DistrictId, NodeId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct District {
    pub id: DistrictId,
    pub name: String,
    pub first_uid: u32,
    pub capacity: u32,
    #[serde(default)]
    pub server_identities: Vec<NodeId>,
    /// OS user ids not assigned to any gear in this district.
    #[serde(default)]
    pub available_uids: BTreeSet<u32>,
}

impl District {
    /// New district with its whole UID range available.
    pub fn new(id: DistrictId, name: impl Into<String>, first_uid: u32, capacity: u32) -> Self {
        Self {
            id,
            name: name.into(),
            first_uid,
            capacity,
            server_identities: Vec::new(),
            available_uids: (first_uid..first_uid.saturating_add(capacity)).collect(),
        }
    }

    pub fn uid_range(&self) -> std::ops::Range<u32> {
        self.first_uid..self.first_uid.saturating_add(self.capacity)
    }

    pub fn contains_uid(&self, uid: u32) -> bool {
        self.uid_range().contains(&uid)
    }

    pub fn has_member(&self, node: &NodeId) -> bool {
        self.server_identities.contains(node)
    }

    pub fn is_available(&self, uid: u32) -> bool {
        self.available_uids.contains(&uid)
    }
}
