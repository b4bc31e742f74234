//! Layer 3: Owners, domains and the Application aggregate.

use serde::{Deserialize, Serialize};

use super::identity::{AppId, DomainId, GearId, GroupId, GroupInstanceId, NodeId, OpId, OwnerId};
use super::operation::{OperationGroup, OperationRecord};
use super::ssh::SshKey;

/// Quota-tracked owner.
///
/// `consumed_gears` is a cache over the owner's applications. Lifecycle code
/// bumps it advisorily; only the reconciler corrects drift.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub id: OwnerId,
    pub login: String,
    #[serde(default)]
    pub consumed_gears: u32,
    #[serde(default)]
    pub max_gears: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_keys: Vec<SshKey>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    pub id: DomainId,
    pub namespace: String,
    pub owner_id: OwnerId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub system_ssh_keys: Vec<SshKey>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gear {
    pub id: GearId,
    pub uid: u32,
    pub server_identity: NodeId,
}

/// A horizontally scaled set of gears fulfilling one role.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInstance {
    pub id: GroupInstanceId,
    #[serde(default)]
    pub gears: Vec<Gear>,
}

/// Exact slot of a record inside its aggregate, as of one read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpPosition {
    pub group_index: usize,
    pub group_id: GroupId,
    pub record_index: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub id: AppId,
    pub name: String,
    pub owner_id: OwnerId,
    pub domain_id: DomainId,
    #[serde(default)]
    pub group_instances: Vec<GroupInstance>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_keys: Vec<SshKey>,
    #[serde(default)]
    pub pending_op_groups: Vec<OperationGroup>,
}

impl Application {
    pub fn new(
        id: AppId,
        name: impl Into<String>,
        owner_id: OwnerId,
        domain_id: DomainId,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            owner_id,
            domain_id,
            group_instances: Vec::new(),
            ssh_keys: Vec::new(),
            pending_op_groups: Vec::new(),
        }
    }

    pub fn gears(&self) -> impl Iterator<Item = &Gear> {
        self.group_instances
            .iter()
            .flat_map(|instance| instance.gears.iter())
    }

    pub fn gear_count(&self) -> usize {
        self.gears().count()
    }

    pub fn gear(&self, id: &GearId) -> Option<&Gear> {
        self.gears().find(|gear| &gear.id == id)
    }

    /// Gear holding `uid` on one of `nodes`, if any.
    pub fn gear_using_uid<'a>(&'a self, uid: u32, nodes: &[NodeId]) -> Option<&'a Gear> {
        self.gears()
            .find(|gear| gear.uid == uid && nodes.contains(&gear.server_identity))
    }

    pub fn group_position(&self, group: &GroupId) -> Option<usize> {
        self.pending_op_groups.iter().position(|g| &g.id == group)
    }

    pub fn group(&self, group: &GroupId) -> Option<&OperationGroup> {
        self.pending_op_groups.iter().find(|g| &g.id == group)
    }

    /// Resolve where `op` currently sits. Positions shift whenever a sibling
    /// group or record is inserted or removed, so never cache the result
    /// across reads.
    pub fn locate_op(&self, op: &OpId) -> Option<OpPosition> {
        self.pending_op_groups
            .iter()
            .enumerate()
            .find_map(|(group_index, group)| {
                group.position_of(op).map(|record_index| OpPosition {
                    group_index,
                    group_id: group.id,
                    record_index,
                })
            })
    }

    pub fn record(&self, op: &OpId) -> Option<&OperationRecord> {
        let position = self.locate_op(op)?;
        self.pending_op_groups
            .get(position.group_index)?
            .ops
            .get(position.record_index)
    }

    pub fn record_at(&self, position: &OpPosition) -> Option<&OperationRecord> {
        self.pending_op_groups
            .get(position.group_index)?
            .ops
            .get(position.record_index)
    }
}
