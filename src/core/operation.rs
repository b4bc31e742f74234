//! Layer 2: Pending operations
//!
//! An `OperationGroup` is one logical lifecycle action (create an app, scale
//! a component, ...) decomposed into ordered `OperationRecord`s. Both live
//! embedded inside their `Application` document; neither is stored on its own.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::{CoreError, UnknownTag};
use super::identity::{GroupId, OpId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    CreateApplication,
    CreateGear,
    AddComponent,
    RemoveComponent,
    ScaleUp,
    ScaleDown,
    DestroyGear,
    DeleteApplication,
    UpdateSshKeys,
    TrackUsage,
}

impl OpType {
    pub fn as_str(self) -> &'static str {
        match self {
            OpType::CreateApplication => "create_application",
            OpType::CreateGear => "create_gear",
            OpType::AddComponent => "add_component",
            OpType::RemoveComponent => "remove_component",
            OpType::ScaleUp => "scale_up",
            OpType::ScaleDown => "scale_down",
            OpType::DestroyGear => "destroy_gear",
            OpType::DeleteApplication => "delete_application",
            OpType::UpdateSshKeys => "update_ssh_keys",
            OpType::TrackUsage => "track_usage",
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpState {
    Init,
    Queued,
    Completed,
    Failed,
}

impl OpState {
    pub fn as_str(self) -> &'static str {
        match self {
            OpState::Init => "init",
            OpState::Queued => "queued",
            OpState::Completed => "completed",
            OpState::Failed => "failed",
        }
    }

    /// `completed` is terminal; everything else may move, including
    /// `failed -> queued` for a retry.
    pub fn can_transition_to(self, next: OpState) -> bool {
        self != next && self != OpState::Completed
    }

    pub fn is_pending(self) -> bool {
        matches!(self, OpState::Init | OpState::Queued)
    }
}

impl fmt::Display for OpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "init" => Ok(OpState::Init),
            "queued" => Ok(OpState::Queued),
            "completed" | "complete" | "done" => Ok(OpState::Completed),
            "failed" | "fail" => Ok(OpState::Failed),
            _ => Err(UnknownTag {
                kind: "operation state",
                raw: s.to_string(),
            }
            .into()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: OpId,
    pub op_type: OpType,
    pub state: OpState,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, String>,
    /// Records that must reach `completed` before an executor dequeues this
    /// one. Stored only; the ledger never enforces it.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prereq: Vec<OpId>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_rollback_op: Option<OpId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub saved_values: BTreeMap<String, String>,
    /// Weak reference to the parent record in the same application.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_op_id: Option<OpId>,
}

impl OperationRecord {
    pub fn from_new(id: OpId, new: NewOperation) -> Self {
        Self {
            id,
            op_type: new.op_type,
            state: OpState::Init,
            args: new.args,
            prereq: new.prereq,
            retry_count: 0,
            retry_rollback_op: None,
            saved_values: BTreeMap::new(),
            parent_op_id: new.parent_op_id,
        }
    }
}

/// Caller-supplied fields for a record about to be created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewOperation {
    pub op_type: OpType,
    pub args: BTreeMap<String, String>,
    pub prereq: Vec<OpId>,
    pub parent_op_id: Option<OpId>,
}

impl NewOperation {
    pub fn new(op_type: OpType) -> Self {
        Self {
            op_type,
            args: BTreeMap::new(),
            prereq: Vec::new(),
            parent_op_id: None,
        }
    }

    pub fn arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    pub fn after(mut self, prereq: OpId) -> Self {
        self.prereq.push(prereq);
        self
    }

    pub fn child_of(mut self, parent: OpId) -> Self {
        self.parent_op_id = Some(parent);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationGroup {
    pub id: GroupId,
    pub action: String,
    #[serde(default)]
    pub ops: Vec<OperationRecord>,
}

impl OperationGroup {
    pub fn new(id: GroupId, action: impl Into<String>) -> Self {
        Self {
            id,
            action: action.into(),
            ops: Vec::new(),
        }
    }

    pub fn position_of(&self, op: &OpId) -> Option<usize> {
        self.ops.iter().position(|record| &record.id == op)
    }

    pub fn record(&self, op: &OpId) -> Option<&OperationRecord> {
        self.ops.iter().find(|record| &record.id == op)
    }

    pub fn is_finished(&self) -> bool {
        self.ops
            .iter()
            .all(|record| record.state == OpState::Completed)
    }
}
