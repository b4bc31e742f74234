//! Core domain types (Layers 0-3)
//!
//! Module hierarchy follows type dependency order:
//! - time: WallClock, clock sources (Layer 0)
//! - identity: uuid-backed ids, NodeId (Layer 1)
//! - ssh, operation, district: leaf entities (Layer 2)
//! - app: Owner, Domain, Application aggregate (Layer 3)

pub mod app;
pub mod district;
pub mod error;
pub mod identity;
pub mod operation;
pub mod ssh;
pub mod time;

pub use app::{Application, Domain, Gear, GroupInstance, OpPosition, Owner};
pub use district::District;
pub use error::{CoreError, InvalidId, UnknownTag};
pub use identity::{
    AppId, DistrictId, DomainId, GearId, GroupId, GroupInstanceId, NodeId, OpId, OwnerId,
};
pub use operation::{NewOperation, OpState, OpType, OperationGroup, OperationRecord};
pub use ssh::{KeyHash, KeySet, SshKey, key_set};
pub use time::{ManualClock, SystemClock, WallClock, WallClockSource};
