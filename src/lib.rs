#![forbid(unsafe_code)]

//! Pending-operation ledger and fleet consistency reconciler for a
//! gear-hosting control plane.
//!
//! - [`ledger`]: per-application operation groups with optimistic,
//!   positional conditional updates.
//! - [`lock`]: advisory, TTL-bounded named locks in the metadata store.
//! - [`reconcile`]: one-shot snapshot, diff and repair of owner quotas, gear
//!   SSH keys and district UID pools.

#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod ledger;
pub mod lock;
mod paths;
pub mod reconcile;
pub mod store;
pub mod telemetry;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

pub use crate::core::{
    AppId, Application, District, DistrictId, Domain, DomainId, Gear, GearId, GroupId, NodeId,
    OpId, OpState, OpType, OperationGroup, OperationRecord, Owner, OwnerId, WallClock,
};
pub use crate::ledger::{OperationLedger, RecordOutcome};
pub use crate::lock::{DistributedLock, LockKey};
pub use crate::reconcile::{ReconcileOptions, ReconcileReport, Reconciler};
pub use crate::store::{DocumentStore, MemoryStore, SqliteStore};
