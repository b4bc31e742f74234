//! Operation ledger.
//!
//! Pending operations live embedded in their application document. Every
//! write re-reads the application, resolves the record's current position,
//! and issues one conditional update addressed by that position. A miss
//! means something else changed the document in between, so the write is
//! retried against a fresh read up to the configured budget. Concurrent
//! writers never block each other; at most one of them wins each slot.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use thiserror::Error;

use crate::core::{
    AppId, Application, GroupId, NewOperation, OpId, OpState, OperationGroup, OperationRecord,
};
use crate::error::{Effect, Transience};
use crate::store::{AppProjection, DocumentStore, GroupSlot, OpSlot, OpUpdate, StoreError};

pub mod retry;

pub use retry::{Attempt, RetryOutcome, retry_with_reload};

pub const DEFAULT_MAX_TRANSITION_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LedgerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("application {app} not found")]
    ApplicationMissing { app: AppId },
    #[error("operation group {group} not found in application {app}")]
    GroupMissing { app: AppId, group: GroupId },
    #[error("operation {op} cannot move from {from} to {to}")]
    InvalidTransition { op: OpId, from: OpState, to: OpState },
    #[error("operation {op} is completed and cannot be retried")]
    RecordCompleted { op: OpId },
    #[error("application {app} kept changing; gave up after {attempts} attempts")]
    Contended { app: AppId, attempts: u32 },
}

impl LedgerError {
    pub fn transience(&self) -> Transience {
        match self {
            LedgerError::Store(e) => e.transience(),
            LedgerError::Contended { .. } => Transience::Retryable,
            LedgerError::ApplicationMissing { .. }
            | LedgerError::GroupMissing { .. }
            | LedgerError::InvalidTransition { .. }
            | LedgerError::RecordCompleted { .. } => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            LedgerError::Store(e) => e.effect(),
            _ => Effect::None,
        }
    }
}

/// Result of a write addressed at one record. None of these is an error:
/// callers inspect the variant to learn what happened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Our conditional update won. `record` is the state we wrote.
    Applied {
        record: OperationRecord,
        attempts: u32,
    },
    /// Another writer already moved the record to the requested state.
    AlreadyInState { record: OperationRecord },
    /// Retry budget spent. `last_seen` is the freshest read of the record.
    Exhausted {
        attempts: u32,
        last_seen: Option<OperationRecord>,
    },
    /// The record or its application no longer exists.
    Vanished,
}

impl RecordOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, RecordOutcome::Applied { .. })
    }

    /// Latest known state of the record, if any.
    pub fn record(&self) -> Option<&OperationRecord> {
        match self {
            RecordOutcome::Applied { record, .. } | RecordOutcome::AlreadyInState { record } => {
                Some(record)
            }
            RecordOutcome::Exhausted { last_seen, .. } => last_seen.as_ref(),
            RecordOutcome::Vanished => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PruneOutcome {
    Pruned,
    /// Some record in the group is not completed yet.
    Unfinished,
    Missing,
    Exhausted { attempts: u32 },
}

/// Capability a parent operation exposes to its children.
///
/// Children hold only the parent's id; the ledger resolves it inside the
/// same application and hands both records over.
pub trait ChildCompletion {
    fn child_completed(&self, app: &Application, parent: &OperationRecord, child: &OperationRecord);
}

impl<F> ChildCompletion for F
where
    F: Fn(&Application, &OperationRecord, &OperationRecord),
{
    fn child_completed(&self, app: &Application, parent: &OperationRecord, child: &OperationRecord) {
        self(app, parent, child)
    }
}

#[derive(Clone)]
pub struct OperationLedger {
    store: Arc<dyn DocumentStore>,
    max_attempts: u32,
}

impl OperationLedger {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            max_attempts: DEFAULT_MAX_TRANSITION_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn reload(&self, app: &AppId) -> Result<Option<Application>, LedgerError> {
        Ok(self.store.find_application(app, AppProjection::Operations)?)
    }

    /// Append a new, empty group to the application.
    pub fn open_group(
        &self,
        app: &AppId,
        action: impl Into<String>,
    ) -> Result<OperationGroup, LedgerError> {
        let group = OperationGroup::new(GroupId::generate(), action);
        if !self.store.push_op_group(app, &group)? {
            return Err(LedgerError::ApplicationMissing { app: *app });
        }
        tracing::debug!(app_id = %app, group_id = %group.id, action = %group.action, "opened operation group");
        Ok(group)
    }

    /// Append a new record in state `init` to `group`.
    pub fn create(
        &self,
        app: &AppId,
        group: &GroupId,
        new: NewOperation,
    ) -> Result<OperationRecord, LedgerError> {
        let record = OperationRecord::from_new(OpId::generate(), new);
        let outcome = retry_with_reload(
            self.max_attempts,
            || self.reload(app),
            |snapshot| {
                let Some(current) = snapshot else {
                    return Err(LedgerError::ApplicationMissing { app: *app });
                };
                let Some(group_index) = current.group_position(group) else {
                    return Err(LedgerError::GroupMissing {
                        app: *app,
                        group: *group,
                    });
                };
                let slot = GroupSlot {
                    app_id: *app,
                    group_index,
                    group_id: *group,
                };
                Ok(if self.store.push_op_record(&slot, &record)? {
                    Attempt::Done(())
                } else {
                    Attempt::Stale
                })
            },
        )?;
        match outcome {
            RetryOutcome::Done { .. } => {
                tracing::debug!(
                    app_id = %app,
                    op_id = %record.id,
                    op_type = %record.op_type,
                    "created operation"
                );
                Ok(record)
            }
            RetryOutcome::Exhausted { attempts, .. } => {
                tracing::warn!(app_id = %app, group_id = %group, attempts, "gave up creating operation");
                Err(LedgerError::Contended {
                    app: *app,
                    attempts,
                })
            }
        }
    }

    /// Move `op` to `next` with an optimistic positional update.
    ///
    /// Contention never surfaces as an error: exhaustion returns
    /// `RecordOutcome::Exhausted` carrying the freshest read.
    pub fn transition(
        &self,
        app: &AppId,
        op: &OpId,
        next: OpState,
    ) -> Result<RecordOutcome, LedgerError> {
        let outcome = retry_with_reload(
            self.max_attempts,
            || self.reload(app),
            |snapshot| {
                let Some((slot, record)) = resolve(snapshot.as_ref(), op) else {
                    return Ok(Attempt::Done(RecordOutcome::Vanished));
                };
                if record.state == next {
                    return Ok(Attempt::Done(RecordOutcome::AlreadyInState {
                        record: record.clone(),
                    }));
                }
                if !record.state.can_transition_to(next) {
                    return Err(LedgerError::InvalidTransition {
                        op: *op,
                        from: record.state,
                        to: next,
                    });
                }
                if !self.store.update_op_record(&slot, &OpUpdate::State(next))? {
                    return Ok(Attempt::Stale);
                }
                let mut record = record.clone();
                record.state = next;
                Ok(Attempt::Done(RecordOutcome::Applied {
                    record,
                    attempts: 0,
                }))
            },
        )?;
        Ok(self.finish(app, op, "transition", outcome))
    }

    /// Transition to `completed`, then notify the parent operation if the
    /// record names one. Notification only follows a transition this call
    /// applied, so a parent hears about each child at most once.
    pub fn complete_and_propagate(
        &self,
        app: &AppId,
        op: &OpId,
        parent_handler: &dyn ChildCompletion,
    ) -> Result<RecordOutcome, LedgerError> {
        let outcome = self.transition(app, op, OpState::Completed)?;
        let RecordOutcome::Applied { record, .. } = &outcome else {
            return Ok(outcome);
        };
        let Some(parent_id) = record.parent_op_id else {
            return Ok(outcome);
        };
        let Some(context) = self.store.find_application(app, AppProjection::Full)? else {
            return Ok(outcome);
        };
        match context.record(&parent_id) {
            Some(parent) => {
                tracing::debug!(app_id = %app, op_id = %op, parent_op_id = %parent_id, "notifying parent");
                parent_handler.child_completed(&context, parent, record);
            }
            None => {
                tracing::debug!(app_id = %app, op_id = %op, parent_op_id = %parent_id, "parent operation no longer pending");
            }
        }
        Ok(outcome)
    }

    /// Record a retry: bump `retry_count` and store the rollback pointer
    /// and saved values.
    pub fn mark_retry(
        &self,
        app: &AppId,
        op: &OpId,
        rollback_op: Option<OpId>,
        saved_values: BTreeMap<String, String>,
    ) -> Result<RecordOutcome, LedgerError> {
        let update = OpUpdate::Retry {
            rollback_op,
            saved_values: saved_values.clone(),
        };
        let outcome = retry_with_reload(
            self.max_attempts,
            || self.reload(app),
            |snapshot| {
                let Some((slot, record)) = resolve(snapshot.as_ref(), op) else {
                    return Ok(Attempt::Done(RecordOutcome::Vanished));
                };
                if record.state == OpState::Completed {
                    return Err(LedgerError::RecordCompleted { op: *op });
                }
                if !self.store.update_op_record(&slot, &update)? {
                    return Ok(Attempt::Stale);
                }
                let mut record = record.clone();
                record.retry_count = record.retry_count.saturating_add(1);
                record.retry_rollback_op = rollback_op;
                record.saved_values = saved_values.clone();
                Ok(Attempt::Done(RecordOutcome::Applied {
                    record,
                    attempts: 0,
                }))
            },
        )?;
        Ok(self.finish(app, op, "mark_retry", outcome))
    }

    /// Remove `group` once every record in it is completed.
    pub fn prune_group(&self, app: &AppId, group: &GroupId) -> Result<PruneOutcome, LedgerError> {
        let outcome = retry_with_reload(
            self.max_attempts,
            || self.reload(app),
            |snapshot| {
                let Some(current) = snapshot else {
                    return Ok(Attempt::Done(PruneOutcome::Missing));
                };
                let Some(group_index) = current.group_position(group) else {
                    return Ok(Attempt::Done(PruneOutcome::Missing));
                };
                if !current.pending_op_groups[group_index].is_finished() {
                    return Ok(Attempt::Done(PruneOutcome::Unfinished));
                }
                let slot = GroupSlot {
                    app_id: *app,
                    group_index,
                    group_id: *group,
                };
                Ok(if self.store.pull_finished_op_group(&slot)? {
                    Attempt::Done(PruneOutcome::Pruned)
                } else {
                    Attempt::Stale
                })
            },
        )?;
        Ok(match outcome {
            RetryOutcome::Done { value, .. } => value,
            RetryOutcome::Exhausted { attempts, .. } => {
                tracing::warn!(app_id = %app, group_id = %group, attempts, "gave up pruning operation group");
                PruneOutcome::Exhausted { attempts }
            }
        })
    }

    /// Pending groups in document order.
    pub fn pending(&self, app: &AppId) -> Result<Vec<OperationGroup>, LedgerError> {
        self.reload(app)?
            .map(|app| app.pending_op_groups)
            .ok_or(LedgerError::ApplicationMissing { app: *app })
    }

    /// Records an executor may dequeue: `init` or `queued`, with every
    /// prerequisite completed. A prerequisite that is no longer pending
    /// belonged to a pruned group and counts as completed.
    pub fn runnable(&self, app: &AppId) -> Result<Vec<OperationRecord>, LedgerError> {
        let groups = self.pending(app)?;
        let records = || groups.iter().flat_map(|group| group.ops.iter());
        let unfinished: BTreeSet<OpId> = records()
            .filter(|record| record.state != OpState::Completed)
            .map(|record| record.id)
            .collect();
        Ok(records()
            .filter(|record| record.state.is_pending())
            .filter(|record| record.prereq.iter().all(|id| !unfinished.contains(id)))
            .cloned()
            .collect())
    }

    fn finish(
        &self,
        app: &AppId,
        op: &OpId,
        action: &'static str,
        outcome: RetryOutcome<RecordOutcome, Option<Application>>,
    ) -> RecordOutcome {
        match outcome {
            RetryOutcome::Done {
                value: RecordOutcome::Applied { record, .. },
                attempts,
            } => RecordOutcome::Applied { record, attempts },
            RetryOutcome::Done { value, .. } => value,
            RetryOutcome::Exhausted { attempts, last } => {
                let last_seen = last.as_ref().and_then(|app| app.record(op)).cloned();
                tracing::warn!(
                    app_id = %app,
                    op_id = %op,
                    action,
                    attempts,
                    last_state = last_seen.as_ref().map(|r| r.state.as_str()),
                    "operation write kept missing; returning last read state"
                );
                RecordOutcome::Exhausted {
                    attempts,
                    last_seen,
                }
            }
        }
    }
}

fn resolve<'a>(app: Option<&'a Application>, op: &OpId) -> Option<(OpSlot, &'a OperationRecord)> {
    let app = app?;
    let position = app.locate_op(op)?;
    let record = app.record_at(&position)?;
    let slot = OpSlot::for_record(
        app.id,
        position.group_index,
        position.group_id,
        position.record_index,
        record,
    );
    Some((slot, record))
}
