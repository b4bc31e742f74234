//! Consistency reconciler: snapshot, diff, repair.
//!
//! One pass captures the fleet once, diffs three independent views (owner
//! quota counters, gear SSH keys, district UID pools) and, unless running
//! report-only, repairs each finding. Categories run on scoped threads.
//! Per-item failures are tallied in the report and never abort the batch.

use std::fmt;
use std::sync::Arc;

use crossbeam::channel::{self, Sender};
use thiserror::Error;

use crate::core::{AppId, WallClock};
use crate::error::Transience;
use crate::lock::DistributedLock;
use crate::store::{DocumentStore, StoreError};

pub mod agent;
pub mod diff;
pub mod repair;
pub mod report;
pub mod snapshot;

pub use agent::{
    AgentError, AgentInventory, AgentKeyResync, FileNodeAgent, KeyResync, NodeAgentProxy,
    NodeReport, ResyncError, ResyncSummary,
};
pub use diff::{KeyDrift, KeyError, QuotaError, UidError, UidErrorKind};
pub use repair::{RepairError, Repaired};
pub use report::{
    Category, CategorySummary, Check, CheckStatus, FailureKind, Finding, ReconcileReport,
    RepairRecord, RepairStatus, Severity,
};
pub use snapshot::{FleetSnapshot, SnapshotStats, recompute_consumed_gears};

use repair::Repairer;
use report::{CategoryOutcome, ReportBuilder};

pub const DEFAULT_LOCK_TTL_SECS: u64 = 60;

/// Failures that stop a whole pass before any category runs.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReconcileError {
    #[error("failed to snapshot metadata store: {0}")]
    Snapshot(#[from] StoreError),
    #[error("failed to query node agents: {0}")]
    Agent(#[from] AgentError),
    #[error("no categories selected")]
    NothingSelected,
}

impl ReconcileError {
    pub fn transience(&self) -> Transience {
        match self {
            ReconcileError::Snapshot(e) => e.transience(),
            ReconcileError::Agent(e) => e.transience(),
            ReconcileError::NothingSelected => Transience::Permanent,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcileOptions {
    pub quota: bool,
    pub ssh_keys: bool,
    pub uids: bool,
    pub report_only: bool,
    pub lock_ttl_secs: u64,
    pub parallel: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            quota: true,
            ssh_keys: true,
            uids: true,
            report_only: false,
            lock_ttl_secs: DEFAULT_LOCK_TTL_SECS,
            parallel: true,
        }
    }
}

impl ReconcileOptions {
    pub fn report_only() -> Self {
        Self {
            report_only: true,
            ..Self::default()
        }
    }

    pub fn only(categories: &[Category]) -> Self {
        Self {
            quota: categories.contains(&Category::Quota),
            ssh_keys: categories.contains(&Category::SshKeys),
            uids: categories.contains(&Category::Uids),
            ..Self::default()
        }
    }

    pub fn selected(&self) -> Vec<Category> {
        Category::ALL
            .into_iter()
            .filter(|category| match category {
                Category::Quota => self.quota,
                Category::SshKeys => self.ssh_keys,
                Category::Uids => self.uids,
            })
            .collect()
    }
}

/// One per-item line of the verbose stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Progress {
    pub category: Category,
    pub target: String,
    pub ok: bool,
    pub detail: String,
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.ok { "OK" } else { "FAIL" };
        write!(
            f,
            "{status:<4} {:<8} {}: {}",
            self.category.as_str(),
            self.target,
            self.detail
        )
    }
}

pub struct Reconciler {
    store: Arc<dyn DocumentStore>,
    agent: Arc<dyn NodeAgentProxy>,
    resync: Arc<dyn KeyResync>,
    lock: DistributedLock,
}

impl Reconciler {
    pub fn new(store: Arc<dyn DocumentStore>, agent: Arc<dyn NodeAgentProxy>) -> Self {
        let resync = Arc::new(AgentKeyResync::new(store.clone(), agent.clone()));
        let lock = DistributedLock::new(store.clone());
        Self {
            store,
            agent,
            resync,
            lock,
        }
    }

    pub fn with_resync(mut self, resync: Arc<dyn KeyResync>) -> Self {
        self.resync = resync;
        self
    }

    pub fn with_lock(mut self, lock: DistributedLock) -> Self {
        self.lock = lock;
        self
    }

    pub fn run(&self, options: &ReconcileOptions) -> Result<ReconcileReport, ReconcileError> {
        self.run_with_progress(options, |_| {})
    }

    /// Run one pass. `sink` receives every per-item line on a single
    /// consumer thread, in completion order.
    pub fn run_with_progress(
        &self,
        options: &ReconcileOptions,
        mut sink: impl FnMut(Progress) + Send,
    ) -> Result<ReconcileReport, ReconcileError> {
        let selected = options.selected();
        if selected.is_empty() {
            return Err(ReconcileError::NothingSelected);
        }
        let span = tracing::info_span!("reconcile", report_only = options.report_only);
        let _enter = span.enter();

        let checked_at = WallClock::now();
        let inventory = if options.ssh_keys {
            self.agent.gear_key_inventory()?
        } else {
            AgentInventory::default()
        };
        let snapshot = snapshot::capture(self.store.as_ref(), &inventory)?;
        let repairer = Repairer {
            store: self.store.as_ref(),
            lock: &self.lock,
            resync: self.resync.as_ref(),
            lock_ttl_secs: options.lock_ttl_secs,
        };

        let (tx, rx) = channel::unbounded::<Progress>();
        let outcomes: Vec<(Category, CategoryOutcome)> = std::thread::scope(|scope| {
            let consumer = scope.spawn(move || {
                for line in rx {
                    sink(line);
                }
            });
            let run = |category: Category, tx: Sender<Progress>| {
                let _span =
                    tracing::info_span!(parent: &span, "category", category = category.as_str())
                        .entered();
                let outcome =
                    run_category(category, &snapshot, &repairer, options.report_only, &tx);
                tracing::info!(
                    findings = outcome.findings.len(),
                    repairs = outcome.repairs.len(),
                    "category done"
                );
                (category, outcome)
            };
            let outcomes = if options.parallel {
                let handles: Vec<_> = selected
                    .iter()
                    .map(|&category| {
                        let tx = tx.clone();
                        scope.spawn(move || run(category, tx))
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| {
                        handle
                            .join()
                            .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
                    })
                    .collect()
            } else {
                selected
                    .iter()
                    .map(|&category| run(category, tx.clone()))
                    .collect()
            };
            drop(tx);
            if let Err(panic) = consumer.join() {
                std::panic::resume_unwind(panic);
            }
            outcomes
        });

        let mut builder =
            ReportBuilder::new(checked_at.0, options.report_only, snapshot.stats.clone());
        for (category, outcome) in outcomes {
            builder.record_category(category, outcome);
        }
        let report = builder.finish();
        for (category, summary) in &report.summary.categories {
            tracing::info!(
                category = category.as_str(),
                detected = summary.detected,
                fixed = summary.fixed,
                failed = summary.failed,
                "reconcile summary"
            );
        }
        Ok(report)
    }
}

fn run_category(
    category: Category,
    snapshot: &FleetSnapshot,
    repairer: &Repairer<'_>,
    report_only: bool,
    progress: &Sender<Progress>,
) -> CategoryOutcome {
    let mut outcome = CategoryOutcome::default();
    let emit = |target: &str, ok: bool, detail: String| {
        // The consumer only goes away once every sender is dropped.
        let _ = progress.send(Progress {
            category,
            target: target.to_string(),
            ok,
            detail,
        });
    };

    match category {
        Category::Quota => {
            for error in diff::diff_quotas(&snapshot.quotas) {
                let target = format!("owner {} ({})", error.owner_id, error.login);
                emit(
                    &target,
                    false,
                    format!("consumed_gears {} but {} gears found", error.recorded, error.actual),
                );
                if !report_only {
                    let result = repairer.quota(&error.owner_id);
                    outcome.repairs.push(record(category, target, result, &emit));
                }
                outcome.findings.push(Finding::Quota(error));
            }
        }
        Category::SshKeys => {
            let errors = diff::diff_keys(&snapshot.gear_keys);
            for error in &errors {
                let target = format!("gear {} of {}", error.gear_id, error.app_id);
                let detail = match error.drift {
                    KeyDrift::Unrecorded => {
                        format!("key '{}' present on node but not recorded", error.key_name)
                    }
                    KeyDrift::MissingOnNode => {
                        format!("key '{}' recorded but missing on node", error.key_name)
                    }
                };
                emit(&target, false, detail);
            }
            if !report_only {
                let mut apps: Vec<AppId> = errors.iter().map(|error| error.app_id).collect();
                apps.sort();
                apps.dedup();
                for app_id in apps {
                    let result = repairer.ssh_keys(&app_id);
                    outcome
                        .repairs
                        .push(record(category, format!("application {app_id}"), result, &emit));
                }
            }
            outcome.findings.extend(errors.into_iter().map(Finding::SshKey));
        }
        Category::Uids => {
            for error in diff::diff_uids(&snapshot.districts) {
                let target = format!("district {} uid {}", error.district_name, error.uid);
                let (detail, result) = match &error.kind {
                    UidErrorKind::Unreserved {
                        app_id, gear_id, ..
                    } => (
                        format!("in use by gear {gear_id} but listed available"),
                        (!report_only).then(|| {
                            repairer.uid_unreserved(&error.district_id, error.uid, app_id, gear_id)
                        }),
                    ),
                    UidErrorKind::Unused => (
                        "reserved but not in use".to_string(),
                        (!report_only).then(|| repairer.uid_unused(&error.district_id, error.uid)),
                    ),
                    UidErrorKind::OutOfRange => ("listed available but out of range".to_string(), None),
                    UidErrorKind::SharedUid { gear_ids } => (
                        format!("held by {} live gears", gear_ids.len()),
                        None,
                    ),
                };
                emit(&target, false, detail);
                if let Some(result) = result {
                    outcome.repairs.push(record(category, target, result, &emit));
                }
                outcome.findings.push(Finding::Uid(error));
            }
        }
    }
    outcome
}

fn record(
    category: Category,
    target: String,
    result: Result<Repaired, RepairError>,
    emit: &impl Fn(&str, bool, String),
) -> RepairRecord {
    let (status, failure, detail) = match result {
        Ok(Repaired::Fixed(detail)) => (RepairStatus::Fixed, None, detail),
        Ok(Repaired::SelfResolved(detail)) => (RepairStatus::SelfResolved, None, detail),
        Err(err) => match err.failure_kind() {
            None => (RepairStatus::SelfResolved, None, err.to_string()),
            Some(kind) => {
                tracing::warn!(category = category.as_str(), target = %target, error = %err, "repair failed");
                (RepairStatus::Failed, Some(kind), err.to_string())
            }
        },
    };
    emit(
        &target,
        status != RepairStatus::Failed,
        format!("repair {}: {detail}", repair_label(status)),
    );
    RepairRecord {
        category,
        target,
        status,
        failure,
        detail,
    }
}

fn repair_label(status: RepairStatus) -> &'static str {
    match status {
        RepairStatus::Fixed => "fixed",
        RepairStatus::SelfResolved => "skipped",
        RepairStatus::Failed => "failed",
    }
}
