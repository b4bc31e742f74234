//! Reconcile report: per-category checks with findings, repair outcomes and
//! a detected/fixed/failed summary.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::diff::{KeyError, QuotaError, UidError};
use super::snapshot::SnapshotStats;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Quota,
    SshKeys,
    Uids,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Quota, Category::SshKeys, Category::Uids];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Quota => "quota",
            Category::SshKeys => "ssh_keys",
            Category::Uids => "uids",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Finding {
    Quota(QuotaError),
    SshKey(KeyError),
    Uid(UidError),
}

impl Finding {
    pub fn category(&self) -> Category {
        match self {
            Finding::Quota(_) => Category::Quota,
            Finding::SshKey(_) => Category::SshKeys,
            Finding::Uid(_) => Category::Uids,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Check {
    pub category: Category,
    pub status: CheckStatus,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub findings: Vec<Finding>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStatus {
    Fixed,
    /// The precondition no longer held on re-read; nothing to do.
    SelfResolved,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    LockUnavailable,
    PersistentInconsistency,
    Resync,
    Store,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairRecord {
    pub category: Category,
    pub target: String,
    pub status: RepairStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategorySummary {
    pub detected: usize,
    pub fixed: usize,
    pub failed: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub categories: BTreeMap<Category, CategorySummary>,
    pub inconsistent: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub checked_at_ms: u64,
    pub report_only: bool,
    pub stats: SnapshotStats,
    pub checks: Vec<Check>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub repairs: Vec<RepairRecord>,
    pub summary: ReconcileSummary,
}

impl ReconcileReport {
    pub fn has_inconsistencies(&self) -> bool {
        self.summary.inconsistent
    }

    /// Process exit status: 0 iff nothing was detected, whatever the mode.
    pub fn exit_code(&self) -> i32 {
        if self.has_inconsistencies() { 1 } else { 0 }
    }

    pub fn check(&self, category: Category) -> Option<&Check> {
        self.checks.iter().find(|check| check.category == category)
    }

    pub fn category(&self, category: Category) -> CategorySummary {
        self.summary
            .categories
            .get(&category)
            .copied()
            .unwrap_or_default()
    }
}

/// Everything one category contributed to a pass.
#[derive(Clone, Debug, Default)]
pub(crate) struct CategoryOutcome {
    pub findings: Vec<Finding>,
    pub repairs: Vec<RepairRecord>,
}

pub(crate) struct ReportBuilder {
    checked_at_ms: u64,
    report_only: bool,
    stats: SnapshotStats,
    checks: BTreeMap<Category, Check>,
    repairs: Vec<RepairRecord>,
}

impl ReportBuilder {
    pub fn new(checked_at_ms: u64, report_only: bool, stats: SnapshotStats) -> Self {
        Self {
            checked_at_ms,
            report_only,
            stats,
            checks: BTreeMap::new(),
            repairs: Vec::new(),
        }
    }

    pub fn record_category(&mut self, category: Category, outcome: CategoryOutcome) {
        let check = self.checks.entry(category).or_insert_with(|| Check {
            category,
            status: CheckStatus::Pass,
            severity: Severity::Low,
            findings: Vec::new(),
        });
        for finding in outcome.findings {
            let (status, severity) = classify(&finding);
            check.status = std::cmp::max(check.status, status);
            check.severity = std::cmp::max(check.severity, severity);
            check.findings.push(finding);
        }
        self.repairs.extend(outcome.repairs);
    }

    pub fn finish(self) -> ReconcileReport {
        let mut categories = BTreeMap::new();
        for (category, check) in &self.checks {
            let repairs = self.repairs.iter().filter(|r| r.category == *category);
            let mut summary = CategorySummary {
                detected: check.findings.len(),
                ..CategorySummary::default()
            };
            for repair in repairs {
                match repair.status {
                    RepairStatus::Fixed => summary.fixed += 1,
                    RepairStatus::Failed => summary.failed += 1,
                    RepairStatus::SelfResolved => {}
                }
            }
            categories.insert(*category, summary);
        }
        let inconsistent = categories.values().any(|summary| summary.detected > 0);
        ReconcileReport {
            checked_at_ms: self.checked_at_ms,
            report_only: self.report_only,
            stats: self.stats,
            checks: self.checks.into_values().collect(),
            repairs: self.repairs,
            summary: ReconcileSummary {
                categories,
                inconsistent,
            },
        }
    }
}

fn classify(finding: &Finding) -> (CheckStatus, Severity) {
    use super::diff::UidErrorKind;
    match finding {
        Finding::Quota(_) => (CheckStatus::Fail, Severity::Medium),
        Finding::SshKey(_) => (CheckStatus::Fail, Severity::High),
        Finding::Uid(error) => match error.kind {
            UidErrorKind::Unreserved { .. } => (CheckStatus::Fail, Severity::High),
            UidErrorKind::Unused => (CheckStatus::Warn, Severity::Low),
            UidErrorKind::OutOfRange => (CheckStatus::Warn, Severity::Medium),
            UidErrorKind::SharedUid { .. } => (CheckStatus::Fail, Severity::High),
        },
    }
}
