//! Human renderer for CLI outputs.
//!
//! Pure formatting; handlers gather the data.

use std::fmt::Write as _;

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::core::{AppId, OperationGroup, OperationRecord};
use crate::reconcile::{
    Category, Check, CheckStatus, Finding, KeyDrift, ReconcileReport, RepairStatus, UidErrorKind,
};

pub fn render_report(report: &ReconcileReport) -> String {
    let mut out = String::new();
    let stats = &report.stats;
    let _ = writeln!(out, "Reconcile pass at {}", format_ms(report.checked_at_ms));
    let _ = writeln!(
        out,
        "Scanned {} owners, {} applications, {} gears, {} districts ({} nodes responding)",
        stats.owners, stats.applications, stats.gears, stats.districts, stats.nodes_responding
    );
    if stats.gears_on_silent_nodes > 0 || stats.gears_unreported > 0 {
        let _ = writeln!(
            out,
            "Skipped key checks: {} gears on silent nodes, {} gears unreported",
            stats.gears_on_silent_nodes, stats.gears_unreported
        );
    }

    for check in &report.checks {
        out.push('\n');
        render_check(&mut out, check);
        let summary = report.category(check.category);
        if !report.report_only && summary.detected > 0 {
            let _ = writeln!(
                out,
                "  repaired {} of {}, {} failed",
                summary.fixed, summary.detected, summary.failed
            );
        }
    }

    let failed: Vec<_> = report
        .repairs
        .iter()
        .filter(|repair| repair.status == RepairStatus::Failed)
        .collect();
    if !failed.is_empty() {
        let _ = writeln!(out, "\nFailed repairs:");
        for repair in failed {
            let _ = writeln!(
                out,
                "  [{}] {}: {}",
                repair.category.as_str(),
                repair.target,
                repair.detail
            );
        }
    }

    out.push('\n');
    if report.has_inconsistencies() {
        let mode = if report.report_only {
            " (report only)"
        } else {
            ""
        };
        out.push_str(&format!("Inconsistencies detected{mode}"));
    } else {
        out.push_str("No inconsistencies found");
    }
    out
}

fn format_ms(ms: u64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .ok()
        .and_then(|at| at.format(&Rfc3339).ok())
        .unwrap_or_else(|| format!("{ms}ms"))
}

fn render_check(out: &mut String, check: &Check) {
    let status = match check.status {
        CheckStatus::Pass => "ok",
        CheckStatus::Warn => "warn",
        CheckStatus::Fail => "FAIL",
    };
    let _ = writeln!(
        out,
        "{:<9} {:<4} {} finding(s)",
        category_title(check.category),
        status,
        check.findings.len()
    );
    for finding in &check.findings {
        let _ = writeln!(out, "  - {}", describe(finding));
    }
}

fn category_title(category: Category) -> &'static str {
    match category {
        Category::Quota => "quota",
        Category::SshKeys => "ssh-keys",
        Category::Uids => "uids",
    }
}

fn describe(finding: &Finding) -> String {
    match finding {
        Finding::Quota(error) => format!(
            "owner {} ({}) records {} gears, has {}",
            error.login, error.owner_id, error.recorded, error.actual
        ),
        Finding::SshKey(error) => {
            let what = match error.drift {
                KeyDrift::Unrecorded => "on node but not recorded",
                KeyDrift::MissingOnNode => "recorded but missing on node",
            };
            format!(
                "gear {} on {}: key '{}' {what}",
                error.gear_id, error.node, error.key_name
            )
        }
        Finding::Uid(error) => match &error.kind {
            UidErrorKind::Unreserved { gear_id, node, .. } => format!(
                "district {} uid {} used by gear {gear_id} on {node} but listed available",
                error.district_name, error.uid
            ),
            UidErrorKind::Unused => format!(
                "district {} uid {} neither used nor available",
                error.district_name, error.uid
            ),
            UidErrorKind::OutOfRange => format!(
                "district {} lists uid {} outside its range",
                error.district_name, error.uid
            ),
            UidErrorKind::SharedUid { gear_ids } => format!(
                "district {} uid {} held by {} live gears",
                error.district_name,
                error.uid,
                gear_ids.len()
            ),
        },
    }
}

pub fn render_groups(app_id: &AppId, groups: &[OperationGroup]) -> String {
    if groups.is_empty() {
        return format!("No pending operations for {app_id}");
    }
    let mut out = format!("Pending operations for {app_id}:\n");
    for group in groups {
        let done = group
            .ops
            .iter()
            .filter(|record| record.state == crate::core::OpState::Completed)
            .count();
        let _ = writeln!(
            out,
            "\n{} [{}] {done}/{} completed",
            group.id,
            group.action,
            group.ops.len()
        );
        for record in &group.ops {
            let _ = writeln!(out, "  {}", render_record(record));
        }
    }
    out.trim_end().to_string()
}

pub fn render_runnable(app_id: &AppId, records: &[OperationRecord]) -> String {
    if records.is_empty() {
        return format!("Nothing runnable for {app_id}");
    }
    let mut out = format!("Runnable operations for {app_id}:\n");
    for record in records {
        let _ = writeln!(out, "  {}", render_record(record));
    }
    out.trim_end().to_string()
}

fn render_record(record: &OperationRecord) -> String {
    let mut line = format!(
        "{:<9} {} {}",
        record.state.as_str(),
        record.op_type,
        record.id
    );
    if record.retry_count > 0 {
        line.push_str(&format!(" (retry {})", record.retry_count));
    }
    if !record.prereq.is_empty() {
        line.push_str(&format!(" after {}", record.prereq.len()));
    }
    line
}
