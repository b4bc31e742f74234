use std::sync::Arc;

use clap::Args;

use super::super::{Ctx, print_json, print_line, render};
use crate::reconcile::{Category, ReconcileOptions, Reconciler};
use crate::{Error, Result};

#[derive(Args, Debug, Default)]
pub struct ReconcileArgs {
    /// Check owner gear counters.
    #[arg(long)]
    pub quota: bool,

    /// Check gear SSH keys against node agents.
    #[arg(long = "ssh-keys")]
    pub ssh_keys: bool,

    /// Check district UID pools.
    #[arg(long)]
    pub uids: bool,

    /// Detect only; never repair.
    #[arg(long = "report-only", alias = "dry-run")]
    pub report_only: bool,

    /// Run categories one after another instead of in parallel.
    #[arg(long)]
    pub serial: bool,
}

impl ReconcileArgs {
    fn options(&self, ctx: &Ctx) -> ReconcileOptions {
        let picked: Vec<Category> = [
            (self.quota, Category::Quota),
            (self.ssh_keys, Category::SshKeys),
            (self.uids, Category::Uids),
        ]
        .into_iter()
        .filter_map(|(on, category)| on.then_some(category))
        .collect();
        let mut options = if picked.is_empty() {
            ReconcileOptions::default()
        } else {
            ReconcileOptions::only(&picked)
        };
        options.report_only = self.report_only;
        options.lock_ttl_secs = ctx.config.reconcile.lock_ttl_secs;
        options.parallel = ctx.config.reconcile.parallel && !self.serial;
        options
    }
}

pub(crate) fn handle(ctx: &Ctx, args: ReconcileArgs) -> Result<i32> {
    let options = args.options(ctx);
    let store = ctx.open_store()?;
    let reconciler = Reconciler::new(store, Arc::new(ctx.agent()));

    let stream = ctx.verbose > 0 && !ctx.json;
    let report = reconciler
        .run_with_progress(&options, |line| {
            if stream {
                // Progress is best effort; the final report still prints.
                let _ = print_line(&line.to_string());
            }
        })
        .map_err(Error::from)?;

    if ctx.json {
        print_json(&report)?;
    } else {
        print_line(&render::render_report(&report))?;
    }
    Ok(report.exit_code())
}
