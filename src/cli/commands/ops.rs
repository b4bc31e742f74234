use clap::Subcommand;

use super::super::{Ctx, print_json, print_line, render};
use crate::Result;
use crate::core::AppId;
use crate::ledger::OperationLedger;

#[derive(Subcommand, Debug)]
pub enum OpsCmd {
    /// Show pending groups and their records.
    #[command(alias = "ls")]
    List { app_id: AppId },

    /// Show records an executor may dequeue now.
    Runnable { app_id: AppId },
}

pub(crate) fn handle(ctx: &Ctx, cmd: OpsCmd) -> Result<()> {
    let ledger = OperationLedger::new(ctx.open_store()?)
        .with_max_attempts(ctx.config.ledger.max_transition_attempts);
    match cmd {
        OpsCmd::List { app_id } => {
            let groups = ledger.pending(&app_id)?;
            if ctx.json {
                print_json(&groups)
            } else {
                print_line(&render::render_groups(&app_id, &groups))
            }
        }
        OpsCmd::Runnable { app_id } => {
            let records = ledger.runnable(&app_id)?;
            if ctx.json {
                print_json(&records)
            } else {
                print_line(&render::render_runnable(&app_id, &records))
            }
        }
    }
}
