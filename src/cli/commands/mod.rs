use clap::Subcommand;

use super::Ctx;
use crate::Result;

pub(super) mod ops;
pub(super) mod reconcile;

pub use ops::OpsCmd;
pub use reconcile::ReconcileArgs;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check (and by default repair) quota, SSH key and UID consistency.
    Reconcile(ReconcileArgs),

    /// Inspect an application's pending operations.
    Ops {
        #[command(subcommand)]
        cmd: OpsCmd,
    },
}

pub(super) fn dispatch(command: Commands, ctx: &Ctx) -> Result<i32> {
    match command {
        Commands::Reconcile(args) => reconcile::handle(ctx, args),
        Commands::Ops { cmd } => ops::handle(ctx, cmd).map(|()| 0),
    }
}
