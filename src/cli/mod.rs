//! CLI surface for broker-rs.
//!
//! Thin handlers over the library: each command opens the configured store
//! and agent directory, calls one library operation and renders the result
//! as text or `--json`.

use std::ffi::OsString;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgAction, Parser, builder::BoolishValueParser};

use crate::config::Config;
use crate::reconcile::FileNodeAgent;
use crate::store::{DocumentStore, SqliteStore};
use crate::{Error, Result};

mod commands;
mod render;

pub use commands::{Commands, OpsCmd, ReconcileArgs};

#[derive(Parser, Debug)]
#[command(
    name = "broker",
    version,
    about = "Pending-operation ledger and fleet consistency reconciler",
    infer_subcommands = true,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Machine-readable JSON output.
    #[arg(
        long,
        global = true,
        default_value_t = false,
        num_args = 0..=1,
        value_parser = BoolishValueParser::new()
    )]
    pub json: bool,

    /// Per-item progress and log output (repeat for more).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Metadata store database (default: from config).
    #[arg(long, global = true, value_name = "PATH")]
    pub store: Option<PathBuf>,

    /// Directory of node agent reports (default: from config).
    #[arg(long, global = true, value_name = "DIR")]
    pub agent_dir: Option<PathBuf>,

    /// Extra config file layered over the user config.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Resolved settings shared by every handler.
pub(crate) struct Ctx {
    pub config: Config,
    pub json: bool,
    pub verbose: u8,
}

impl Ctx {
    pub fn open_store(&self) -> Result<Arc<dyn DocumentStore>> {
        let path = self.config.store.resolved_path();
        tracing::debug!(path = %path.display(), "opening store");
        Ok(Arc::new(SqliteStore::open(&path)?))
    }

    pub fn agent(&self) -> FileNodeAgent {
        FileNodeAgent::new(self.config.agent.resolved_reports_dir())
    }
}

pub fn parse_from<I, T>(args: I) -> Cli
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Cli::parse_from(args)
}

/// Run the CLI (used by bin). Returns the process exit code.
pub fn run(cli: Cli, mut config: Config) -> Result<i32> {
    if let Some(path) = cli.store {
        config.store.path = Some(path);
    }
    if let Some(dir) = cli.agent_dir {
        config.agent.reports_dir = Some(dir);
    }
    let ctx = Ctx {
        config,
        json: cli.json,
        verbose: cli.verbose,
    };
    commands::dispatch(cli.command, &ctx)
}

pub(crate) fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let s = serde_json::to_string_pretty(value).map_err(|e| Error::Output(e.into()))?;
    print_line(&s)
}

pub(crate) fn print_line(s: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    if let Err(e) = writeln!(stdout, "{s}")
        && e.kind() != std::io::ErrorKind::BrokenPipe
    {
        return Err(Error::Output(e));
    }
    Ok(())
}
