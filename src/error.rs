use thiserror::Error;

use crate::core::CoreError;
use crate::ledger::LedgerError;
use crate::lock::LockError;
use crate::reconcile::{AgentError, ReconcileError};
use crate::store::StoreError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// What we know about side effects when an error is returned.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Effect {
    /// Definitely no side effects occurred.
    None,
    /// Side effects definitely occurred.
    Some,
    /// We don't know if side effects occurred.
    Unknown,
}

impl Effect {
    pub fn as_str(self) -> &'static str {
        match self {
            Effect::None => "none",
            Effect::Some => "some",
            Effect::Unknown => "unknown",
        }
    }
}

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over canonical capability errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error("config error: {reason}")]
    Config { reason: String },

    #[error("failed to write output: {0}")]
    Output(#[source] std::io::Error),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Core(e) => e.transience(),
            Error::Store(e) => e.transience(),
            Error::Ledger(e) => e.transience(),
            Error::Lock(e) => e.transience(),
            Error::Agent(e) => e.transience(),
            Error::Reconcile(e) => e.transience(),
            Error::Config { .. } => Transience::Permanent,
            Error::Output(_) => Transience::Unknown,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            Error::Core(e) => e.effect(),
            Error::Store(e) => e.effect(),
            Error::Ledger(e) => e.effect(),
            Error::Lock(_) => Effect::Unknown,
            Error::Agent(_) => Effect::Unknown,
            Error::Reconcile(_) => Effect::Unknown,
            Error::Config { .. } => Effect::None,
            Error::Output(_) => Effect::Unknown,
        }
    }
}
