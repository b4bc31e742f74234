//! Core capability errors (id parsing, model validation).
//!
//! These are bounded and stable: core errors represent domain/refusal states,
//! not library implementation details.

use thiserror::Error;

use crate::error::{Effect, Transience};

/// Invalid identifier.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum InvalidId {
    #[error("application id `{raw}` is invalid: {reason}")]
    Application { raw: String, reason: String },
    #[error("operation group id `{raw}` is invalid: {reason}")]
    Group { raw: String, reason: String },
    #[error("operation id `{raw}` is invalid: {reason}")]
    Operation { raw: String, reason: String },
    #[error("owner id `{raw}` is invalid: {reason}")]
    Owner { raw: String, reason: String },
    #[error("domain id `{raw}` is invalid: {reason}")]
    Domain { raw: String, reason: String },
    #[error("gear id `{raw}` is invalid: {reason}")]
    Gear { raw: String, reason: String },
    #[error("group instance id `{raw}` is invalid: {reason}")]
    GroupInstance { raw: String, reason: String },
    #[error("district id `{raw}` is invalid: {reason}")]
    District { raw: String, reason: String },
    #[error("node identity `{raw}` is invalid: {reason}")]
    Node { raw: String, reason: String },
    #[error("key hash `{raw}` is invalid: {reason}")]
    KeyHash { raw: String, reason: String },
    #[error("lock key `{raw}` is invalid: {reason}")]
    LockKey { raw: String, reason: String },
}

/// Unknown enum tag on the wire.
#[derive(Debug, Error, Clone)]
#[error("{kind} `{raw}` is not recognized")]
pub struct UnknownTag {
    pub kind: &'static str,
    pub raw: String,
}

/// Canonical error enum for core capability.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum CoreError {
    #[error(transparent)]
    InvalidId(#[from] InvalidId),
    #[error(transparent)]
    UnknownTag(#[from] UnknownTag),
}

impl CoreError {
    pub fn transience(&self) -> Transience {
        // Core errors are pure domain/input failures.
        Transience::Permanent
    }

    pub fn effect(&self) -> Effect {
        Effect::None
    }
}
