//! Poke pipeline: the wire-level transport of patches.
//!
//! A poke advances clients of a group from one CVR cookie to the next and
//! travels as a start frame, any number of part frames, and an end frame
//! sharing a poke id. The receiving side accumulates frames, debounces,
//! merges buffered pokes into one, and applies the result under a lock so
//! the base-cookie chain can never interleave.

mod accumulate;
mod debounce;
mod merge;
mod types;

use thiserror::Error;

use crate::core::VersionError;
use crate::error::{Effect, Transience};

pub use accumulate::PokeAccumulator;
pub use debounce::{ApplyError, BASE_COOKIE_MISMATCH, PokeHandler, PokeSink};
pub use merge::merge_pokes;
pub use types::{
    ClientPatchOp, PokeBody, PokeEnd, PokePart, PokeStart, QueryPatchOp, RowPatchOp,
    SchemaVersions,
};

#[derive(Debug, Error)]
pub enum PokeError {
    #[error("poke {got} arrived while poke {expected} is in progress")]
    IdMismatch { expected: String, got: String },
    #[error("poke {0} started while another poke is in progress")]
    UnexpectedStart(String),
    #[error("poke frame without a poke in progress")]
    NoPokeInProgress,
    #[error("cookie gap: poke starts at {base} but client is at {cookie}")]
    CookieGap { base: String, cookie: String },
    #[error("cannot merge zero pokes")]
    EmptyMerge,
    #[error(transparent)]
    Version(#[from] VersionError),
    #[error("poke apply failed (recoverable): {0}")]
    RecoverableApply(String),
    #[error("poke apply failed: {0}")]
    Apply(String),
}

impl PokeError {
    /// Recoverable failures clear the pipeline; the caller reconnects and
    /// catches up. Everything else is fatal to the connection.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PokeError::IdMismatch { .. }
                | PokeError::UnexpectedStart(_)
                | PokeError::NoPokeInProgress
                | PokeError::RecoverableApply(_)
        )
    }

    pub fn transience(&self) -> Transience {
        if self.is_recoverable() {
            Transience::Retryable
        } else {
            Transience::Permanent
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            PokeError::Apply(_) | PokeError::RecoverableApply(_) => Effect::Unknown,
            _ => Effect::None,
        }
    }
}
