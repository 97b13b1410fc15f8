use thiserror::Error;

use crate::client::ClientError;
use crate::poke::PokeError;
use crate::runner::RunnerError;
use crate::store::StoreError;
use crate::updater::UpdateError;

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
    /// Side effects definitely occurred (locally or remotely).
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
    Store(#[from] StoreError),

    #[error(transparent)]
    Update(#[from] UpdateError),

    #[error(transparent)]
    Poke(#[from] PokeError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Store(e) => e.transience(),
            Error::Update(e) => e.transience(),
            Error::Poke(e) => e.transience(),
            Error::Client(e) => e.transience(),
            Error::Runner(e) => e.transience(),
            Error::Config(_) => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            Error::Store(e) => e.effect(),
            Error::Update(e) => e.effect(),
            Error::Poke(e) => e.effect(),
            Error::Client(e) => e.effect(),
            Error::Runner(e) => e.effect(),
            Error::Config(_) => Effect::None,
        }
    }
}
