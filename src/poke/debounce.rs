//! Debounced poke application.
//!
//! Committed pokes sit in the buffer for at most one frame interval, then
//! the whole run is merged and applied as a unit. Applies are serialized
//! under a lock: an out-of-order apply would corrupt the base-cookie chain
//! the consumer maintains.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use super::accumulate::PokeAccumulator;
use super::merge::merge_pokes;
use super::types::{PokeBody, PokeEnd, PokePart, PokeStart};
use super::PokeError;

/// Canonical substring a consumer embeds in an apply error when the poke's
/// base cookie does not match its current state. Anything else is fatal.
pub const BASE_COOKIE_MISMATCH: &str = "unexpected base cookie";

/// One screen refresh at 60Hz; flushing faster than this buys nothing.
const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(16);

#[derive(Debug)]
pub struct ApplyError {
    pub message: String,
}

impl ApplyError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Downstream consumer of merged pokes.
pub trait PokeSink: Send {
    fn apply(&mut self, poke: &PokeBody) -> Result<(), ApplyError>;
}

/// Accumulates frames and applies merged pokes after a debounce tick.
pub struct PokeHandler {
    accumulator: PokeAccumulator,
    frame_interval: Duration,
    due_at: Option<Instant>,
    apply_lock: Mutex<()>,
}

impl PokeHandler {
    pub fn new() -> Self {
        Self::with_frame_interval(DEFAULT_FRAME_INTERVAL)
    }

    /// `Duration::ZERO` flushes on the next tick with no batching window.
    pub fn with_frame_interval(frame_interval: Duration) -> Self {
        Self {
            accumulator: PokeAccumulator::new(),
            frame_interval,
            due_at: None,
            apply_lock: Mutex::new(()),
        }
    }

    pub fn handle_start(&mut self, start: PokeStart) -> Result<(), PokeError> {
        self.accumulator.handle_start(start)
    }

    pub fn handle_part(&mut self, part: PokePart) -> Result<(), PokeError> {
        self.accumulator.handle_part(part)
    }

    pub fn handle_end(&mut self, end: PokeEnd, now: Instant) -> Result<(), PokeError> {
        self.accumulator.handle_end(end)?;
        if self.accumulator.buffered() > 0 && self.due_at.is_none() {
            self.due_at = Some(now + self.frame_interval);
        }
        Ok(())
    }

    /// When the next flush is due, if anything is buffered.
    pub fn due_at(&self) -> Option<Instant> {
        self.due_at
    }

    /// Merges and applies everything buffered. A base-cookie mismatch from
    /// the sink clears all pipeline state and surfaces as recoverable (the
    /// caller reconnects and catches up); any other apply failure is fatal.
    pub fn flush(&mut self, sink: &mut dyn PokeSink, now: Instant) -> Result<(), PokeError> {
        if self.due_at.is_some_and(|due| due > now) {
            return Ok(());
        }
        self.due_at = None;
        let buffered = self.accumulator.take_buffered();
        if buffered.is_empty() {
            return Ok(());
        }
        let merged = merge_pokes(&buffered)?;
        debug!(
            poke = %merged.start.poke_id,
            cookie = %merged.start.cookie,
            merged_from = buffered.len(),
            "applying poke"
        );

        let guard = self
            .apply_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let result = sink.apply(&merged);
        drop(guard);

        match result {
            Ok(()) => Ok(()),
            Err(err) if err.message.contains(BASE_COOKIE_MISMATCH) => {
                self.accumulator.clear();
                Err(PokeError::RecoverableApply(err.message))
            }
            Err(err) => Err(PokeError::Apply(err.message)),
        }
    }

    /// Drops all buffered and in-progress state.
    pub fn clear(&mut self) {
        self.accumulator.clear();
        self.due_at = None;
    }
}

impl Default for PokeHandler {
    fn default() -> Self {
        Self::new()
    }
}
