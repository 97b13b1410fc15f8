//! Frame accumulation: start/part/end into buffered pokes.

use std::collections::VecDeque;

use super::types::{PokeBody, PokeEnd, PokePart, PokeStart};
use super::PokeError;

/// Tracks the single poke currently being received and the pokes already
/// committed but not yet flushed downstream. Any frame that violates the
/// protocol resets the in-progress poke before surfacing the error.
#[derive(Debug, Default)]
pub struct PokeAccumulator {
    receiving: Option<PokeBody>,
    buffer: VecDeque<PokeBody>,
}

impl PokeAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_start(&mut self, start: PokeStart) -> Result<(), PokeError> {
        if let Some(in_progress) = self.receiving.take() {
            return Err(PokeError::UnexpectedStart(in_progress.start.poke_id));
        }
        self.receiving = Some(PokeBody::new(start));
        Ok(())
    }

    pub fn handle_part(&mut self, part: PokePart) -> Result<(), PokeError> {
        let Some(receiving) = self.receiving.as_mut() else {
            return Err(PokeError::NoPokeInProgress);
        };
        if receiving.start.poke_id != part.poke_id {
            let expected = receiving.start.poke_id.clone();
            self.receiving = None;
            return Err(PokeError::IdMismatch {
                expected,
                got: part.poke_id,
            });
        }
        receiving.parts.push(part);
        Ok(())
    }

    /// Commits the in-progress poke to the buffer, or drops it when the
    /// end frame carries `cancel`.
    pub fn handle_end(&mut self, end: PokeEnd) -> Result<(), PokeError> {
        let Some(receiving) = self.receiving.take() else {
            return Err(PokeError::NoPokeInProgress);
        };
        if receiving.start.poke_id != end.poke_id {
            return Err(PokeError::IdMismatch {
                expected: receiving.start.poke_id,
                got: end.poke_id,
            });
        }
        if !end.cancel {
            self.buffer.push_back(receiving);
        }
        Ok(())
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn take_buffered(&mut self) -> Vec<PokeBody> {
        self.buffer.drain(..).collect()
    }

    /// Drops everything, in-progress and buffered. Used when a recoverable
    /// error forces the connection to start over.
    pub fn clear(&mut self) {
        self.receiving = None;
        self.buffer.clear();
    }
}
