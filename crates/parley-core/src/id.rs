//! Message id generation.
//!
//! Ids follow the Sonyflake layout so they stay unique across nodes without
//! coordination and sort roughly by creation time:
//!
//! ```text
//! | 1 bit unused | 39 bits time (10 ms ticks) | 8 bits sequence | 16 bits machine |
//! ```

use parley_protocol::MessageId;
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Id epoch, 2024-01-01T00:00:00Z in unix milliseconds.
pub const EPOCH_MILLIS: u64 = 1_704_067_200_000;

/// Length of one time tick in milliseconds.
pub const TICK_MILLIS: u64 = 10;

const BITS_TIME: u32 = 39;
const BITS_SEQUENCE: u32 = 8;
const BITS_MACHINE: u32 = 16;

const MAX_TICKS: u64 = (1 << BITS_TIME) - 1;
const SEQUENCE_MASK: u16 = (1 << BITS_SEQUENCE) - 1;

/// Id generation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    /// The system clock reads earlier than the id epoch.
    #[error("System clock is before the id epoch")]
    ClockBeforeEpoch,

    /// The 39-bit time space is used up.
    #[error("Id time space exhausted")]
    Exhausted,
}

/// Current unix time in milliseconds.
#[must_use]
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Debug)]
struct IdState {
    ticks: u64,
    sequence: u16,
}

/// Generator of unique, strictly increasing message ids.
#[derive(Debug)]
pub struct IdGenerator {
    machine_id: u16,
    state: Mutex<IdState>,
}

impl IdGenerator {
    /// Create a generator for the given machine id.
    #[must_use]
    pub fn new(machine_id: u16) -> Self {
        Self {
            machine_id,
            state: Mutex::new(IdState {
                ticks: 0,
                sequence: 0,
            }),
        }
    }

    /// The machine id embedded in every id.
    #[must_use]
    pub fn machine_id(&self) -> u16 {
        self.machine_id
    }

    /// Produce the next id.
    ///
    /// When the sequence for the current tick is used up the generator moves
    /// on to the next tick instead of sleeping, so bursts briefly run ahead of
    /// the wall clock. A clock that steps backwards keeps the last tick.
    ///
    /// # Errors
    ///
    /// Returns an error if the clock is before the epoch or the time space is
    /// exhausted.
    pub fn next_id(&self) -> Result<MessageId, IdError> {
        let now = current_ticks()?;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if state.ticks < now {
            state.ticks = now;
            state.sequence = 0;
        } else {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                state.ticks += 1;
            }
        }

        if state.ticks > MAX_TICKS {
            return Err(IdError::Exhausted);
        }

        Ok(compose(state.ticks, state.sequence, self.machine_id))
    }
}

fn current_ticks() -> Result<u64, IdError> {
    let now = unix_millis();
    if now < EPOCH_MILLIS {
        return Err(IdError::ClockBeforeEpoch);
    }
    Ok((now - EPOCH_MILLIS) / TICK_MILLIS)
}

fn compose(ticks: u64, sequence: u16, machine_id: u16) -> MessageId {
    (ticks << (BITS_SEQUENCE + BITS_MACHINE))
        | (u64::from(sequence) << BITS_MACHINE)
        | u64::from(machine_id)
}

/// Parts of an id, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdParts {
    /// Milliseconds since the unix epoch, at tick resolution.
    pub unix_millis: u64,
    pub sequence: u16,
    pub machine_id: u16,
}

/// Split an id into its parts.
#[must_use]
pub fn decompose(id: MessageId) -> IdParts {
    let ticks = id >> (BITS_SEQUENCE + BITS_MACHINE);
    IdParts {
        unix_millis: EPOCH_MILLIS + ticks * TICK_MILLIS,
        sequence: ((id >> BITS_MACHINE) as u16) & SEQUENCE_MASK,
        machine_id: id as u16,
    }
}
