//! Snowflake-style entity identifiers
//!
//! Layout (most significant first):
//!
//! ```text
//! | 1 bit unused | 41 bits ms since EPOCH | 10 bits machine | 12 bits sequence |
//! ```
//!
//! Ids from one generator are strictly increasing. Ids from generators seeded
//! with distinct machine indices never collide.

use crate::error::{ClusterError, Result};
use parking_lot::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// 2020-01-01T00:00:00Z in milliseconds
pub const EPOCH_MS: u64 = 1_577_836_800_000;

const MACHINE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;

/// Largest machine index that fits the layout
pub const MAX_MACHINE_INDEX: u16 = (1 << MACHINE_BITS) - 1;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

#[derive(Debug)]
struct Clock {
    last_ms: u64,
    sequence: u64,
}

/// Time-ordered 64-bit id allocator
#[derive(Debug)]
pub struct IdGenerator {
    machine: u16,
    clock: Mutex<Clock>,
}

impl IdGenerator {
    pub fn new(machine: u16) -> Result<Self> {
        if machine > MAX_MACHINE_INDEX {
            return Err(ClusterError::InvalidConfig(format!(
                "machine index {} exceeds {}",
                machine, MAX_MACHINE_INDEX
            )));
        }
        Ok(Self {
            machine,
            clock: Mutex::new(Clock {
                last_ms: 0,
                sequence: 0,
            }),
        })
    }

    pub fn machine(&self) -> u16 {
        self.machine
    }

    /// Allocate the next id
    ///
    /// A wall clock that steps backwards does not produce smaller ids: the
    /// generator keeps counting from the last millisecond it issued, and
    /// borrows the next millisecond once a sequence is exhausted.
    pub fn next_id(&self) -> u64 {
        let now = current_ms();
        let mut clock = self.clock.lock();

        if now > clock.last_ms {
            clock.last_ms = now;
            clock.sequence = 0;
        } else if clock.sequence < MAX_SEQUENCE {
            clock.sequence += 1;
        } else {
            clock.last_ms += 1;
            clock.sequence = 0;
        }

        compose(clock.last_ms, self.machine, clock.sequence)
    }
}

fn current_ms() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(EPOCH_MS);
    millis.saturating_sub(EPOCH_MS)
}

fn compose(ms: u64, machine: u16, sequence: u64) -> u64 {
    (ms << (MACHINE_BITS + SEQUENCE_BITS)) | ((machine as u64) << SEQUENCE_BITS) | sequence
}

/// Split an id into `(ms since EPOCH, machine, sequence)`
pub fn decompose(id: u64) -> (u64, u16, u64) {
    let ms = id >> (MACHINE_BITS + SEQUENCE_BITS);
    let machine = ((id >> SEQUENCE_BITS) & MAX_MACHINE_INDEX as u64) as u16;
    (ms, machine, id & MAX_SEQUENCE)
}
