// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::{
    fmt,
    sync::OnceLock,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

use crate::crypto::Hash32;

pub type Slot = u32;
pub type Tick = u8;

pub const TICKS_PER_SLOT: u32 = 100;

/// Logical ledger time: `(slot, tick)` with `tick < TICKS_PER_SLOT`.
/// Slot boundaries are tick 0.
#[derive(
    Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Default, Serialize, Deserialize,
)]
pub struct LedgerTime {
    pub slot: Slot,
    pub tick: Tick,
}

impl LedgerTime {
    pub fn new(slot: Slot, tick: Tick) -> Self {
        assert!((tick as u32) < TICKS_PER_SLOT, "tick out of range: {tick}");
        Self { slot, tick }
    }

    pub fn slot_boundary(slot: Slot) -> Self {
        Self { slot, tick: 0 }
    }

    pub fn is_slot_boundary(&self) -> bool {
        self.tick == 0
    }

    /// Total ticks since genesis.
    pub fn as_ticks(&self) -> u64 {
        self.slot as u64 * TICKS_PER_SLOT as u64 + self.tick as u64
    }

    pub fn from_ticks(ticks: u64) -> Self {
        Self {
            slot: (ticks / TICKS_PER_SLOT as u64) as Slot,
            tick: (ticks % TICKS_PER_SLOT as u64) as Tick,
        }
    }

    pub fn add_ticks(&self, ticks: u32) -> Self {
        Self::from_ticks(self.as_ticks() + ticks as u64)
    }

    /// Signed tick distance `self - other`.
    pub fn diff_ticks(&self, other: &LedgerTime) -> i64 {
        self.as_ticks() as i64 - other.as_ticks() as i64
    }

    pub fn next_slot_boundary(&self) -> Self {
        Self::slot_boundary(self.slot + 1)
    }

    pub fn ticks_to_next_slot_boundary(&self) -> u32 {
        TICKS_PER_SLOT - self.tick as u32
    }
}

impl fmt::Debug for LedgerTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.slot, self.tick)
    }
}

impl fmt::Display for LedgerTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.slot, self.tick)
    }
}

/// Immutable, process-wide ledger constants. Loaded exactly once before any
/// task runs; everything else reads it through [`Ledger::get`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerIdentity {
    pub description: String,
    pub initial_supply: u64,
    pub tick_duration: Duration,
    /// Minimum ticks between a transaction and its inputs.
    pub tx_pace: u32,
    /// Protocol floor for the sequencer pace option.
    pub sequencer_pace: u32,
    /// Flat inflation granted to every branch transaction.
    pub branch_inflation_bonus: u64,
}

impl LedgerIdentity {
    /// Identity used by tests and local single-node runs.
    pub fn default_local() -> Self {
        Self {
            description: "proxima.local".to_string(),
            initial_supply: 1_000_000_000_000,
            tick_duration: Duration::from_millis(2),
            tx_pace: 1,
            sequencer_pace: 2,
            branch_inflation_bonus: 20,
        }
    }

    /// Hash keying the peering streams: nodes with different ledger
    /// constants ignore each other.
    pub fn library_hash(&self) -> Hash32 {
        let encoded = bincode::serialize(self).expect("ledger identity serializes");
        Hash32::digest(&encoded)
    }
}

pub struct Ledger {
    identity: LedgerIdentity,
    genesis: Instant,
}

static LEDGER: OnceLock<Ledger> = OnceLock::new();

impl Ledger {
    /// Installs the identity, mapping ledger time 0|0 to "now". Returns the
    /// previously installed instance if any; the first install wins.
    pub fn install(identity: LedgerIdentity) -> &'static Ledger {
        LEDGER.get_or_init(|| Ledger {
            identity,
            genesis: Instant::now(),
        })
    }

    pub fn get() -> &'static Ledger {
        LEDGER.get_or_init(|| Ledger {
            identity: LedgerIdentity::default_local(),
            genesis: Instant::now(),
        })
    }

    pub fn identity(&self) -> &LedgerIdentity {
        &self.identity
    }

    pub fn time_now(&self) -> LedgerTime {
        let elapsed = self.genesis.elapsed();
        let ticks = elapsed.as_nanos() / self.identity.tick_duration.as_nanos();
        LedgerTime::from_ticks(ticks as u64)
    }

    pub fn slot_now(&self) -> Slot {
        self.time_now().slot
    }

    pub fn tick_duration(&self) -> Duration {
        self.identity.tick_duration
    }

    pub fn slot_duration(&self) -> Duration {
        self.identity.tick_duration * TICKS_PER_SLOT
    }

    /// How long to sleep until logical time `t`; zero if `t` is in the past.
    pub fn sleep_duration_until(&self, t: LedgerTime) -> Duration {
        let now = self.time_now();
        let diff = t.diff_ticks(&now);
        if diff <= 0 {
            Duration::ZERO
        } else {
            self.identity.tick_duration * diff as u32
        }
    }

    pub fn valid_sequencer_pace(&self, prev: LedgerTime, target: LedgerTime) -> bool {
        target.diff_ticks(&prev) >= self.identity.sequencer_pace as i64
    }
}
